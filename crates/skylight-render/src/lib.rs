// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use skylight_math::CameraMatrices;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    /// Minimized windows report a zero dimension; nothing can be created at that size.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Framebuffer size change reported by the host window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeEvent {
    pub size: RenderSize,
}

impl ResizeEvent {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: RenderSize { width, height },
        }
    }
}

/// Per-frame parameters, laid out to match the std140 block `FrameUniforms`
/// in the shipped shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    pub world: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub camera_pos: [f32; 3],
    pub lerp_user_values: f32,
    pub user_metalness: f32,
    pub user_roughness: f32,
    pub _pad: [f32; 2],
}

impl Default for FrameUniforms {
    fn default() -> Self {
        let identity = skylight_math::Mat4::IDENTITY.to_cols_array_2d();
        Self {
            world: identity,
            view: identity,
            proj: identity,
            camera_pos: [0.0; 3],
            lerp_user_values: 0.0,
            user_metalness: 0.0,
            user_roughness: 0.5,
            _pad: [0.0; 2],
        }
    }
}

impl FrameUniforms {
    pub fn set_camera(&mut self, camera: &CameraMatrices) {
        self.view = camera.view.to_cols_array_2d();
        self.proj = camera.proj.to_cols_array_2d();
        self.camera_pos = camera.position.to_array();
    }
}

pub trait Renderer {
    fn resize(&mut self, event: ResizeEvent) -> Result<()>;
    fn render(&mut self, uniforms: &FrameUniforms) -> Result<()>;
    /// Recompile shaders and rebuild pipelines; keeps the previous state on failure.
    fn reload(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_are_std140_sized() {
        // three mat4 + vec3/float + two floats padded to 16
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 3 * 64 + 16 + 16);
    }

    #[test]
    fn zero_sized_window_is_empty() {
        assert!(ResizeEvent::new(0, 600).size.is_empty());
        assert!(ResizeEvent::new(800, 0).size.is_empty());
        assert!(!ResizeEvent::new(1, 1).size.is_empty());
    }
}
