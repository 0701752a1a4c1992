// SPDX-License-Identifier: CEPL-1.0
//! Camera and projection helpers shared by the renderer and the host.
//!
//! All projections target Vulkan clip space: depth in `[0, 1]`, and framebuffer
//! row 0 at the top.
pub use glam::{Mat4, Vec3, Vec4};

/// Face order matches Vulkan cube array layers: +X, -X, +Y, -Y, +Z, -Z.
pub const CUBE_FACE_COUNT: usize = 6;

/// View matrices looking from the origin through the center of each cube face.
///
/// Combined with [`cube_face_projection`] and a non-flipped viewport, face `i`
/// rendered into array layer `i` samples back exactly along the direction used
/// to produce it.
pub fn cube_face_views() -> [Mat4; CUBE_FACE_COUNT] {
    let eye = Vec3::ZERO;
    [
        Mat4::look_at_rh(eye, Vec3::X, Vec3::NEG_Y),
        Mat4::look_at_rh(eye, Vec3::NEG_X, Vec3::NEG_Y),
        Mat4::look_at_rh(eye, Vec3::Y, Vec3::Z),
        Mat4::look_at_rh(eye, Vec3::NEG_Y, Vec3::NEG_Z),
        Mat4::look_at_rh(eye, Vec3::Z, Vec3::NEG_Y),
        Mat4::look_at_rh(eye, Vec3::NEG_Z, Vec3::NEG_Y),
    ]
}

/// 90° square frustum used for every cube face.
pub fn cube_face_projection() -> Mat4 {
    Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 10.0)
}

/// Right-handed perspective with Y flipped for a positive-height Vulkan viewport.
pub fn perspective_vk(fov_y_deg: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y_deg.to_radians(), aspect, near, far);
    proj.y_axis.y *= -1.0;
    proj
}

#[derive(Debug, Clone, Copy)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub proj: Mat4,
    /// Camera position in world space.
    pub position: Vec3,
}

/// Camera circling the origin around `up`.
#[derive(Debug, Clone, Copy)]
pub struct OrbitCamera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Fraction of a quarter turn per second.
    pub rotation_speed: f32,
    pub fov_y_deg: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            position: Vec3::splat(2.0),
            target: Vec3::ZERO,
            up: Vec3::Z,
            rotation_speed: 0.3,
            fov_y_deg: 60.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl OrbitCamera {
    pub fn matrices(&self, elapsed: f32, aspect: f32) -> CameraMatrices {
        let angle = elapsed * self.rotation_speed * 90f32.to_radians();
        let rotation = Mat4::from_axis_angle(self.up.normalize(), angle);

        // Rotating the world by R is the same as moving the camera by R^-1.
        let view = Mat4::look_at_rh(self.position, self.target, self.up) * rotation;
        let position = rotation.inverse().transform_point3(self.position);

        CameraMatrices {
            view,
            proj: perspective_vk(self.fov_y_deg, aspect, self.near, self.far),
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(face: usize, dir: Vec3) -> Vec3 {
        let clip = cube_face_projection() * cube_face_views()[face] * dir.extend(1.0);
        clip.truncate() / clip.w
    }

    #[test]
    fn each_face_centers_its_axis() {
        let axes = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
        for (face, axis) in axes.into_iter().enumerate() {
            let ndc = project(face, axis);
            assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5, "face {face}: {ndc:?}");
            assert!((0.0..=1.0).contains(&ndc.z));
        }
    }

    #[test]
    fn positive_x_face_matches_vulkan_cube_addressing() {
        // +X: s = -z, t = -y
        let ndc = project(0, Vec3::new(1.0, 0.5, -0.25));
        assert!((ndc.x - 0.25).abs() < 1e-5);
        assert!((ndc.y + 0.5).abs() < 1e-5);
    }

    #[test]
    fn negative_y_face_matches_vulkan_cube_addressing() {
        // -Y: s = x, t = -z
        let ndc = project(3, Vec3::new(0.5, -1.0, 0.25));
        assert!((ndc.x - 0.5).abs() < 1e-5);
        assert!((ndc.y + 0.25).abs() < 1e-5);
    }

    #[test]
    fn orbit_camera_starts_at_configured_position() {
        let cam = OrbitCamera::default();
        let m = cam.matrices(0.0, 16.0 / 9.0);
        assert!((m.position - Vec3::splat(2.0)).length() < 1e-5);
        let eye_in_view = m.view.transform_point3(m.position);
        assert!(eye_in_view.length() < 1e-4);
    }

    #[test]
    fn orbit_camera_view_keeps_world_position_at_eye() {
        let cam = OrbitCamera::default();
        let m = cam.matrices(3.7, 1.0);
        assert!(m.view.transform_point3(m.position).length() < 1e-4);
        // orbit stays on the same height around Z
        assert!((m.position.z - 2.0).abs() < 1e-4);
    }

    #[test]
    fn vk_projection_flips_y() {
        let gl = Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0);
        let vk = perspective_vk(1f32.to_degrees(), 1.0, 0.1, 10.0);
        assert!((gl.y_axis.y + vk.y_axis.y).abs() < 1e-5);
    }
}
