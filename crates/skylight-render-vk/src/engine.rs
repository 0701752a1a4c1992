// SPDX-License-Identifier: CEPL-1.0
//! Ties the device, swapchain, scene and renderer into one frame loop and
//! owns the out-of-date / minimized-window recovery path.
use std::sync::Arc;

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use skylight_render::{FrameUniforms, RenderSize, ResizeEvent};
use tracing::{info, warn};

use crate::context::DeviceContext;
use crate::renderer::{Renderer, RendererConfig};
use crate::scene::{RenderScene, SceneConfig};
use crate::swapchain::{Frame, FrameError, PassLoad, Recreate, SwapChain, SwapChainConfig, SwapChainState};

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub swapchain: SwapChainConfig,
    pub renderer: RendererConfig,
    pub scene: SceneConfig,
    pub initial_environment: usize,
}

/// Extra draws appended to each frame after the scene, inside a render pass
/// that keeps the scene's color and depth (e.g. a debug UI).
pub trait FrameOverlay {
    /// Called between `begin_render_pass(PassLoad::Load)` and `end_render_pass`.
    fn record(&mut self, device: &ash::Device, frame: &Frame) -> Result<()>;
    /// The swapchain was rebuilt; render pass and extent may have changed.
    fn resize(&mut self, _swapchain: &SwapChain) -> Result<()> {
        Ok(())
    }
}

// Field order is drop order: nothing may outlive the device context.
pub struct Engine {
    overlay: Option<Box<dyn FrameOverlay>>,
    renderer: Renderer,
    scene: RenderScene,
    swapchain: SwapChain,
    ctx: Arc<DeviceContext>,
    size: RenderSize,
    paused: bool,
    environment: usize,
}

impl Engine {
    pub fn new<W>(window: &W, size: RenderSize, config: EngineConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        // STRICT ORDER: context → swapchain → scene → renderer.
        let ctx = Arc::new(DeviceContext::new(window, window)?);
        let mut swapchain = SwapChain::new(ctx.clone(), config.swapchain)?;
        swapchain.init(size.width, size.height).context("initial swapchain")?;
        let scene = RenderScene::new(ctx.clone(), &config.scene)?;
        let environment = config
            .initial_environment
            .min(scene.environment_count().saturating_sub(1));
        let renderer = Renderer::new(ctx.clone(), &swapchain, &scene, config.renderer, environment)?;
        info!(
            "engine ready: {}x{}, {} swapchain images, {} frames in flight",
            size.width,
            size.height,
            swapchain.image_count(),
            swapchain.buffering_depth()
        );
        Ok(Self {
            overlay: None,
            renderer,
            scene,
            swapchain,
            ctx,
            size,
            paused: false,
            environment,
        })
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn FrameOverlay>) {
        self.overlay = Some(overlay);
    }

    pub fn environment_count(&self) -> usize {
        self.scene.environment_count()
    }

    pub fn current_environment(&self) -> usize {
        self.environment
    }

    pub fn environment_name(&self, index: usize) -> Option<&str> {
        self.scene.environment_path(index)
    }

    /// Re-bakes the environment and irradiance cubes from HDR panorama `index`.
    pub fn set_environment(&mut self, index: usize) -> Result<()> {
        self.renderer.set_environment(&self.scene, index)?;
        self.environment = index;
        Ok(())
    }

    pub fn gpu_frame_ms(&self) -> Option<f64> {
        self.renderer.gpu_frame_ms()
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn swapchain(&self) -> &SwapChain {
        &self.swapchain
    }

    fn recreate(&mut self) -> Result<()> {
        match self.swapchain.reinit(self.size.width, self.size.height)? {
            Recreate::Deferred => {
                if !self.paused {
                    info!("vk: surface has no area → paused=true");
                }
                self.paused = true;
            }
            Recreate::Rebuilt => {
                self.paused = false;
                self.renderer.resize(&self.swapchain, &self.scene)?;
                if let Some(overlay) = self.overlay.as_mut() {
                    overlay.resize(&self.swapchain)?;
                }
            }
        }
        Ok(())
    }

    fn record_overlay(&mut self, frame: &Frame) {
        let Some(overlay) = self.overlay.as_mut() else {
            return;
        };
        let device = self.ctx.device();
        unsafe { frame.begin_render_pass(device, PassLoad::Load, [0.0; 4]) };
        if let Err(e) = overlay.record(device, frame) {
            warn!("overlay skipped this frame: {e:#}");
        }
        unsafe { frame.end_render_pass(device) };
    }
}

impl skylight_render::Renderer for Engine {
    fn resize(&mut self, event: ResizeEvent) -> Result<()> {
        self.size = event.size;
        if event.size.is_empty() {
            if !self.paused {
                info!("vk: resize to 0x0 → paused=true");
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!(
                "vk: resize to {}x{} → paused=false",
                event.size.width, event.size.height
            );
        }
        self.recreate()
    }

    // STRICT PER-FRAME ORDER:
    // 1) acquire (slot fence, image, uniforms, begin recording)
    // 2) scene pass, then overlay pass
    // 3) present (submit + present)
    fn render(&mut self, uniforms: &FrameUniforms) -> Result<()> {
        if self.size.is_empty() {
            return Ok(());
        }
        if self.paused || self.swapchain.state() == SwapChainState::Recreating {
            self.recreate()?;
            if self.swapchain.state() != SwapChainState::Ready {
                return Ok(());
            }
        }

        let frame = match self.swapchain.acquire(bytemuck::bytes_of(uniforms)) {
            Ok(frame) => frame,
            Err(e) if e.needs_recreate() => return self.recreate(),
            Err(FrameError::Timeout) => {
                warn!("vk: acquire timed out; skipping frame");
                return Ok(());
            }
            Err(e) => return Err(e).context("acquire"),
        };

        unsafe { self.renderer.render(&frame, &self.scene) };
        self.record_overlay(&frame);

        match self.swapchain.present(frame) {
            Ok(()) => Ok(()),
            Err(e) if e.needs_recreate() => self.recreate(),
            Err(e) => Err(e).context("present"),
        }
    }

    /// Recompiles every scene shader, rebuilds pipelines and re-bakes the
    /// current environment. Shaders that fail to compile keep their old module.
    fn reload(&mut self) -> Result<()> {
        self.ctx.wait_idle()?;
        let shaders = self.scene.reload_shaders();
        self.renderer.reload(&self.swapchain, &self.scene)?;
        self.renderer.set_environment(&self.scene, self.environment)?;
        shaders
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.renderer.set_clear_color(rgba);
    }

    fn set_vsync(&mut self, on: bool) {
        if self.swapchain.config().vsync == on {
            return;
        }
        self.swapchain.set_vsync(on);
        if let Err(e) = self.recreate() {
            warn!("vk: vsync change failed: {e:#}");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
    }
}
