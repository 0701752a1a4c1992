// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use skylight_core::{init_tracing, FrameClock};
use skylight_math::OrbitCamera;
use skylight_render::{FrameUniforms, RenderSize, Renderer};
use skylight_render_vk::Engine;
use tracing::{error, info, warn};

use skylight_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = "skylight.toml")]
    config: PathBuf,
    /// Start with this environment instead of the configured one
    #[arg(long)]
    environment: Option<usize>,
}

// Field order is drop order: the engine goes before the window it draws into.
struct App {
    engine: Option<Engine>,
    window: Option<Window>,
    render_size: RenderSize,

    cfg: AppCfg,
    vsync: bool,
    exiting: bool,
    paused: bool,

    clock: FrameClock,
    camera: OrbitCamera,
    uniforms: FrameUniforms,

    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let mut uniforms = FrameUniforms::default();
        cfg.apply_material(&mut uniforms);
        Self {
            engine: None,
            window: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            vsync: cfg.render.vsync,
            cfg,
            exiting: false,
            paused: false,
            clock: FrameClock::new(),
            camera: OrbitCamera::default(),
            uniforms,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }

    fn create_engine(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(Window::default_attributes().with_title("skylight"))?;
        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width.max(1),
            height: size.height.max(1),
        };
        let engine = Engine::new(&window, self.render_size, self.cfg.engine_config())?;
        info!(
            "environment {} of {}: {}",
            engine.current_environment() + 1,
            engine.environment_count(),
            engine.environment_name(engine.current_environment()).unwrap_or("?")
        );
        self.engine = Some(engine);
        self.window = Some(window);
        self.clock.reset();
        Ok(())
    }

    fn cycle_environment(&mut self, step: isize) {
        let Some(engine) = &mut self.engine else {
            return;
        };
        let count = engine.environment_count();
        if count < 2 {
            return;
        }
        let next = (engine.current_environment() as isize + step).rem_euclid(count as isize) as usize;
        match engine.set_environment(next) {
            Ok(()) => info!(
                "environment {} of {}: {}",
                next + 1,
                count,
                engine.environment_name(next).unwrap_or("?")
            ),
            Err(e) => error!("environment switch failed: {e:#}"),
        }
    }

    fn on_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match event.logical_key.as_ref() {
            Key::Character("r") | Key::Character("R") => {
                if let Some(engine) = &mut self.engine {
                    info!("reloading shaders");
                    if let Err(e) = engine.reload() {
                        warn!("reload: {e:#}");
                    }
                }
            }
            Key::Character("v") | Key::Character("V") => {
                self.vsync = !self.vsync;
                info!("vsync = {}", self.vsync);
                if let Some(engine) = &mut self.engine {
                    engine.set_vsync(self.vsync);
                }
            }
            Key::Character("m") | Key::Character("M") => {
                let lerp = if self.uniforms.lerp_user_values > 0.5 { 0.0 } else { 1.0 };
                self.uniforms.lerp_user_values = lerp;
                info!("user material values = {}", lerp > 0.5);
            }
            Key::Named(NamedKey::ArrowRight) => self.cycle_environment(1),
            Key::Named(NamedKey::ArrowLeft) => self.cycle_environment(-1),
            _ => {}
        }
    }

    fn redraw(&mut self) {
        let Some(engine) = &mut self.engine else {
            return;
        };
        let t = self.clock.tick();
        let camera = self.camera.matrices(t.elapsed, self.render_size.aspect());
        self.uniforms.set_camera(&camera);

        match engine.render(&self.uniforms) {
            // count only frames that were actually rendered
            Ok(()) => self.frames = self.frames.saturating_add(1),
            Err(e) => error!("render error: {e:#}"),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.create_engine(event_loop) {
                error!("vk init failed: {e:#}");
                self.exiting = true;
                event_loop.exit();
                return;
            }
            info!("vsync cfg = {}", self.vsync);
        }

        event_loop.set_control_flow(if self.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_empty();
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.engine = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                let resize = skylight_platform::resize_event(new_size);
                self.render_size = resize.size;
                let now_paused = resize.size.is_empty();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        resize.size.width, resize.size.height, self.paused
                    );
                }
                if let Some(engine) = &mut self.engine {
                    if let Err(e) = engine.resize(resize) {
                        error!("resize failed: {e:#}");
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_empty();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => self.on_key(&event),

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                self.redraw();
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            // window-size=0 or occluded → sleep
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(if self.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            match self.engine.as_ref().and_then(Engine::gpu_frame_ms) {
                Some(ms) => info!("fps ~ {} (gpu {ms:.2} ms)", self.frames),
                None => info!("fps ~ {}", self.frames),
            }
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    if let Some(index) = args.environment {
        cfg.scene.initial_environment = index;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
