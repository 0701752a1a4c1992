// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use skylight_render::FrameUniforms;
use skylight_render_vk::{EngineConfig, RendererConfig, SceneConfig, SwapChainConfig};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default)]
    pub vsync_mode: VsyncModeCfg,
    #[serde(default = "default_true")]
    pub msaa: bool,
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TexturesCfg {
    pub albedo: Option<PathBuf>,
    pub normal: Option<PathBuf>,
    pub ao: Option<PathBuf>,
    /// r: metalness, g: roughness
    pub shading: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SceneCfg {
    #[serde(default)]
    pub mesh: Option<PathBuf>,
    #[serde(default)]
    pub textures: TexturesCfg,
    #[serde(default)]
    pub environments: Vec<PathBuf>,
    #[serde(default)]
    pub initial_environment: usize,
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,
    #[serde(default = "default_environment_size")]
    pub environment_size: u32,
    #[serde(default = "default_irradiance_size")]
    pub irradiance_size: u32,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MaterialCfg {
    /// 0 uses the texture values, 1 the values below.
    #[serde(default)]
    pub lerp_user_values: f32,
    #[serde(default)]
    pub metalness: f32,
    #[serde(default = "default_roughness")]
    pub roughness: f32,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub scene: SceneCfg,
    #[serde(default)]
    pub material: MaterialCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync: true,
            vsync_mode: VsyncModeCfg::Mailbox,
            msaa: true,
            fence_timeout_ms: default_fence_timeout_ms(),
        }
    }
}

impl Default for SceneCfg {
    fn default() -> Self {
        SceneCfg {
            mesh: None,
            textures: TexturesCfg::default(),
            environments: Vec::new(),
            initial_environment: 0,
            shader_dir: None,
            environment_size: default_environment_size(),
            irradiance_size: default_irradiance_size(),
        }
    }
}

impl Default for MaterialCfg {
    fn default() -> Self {
        MaterialCfg {
            lerp_user_values: 0.0,
            metalness: 0.0,
            roughness: default_roughness(),
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_true() -> bool {
    true
}
fn default_fence_timeout_ms() -> u64 {
    1000
}
fn default_environment_size() -> u32 {
    512
}
fn default_irradiance_size() -> u32 {
    32
}
fn default_roughness() -> f32 {
    0.5
}

/// Missing file → defaults; unparsable file → defaults with a warning.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => {
            info!("no {} found; using defaults", path.display());
            AppCfg::default()
        }
    }
}

pub fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

impl AppCfg {
    pub fn engine_config(&self) -> EngineConfig {
        let render = &self.render;
        let scene = &self.scene;
        EngineConfig {
            swapchain: SwapChainConfig {
                vsync: render.vsync,
                vsync_mode: match render.vsync_mode {
                    VsyncModeCfg::Fifo => skylight_render_vk::VsyncMode::Fifo,
                    VsyncModeCfg::Mailbox => skylight_render_vk::VsyncMode::Mailbox,
                },
                msaa: render.msaa,
                fence_timeout: Duration::from_millis(render.fence_timeout_ms.max(1)),
                ..SwapChainConfig::default()
            },
            renderer: RendererConfig {
                environment_size: scene.environment_size.max(1),
                irradiance_size: scene.irradiance_size.max(1),
                clear_color: render.clear_color,
                ..RendererConfig::default()
            },
            scene: SceneConfig {
                mesh: scene.mesh.clone(),
                albedo: scene.textures.albedo.clone(),
                normal: scene.textures.normal.clone(),
                ao: scene.textures.ao.clone(),
                shading: scene.textures.shading.clone(),
                environments: scene.environments.clone(),
                shader_dir: scene.shader_dir.clone(),
            },
            initial_environment: scene.initial_environment,
        }
    }

    pub fn apply_material(&self, uniforms: &mut FrameUniforms) {
        let m = &self.material;
        uniforms.lerp_user_values = m.lerp_user_values.clamp(0.0, 1.0);
        uniforms.user_metalness = m.metalness.clamp(0.0, 1.0);
        uniforms.user_roughness = m.roughness.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert!(cfg.render.vsync);
        assert!(cfg.render.msaa);
        assert_eq!(cfg.render.vsync_mode, VsyncModeCfg::Mailbox);
        assert_eq!(cfg.render.fence_timeout_ms, 1000);
        assert_eq!(cfg.scene.environment_size, 512);
        assert_eq!(cfg.scene.irradiance_size, 32);
        assert!(cfg.scene.environments.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            vsync_mode = "fifo"
            msaa = false

            [scene]
            mesh = "assets/helmet.obj"
            environments = ["a.hdr", "b.hdr"]
            initial_environment = 1

            [scene.textures]
            albedo = "assets/albedo.png"

            [material]
            lerp_user_values = 1.0
            metalness = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.vsync_mode, VsyncModeCfg::Fifo);
        assert!(!cfg.render.msaa);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.scene.mesh.as_deref(), Some(Path::new("assets/helmet.obj")));
        assert_eq!(cfg.scene.environments.len(), 2);
        assert_eq!(cfg.scene.initial_environment, 1);
        assert!(cfg.scene.textures.albedo.is_some());
        assert!(cfg.scene.textures.normal.is_none());
        assert_eq!(cfg.material.metalness, 0.8);
        assert_eq!(cfg.material.roughness, 0.5);
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(parse_cfg("[render]\nvsync_mode = \"sometimes\"\n").is_err());
        assert!(parse_cfg("[render]\nclear_color = [1.0]\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_cfg(Path::new("/definitely/not/skylight.toml"));
        assert_eq!(cfg.render.clear_color, default_clear());
    }

    #[test]
    fn engine_config_carries_values_through() {
        let cfg = parse_cfg(
            r#"
            [render]
            vsync = false
            fence_timeout_ms = 0
            clear_color = [1.0, 0.0, 0.0, 1.0]

            [scene]
            environments = ["sky.hdr"]
            irradiance_size = 16
            shader_dir = "shaders"
            "#,
        )
        .unwrap();
        let engine = cfg.engine_config();
        assert!(!engine.swapchain.vsync);
        assert_eq!(engine.swapchain.fence_timeout, Duration::from_millis(1));
        assert_eq!(engine.renderer.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(engine.renderer.irradiance_size, 16);
        assert_eq!(engine.scene.environments, vec![PathBuf::from("sky.hdr")]);
        assert_eq!(engine.scene.shader_dir, Some(PathBuf::from("shaders")));
    }

    #[test]
    fn material_values_are_clamped_into_uniforms() {
        let cfg = parse_cfg("[material]\nlerp_user_values = 2.0\nroughness = -1.0\n").unwrap();
        let mut uniforms = FrameUniforms::default();
        cfg.apply_material(&mut uniforms);
        assert_eq!(uniforms.lerp_user_values, 1.0);
        assert_eq!(uniforms.user_roughness, 0.0);
    }
}
