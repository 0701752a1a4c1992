// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use tracing::info;

use crate::builtin::BuiltinShader;
use crate::context::DeviceContext;
use crate::mesh::Mesh;
use crate::resource_manager::{ResourceId, ResourceManager};
use crate::shader::Shader;
use crate::texture::Texture;

/// Assets of the one lit object plus its surroundings. Missing material
/// textures are replaced by 1x1 neutral ones.
#[derive(Clone, Debug, Default)]
pub struct SceneConfig {
    /// `.obj` file; without one only the skybox is drawn.
    pub mesh: Option<PathBuf>,
    pub albedo: Option<PathBuf>,
    pub normal: Option<PathBuf>,
    pub ao: Option<PathBuf>,
    /// r: metalness, g: roughness.
    pub shading: Option<PathBuf>,
    /// Equirectangular HDR panoramas. Empty means a flat grey environment.
    pub environments: Vec<PathBuf>,
    /// Compile shaders from this directory instead of the built-in ones.
    pub shader_dir: Option<PathBuf>,
}

const SKYBOX_MESH: ResourceId = 0;
const PBR_MESH: ResourceId = 1;

const ALBEDO: ResourceId = 0;
const NORMAL: ResourceId = 1;
const AO: ResourceId = 2;
const SHADING: ResourceId = 3;
const ENVIRONMENT_BASE: ResourceId = 100;

fn shader_id(shader: BuiltinShader) -> ResourceId {
    BuiltinShader::ALL
        .iter()
        .position(|s| *s == shader)
        .unwrap_or_default() as ResourceId
}

/// Material slots of the PBR pass, in descriptor binding order after the two cubes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialMap {
    Albedo,
    Normal,
    Ao,
    Shading,
}

impl MaterialMap {
    pub const ALL: [Self; 4] = [Self::Albedo, Self::Normal, Self::Ao, Self::Shading];

    fn id(self) -> ResourceId {
        match self {
            Self::Albedo => ALBEDO,
            Self::Normal => NORMAL,
            Self::Ao => AO,
            Self::Shading => SHADING,
        }
    }

    /// RGBA8 texel used when no file is configured.
    pub fn fallback_texel(self) -> [u8; 4] {
        match self {
            Self::Albedo | Self::Ao => [255, 255, 255, 255],
            Self::Normal => [128, 128, 255, 255],
            Self::Shading => [0, 128, 0, 255],
        }
    }
}

pub struct RenderScene {
    resources: ResourceManager,
    environment_paths: Vec<String>,
    has_mesh: bool,
}

impl RenderScene {
    pub fn new(ctx: Arc<DeviceContext>, config: &SceneConfig) -> Result<Self> {
        let mut resources = ResourceManager::new(ctx.clone());

        for shader in BuiltinShader::ALL {
            let id = shader_id(shader);
            match &config.shader_dir {
                Some(dir) => {
                    resources.load_shader(id, dir.join(shader.file_name()), Some(shader.kind()))?;
                }
                None => {
                    resources.add_shader(id, shader.load(ctx.clone())?)?;
                }
            }
        }

        resources.create_cube_mesh(SKYBOX_MESH, 1.0)?;
        if let Some(path) = &config.mesh {
            resources.load_mesh(PBR_MESH, path)?;
        }

        let paths = [&config.albedo, &config.normal, &config.ao, &config.shading];
        for (map, path) in MaterialMap::ALL.into_iter().zip(paths) {
            match path {
                Some(p) => {
                    resources.load_texture(map.id(), p)?;
                }
                None => {
                    let tex = Texture::from_pixels(
                        ctx.clone(),
                        1,
                        1,
                        vk::Format::R8G8B8A8_UNORM,
                        &map.fallback_texel(),
                        false,
                    )?;
                    resources.add_texture(map.id(), tex)?;
                }
            }
        }

        let mut environment_paths = Vec::new();
        for (i, path) in config.environments.iter().enumerate() {
            resources
                .load_texture(ENVIRONMENT_BASE + i as ResourceId, path)
                .with_context(|| format!("environment {i}"))?;
            environment_paths.push(path.display().to_string());
        }
        if environment_paths.is_empty() {
            let grey: Vec<f32> = [0.5f32, 0.5, 0.5, 1.0].repeat(2);
            let tex = Texture::from_pixels(
                ctx,
                2,
                1,
                vk::Format::R32G32B32A32_SFLOAT,
                bytemuck::cast_slice(&grey),
                false,
            )?;
            resources.add_texture(ENVIRONMENT_BASE, tex)?;
            environment_paths.push("<flat grey>".to_owned());
        }

        info!(
            "scene ready: mesh: {}, environments: {}",
            config.mesh.is_some(),
            environment_paths.len()
        );
        Ok(Self {
            resources,
            environment_paths,
            has_mesh: config.mesh.is_some(),
        })
    }

    /// Each shader keeps its previous module when its own compile fails.
    pub fn reload_shaders(&mut self) -> Result<()> {
        self.resources.reload_shaders()
    }

    pub fn shader(&self, shader: BuiltinShader) -> Result<&Shader> {
        Ok(self.resources.shader(shader_id(shader))?)
    }

    pub fn skybox_mesh(&self) -> Result<&Mesh> {
        Ok(self.resources.mesh(SKYBOX_MESH)?)
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        if !self.has_mesh {
            return None;
        }
        self.resources.mesh(PBR_MESH).ok()
    }

    pub fn material(&self, map: MaterialMap) -> Result<&Texture> {
        Ok(self.resources.texture(map.id())?)
    }

    pub fn environment_count(&self) -> usize {
        self.environment_paths.len()
    }

    pub fn environment(&self, index: usize) -> Result<&Texture> {
        if index >= self.environment_count() {
            bail!(
                "environment {index} out of range ({} loaded)",
                self.environment_count()
            );
        }
        Ok(self.resources.texture(ENVIRONMENT_BASE + index as ResourceId)?)
    }

    pub fn environment_path(&self, index: usize) -> Option<&str> {
        self.environment_paths.get(index).map(String::as_str)
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_shader_ids_are_unique() {
        let mut ids: Vec<_> = BuiltinShader::ALL.iter().map(|s| shader_id(*s)).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), BuiltinShader::ALL.len());
    }

    #[test]
    fn fallback_normal_points_out_of_the_surface() {
        let [x, y, z, _] = MaterialMap::Normal.fallback_texel();
        let n = [x, y, z].map(|c| c as f32 / 255.0 * 2.0 - 1.0);
        assert!(n[0].abs() < 0.01 && n[1].abs() < 0.01);
        assert!((n[2] - 1.0).abs() < 0.01);
    }

    #[test]
    fn fallback_shading_is_dielectric_mid_roughness() {
        let [metal, rough, ..] = MaterialMap::Shading.fallback_texel();
        assert_eq!(metal, 0);
        assert!((rough as f32 / 255.0 - 0.5).abs() < 0.01);
    }
}
