// SPDX-License-Identifier: CEPL-1.0
//! Shaders shipped with the crate: compiled by build.rs and embedded, but still
//! tied to their source files so hot reload picks up edits.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::context::DeviceContext;
use crate::shader::{Shader, ShaderKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinShader {
    CubeVertex,
    HdriToCube,
    DiffuseIrradiance,
    SkyboxVertex,
    SkyboxFragment,
    PbrVertex,
    PbrFragment,
}

macro_rules! spirv {
    ($file:literal) => {
        include_bytes!(concat!(env!("OUT_DIR"), "/", $file, ".spv"))
    };
}

impl BuiltinShader {
    pub const ALL: [Self; 7] = [
        Self::CubeVertex,
        Self::HdriToCube,
        Self::DiffuseIrradiance,
        Self::SkyboxVertex,
        Self::SkyboxFragment,
        Self::PbrVertex,
        Self::PbrFragment,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::CubeVertex => "cube.vert",
            Self::HdriToCube => "hdri_to_cube.frag",
            Self::DiffuseIrradiance => "diffuse_irradiance.frag",
            Self::SkyboxVertex => "skybox.vert",
            Self::SkyboxFragment => "skybox.frag",
            Self::PbrVertex => "pbr.vert",
            Self::PbrFragment => "pbr.frag",
        }
    }

    pub fn kind(self) -> ShaderKind {
        match self {
            Self::CubeVertex | Self::SkyboxVertex | Self::PbrVertex => ShaderKind::Vertex,
            _ => ShaderKind::Fragment,
        }
    }

    fn spirv_bytes(self) -> &'static [u8] {
        match self {
            Self::CubeVertex => spirv!("cube.vert"),
            Self::HdriToCube => spirv!("hdri_to_cube.frag"),
            Self::DiffuseIrradiance => spirv!("diffuse_irradiance.frag"),
            Self::SkyboxVertex => spirv!("skybox.vert"),
            Self::SkyboxFragment => spirv!("skybox.frag"),
            Self::PbrVertex => spirv!("pbr.vert"),
            Self::PbrFragment => spirv!("pbr.frag"),
        }
    }

    /// Embedded bytes are not guaranteed to be 4-byte aligned.
    pub fn spirv(self) -> Result<Vec<u32>> {
        let bytes = self.spirv_bytes();
        if bytes.len() % 4 != 0 {
            return Err(anyhow!("{} is not valid SPIR-V", self.file_name()));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn source_path(self) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("shaders")
            .join(self.file_name())
    }

    pub fn load(self, ctx: Arc<DeviceContext>) -> Result<Shader> {
        Shader::from_spirv(ctx, &self.spirv()?, self.kind(), self.source_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_modules_are_spirv() {
        for s in BuiltinShader::ALL {
            let words = s.spirv().unwrap();
            assert_eq!(words[0], 0x0723_0203, "{}", s.file_name());
        }
    }

    #[test]
    fn kinds_follow_file_extensions() {
        for s in BuiltinShader::ALL {
            assert_eq!(ShaderKind::from_path(&s.source_path()), Some(s.kind()));
        }
    }

    #[test]
    fn sources_ship_with_the_crate() {
        for s in BuiltinShader::ALL {
            assert!(s.source_path().is_file(), "{}", s.source_path().display());
        }
    }
}
