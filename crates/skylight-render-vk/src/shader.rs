// SPDX-License-Identifier: CEPL-1.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use tracing::{info, warn};

use crate::context::DeviceContext;
use crate::utils;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Fragment,
    Compute,
    Geometry,
    TessControl,
    TessEvaluation,
}

impl ShaderKind {
    /// Infers the stage from the conventional GLSL extension (`.vert`, `.frag`, ...).
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "vert" => Some(Self::Vertex),
            "frag" => Some(Self::Fragment),
            "comp" => Some(Self::Compute),
            "geom" => Some(Self::Geometry),
            "tesc" => Some(Self::TessControl),
            "tese" => Some(Self::TessEvaluation),
            _ => None,
        }
    }

    pub fn stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        }
    }

    fn shaderc(self) -> shaderc::ShaderKind {
        match self {
            Self::Vertex => shaderc::ShaderKind::Vertex,
            Self::Fragment => shaderc::ShaderKind::Fragment,
            Self::Compute => shaderc::ShaderKind::Compute,
            Self::Geometry => shaderc::ShaderKind::Geometry,
            Self::TessControl => shaderc::ShaderKind::TessControl,
            Self::TessEvaluation => shaderc::ShaderKind::TessEvaluation,
        }
    }
}

/// Compiles GLSL to SPIR-V words targeting Vulkan 1.2.
pub fn compile_glsl(source: &str, kind: ShaderKind, name: &str) -> Result<Vec<u32>> {
    let compiler = shaderc::Compiler::new().context("creating shaderc compiler")?;
    let mut opts = shaderc::CompileOptions::new().context("creating shaderc compile options")?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let artifact = compiler
        .compile_into_spirv(source, kind.shaderc(), name, "main", Some(&opts))
        .with_context(|| format!("compiling {name}"))?;
    if artifact.get_num_warnings() > 0 {
        warn!("{name}: {}", artifact.get_warning_messages());
    }
    Ok(artifact.as_binary().to_vec())
}

fn compile_file(path: &Path, kind: ShaderKind) -> Result<Vec<u32>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading shader {}", path.display()))?;
    compile_glsl(&source, kind, &path.to_string_lossy())
}

/// A shader module tied to the GLSL file it came from.
pub struct Shader {
    ctx: Arc<DeviceContext>,
    module: vk::ShaderModule,
    path: PathBuf,
    kind: ShaderKind,
}

impl Shader {
    /// `kind` falls back to the file extension when not given.
    pub fn compile_from_file(
        ctx: Arc<DeviceContext>,
        path: impl AsRef<Path>,
        kind: Option<ShaderKind>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let kind = kind
            .or_else(|| ShaderKind::from_path(&path))
            .ok_or_else(|| anyhow!("cannot infer shader stage of {}", path.display()))?;
        let words = compile_file(&path, kind)?;
        let shader = Self::from_spirv(ctx, &words, kind, path)?;
        info!("compiled shader {}", shader.path.display());
        Ok(shader)
    }

    /// Wraps precompiled SPIR-V; `path` is still the source used by `reload`.
    pub fn from_spirv(
        ctx: Arc<DeviceContext>,
        words: &[u32],
        kind: ShaderKind,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let module = unsafe { utils::create_shader_module(ctx.device(), words)? };
        Ok(Self {
            ctx,
            module,
            path: path.into(),
            kind,
        })
    }

    /// Recompiles from the source path. On any failure the current module is
    /// left untouched and the error is returned.
    pub fn reload(&mut self) -> Result<()> {
        let words = compile_file(&self.path, self.kind)?;
        let module = unsafe { utils::create_shader_module(self.ctx.device(), &words)? };
        let old = std::mem::replace(&mut self.module, module);
        // Pipelines built from the old module keep their own copy of the code.
        unsafe { self.ctx.device().destroy_shader_module(old, None) };
        info!("reloaded shader {}", self.path.display());
        Ok(())
    }

    #[inline]
    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }
    #[inline]
    pub fn kind(&self) -> ShaderKind {
        self.kind
    }
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: self.kind.stage(),
            module: self.module,
            p_name: c"main".as_ptr(),
            ..Default::default()
        }
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_inferred_from_extension() {
        assert_eq!(
            ShaderKind::from_path(Path::new("shaders/pbr.frag")),
            Some(ShaderKind::Fragment)
        );
        assert_eq!(
            ShaderKind::from_path(Path::new("cube.vert")),
            Some(ShaderKind::Vertex)
        );
        assert_eq!(
            ShaderKind::from_path(Path::new("a.tese")),
            Some(ShaderKind::TessEvaluation)
        );
        assert_eq!(ShaderKind::from_path(Path::new("noext")), None);
        assert_eq!(ShaderKind::from_path(Path::new("x.glsl")), None);
    }

    #[test]
    fn compiles_minimal_fragment_shader() {
        let src = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(1.0); }\n";
        let words = compile_glsl(src, ShaderKind::Fragment, "min.frag").unwrap();
        // SPIR-V magic number
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = compile_glsl("#version 450\nvoid main() { oops }", ShaderKind::Vertex, "bad.vert")
            .unwrap_err();
        assert!(format!("{err:#}").contains("bad.vert"));
    }
}
