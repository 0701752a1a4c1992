// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device context, GPU resources, swapchain frame protocol,
//! cube map baking and the IBL scene renderer.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod builtin;
pub mod context;
pub mod cubemap;
pub mod engine;
mod handles;
pub mod mesh;
pub mod pipeline;
pub mod query_pool;
pub mod renderer;
pub mod resource_manager;
pub mod scene;
pub mod shader;
pub mod swapchain;
pub mod texture;
pub mod utils;

pub use ash::vk;

pub use builtin::BuiltinShader;
pub use context::DeviceContext;
pub use cubemap::CubemapRenderer;
pub use engine::{Engine, EngineConfig, FrameOverlay};
pub use mesh::{Geometry, Mesh, Vertex};
pub use query_pool::QueryPool;
pub use renderer::{Renderer, RendererConfig};
pub use resource_manager::{ResourceError, ResourceId, ResourceManager, ResourceRegistry};
pub use scene::{MaterialMap, RenderScene, SceneConfig};
pub use shader::{Shader, ShaderKind};
pub use swapchain::{
    Frame, FrameError, PassLoad, Recreate, SwapChain, SwapChainConfig, SwapChainState, VsyncMode,
};
pub use texture::{Texture, TextureKind};
pub use utils::UtilError;
