// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::context::DeviceContext;
use crate::mesh::Mesh;
use crate::shader::{Shader, ShaderKind};
use crate::texture::Texture;

pub type ResourceId = u32;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{kind} id {id} is already taken")]
    Duplicate { kind: &'static str, id: ResourceId },
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: ResourceId },
    #[error("loading {kind} {id}")]
    Load {
        kind: &'static str,
        id: ResourceId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Id → owned value with unique ids. Inserting over a taken id is rejected and
/// leaves the existing value in place.
#[derive(Debug)]
pub struct ResourceRegistry<T> {
    kind: &'static str,
    items: HashMap<ResourceId, T>,
}

impl<T> ResourceRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: HashMap::new(),
        }
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.items.contains_key(&id)
    }

    /// Fails before calling `make` when `id` is taken, so nothing is created.
    pub fn try_insert_with<F>(&mut self, id: ResourceId, make: F) -> Result<&mut T, ResourceError>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        if self.contains(id) {
            warn!("{} id {id} is already taken; keeping the existing one", self.kind);
            return Err(ResourceError::Duplicate { kind: self.kind, id });
        }
        let value = make().map_err(|e| ResourceError::Load {
            kind: self.kind,
            id,
            source: e.into(),
        })?;
        Ok(self.items.entry(id).or_insert(value))
    }

    pub fn insert(&mut self, id: ResourceId, value: T) -> Result<&mut T, ResourceError> {
        self.try_insert_with(id, || Ok(value))
    }

    pub fn get(&self, id: ResourceId) -> Result<&T, ResourceError> {
        self.items.get(&id).ok_or(ResourceError::NotFound { kind: self.kind, id })
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Result<&mut T, ResourceError> {
        self.items
            .get_mut(&id)
            .ok_or(ResourceError::NotFound { kind: self.kind, id })
    }

    /// Unknown ids are ignored.
    pub fn remove(&mut self, id: ResourceId) -> Option<T> {
        self.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.items.keys().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceId, &mut T)> {
        self.items.iter_mut().map(|(id, v)| (*id, v))
    }
}

/// Owns every mesh, shader and texture of a scene by id.
pub struct ResourceManager {
    ctx: Arc<DeviceContext>,
    meshes: ResourceRegistry<Mesh>,
    shaders: ResourceRegistry<Shader>,
    textures: ResourceRegistry<Texture>,
}

impl ResourceManager {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            meshes: ResourceRegistry::new("mesh"),
            shaders: ResourceRegistry::new("shader"),
            textures: ResourceRegistry::new("texture"),
        }
    }

    pub fn create_cube_mesh(&mut self, id: ResourceId, size: f32) -> Result<&Mesh, ResourceError> {
        let ctx = self.ctx.clone();
        self.meshes
            .try_insert_with(id, || Mesh::create_skybox(ctx, size))
            .map(|m| &*m)
    }

    pub fn load_mesh(&mut self, id: ResourceId, path: impl AsRef<Path>) -> Result<&Mesh, ResourceError> {
        let ctx = self.ctx.clone();
        self.meshes
            .try_insert_with(id, || Mesh::load_from_file(ctx, path))
            .map(|m| &*m)
    }

    pub fn mesh(&self, id: ResourceId) -> Result<&Mesh, ResourceError> {
        self.meshes.get(id)
    }

    pub fn unload_mesh(&mut self, id: ResourceId) {
        self.meshes.remove(id);
    }

    /// `kind` is inferred from the extension when `None`.
    pub fn load_shader(
        &mut self,
        id: ResourceId,
        path: impl AsRef<Path>,
        kind: Option<ShaderKind>,
    ) -> Result<&Shader, ResourceError> {
        let ctx = self.ctx.clone();
        self.shaders
            .try_insert_with(id, || Shader::compile_from_file(ctx, path, kind))
            .map(|s| &*s)
    }

    /// Registers an already-built shader (e.g. from embedded SPIR-V).
    pub fn add_shader(&mut self, id: ResourceId, shader: Shader) -> Result<&Shader, ResourceError> {
        self.shaders.insert(id, shader).map(|s| &*s)
    }

    pub fn shader(&self, id: ResourceId) -> Result<&Shader, ResourceError> {
        self.shaders.get(id)
    }

    pub fn unload_shader(&mut self, id: ResourceId) {
        self.shaders.remove(id);
    }

    /// Recompiles every shader. Each one keeps its old module if its own
    /// compile fails; the first failure is returned after all were tried.
    pub fn reload_shaders(&mut self) -> anyhow::Result<()> {
        let mut first_err = None;
        for (id, shader) in self.shaders.iter_mut() {
            if let Err(e) = shader.reload() {
                warn!("shader {id} ({}) kept its previous module: {e:#}", shader.path().display());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn load_texture(&mut self, id: ResourceId, path: impl AsRef<Path>) -> Result<&Texture, ResourceError> {
        let ctx = self.ctx.clone();
        self.textures
            .try_insert_with(id, || Texture::load_from_file(ctx, path))
            .map(|t| &*t)
    }

    pub fn add_texture(&mut self, id: ResourceId, texture: Texture) -> Result<&Texture, ResourceError> {
        self.textures.insert(id, texture).map(|t| &*t)
    }

    pub fn texture(&self, id: ResourceId) -> Result<&Texture, ResourceError> {
        self.textures.get(id)
    }

    pub fn unload_texture(&mut self, id: ResourceId) {
        self.textures.remove(id);
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_keeps_first_value() {
        let mut reg = ResourceRegistry::new("thing");
        reg.insert(1, "first").unwrap();
        let err = reg.insert(1, "second").unwrap_err();
        assert!(matches!(err, ResourceError::Duplicate { id: 1, .. }));
        assert_eq!(*reg.get(1).unwrap(), "first");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_id_never_builds_the_value() {
        let mut reg = ResourceRegistry::new("thing");
        reg.insert(7, 0u32).unwrap();
        let mut called = false;
        let _ = reg.try_insert_with(7, || {
            called = true;
            Ok(1)
        });
        assert!(!called);
    }

    #[test]
    fn failed_load_leaves_id_free() {
        let mut reg: ResourceRegistry<u32> = ResourceRegistry::new("thing");
        let err = reg
            .try_insert_with(3, || Err(anyhow::anyhow!("missing file")))
            .unwrap_err();
        assert!(matches!(err, ResourceError::Load { id: 3, .. }));
        assert!(!reg.contains(3));
        reg.insert(3, 9).unwrap();
        assert_eq!(*reg.get(3).unwrap(), 9);
    }

    #[test]
    fn missing_and_removed_ids() {
        let mut reg = ResourceRegistry::new("thing");
        assert!(matches!(reg.get(4), Err(ResourceError::NotFound { id: 4, .. })));
        reg.insert(4, 'x').unwrap();
        assert_eq!(reg.remove(4), Some('x'));
        assert_eq!(reg.remove(4), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn errors_name_the_resource_kind() {
        let mut reg = ResourceRegistry::new("texture");
        reg.insert(2, ()).unwrap();
        let msg = reg.insert(2, ()).unwrap_err().to_string();
        assert_eq!(msg, "texture id 2 is already taken");
    }
}
