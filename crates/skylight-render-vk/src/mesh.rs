// SPDX-License-Identifier: CEPL-1.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use skylight_math::Vec3;
use tracing::info;

use crate::context::DeviceContext;
use crate::handles::Guard;
use crate::utils::{self, BufferAlloc};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations 0..=3: position, normal, tangent, uv.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        let attr = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        [
            attr(0, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, position)),
            attr(1, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, normal)),
            attr(2, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, tangent)),
            attr(3, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Vertex, uv)),
        ]
    }
}

/// CPU-side indexed triangle list.
#[derive(Clone, Debug, Default)]
pub struct Geometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Axis-aligned cube spanning `[-size, size]` on every axis. Faces are not
/// culled when drawn, so winding is irrelevant.
pub fn skybox_geometry(size: f32) -> Geometry {
    let vertices = (0..8)
        .map(|i| {
            let p = Vec3::new(
                if i & 1 == 0 { -size } else { size },
                if i & 2 == 0 { -size } else { size },
                if i & 4 == 0 { -size } else { size },
            );
            Vertex {
                position: p.to_array(),
                normal: (-p).normalize_or_zero().to_array(),
                ..Default::default()
            }
        })
        .collect();

    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 3, 6, 7, // +y
        0, 4, 2, 2, 4, 6, // -x
        1, 3, 5, 3, 7, 5, // +x
    ];
    Geometry { vertices, indices }
}

/// Per-vertex tangents from UV gradients, orthogonalized against the normal.
/// Vertices without a usable UV gradient get an arbitrary perpendicular.
pub fn compute_tangents(geometry: &mut Geometry) {
    let mut accum = vec![Vec3::ZERO; geometry.vertices.len()];
    for tri in geometry.indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let (va, vb, vc) = (
            &geometry.vertices[a],
            &geometry.vertices[b],
            &geometry.vertices[c],
        );
        let e1 = Vec3::from(vb.position) - Vec3::from(va.position);
        let e2 = Vec3::from(vc.position) - Vec3::from(va.position);
        let (du1, dv1) = (vb.uv[0] - va.uv[0], vb.uv[1] - va.uv[1]);
        let (du2, dv2) = (vc.uv[0] - va.uv[0], vc.uv[1] - va.uv[1]);
        let det = du1 * dv2 - du2 * dv1;
        if det.abs() < 1e-12 {
            continue;
        }
        let t = (e1 * dv2 - e2 * dv1) / det;
        for i in [a, b, c] {
            accum[i] += t;
        }
    }

    for (v, t) in geometry.vertices.iter_mut().zip(accum) {
        let n = Vec3::from(v.normal);
        let ortho = (t - n * n.dot(t)).normalize_or_zero();
        let tangent = if ortho == Vec3::ZERO {
            n.any_orthonormal_vector()
        } else {
            ortho
        };
        v.tangent = tangent.to_array();
    }
}

fn smooth_normals(geometry: &mut Geometry) {
    let mut accum = vec![Vec3::ZERO; geometry.vertices.len()];
    for tri in geometry.indices.chunks_exact(3) {
        let p = |i: u32| Vec3::from(geometry.vertices[i as usize].position);
        let n = (p(tri[1]) - p(tri[0])).cross(p(tri[2]) - p(tri[0]));
        for &i in tri {
            accum[i as usize] += n;
        }
    }
    for (v, n) in geometry.vertices.iter_mut().zip(accum) {
        v.normal = n.normalize_or(Vec3::Z).to_array();
    }
}

/// Loads every model of a Wavefront `.obj` into one triangle list.
pub fn load_obj_geometry(path: &Path) -> Result<Geometry> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            single_index: true,
            triangulate: true,
            ..Default::default()
        },
    )
    .with_context(|| format!("loading {}", path.display()))?;

    let mut geometry = Geometry::default();
    let mut missing_normals = false;
    for model in &models {
        let mesh = &model.mesh;
        let base = geometry.vertices.len() as u32;
        let count = mesh.positions.len() / 3;
        missing_normals |= mesh.normals.len() != mesh.positions.len();

        for i in 0..count {
            let normal = mesh
                .normals
                .get(3 * i..3 * i + 3)
                .map(|n| [n[0], n[1], n[2]])
                .unwrap_or_default();
            let uv = mesh
                .texcoords
                .get(2 * i..2 * i + 2)
                .map(|t| [t[0], 1.0 - t[1]])
                .unwrap_or_default();
            geometry.vertices.push(Vertex {
                position: [
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                ],
                normal,
                tangent: [0.0; 3],
                uv,
            });
        }
        geometry.indices.extend(mesh.indices.iter().map(|&i| base + i));
    }

    if geometry.indices.is_empty() {
        bail!("{} contains no triangles", path.display());
    }
    if missing_normals {
        smooth_normals(&mut geometry);
    }
    compute_tangents(&mut geometry);
    Ok(geometry)
}

/// Device-local vertex and index buffers.
pub struct Mesh {
    ctx: Arc<DeviceContext>,
    vertices: BufferAlloc,
    indices: BufferAlloc,
    vertex_count: u32,
    index_count: u32,
    path: Option<PathBuf>,
}

impl Mesh {
    pub fn create_skybox(ctx: Arc<DeviceContext>, size: f32) -> Result<Self> {
        Self::from_geometry(ctx, &skybox_geometry(size))
    }

    pub fn from_geometry(ctx: Arc<DeviceContext>, geometry: &Geometry) -> Result<Self> {
        if geometry.vertices.is_empty() || geometry.indices.is_empty() {
            bail!("cannot upload empty geometry");
        }
        let device = ctx.device();
        let vertices = Guard::new(device, unsafe {
            utils::create_device_local_buffer(
                &ctx,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                bytemuck::cast_slice(&geometry.vertices),
            )?
        });
        let indices = unsafe {
            utils::create_device_local_buffer(
                &ctx,
                vk::BufferUsageFlags::INDEX_BUFFER,
                bytemuck::cast_slice(&geometry.indices),
            )?
        };
        let vertices = vertices.keep();
        Ok(Self {
            ctx,
            vertices,
            indices,
            vertex_count: geometry.vertices.len() as u32,
            index_count: geometry.indices.len() as u32,
            path: None,
        })
    }

    pub fn load_from_file(ctx: Arc<DeviceContext>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let geometry = load_obj_geometry(path)?;
        let mut mesh = Self::from_geometry(ctx, &geometry)?;
        mesh.path = Some(path.to_path_buf());
        info!(
            "loaded mesh {} ({} vertices, {} indices)",
            path.display(),
            mesh.vertex_count,
            mesh.index_count
        );
        Ok(mesh)
    }

    /// Rebuilds from the source file; the current buffers stay in use on failure.
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            bail!("mesh was not loaded from a file");
        };
        let fresh = Self::load_from_file(self.ctx.clone(), path)?;
        // Recorded command buffers may still reference the old buffers.
        self.ctx.wait_idle()?;
        *self = fresh;
        Ok(())
    }

    /// Binds both buffers and issues one indexed draw.
    pub unsafe fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.indices.buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }
    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_buffer(self.indices.buffer, None);
            device.free_memory(self.indices.memory, None);
            device.destroy_buffer(self.vertices.buffer, None);
            device.free_memory(self.vertices.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 44);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[2].offset, 24);
        assert_eq!(attrs[3].offset, 36);
        assert_eq!(Vertex::binding_description().stride, 44);
    }

    #[test]
    fn skybox_is_a_closed_cube() {
        let g = skybox_geometry(2.0);
        assert_eq!(g.vertices.len(), 8);
        assert_eq!(g.indices.len(), 36);
        assert!(g.indices.iter().all(|&i| i < 8));
        for v in &g.vertices {
            assert!(v.position.iter().all(|c| c.abs() == 2.0));
        }
        // every edge of a closed triangle mesh is shared by exactly two triangles
        let mut edges = std::collections::HashMap::new();
        for tri in g.indices.chunks_exact(3) {
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                *edges.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        assert!(edges.values().all(|&n| n == 2));
    }

    #[test]
    fn skybox_triangles_are_not_degenerate() {
        let g = skybox_geometry(1.0);
        for tri in g.indices.chunks_exact(3) {
            let p = |i: u32| Vec3::from(g.vertices[i as usize].position);
            let area = (p(tri[1]) - p(tri[0])).cross(p(tri[2]) - p(tri[0])).length();
            assert!(area > 1e-3);
        }
    }

    #[test]
    fn tangents_follow_u_direction() {
        let mut g = Geometry {
            vertices: vec![
                Vertex { position: [0.0, 0.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 0.0], ..Default::default() },
                Vertex { position: [1.0, 0.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 0.0], ..Default::default() },
                Vertex { position: [0.0, 1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 1.0], ..Default::default() },
            ],
            indices: vec![0, 1, 2],
        };
        compute_tangents(&mut g);
        for v in &g.vertices {
            assert!((Vec3::from(v.tangent) - Vec3::X).length() < 1e-5);
        }
    }

    #[test]
    fn tangents_without_uvs_are_still_perpendicular() {
        let mut g = skybox_geometry(1.0);
        compute_tangents(&mut g);
        for v in &g.vertices {
            let (n, t) = (Vec3::from(v.normal), Vec3::from(v.tangent));
            assert!(n.dot(t).abs() < 1e-4);
            assert!((t.length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn obj_files_are_triangulated_and_flip_v() {
        let path = std::env::temp_dir().join(format!("skylight-quad-{}.obj", std::process::id()));
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             vn 0 0 1\n\
             f 1/1/1 2/2/1 3/3/1 4/4/1\n",
        )
        .unwrap();
        let g = load_obj_geometry(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(g.indices.len(), 6);
        assert_eq!(g.vertices.len(), 4);
        let first = g.vertices.iter().find(|v| v.position == [0.0, 0.0, 0.0]).unwrap();
        assert_eq!(first.uv, [0.0, 1.0]);
        assert_eq!(first.normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn obj_without_normals_gets_smooth_normals() {
        let path = std::env::temp_dir().join(format!("skylight-tri-{}.obj", std::process::id()));
        std::fs::write(&path, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        let g = load_obj_geometry(&path).unwrap();
        std::fs::remove_file(&path).ok();
        for v in &g.vertices {
            assert!((Vec3::from(v.normal) - Vec3::Z).length() < 1e-5);
        }
    }

    #[test]
    fn missing_obj_is_an_error() {
        assert!(load_obj_geometry(Path::new("/nonexistent/skylight.obj")).is_err());
    }
}
