// SPDX-License-Identifier: CEPL-1.0
//! Tests against a real device. Each one returns early when no Vulkan device
//! is available, so they pass on machines without a GPU.
use std::sync::Arc;

use skylight_render_vk::mesh::skybox_geometry;
use skylight_render_vk::vk;
use skylight_render_vk::{
    utils, BuiltinShader, CubemapRenderer, DeviceContext, Mesh, QueryPool, ResourceError,
    ResourceManager, Shader, ShaderKind, Texture,
};

fn context() -> Option<Arc<DeviceContext>> {
    match DeviceContext::headless() {
        Ok(ctx) => Some(Arc::new(ctx)),
        Err(e) => {
            eprintln!("skipping: no Vulkan device ({e:#})");
            None
        }
    }
}

fn solid_rgba8(ctx: &Arc<DeviceContext>, w: u32, h: u32, rgba: [u8; 4], mipmapped: bool) -> Texture {
    let pixels = rgba.repeat((w * h) as usize);
    Texture::from_pixels(ctx.clone(), w, h, vk::Format::R8G8B8A8_UNORM, &pixels, mipmapped).unwrap()
}

fn assert_all_close(bytes: &[u8], rgba: [u8; 4], tolerance: u8, what: &str) {
    for (i, px) in bytes.chunks_exact(4).enumerate() {
        for c in 0..4 {
            let diff = px[c].abs_diff(rgba[c]);
            assert!(
                diff <= tolerance,
                "{what}: texel {i} channel {c} is {} (want {} ± {tolerance})",
                px[c],
                rgba[c]
            );
        }
    }
}

#[test]
fn texture_read_back_returns_uploaded_pixels() {
    let Some(ctx) = context() else { return };
    let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| (i * 3) as u8).collect();
    let tex = Texture::from_pixels(ctx, 4, 4, vk::Format::R8G8B8A8_UNORM, &pixels, false).unwrap();
    assert_eq!(tex.mip_levels(), 1);
    assert_eq!(tex.read_back(0, 0).unwrap(), pixels);
}

#[test]
fn mip_chain_of_a_solid_texture_stays_solid() {
    let Some(ctx) = context() else { return };
    let color = [40, 80, 160, 255];
    let tex = solid_rgba8(&ctx, 8, 8, color, true);
    assert_eq!(tex.mip_levels(), 4);
    let smallest = tex.read_back(0, 3).unwrap();
    assert_eq!(smallest.len(), 4);
    assert_all_close(&smallest, color, 1, "mip 3");
}

#[test]
fn wrong_pixel_count_is_rejected() {
    let Some(ctx) = context() else { return };
    let err = Texture::from_pixels(ctx, 2, 2, vk::Format::R8G8B8A8_UNORM, &[0; 12], false);
    assert!(err.is_err());
}

#[test]
fn baking_a_solid_panorama_gives_solid_faces() {
    let Some(ctx) = context() else { return };
    let color = [200, 100, 50, 255];
    let input = solid_rgba8(&ctx, 4, 2, color, false);
    let target = Texture::create_cube(ctx.clone(), 16, vk::Format::R8G8B8A8_UNORM, 1).unwrap();

    let vert = BuiltinShader::CubeVertex.load(ctx.clone()).unwrap();
    let frag = BuiltinShader::HdriToCube.load(ctx.clone()).unwrap();
    let baker = CubemapRenderer::new(ctx.clone(), &target, &vert, &frag).unwrap();
    baker.render(&input).unwrap();
    drop(baker);

    for face in 0..6 {
        let texels = target.read_back(face, 0).unwrap();
        assert_eq!(texels.len(), 16 * 16 * 4);
        assert_all_close(&texels, color, 1, &format!("face {face}"));
    }
}

#[test]
fn baking_twice_is_idempotent() {
    let Some(ctx) = context() else { return };
    let pixels: Vec<u8> = (0..8 * 4 * 4).map(|i| (i * 7 % 251) as u8).collect();
    let input = Texture::from_pixels(ctx.clone(), 8, 4, vk::Format::R8G8B8A8_UNORM, &pixels, false).unwrap();
    let target = Texture::create_cube(ctx.clone(), 8, vk::Format::R8G8B8A8_UNORM, 4).unwrap();

    let vert = BuiltinShader::CubeVertex.load(ctx.clone()).unwrap();
    let frag = BuiltinShader::HdriToCube.load(ctx.clone()).unwrap();
    let baker = CubemapRenderer::new(ctx.clone(), &target, &vert, &frag).unwrap();

    baker.render(&input).unwrap();
    let first: Vec<_> = (0..6).map(|f| target.read_back(f, 0).unwrap()).collect();
    baker.render(&input).unwrap();
    let second: Vec<_> = (0..6).map(|f| target.read_back(f, 0).unwrap()).collect();
    assert_eq!(first, second);
}

#[test]
fn irradiance_of_a_solid_environment_matches_it() {
    let Some(ctx) = context() else { return };
    let color = [120, 160, 200, 255];
    let input = solid_rgba8(&ctx, 4, 2, color, false);
    let environment = Texture::create_cube(ctx.clone(), 16, vk::Format::R8G8B8A8_UNORM, 1).unwrap();
    let irradiance = Texture::create_cube(ctx.clone(), 4, vk::Format::R8G8B8A8_UNORM, 1).unwrap();

    let vert = BuiltinShader::CubeVertex.load(ctx.clone()).unwrap();
    let to_cube = BuiltinShader::HdriToCube.load(ctx.clone()).unwrap();
    let convolve = BuiltinShader::DiffuseIrradiance.load(ctx.clone()).unwrap();
    CubemapRenderer::new(ctx.clone(), &environment, &vert, &to_cube)
        .unwrap()
        .render(&input)
        .unwrap();
    CubemapRenderer::new(ctx.clone(), &irradiance, &vert, &convolve)
        .unwrap()
        .render(&environment)
        .unwrap();

    for face in 0..6 {
        let texels = irradiance.read_back(face, 0).unwrap();
        assert_all_close(&texels, color, 3, &format!("irradiance face {face}"));
    }
}

#[test]
fn bake_target_must_be_a_cube() {
    let Some(ctx) = context() else { return };
    let flat = solid_rgba8(&ctx, 4, 4, [0; 4], false);
    let vert = BuiltinShader::CubeVertex.load(ctx.clone()).unwrap();
    let frag = BuiltinShader::HdriToCube.load(ctx.clone()).unwrap();
    assert!(CubemapRenderer::new(ctx, &flat, &vert, &frag).is_err());
}

#[test]
fn failed_shader_reload_keeps_the_old_module() {
    let Some(ctx) = context() else { return };
    let path = std::env::temp_dir().join(format!("skylight-reload-{}.frag", std::process::id()));
    let good = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(1.0); }\n";
    std::fs::write(&path, good).unwrap();

    let mut shader = Shader::compile_from_file(ctx, &path, None).unwrap();
    assert_eq!(shader.kind(), ShaderKind::Fragment);
    let before = shader.module();

    std::fs::write(&path, "#version 450\nvoid main() { this is not glsl }\n").unwrap();
    assert!(shader.reload().is_err());
    assert_eq!(shader.module(), before);

    std::fs::write(&path, good).unwrap();
    shader.reload().unwrap();
    assert_ne!(shader.module(), before);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn timestamps_are_monotonic() {
    let Some(ctx) = context() else { return };
    if !ctx.timestamps_supported() {
        eprintln!("skipping: no timestamp support");
        return;
    }
    let pool = QueryPool::timestamps(ctx.clone(), 2).unwrap();
    unsafe {
        utils::run_single_time_commands(&ctx, |_, cmd| {
            pool.reset(cmd, 0, 2);
            pool.write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, 0);
            pool.write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 1);
            Ok(())
        })
        .unwrap();
    }
    let ts = pool.results_u64(0, 2, vk::QueryResultFlags::WAIT).unwrap();
    assert!(ts[1] >= ts[0]);
    assert!(pool.results_u64(1, 2, vk::QueryResultFlags::WAIT).is_err());
}

#[test]
fn resource_manager_rejects_duplicate_ids() {
    let Some(ctx) = context() else { return };
    let mut resources = ResourceManager::new(ctx.clone());
    let first = solid_rgba8(&ctx, 2, 2, [1, 2, 3, 4], false);
    let first_view = first.view();
    resources.add_texture(5, first).unwrap();

    let second = solid_rgba8(&ctx, 2, 2, [9, 9, 9, 9], false);
    let err = resources.add_texture(5, second).unwrap_err();
    assert!(matches!(err, ResourceError::Duplicate { id: 5, .. }));
    assert_eq!(resources.texture(5).unwrap().view(), first_view);

    assert!(matches!(
        resources.load_texture(6, "/definitely/not/here.png"),
        Err(ResourceError::Load { id: 6, .. })
    ));
    assert!(resources.texture(6).is_err());

    resources.create_cube_mesh(0, 1.0).unwrap();
    assert!(resources.create_cube_mesh(0, 2.0).is_err());
    assert_eq!(resources.mesh(0).unwrap().index_count(), 36);
    resources.unload_mesh(0);
    assert!(resources.mesh(0).is_err());
}

#[test]
fn mesh_upload_keeps_counts() {
    let Some(ctx) = context() else { return };
    let geometry = skybox_geometry(2.0);
    let mesh = Mesh::from_geometry(ctx, &geometry).unwrap();
    assert_eq!(mesh.vertex_count(), geometry.vertices.len() as u32);
    assert_eq!(mesh.index_count(), geometry.indices.len() as u32);
}

const TOP: [u8; 4] = [255, 0, 0, 255];
const BOTTOM: [u8; 4] = [0, 0, 255, 255];
const POS_X: [u8; 4] = [0, 255, 0, 255];
const POS_Y: [u8; 4] = [0, 255, 255, 255];
const NEG_X: [u8; 4] = [255, 255, 0, 255];
const NEG_Y: [u8; 4] = [255, 0, 255, 255];

/// 8x64 Z-up panorama: a solid cap above 45° and below -45°, and around the
/// horizon one two-column block centred on each horizontal axis.
fn compass_panorama() -> Vec<u8> {
    let (w, h) = (8usize, 64usize);
    let mut pixels = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        for col in 0..w {
            let texel = if row < h / 4 {
                TOP
            } else if row >= 3 * h / 4 {
                BOTTOM
            } else {
                // u = atan(y, x) / 2π + 0.5: -Y at 0.25, +X at 0.5, +Y at 0.75, -X at 0 / 1
                match col {
                    1 | 2 => NEG_Y,
                    3 | 4 => POS_X,
                    5 | 6 => POS_Y,
                    _ => NEG_X,
                }
            };
            pixels.extend_from_slice(&texel);
        }
    }
    pixels
}

fn centre_texel(face: &[u8], size: usize) -> [u8; 4] {
    let i = ((size / 2) * size + size / 2) * 4;
    [face[i], face[i + 1], face[i + 2], face[i + 3]]
}

#[test]
fn baked_faces_follow_the_z_up_panorama_layout() {
    let Some(ctx) = context() else { return };
    let pixels = compass_panorama();
    let input = Texture::from_pixels(ctx.clone(), 8, 64, vk::Format::R8G8B8A8_UNORM, &pixels, false).unwrap();
    let size = 16;
    let target = Texture::create_cube(ctx.clone(), size, vk::Format::R8G8B8A8_UNORM, 1).unwrap();

    let vert = BuiltinShader::CubeVertex.load(ctx.clone()).unwrap();
    let frag = BuiltinShader::HdriToCube.load(ctx.clone()).unwrap();
    CubemapRenderer::new(ctx.clone(), &target, &vert, &frag)
        .unwrap()
        .render(&input)
        .unwrap();

    // Cube layers: +X, -X, +Y, -Y, +Z, -Z.
    let expected = [POS_X, NEG_X, POS_Y, NEG_Y, TOP, BOTTOM];
    for (face, want) in expected.into_iter().enumerate() {
        let texels = target.read_back(face as u32, 0).unwrap();
        let got = centre_texel(&texels, size as usize);
        assert_all_close(&got, want, 2, &format!("centre of face {face}"));
    }
}

#[test]
fn empty_host_writes_map_nothing() {
    let Some(ctx) = context() else { return };
    unsafe {
        let buf = utils::create_buffer(
            &ctx,
            16,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        let device = ctx.device();
        utils::write_host_visible(device, buf.memory, 0, &[1, 2, 3, 4]).unwrap();
        utils::write_host_visible(device, buf.memory, 0, &[]).unwrap();
        assert!(utils::read_host_visible(device, buf.memory, 0).unwrap().is_empty());
        assert_eq!(utils::read_host_visible(device, buf.memory, 4).unwrap(), [1, 2, 3, 4]);
        device.destroy_buffer(buf.buffer, None);
        device.free_memory(buf.memory, None);
    }
}

#[test]
fn texture_reload_picks_up_the_new_file() {
    let Some(ctx) = context() else { return };
    let path = std::env::temp_dir().join(format!("skylight-reload-{}.png", std::process::id()));
    image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]))
        .save(&path)
        .unwrap();

    let mut tex = Texture::load_from_file(ctx.clone(), &path).unwrap();
    assert_all_close(&tex.read_back(0, 0).unwrap(), [10, 20, 30, 255], 0, "before reload");

    image::RgbaImage::from_pixel(2, 2, image::Rgba([200, 100, 50, 255]))
        .save(&path)
        .unwrap();
    tex.reload().unwrap();
    assert_all_close(&tex.read_back(0, 0).unwrap(), [200, 100, 50, 255], 0, "after reload");

    std::fs::remove_file(&path).unwrap();
    assert!(tex.reload().is_err());
    assert_all_close(&tex.read_back(0, 0).unwrap(), [200, 100, 50, 255], 0, "after failed reload");

    let mut generated = solid_rgba8(&ctx, 1, 1, [0; 4], false);
    assert!(generated.reload().is_err());
}
