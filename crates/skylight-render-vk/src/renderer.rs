// SPDX-License-Identifier: CEPL-1.0
//! Skybox + PBR mesh under image-based lighting.
//!
//! Descriptor set 0 comes from the swapchain (frame uniforms), set 1 is owned
//! here: environment cube, irradiance cube, then the four material maps.
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use tracing::{debug, info, warn};

use crate::builtin::BuiltinShader;
use crate::context::DeviceContext;
use crate::cubemap::CubemapRenderer;
use crate::handles::Guard;
use crate::pipeline::{self, DepthState, GraphicsPipelineDesc, VertexLayout};
use crate::query_pool::{timestamp_delta_ms, QueryPool};
use crate::scene::{MaterialMap, RenderScene};
use crate::swapchain::{Frame, PassLoad, SwapChain};
use crate::texture::Texture;
use crate::utils;

const BINDING_ENVIRONMENT: u32 = 0;
const BINDING_IRRADIANCE: u32 = 1;
const BINDING_FIRST_MATERIAL: u32 = 2;
const SCENE_BINDINGS: u32 = 6;

#[derive(Clone, Copy, Debug)]
pub struct RendererConfig {
    /// Edge length of the baked environment cube; fully mipmapped.
    pub environment_size: u32,
    pub irradiance_size: u32,
    pub environment_format: vk::Format,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            environment_size: 512,
            irradiance_size: 32,
            environment_format: vk::Format::R16G16B16A16_SFLOAT,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Clone, Copy)]
struct Pipelines {
    skybox: vk::Pipeline,
    pbr: vk::Pipeline,
}

/// Two timestamps per swapchain image, read back the next time that image
/// comes around (its previous submission has completed by then).
struct FrameTimer {
    pool: QueryPool,
    written: Vec<bool>,
    period: f32,
    last_ms: Option<f64>,
}

impl FrameTimer {
    fn new(ctx: &Arc<DeviceContext>, image_count: usize) -> Option<Self> {
        if !ctx.timestamps_supported() || image_count == 0 {
            return None;
        }
        match QueryPool::timestamps(ctx.clone(), 2 * image_count as u32) {
            Ok(pool) => Some(Self {
                pool,
                written: vec![false; image_count],
                period: ctx.timestamp_period(),
                last_ms: None,
            }),
            Err(e) => {
                warn!("GPU frame timing disabled: {e:#}");
                None
            }
        }
    }

    fn collect(&mut self, image: usize) {
        if !self.written[image] {
            return;
        }
        match self
            .pool
            .results_u64(2 * image as u32, 2, vk::QueryResultFlags::empty())
        {
            Ok(ts) => {
                let ms = timestamp_delta_ms(ts[0], ts[1], self.period);
                self.last_ms = Some(ms);
                debug!(target: "gpu", "frame {ms:.3} ms");
            }
            Err(e) => debug!(target: "gpu", "timestamps unavailable: {e:#}"),
        }
    }

    unsafe fn begin(&mut self, cmd: vk::CommandBuffer, image: usize) {
        self.collect(image);
        let first = 2 * image as u32;
        unsafe {
            self.pool.reset(cmd, first, 2);
            self.pool
                .write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, first);
        }
    }

    unsafe fn end(&mut self, cmd: vk::CommandBuffer, image: usize) {
        unsafe {
            self.pool.write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                2 * image as u32 + 1,
            )
        };
        self.written[image] = true;
    }
}

pub struct Renderer {
    ctx: Arc<DeviceContext>,
    config: RendererConfig,
    scene_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipelines: Pipelines,
    descriptor_pool: vk::DescriptorPool,
    scene_set: vk::DescriptorSet,
    environment: Texture,
    irradiance: Texture,
    timer: Option<FrameTimer>,
}

impl Renderer {
    /// Builds pipelines against the swapchain's render pass and bakes
    /// `environment` of the scene.
    pub fn new(
        ctx: Arc<DeviceContext>,
        swapchain: &SwapChain,
        scene: &RenderScene,
        config: RendererConfig,
        environment: usize,
    ) -> Result<Self> {
        let device = ctx.device();

        let bindings: Vec<_> = (0..SCENE_BINDINGS)
            .map(|b| {
                utils::layout_binding(
                    b,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                )
            })
            .collect();
        let scene_set_layout = Guard::new(device, unsafe {
            utils::create_descriptor_set_layout(device, &bindings)?
        });
        let pipeline_layout = Guard::new(device, unsafe {
            pipeline::create_pipeline_layout(
                device,
                &[swapchain.descriptor_set_layout(), scene_set_layout.get()],
                &[],
            )?
        });

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: SCENE_BINDINGS,
        };
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        let descriptor_pool = Guard::new(device, unsafe { device.create_descriptor_pool(&pool_ci, None)? });
        let layouts = [scene_set_layout.get()];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: descriptor_pool.get(),
            descriptor_set_count: 1,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let scene_set = unsafe { device.allocate_descriptor_sets(&alloc)? }[0];

        let env_size = config.environment_size.max(1);
        let environment_cube = Texture::create_cube(
            ctx.clone(),
            env_size,
            config.environment_format,
            utils::mip_levels_for(env_size, env_size),
        )
        .context("creating environment cube")?;
        let irradiance_cube = Texture::create_cube(
            ctx.clone(),
            config.irradiance_size.max(1),
            config.environment_format,
            1,
        )
        .context("creating irradiance cube")?;

        let pipelines = unsafe { build_pipelines(device, swapchain, scene, pipeline_layout.get())? };
        let mut renderer = Self {
            timer: FrameTimer::new(&ctx, swapchain.image_count()),
            config,
            scene_set_layout: scene_set_layout.keep(),
            pipeline_layout: pipeline_layout.keep(),
            pipelines,
            descriptor_pool: descriptor_pool.keep(),
            scene_set,
            environment: environment_cube,
            irradiance: irradiance_cube,
            ctx,
        };
        // From here on `Drop` owns every handle.
        renderer.bind_scene(scene)?;
        renderer.set_environment(scene, environment)?;
        info!(
            "renderer ready: environment {}x{}, irradiance {}x{}",
            renderer.environment.width(),
            renderer.environment.height(),
            renderer.irradiance.width(),
            renderer.irradiance.height()
        );
        Ok(renderer)
    }

    fn bind_scene(&self, scene: &RenderScene) -> Result<()> {
        let device = self.ctx.device();
        unsafe {
            utils::bind_combined_image_sampler(
                device,
                self.scene_set,
                BINDING_ENVIRONMENT,
                self.environment.view(),
                self.environment.sampler(),
            );
            utils::bind_combined_image_sampler(
                device,
                self.scene_set,
                BINDING_IRRADIANCE,
                self.irradiance.view(),
                self.irradiance.sampler(),
            );
            for (i, map) in MaterialMap::ALL.into_iter().enumerate() {
                let tex = scene.material(map)?;
                utils::bind_combined_image_sampler(
                    device,
                    self.scene_set,
                    BINDING_FIRST_MATERIAL + i as u32,
                    tex.view(),
                    tex.sampler(),
                );
            }
        }
        Ok(())
    }

    /// Bakes the scene's HDR panorama `index` into the environment cube and
    /// convolves that into the irradiance cube. Waits for the GPU first.
    pub fn set_environment(&mut self, scene: &RenderScene, index: usize) -> Result<()> {
        let hdr = scene.environment(index)?;
        self.ctx.wait_idle()?;

        let cube_vert = scene.shader(BuiltinShader::CubeVertex)?;
        CubemapRenderer::new(
            self.ctx.clone(),
            &self.environment,
            cube_vert,
            scene.shader(BuiltinShader::HdriToCube)?,
        )?
        .render(hdr)
        .context("baking environment cube")?;
        CubemapRenderer::new(
            self.ctx.clone(),
            &self.irradiance,
            cube_vert,
            scene.shader(BuiltinShader::DiffuseIrradiance)?,
        )?
        .render(&self.environment)
        .context("baking irradiance cube")?;

        info!(
            "environment {index} ({}) baked",
            scene.environment_path(index).unwrap_or("?")
        );
        Ok(())
    }

    /// Rebuilds pipelines for a recreated swapchain. Baked cubes are kept.
    pub fn resize(&mut self, swapchain: &SwapChain, scene: &RenderScene) -> Result<()> {
        let pipelines = unsafe { build_pipelines(self.ctx.device(), swapchain, scene, self.pipeline_layout)? };
        self.ctx.wait_idle()?;
        self.replace_pipelines(pipelines);
        self.timer = FrameTimer::new(&self.ctx, swapchain.image_count());
        Ok(())
    }

    /// Rebuilds pipelines from the scene's current shader modules. The old
    /// pipelines stay bound unless every new one builds.
    pub fn reload(&mut self, swapchain: &SwapChain, scene: &RenderScene) -> Result<()> {
        let pipelines = unsafe { build_pipelines(self.ctx.device(), swapchain, scene, self.pipeline_layout) }
            .context("rebuilding pipelines; keeping the previous ones")?;
        self.ctx.wait_idle()?;
        self.replace_pipelines(pipelines);
        info!("pipelines reloaded");
        Ok(())
    }

    fn replace_pipelines(&mut self, pipelines: Pipelines) {
        let old = std::mem::replace(&mut self.pipelines, pipelines);
        unsafe { destroy_pipelines(self.ctx.device(), old) };
    }

    /// Records the scene into `frame`: clears, draws the skybox, then the mesh.
    pub unsafe fn render(&mut self, frame: &Frame, scene: &RenderScene) {
        let device = self.ctx.device();
        let cmd = frame.command_buffer();
        let image = frame.image_index() as usize;

        unsafe {
            if let Some(timer) = self.timer.as_mut() {
                timer.begin(cmd, image);
            }

            frame.begin_render_pass(device, PassLoad::Clear, self.config.clear_color);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[frame.descriptor_set(), self.scene_set],
                &[],
            );

            if let Ok(skybox) = scene.skybox_mesh() {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines.skybox);
                skybox.draw(device, cmd);
            }
            if let Some(mesh) = scene.mesh() {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines.pbr);
                mesh.draw(device, cmd);
            }
            frame.end_render_pass(device);

            if let Some(timer) = self.timer.as_mut() {
                timer.end(cmd, image);
            }
        }
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.config.clear_color = rgba;
    }

    /// Last measured GPU time of a whole frame, when timestamps are supported.
    pub fn gpu_frame_ms(&self) -> Option<f64> {
        self.timer.as_ref().and_then(|t| t.last_ms)
    }

    pub fn environment(&self) -> &Texture {
        &self.environment
    }

    pub fn irradiance(&self) -> &Texture {
        &self.irradiance
    }
}

unsafe fn build_pipelines(
    device: &ash::Device,
    swapchain: &SwapChain,
    scene: &RenderScene,
    layout: vk::PipelineLayout,
) -> Result<Pipelines> {
    let render_pass = swapchain.render_pass();
    let samples = swapchain.samples();

    let skybox = Guard::new(device, unsafe {
        pipeline::create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vertex: scene.shader(BuiltinShader::SkyboxVertex)?,
                fragment: scene.shader(BuiltinShader::SkyboxFragment)?,
                vertex_layout: VertexLayout::PositionOnly,
                cull_mode: vk::CullModeFlags::NONE,
                depth: DepthState::BACKGROUND,
                samples,
                render_pass,
                layout,
            },
        )
        .context("skybox pipeline")?
    });
    let pbr = unsafe {
        pipeline::create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vertex: scene.shader(BuiltinShader::PbrVertex)?,
                fragment: scene.shader(BuiltinShader::PbrFragment)?,
                vertex_layout: VertexLayout::Full,
                cull_mode: vk::CullModeFlags::BACK,
                depth: DepthState::LESS,
                samples,
                render_pass,
                layout,
            },
        )
        .context("pbr pipeline")?
    };
    Ok(Pipelines {
        skybox: skybox.keep(),
        pbr,
    })
}

unsafe fn destroy_pipelines(device: &ash::Device, p: Pipelines) {
    unsafe {
        device.destroy_pipeline(p.skybox, None);
        device.destroy_pipeline(p.pbr, None);
    }
}

// STRICT TEARDOWN ORDER: pipelines, then their layout, then the set layout.
// Textures and the query pool release themselves afterwards.
impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        let device = self.ctx.device();
        unsafe {
            destroy_pipelines(device, self.pipelines);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.scene_set_layout, None);
        }
    }
}
