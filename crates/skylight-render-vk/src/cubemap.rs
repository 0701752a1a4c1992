// SPDX-License-Identifier: CEPL-1.0
//! Offscreen bake of a 2D or cube input onto the six faces of a cube texture.
//!
//! One render pass, one pipeline and one imageless framebuffer serve all six
//! faces; each face's view is supplied when its pass begins. All six passes go
//! into a single command buffer behind a single fence. The faces write
//! disjoint array layers, and the render pass's external dependencies order
//! the passes against the transfer work before and after them.
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use skylight_math::{cube_face_projection, cube_face_views, CUBE_FACE_COUNT};
use tracing::debug;

use crate::context::DeviceContext;
use crate::handles::{keep_all, Guard};
use crate::mesh::Mesh;
use crate::pipeline::{self, DepthState, GraphicsPipelineDesc, VertexLayout};
use crate::shader::Shader;
use crate::texture::{Texture, TextureKind};
use crate::utils::{self, BufferAlloc};

/// Matches `CubeUniforms` in `cube.vert`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CubeUniforms {
    pub views: [[[f32; 4]; 4]; CUBE_FACE_COUNT],
    pub proj: [[f32; 4]; 4],
}

impl CubeUniforms {
    pub fn new() -> Self {
        let views = cube_face_views().map(|m| m.to_cols_array_2d());
        Self {
            views,
            proj: cube_face_projection().to_cols_array_2d(),
        }
    }
}

impl Default for CubeUniforms {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CubemapRenderer<'a> {
    ctx: Arc<DeviceContext>,
    target: &'a Texture,
    face_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    uniforms: BufferAlloc,
    cube: Mesh,
}

unsafe fn create_bake_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let attachment = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        final_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::TRANSFER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    ];
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &attachment,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };
    Ok(unsafe { device.create_render_pass(&ci, None)? })
}

/// Framebuffer with no bound view; the face view is attached at pass begin.
unsafe fn create_imageless_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    target: &Texture,
) -> Result<vk::Framebuffer> {
    let format = target.format();
    let image_info = vk::FramebufferAttachmentImageInfo {
        s_type: vk::StructureType::FRAMEBUFFER_ATTACHMENT_IMAGE_INFO,
        flags: target.create_flags(),
        usage: target.usage(),
        width: target.width(),
        height: target.height(),
        layer_count: 1,
        view_format_count: 1,
        p_view_formats: &format,
        ..Default::default()
    };
    let attachments_info = vk::FramebufferAttachmentsCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_ATTACHMENTS_CREATE_INFO,
        attachment_image_info_count: 1,
        p_attachment_image_infos: &image_info,
        ..Default::default()
    };
    let ci = vk::FramebufferCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
        p_next: (&attachments_info as *const vk::FramebufferAttachmentsCreateInfo).cast(),
        flags: vk::FramebufferCreateFlags::IMAGELESS,
        render_pass,
        attachment_count: 1,
        width: target.width(),
        height: target.height(),
        layers: 1,
        ..Default::default()
    };
    Ok(unsafe { device.create_framebuffer(&ci, None)? })
}

impl<'a> CubemapRenderer<'a> {
    /// `vertex` is normally `cube.vert`; `fragment` decides what is baked.
    pub fn new(
        ctx: Arc<DeviceContext>,
        target: &'a Texture,
        vertex: &Shader,
        fragment: &Shader,
    ) -> Result<Self> {
        if target.kind() != TextureKind::Cube {
            bail!("cube bake target must be a cube texture");
        }
        let device = ctx.device();

        let mut face_views = Vec::with_capacity(CUBE_FACE_COUNT);
        for layer in 0..CUBE_FACE_COUNT as u32 {
            let range = utils::subresource_range(vk::ImageAspectFlags::COLOR, 0, 1, layer, 1);
            face_views.push(Guard::new(device, unsafe {
                utils::create_image_view(
                    device,
                    target.image(),
                    vk::ImageViewType::TYPE_2D,
                    target.format(),
                    range,
                )?
            }));
        }

        let render_pass = Guard::new(device, unsafe { create_bake_pass(device, target.format())? });
        let framebuffer = Guard::new(device, unsafe {
            create_imageless_framebuffer(device, render_pass.get(), target)?
        });

        let bindings = [
            utils::layout_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
            utils::layout_binding(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            ),
        ];
        let set_layout = Guard::new(device, unsafe {
            utils::create_descriptor_set_layout(device, &bindings)?
        });
        let push = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<u32>() as u32,
        };
        let pipeline_layout = Guard::new(device, unsafe {
            pipeline::create_pipeline_layout(device, &[set_layout.get()], &[push])?
        });
        let pipeline = Guard::new(device, unsafe {
            pipeline::create_graphics_pipeline(
                device,
                &GraphicsPipelineDesc {
                    vertex,
                    fragment,
                    vertex_layout: VertexLayout::PositionOnly,
                    cull_mode: vk::CullModeFlags::NONE,
                    depth: DepthState::DISABLED,
                    samples: vk::SampleCountFlags::TYPE_1,
                    render_pass: render_pass.get(),
                    layout: pipeline_layout.get(),
                },
            )
            .context("building cube bake pipeline")?
        });

        let uniform_bytes = bytemuck::bytes_of(&CubeUniforms::new()).to_vec();
        let uniforms = Guard::new(device, unsafe {
            utils::create_buffer(
                &ctx,
                uniform_bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?
        });
        unsafe { utils::write_host_visible(device, uniforms.get().memory, 0, &uniform_bytes)? };

        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
            },
        ];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let descriptor_pool = Guard::new(device, unsafe { device.create_descriptor_pool(&pool_ci, None)? });
        let layouts = [set_layout.get()];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: descriptor_pool.get(),
            descriptor_set_count: 1,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc)? }[0];
        unsafe {
            utils::bind_uniform_buffer(
                device,
                descriptor_set,
                0,
                uniforms.get().buffer,
                uniform_bytes.len() as vk::DeviceSize,
            )
        };

        let cube = Mesh::create_skybox(ctx.clone(), 1.0)?;

        Ok(Self {
            face_views: keep_all(face_views),
            render_pass: render_pass.keep(),
            framebuffer: framebuffer.keep(),
            set_layout: set_layout.keep(),
            pipeline_layout: pipeline_layout.keep(),
            pipeline: pipeline.keep(),
            descriptor_pool: descriptor_pool.keep(),
            descriptor_set,
            uniforms: uniforms.keep(),
            cube,
            target,
            ctx,
        })
    }

    pub fn target(&self) -> &Texture {
        self.target
    }

    /// Bakes `input` into every face of the target and regenerates its mips.
    /// Blocks until the GPU is done; the target ends in SHADER_READ_ONLY.
    pub fn render(&self, input: &Texture) -> Result<()> {
        let ctx = &*self.ctx;
        let device = ctx.device();
        let target = self.target;
        let extent = vk::Extent2D {
            width: target.width(),
            height: target.height(),
        };
        let whole = utils::subresource_range(
            vk::ImageAspectFlags::COLOR,
            0,
            target.mip_levels(),
            0,
            target.layer_count(),
        );

        unsafe {
            utils::bind_combined_image_sampler(device, self.descriptor_set, 1, input.view(), input.sampler());

            utils::run_single_time_commands(ctx, |device, cmd| {
                // Contents are replaced, so the previous layout is irrelevant.
                utils::record_layout_transition(
                    device,
                    cmd,
                    target.image(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    whole,
                )?;

                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_set],
                    &[],
                );
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                let area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                };
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[area]);

                let clear = vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 1.0],
                    },
                };
                for (face, view) in self.face_views.iter().enumerate() {
                    let attachment_info = vk::RenderPassAttachmentBeginInfo {
                        s_type: vk::StructureType::RENDER_PASS_ATTACHMENT_BEGIN_INFO,
                        attachment_count: 1,
                        p_attachments: view,
                        ..Default::default()
                    };
                    let begin = vk::RenderPassBeginInfo {
                        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                        p_next: (&attachment_info as *const vk::RenderPassAttachmentBeginInfo).cast(),
                        render_pass: self.render_pass,
                        framebuffer: self.framebuffer,
                        render_area: area,
                        clear_value_count: 1,
                        p_clear_values: &clear,
                        ..Default::default()
                    };
                    device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
                    device.cmd_push_constants(
                        cmd,
                        self.pipeline_layout,
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::bytes_of(&(face as u32)),
                    );
                    self.cube.draw(device, cmd);
                    device.cmd_end_render_pass(cmd);
                }
                Ok(())
            })
            .context("baking cube faces")?;

            utils::generate_mipmaps(
                ctx,
                target.image(),
                target.format(),
                target.width(),
                target.height(),
                target.mip_levels(),
                target.layer_count(),
            )?;
        }
        debug!(
            "baked {}x{} cube ({} mips)",
            extent.width,
            extent.height,
            target.mip_levels()
        );
        Ok(())
    }
}

// STRICT TEARDOWN ORDER: pipeline before its layout, framebuffer before the
// render pass and face views it was built against.
impl Drop for CubemapRenderer<'_> {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_buffer(self.uniforms.buffer, None);
            device.free_memory(self.uniforms.memory, None);
            device.destroy_framebuffer(self.framebuffer, None);
            device.destroy_render_pass(self.render_pass, None);
            for &view in &self.face_views {
                device.destroy_image_view(view, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_match_the_shader_block() {
        // six mat4 views + one mat4 projection, std140
        assert_eq!(std::mem::size_of::<CubeUniforms>(), 7 * 64);
    }

    #[test]
    fn uniforms_hold_every_face() {
        let u = CubeUniforms::new();
        let views = cube_face_views();
        for (i, v) in views.iter().enumerate() {
            assert_eq!(u.views[i], v.to_cols_array_2d());
        }
        assert_eq!(u.proj, cube_face_projection().to_cols_array_2d());
    }
}
