// SPDX-License-Identifier: CEPL-1.0
//! Stateless helpers for buffers, images and one-shot command submission.
//!
//! Everything here takes the `DeviceContext` (or a bare `ash::Device`) it works
//! on explicitly. Functions that submit work block until the queue is done.
use anyhow::{Context, Result};
use ash::vk;
use thiserror::Error;

use crate::context::DeviceContext;
use crate::handles::Guard;

#[derive(Debug, Error)]
pub enum UtilError {
    #[error("no memory type matches bits {type_bits:#x} with {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("unsupported layout transition {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    #[error("format {0:?} does not support linear blitting")]
    LinearBlitUnsupported(vk::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct BufferAlloc {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageAlloc {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, UtilError> {
    (0..props.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(UtilError::NoSuitableMemoryType {
            type_bits,
            required,
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Access and stage masks for the layout pairs the engine uses. Any other pair
/// is rejected rather than guessed.
pub fn transition_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<LayoutMasks, UtilError> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (from, to) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_READ,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            A::SHADER_READ,
            A::TRANSFER_READ,
            S::FRAGMENT_SHADER,
            S::TRANSFER,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => (
            A::SHADER_READ,
            A::TRANSFER_WRITE,
            S::FRAGMENT_SHADER,
            S::TRANSFER,
        ),
        _ => return Err(UtilError::UnsupportedLayoutTransition { from, to }),
    };
    Ok(LayoutMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32
    ) || has_stencil_component(format)
}

pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil_component(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Full chain length down to 1x1.
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Highest sample count supported by both color and depth framebuffers.
pub fn max_usable_sample_count(props: &vk::PhysicalDeviceProperties) -> vk::SampleCountFlags {
    let counts = props.limits.framebuffer_color_sample_counts
        & props.limits.framebuffer_depth_sample_counts;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|c| counts.contains(*c))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

pub fn pick_depth_format(ctx: &DeviceContext) -> Result<vk::Format> {
    [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ]
    .into_iter()
    .find(|&f| {
        ctx.format_properties(f)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
    .context("no supported depth format")
}

pub fn subresource_range(
    aspect_mask: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
    base_array_layer: u32,
    layer_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level,
        level_count,
        base_array_layer,
        layer_count,
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

pub unsafe fn create_buffer(
    ctx: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> Result<BufferAlloc> {
    let device = ctx.device();
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buffer = Guard::new(device, unsafe { device.create_buffer(&bci, None)? });
    let req = unsafe { device.get_buffer_memory_requirements(buffer.get()) };
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: find_memory_type(ctx.memory_properties(), req.memory_type_bits, props)?,
        ..Default::default()
    };
    let memory = Guard::new(device, unsafe { device.allocate_memory(&mai, None)? });
    unsafe { device.bind_buffer_memory(buffer.get(), memory.get(), 0)? };
    Ok(BufferAlloc {
        buffer: buffer.keep(),
        memory: memory.keep(),
        size,
    })
}

/// Memory must be HOST_VISIBLE | HOST_COHERENT. An empty `bytes` maps nothing.
pub unsafe fn write_host_visible(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    unsafe {
        let ptr = device.map_memory(
            memory,
            offset,
            bytes.len() as vk::DeviceSize,
            vk::MemoryMapFlags::empty(),
        )?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        device.unmap_memory(memory);
    }
    Ok(())
}

pub unsafe fn read_host_visible(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    if len == 0 {
        return Ok(out);
    }
    unsafe {
        let ptr = device.map_memory(memory, 0, len as vk::DeviceSize, vk::MemoryMapFlags::empty())?;
        std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), len);
        device.unmap_memory(memory);
    }
    Ok(out)
}

pub unsafe fn create_staging_buffer(ctx: &DeviceContext, bytes: &[u8]) -> Result<BufferAlloc> {
    let staging = unsafe {
        create_buffer(
            ctx,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?
    };
    let staging = Guard::new(ctx.device(), staging);
    unsafe { write_host_visible(ctx.device(), staging.get().memory, 0, bytes)? };
    Ok(staging.keep())
}

/// Device-local buffer filled through a temporary staging buffer.
pub unsafe fn create_device_local_buffer(
    ctx: &DeviceContext,
    usage: vk::BufferUsageFlags,
    bytes: &[u8],
) -> Result<BufferAlloc> {
    let device = ctx.device();
    let size = bytes.len() as vk::DeviceSize;
    let staging = Guard::new(device, unsafe { create_staging_buffer(ctx, bytes)? });
    let dst = Guard::new(device, unsafe {
        create_buffer(
            ctx,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?
    });
    unsafe { copy_buffer(ctx, staging.get().buffer, dst.get().buffer, size)? };
    Ok(dst.keep())
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl ImageDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
            flags: vk::ImageCreateFlags::empty(),
        }
    }

    pub fn new_cube(size: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            array_layers: 6,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ..Self::new_2d(size, size, format, usage)
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

pub unsafe fn create_image(
    ctx: &DeviceContext,
    desc: &ImageDesc,
    props: vk::MemoryPropertyFlags,
) -> Result<ImageAlloc> {
    let device = ctx.device();
    let ici = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        flags: desc.flags,
        image_type: vk::ImageType::TYPE_2D,
        format: desc.format,
        extent: vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        },
        mip_levels: desc.mip_levels,
        array_layers: desc.array_layers,
        samples: desc.samples,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: desc.usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };
    let image = Guard::new(device, unsafe { device.create_image(&ici, None)? });
    let req = unsafe { device.get_image_memory_requirements(image.get()) };
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: find_memory_type(ctx.memory_properties(), req.memory_type_bits, props)?,
        ..Default::default()
    };
    let memory = Guard::new(device, unsafe { device.allocate_memory(&mai, None)? });
    unsafe { device.bind_image_memory(image.get(), memory.get(), 0)? };
    Ok(ImageAlloc {
        image: image.keep(),
        memory: memory.keep(),
    })
}

pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type,
        format,
        subresource_range: range,
        ..Default::default()
    };
    Ok(unsafe { device.create_image_view(&ci, None)? })
}

pub fn supports_linear_filter(ctx: &DeviceContext, format: vk::Format) -> bool {
    ctx.format_properties(format)
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
}

/// Sampler covering `mip_levels`. Linear filtering (and anisotropy, when the
/// device allows) is used only if `format` supports it.
pub unsafe fn create_sampler(
    ctx: &DeviceContext,
    format: vk::Format,
    mip_levels: u32,
    address_mode: vk::SamplerAddressMode,
) -> Result<vk::Sampler> {
    let linear = supports_linear_filter(ctx, format);
    let (filter, mipmap_mode) = if linear {
        (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR)
    } else {
        (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
    };
    let anisotropy = linear && ctx.anisotropy_enabled();
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: filter,
        min_filter: filter,
        mipmap_mode,
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        anisotropy_enable: anisotropy.into(),
        max_anisotropy: if anisotropy {
            ctx.properties().limits.max_sampler_anisotropy
        } else {
            1.0
        },
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: mip_levels as f32,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        ..Default::default()
    };
    Ok(unsafe { ctx.device().create_sampler(&ci, None)? })
}

pub unsafe fn create_shader_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: std::mem::size_of_val(words),
        p_code: words.as_ptr(),
        ..Default::default()
    };
    Ok(unsafe { device.create_shader_module(&ci, None)? })
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

pub unsafe fn begin_single_time_commands(ctx: &DeviceContext) -> Result<vk::CommandBuffer> {
    let device = ctx.device();
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: ctx.command_pool(),
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = unsafe { device.allocate_command_buffers(&ai)? }[0];
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    if let Err(e) = unsafe { device.begin_command_buffer(cmd, &bi) } {
        unsafe { device.free_command_buffers(ctx.command_pool(), &[cmd]) };
        return Err(e.into());
    }
    Ok(cmd)
}

/// Submits `cmd`, waits on a fence and frees the buffer, also on failure.
pub unsafe fn end_single_time_commands(ctx: &DeviceContext, cmd: vk::CommandBuffer) -> Result<()> {
    let device = ctx.device();
    let submit = || -> Result<()> {
        unsafe {
            device.end_command_buffer(cmd)?;
            let fence = Guard::new(device, device.create_fence(&vk::FenceCreateInfo::default(), None)?);
            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            device.queue_submit(ctx.queue(), std::slice::from_ref(&si), fence.get())?;
            device.wait_for_fences(&[fence.get()], true, u64::MAX)?;
        }
        Ok(())
    };
    let result = submit();
    unsafe { device.free_command_buffers(ctx.command_pool(), &[cmd]) };
    result.context("single-time command submission")
}

/// Records `f` into a fresh command buffer and runs it to completion.
pub unsafe fn run_single_time_commands<F>(ctx: &DeviceContext, f: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
{
    let cmd = unsafe { begin_single_time_commands(ctx)? };
    if let Err(e) = f(ctx.device(), cmd) {
        unsafe {
            let _ = ctx.device().end_command_buffer(cmd);
            ctx.device().free_command_buffers(ctx.command_pool(), &[cmd]);
        }
        return Err(e);
    }
    unsafe { end_single_time_commands(ctx, cmd) }
}

pub unsafe fn record_layout_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) -> Result<(), UtilError> {
    let masks = transition_masks(from, to)?;
    let barrier = vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: masks.src_access,
        dst_access_mask: masks.dst_access,
        old_layout: from,
        new_layout: to,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: range,
        ..Default::default()
    };
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        )
    };
    Ok(())
}

/// Blocking layout transition of `range`. Unknown pairs fail before anything is recorded.
pub unsafe fn transition_image_layout(
    ctx: &DeviceContext,
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) -> Result<()> {
    transition_masks(from, to)?;
    unsafe {
        run_single_time_commands(ctx, |device, cmd| {
            Ok(record_layout_transition(device, cmd, image, from, to, range)?)
        })
    }
}

pub unsafe fn copy_buffer(
    ctx: &DeviceContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    unsafe {
        run_single_time_commands(ctx, |device, cmd| {
            device.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
            Ok(())
        })
    }
}

fn color_layers(mip_level: u32, base_array_layer: u32, layer_count: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer,
        layer_count,
    }
}

/// Copies tightly packed layers into mip 0. The image must be in TRANSFER_DST.
pub unsafe fn copy_buffer_to_image(
    ctx: &DeviceContext,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
    layer_count: u32,
) -> Result<()> {
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: color_layers(0, 0, layer_count),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    };
    unsafe {
        run_single_time_commands(ctx, |device, cmd| {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            Ok(())
        })
    }
}

/// Copies one layer of one mip into `buffer`. The image must be in TRANSFER_SRC.
pub unsafe fn copy_image_to_buffer(
    ctx: &DeviceContext,
    image: vk::Image,
    mip_level: u32,
    layer: u32,
    width: u32,
    height: u32,
    buffer: vk::Buffer,
) -> Result<()> {
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: color_layers(mip_level, layer, 1),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    };
    unsafe {
        run_single_time_commands(ctx, |device, cmd| {
            device.cmd_copy_image_to_buffer(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                std::slice::from_ref(&region),
            );
            Ok(())
        })
    }
}

fn mip_extent(size: u32) -> i32 {
    size.max(1) as i32
}

/// Fills mips `1..mip_levels` of every layer by successive linear blits.
///
/// Every level must be in TRANSFER_DST on entry; every level ends in
/// SHADER_READ_ONLY.
pub unsafe fn generate_mipmaps(
    ctx: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    width: u32,
    height: u32,
    mip_levels: u32,
    layer_count: u32,
) -> Result<()> {
    if mip_levels > 1 && !supports_linear_filter(ctx, format) {
        return Err(UtilError::LinearBlitUnsupported(format).into());
    }

    let level = |i: u32| subresource_range(vk::ImageAspectFlags::COLOR, i, 1, 0, layer_count);

    unsafe {
        run_single_time_commands(ctx, |device, cmd| {
            let mut mip_w = width;
            let mut mip_h = height;
            for i in 1..mip_levels {
                record_layout_transition(
                    device,
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    level(i - 1),
                )?;

                let next_w = (mip_w / 2).max(1);
                let next_h = (mip_h / 2).max(1);
                let blit = vk::ImageBlit {
                    src_subresource: color_layers(i - 1, 0, layer_count),
                    src_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: mip_extent(mip_w),
                            y: mip_extent(mip_h),
                            z: 1,
                        },
                    ],
                    dst_subresource: color_layers(i, 0, layer_count),
                    dst_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: mip_extent(next_w),
                            y: mip_extent(next_h),
                            z: 1,
                        },
                    ],
                };
                device.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    vk::Filter::LINEAR,
                );

                record_layout_transition(
                    device,
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    level(i - 1),
                )?;

                mip_w = next_w;
                mip_h = next_h;
            }

            record_layout_transition(
                device,
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                level(mip_levels.max(1) - 1),
            )?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

pub unsafe fn bind_combined_image_sampler(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let info = vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };
    let write = vk::WriteDescriptorSet {
        s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
        dst_set: set,
        dst_binding: binding,
        descriptor_count: 1,
        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        p_image_info: &info,
        ..Default::default()
    };
    unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
}

pub unsafe fn bind_uniform_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let info = vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    };
    let write = vk::WriteDescriptorSet {
        s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
        dst_set: set,
        dst_binding: binding,
        descriptor_count: 1,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        p_buffer_info: &info,
        ..Default::default()
    };
    unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
}

pub unsafe fn create_descriptor_set_layout(
    device: &ash::Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: bindings.len() as u32,
        p_bindings: bindings.as_ptr(),
        ..Default::default()
    };
    Ok(unsafe { device.create_descriptor_set_layout(&ci, None)? })
}

pub fn layout_binding(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    stage_flags: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding {
        binding,
        descriptor_type,
        descriptor_count: 1,
        stage_flags,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn memory_type_respects_both_mask_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);
        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        // type 1 filtered out by the resource's type bits
        assert_eq!(find_memory_type(&props, 0b101, host).unwrap(), 2);
    }

    #[test]
    fn memory_type_missing_is_an_error() {
        let props = memory_props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(err, UtilError::NoSuitableMemoryType { type_bits: 1, .. }));
    }

    #[test]
    fn upload_transitions_use_transfer_then_fragment() {
        let m = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::empty());
        assert_eq!(m.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let m = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn attachment_transitions() {
        let depth = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert!(depth
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));

        let color = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(color.dst_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn readback_round_trip_layouts_are_supported() {
        use vk::ImageLayout as L;
        for (from, to) in [
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
            (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
        ] {
            assert!(transition_masks(from, to).is_ok(), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn unknown_transition_is_rejected() {
        let err = transition_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::GENERAL,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UtilError::UnsupportedLayoutTransition {
                from: vk::ImageLayout::PRESENT_SRC_KHR,
                to: vk::ImageLayout::GENERAL
            }
        ));
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_levels_for(1, 1), 1);
        assert_eq!(mip_levels_for(2, 1), 2);
        assert_eq!(mip_levels_for(512, 512), 10);
        assert_eq!(mip_levels_for(1024, 300), 11);
        assert_eq!(mip_levels_for(0, 0), 1);
    }

    #[test]
    fn depth_formats_and_aspects() {
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
        assert_eq!(aspect_for(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn sample_count_takes_common_maximum() {
        let mut props = vk::PhysicalDeviceProperties::default();
        props.limits.framebuffer_color_sample_counts = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        props.limits.framebuffer_depth_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(max_usable_sample_count(&props), vk::SampleCountFlags::TYPE_4);

        props.limits.framebuffer_depth_sample_counts = vk::SampleCountFlags::TYPE_1;
        assert_eq!(max_usable_sample_count(&props), vk::SampleCountFlags::TYPE_1);
    }
}
