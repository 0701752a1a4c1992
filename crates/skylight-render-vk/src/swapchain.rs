// SPDX-License-Identifier: CEPL-1.0
//! Presentable images and the acquire → record → present protocol.
//!
//! States: `Uninitialized → Ready ⇄ Rendering`, and `Ready → Recreating → Ready`
//! when the surface changes. A [`Frame`] returned by [`SwapChain::acquire`] is
//! consumed by [`SwapChain::present`], so a frame cannot be presented twice.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ash::khr::swapchain;
use ash::vk;
use skylight_render::RenderSize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::DeviceContext;
use crate::handles::{keep_all, Guard};
use crate::utils::{self, BufferAlloc, ImageAlloc, ImageDesc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VsyncMode {
    /// Target monitor refresh rate.
    Fifo,
    /// Uncapped, tear-free when available.
    #[default]
    Mailbox,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapChainConfig {
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub msaa: bool,
    /// Upper bound for every CPU wait in `acquire`.
    pub fence_timeout: Duration,
    /// Size of each per-image uniform buffer.
    pub uniform_size: vk::DeviceSize,
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            msaa: true,
            fence_timeout: Duration::from_secs(1),
            uniform_size: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapChainState {
    Uninitialized,
    Ready,
    Rendering,
    Recreating,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("surface is out of date")]
    OutOfDate,
    #[error("swapchain no longer matches the surface")]
    Suboptimal,
    #[error("timed out waiting for the GPU")]
    Timeout,
    #[error("swapchain is not ready for this call (state {0:?})")]
    NotReady(SwapChainState),
    #[error("uniform data is {got} bytes, the per-image buffer holds {max}")]
    UniformOverflow { got: usize, max: vk::DeviceSize },
    #[error(transparent)]
    Vulkan(#[from] vk::Result),
}

impl FrameError {
    /// The swapchain has to be rebuilt before the next frame.
    pub fn needs_recreate(&self) -> bool {
        matches!(self, Self::OutOfDate | Self::Suboptimal)
    }
}

/// Outcome of [`SwapChain::reinit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recreate {
    /// Zero-sized surface; nothing was changed. Try again after the next resize.
    Deferred,
    Rebuilt,
}

/// Which render pass a recording begins with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassLoad {
    /// Clears color and depth; used for the main scene.
    Clear,
    /// Keeps what earlier passes of this frame wrote; used for overlays.
    Load,
}

// ---------------------------------------------------------------------------
// Pure selection logic
// ---------------------------------------------------------------------------

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VsyncMode,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = if !vsync {
        &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ]
    } else {
        match mode {
            VsyncMode::Mailbox => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
            VsyncMode::Fifo => &[vk::PresentModeKHR::FIFO],
        }
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let find = |pred: &dyn Fn(&vk::SurfaceFormatKHR) -> bool| formats.iter().copied().find(|f| pred(f));
    find(&|f| f.format == vk::Format::B8G8R8A8_SRGB)
        .or_else(|| find(&|f| f.format == vk::Format::R8G8B8A8_SRGB))
        .or_else(|| {
            find(&|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn buffering_depth(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Recording,
    InFlight,
}

/// Round-robin bookkeeping of buffering slots.
///
/// A slot is claimed for recording only after its previous submission has been
/// waited on, and at most one slot records at a time.
#[derive(Clone, Debug)]
pub struct SlotRing {
    states: Vec<SlotState>,
    current: usize,
}

impl SlotRing {
    pub fn new(depth: usize) -> Self {
        Self {
            states: vec![SlotState::Free; depth.max(1)],
            current: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.states.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Claims the current slot. `None` while another slot is still recording.
    pub fn begin(&mut self) -> Option<usize> {
        if self.states.contains(&SlotState::Recording) {
            return None;
        }
        self.states[self.current] = SlotState::Recording;
        Some(self.current)
    }

    /// Recording was abandoned before submission; the slot stays current.
    pub fn cancel(&mut self, slot: usize) {
        if self.states[slot] == SlotState::Recording {
            self.states[slot] = SlotState::Free;
        }
    }

    pub fn submit(&mut self, slot: usize) {
        self.states[slot] = SlotState::InFlight;
        self.current = (slot + 1) % self.states.len();
    }

    /// Slots that are recording or whose submission has not been waited on.
    pub fn outstanding(&self) -> usize {
        self.states.iter().filter(|s| **s != SlotState::Free).count()
    }

    /// After a device idle every submission is complete.
    pub fn reset(&mut self) {
        self.states.fill(SlotState::Free);
        self.current = 0;
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One acquired image being recorded. Hand it back to [`SwapChain::present`].
#[derive(Debug)]
pub struct Frame {
    slot: usize,
    image_index: u32,
    command_buffer: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    render_pass_clear: vk::RenderPass,
    render_pass_load: vk::RenderPass,
    extent: vk::Extent2D,
    descriptor_set: vk::DescriptorSet,
    suboptimal: bool,
}

impl Frame {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    /// Per-image set 0 holding the frame uniforms.
    #[inline]
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Begins `load`'s render pass on this frame's framebuffer and sets a
    /// full-extent viewport and scissor.
    pub unsafe fn begin_render_pass(&self, device: &ash::Device, load: PassLoad, clear_color: [f32; 4]) {
        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
            vk::ClearValue::default(),
        ];
        let render_pass = match load {
            PassLoad::Clear => self.render_pass_clear,
            PassLoad::Load => self.render_pass_load,
        };
        let info = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass,
            framebuffer: self.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        unsafe {
            device.cmd_begin_render_pass(self.command_buffer, &info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    pub unsafe fn end_render_pass(&self, device: &ash::Device) {
        unsafe { device.cmd_end_render_pass(self.command_buffer) };
    }
}

// ---------------------------------------------------------------------------
// GPU resources rebuilt on every resize
// ---------------------------------------------------------------------------

struct SlotSync {
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
}

struct Target {
    alloc: ImageAlloc,
    view: vk::ImageView,
}

struct Resources {
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    color: Option<Target>,
    depth: Target,
    render_pass_clear: vk::RenderPass,
    render_pass_load: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,
    uniforms: Vec<BufferAlloc>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    slots: Vec<SlotSync>,
    /// Indexed by image: the presentation engine holds it until that image is
    /// acquired again.
    render_finished: Vec<vk::Semaphore>,
    /// Slot whose fence guards the last submission that used each image.
    images_in_flight: Vec<Option<usize>>,
}

unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
    load: PassLoad,
) -> Result<vk::RenderPass> {
    let msaa = samples != vk::SampleCountFlags::TYPE_1;
    let color_final = if msaa {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };
    let (load_op, color_initial, depth_initial) = match load {
        PassLoad::Clear => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::UNDEFINED,
        ),
        PassLoad::Load => (
            vk::AttachmentLoadOp::LOAD,
            color_final,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
    };

    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples,
            load_op,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: color_initial,
            final_layout: color_final,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples,
            load_op,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: depth_initial,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
        // MSAA resolve target: the swapchain image itself.
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
    ];
    let attachment_count = if msaa { 3 } else { 2 };

    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_ref = vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_resolve_attachments: if msaa {
            &resolve_ref
        } else {
            std::ptr::null()
        },
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: attachment_stages,
        dst_stage_mask: attachment_stages,
        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    };

    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(unsafe { device.create_render_pass(&ci, None)? })
}

unsafe fn create_target(
    ctx: &DeviceContext,
    extent: vk::Extent2D,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
) -> Result<(Guard<'_, ImageAlloc>, Guard<'_, vk::ImageView>)> {
    let device = ctx.device();
    let desc = ImageDesc::new_2d(extent.width, extent.height, format, usage).with_samples(samples);
    let alloc = Guard::new(device, unsafe {
        utils::create_image(ctx, &desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?
    });
    let range = utils::subresource_range(utils::aspect_for(format), 0, 1, 0, 1);
    let view = Guard::new(device, unsafe {
        utils::create_image_view(device, alloc.get().image, vk::ImageViewType::TYPE_2D, format, range)?
    });
    Ok((alloc, view))
}

impl Resources {
    /// `Ok(None)` when the surface currently has a zero extent.
    unsafe fn build(
        ctx: &DeviceContext,
        loader: &swapchain::Device,
        cfg: &SwapChainConfig,
        want: RenderSize,
        set_layout: vk::DescriptorSetLayout,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Option<Self>> {
        let surf = ctx
            .surface()
            .ok_or_else(|| anyhow!("device context has no surface"))?;
        let phys = ctx.physical_device();

        // --- Query surface capabilities / formats / present modes ---
        let (caps, formats, modes) = unsafe {
            (
                surf.loader
                    .get_physical_device_surface_capabilities(phys, surf.surface)?,
                surf.loader
                    .get_physical_device_surface_formats(phys, surf.surface)?,
                surf.loader
                    .get_physical_device_surface_present_modes(phys, surf.surface)?,
            )
        };
        let extent = extent_from_caps(&caps, want);
        if extent.width == 0 || extent.height == 0 {
            return Ok(None);
        }
        let format = pick_surface_format(&formats).context("surface reports no formats")?;
        let present_mode = choose_present_mode(&modes, cfg.vsync, cfg.vsync_mode);
        let min_image_count = buffering_depth(&caps);
        let samples = if cfg.msaa {
            utils::max_usable_sample_count(ctx.properties())
        } else {
            vk::SampleCountFlags::TYPE_1
        };
        let depth_format = utils::pick_depth_format(ctx)?;

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surf.surface,
            min_image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };

        // Swapchains are not covered by `Destroy`; roll back by hand.
        let swapchain = unsafe { loader.create_swapchain(&swap_info, None)? };
        let rest = unsafe {
            Self::build_dependents(
                ctx,
                cfg,
                set_layout,
                swapchain,
                loader,
                format,
                extent,
                samples,
                depth_format,
                min_image_count,
            )
        };
        match rest {
            Ok(res) => {
                info!(
                    "swapchain: {:?} / {:?}, present_mode: {:?}, extent: {}x{}, images: {}, slots: {}, samples: {:?}",
                    format.format,
                    format.color_space,
                    present_mode,
                    extent.width,
                    extent.height,
                    res.images.len(),
                    res.slots.len(),
                    samples,
                );
                Ok(Some(res))
            }
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn build_dependents(
        ctx: &DeviceContext,
        cfg: &SwapChainConfig,
        set_layout: vk::DescriptorSetLayout,
        swapchain: vk::SwapchainKHR,
        loader: &swapchain::Device,
        format: vk::SurfaceFormatKHR,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        depth_format: vk::Format,
        depth: u32,
    ) -> Result<Self> {
        let device = ctx.device();
        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        let image_count = images.len();

        let mut views = Vec::with_capacity(image_count);
        for &img in &images {
            let range = utils::subresource_range(vk::ImageAspectFlags::COLOR, 0, 1, 0, 1);
            views.push(Guard::new(device, unsafe {
                utils::create_image_view(device, img, vk::ImageViewType::TYPE_2D, format.format, range)?
            }));
        }

        let msaa = samples != vk::SampleCountFlags::TYPE_1;
        let color = if msaa {
            Some(unsafe {
                create_target(
                    ctx,
                    extent,
                    format.format,
                    samples,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT,
                )?
            })
        } else {
            None
        };
        let depth_target = unsafe {
            create_target(
                ctx,
                extent,
                depth_format,
                samples,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )?
        };

        let render_pass_clear = Guard::new(device, unsafe {
            create_render_pass(device, format.format, depth_format, samples, PassLoad::Clear)?
        });
        let render_pass_load = Guard::new(device, unsafe {
            create_render_pass(device, format.format, depth_format, samples, PassLoad::Load)?
        });

        let mut framebuffers = Vec::with_capacity(image_count);
        for view in &views {
            let attachments: Vec<vk::ImageView> = match &color {
                Some((_, color_view)) => vec![color_view.get(), depth_target.1.get(), view.get()],
                None => vec![view.get(), depth_target.1.get()],
            };
            let ci = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: render_pass_clear.get(),
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            framebuffers.push(Guard::new(device, unsafe { device.create_framebuffer(&ci, None)? }));
        }

        // Per-image uniforms + set 0.
        let mut uniforms = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            uniforms.push(Guard::new(device, unsafe {
                utils::create_buffer(
                    ctx,
                    cfg.uniform_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?
            }));
        }
        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: image_count as u32,
        };
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: image_count as u32,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        let descriptor_pool = Guard::new(device, unsafe { device.create_descriptor_pool(&pool_ci, None)? });
        let layouts = vec![set_layout; image_count];
        let alloc_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: descriptor_pool.get(),
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };
        for (set, ubo) in descriptor_sets.iter().zip(&uniforms) {
            unsafe { utils::bind_uniform_buffer(device, *set, 0, ubo.get().buffer, cfg.uniform_size) };
        }

        // Sync: acquire semaphore + fence per slot, render-finished per image.
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut acquire_sems = Vec::with_capacity(depth as usize);
        let mut fences = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            acquire_sems.push(Guard::new(device, unsafe { device.create_semaphore(&sem_ci, None)? }));
            fences.push(Guard::new(device, unsafe { device.create_fence(&fence_ci, None)? }));
        }
        let mut render_finished = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            render_finished.push(Guard::new(device, unsafe { device.create_semaphore(&sem_ci, None)? }));
        }

        let alloc_ci = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: ctx.command_pool(),
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: image_count as u32,
            ..Default::default()
        };
        // Last fallible step: nothing after it needs rollback of command buffers.
        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_ci)? };

        let slots = keep_all(acquire_sems)
            .into_iter()
            .zip(keep_all(fences))
            .map(|(image_available, in_flight)| SlotSync {
                image_available,
                in_flight,
            })
            .collect();

        Ok(Self {
            swapchain,
            format,
            extent,
            samples,
            images,
            views: keep_all(views),
            color: color.map(|(alloc, view)| Target {
                alloc: alloc.keep(),
                view: view.keep(),
            }),
            depth: Target {
                alloc: depth_target.0.keep(),
                view: depth_target.1.keep(),
            },
            render_pass_clear: render_pass_clear.keep(),
            render_pass_load: render_pass_load.keep(),
            framebuffers: keep_all(framebuffers),
            command_buffers,
            uniforms: keep_all(uniforms),
            descriptor_pool: descriptor_pool.keep(),
            descriptor_sets,
            slots,
            render_finished: keep_all(render_finished),
            images_in_flight: vec![None; image_count],
        })
    }

    /// Waits out any older use of image `img`, writes its uniforms and opens
    /// its command buffer for recording.
    unsafe fn prepare_image(
        &self,
        device: &ash::Device,
        slot: usize,
        img: usize,
        uniforms: &[u8],
        timeout: u64,
    ) -> Result<vk::CommandBuffer, FrameError> {
        // An older slot may still be rendering into this image.
        if let Some(other) = self.images_in_flight[img] {
            if other != slot {
                unsafe { device.wait_for_fences(&[self.slots[other].in_flight], true, timeout) }
                    .map_err(timeout_or)?;
            }
        }

        if !uniforms.is_empty() {
            let memory = self.uniforms[img].memory;
            unsafe {
                let ptr = device.map_memory(
                    memory,
                    0,
                    uniforms.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )?;
                std::ptr::copy_nonoverlapping(uniforms.as_ptr(), ptr as *mut u8, uniforms.len());
                device.unmap_memory(memory);
            }
        }

        let cmd = self.command_buffers[img];
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &bi)?;
        }
        Ok(cmd)
    }

    // STRICT TEARDOWN ORDER (device must be idle):
    // - command buffers back to the pool
    // - sync objects
    // - descriptor pool (frees its sets), then uniform buffers
    // - framebuffers before render passes and views
    // - MSAA/depth targets, swapchain views, swapchain last
    unsafe fn destroy(&self, ctx: &DeviceContext, loader: &swapchain::Device) {
        let device = ctx.device();
        unsafe {
            device.free_command_buffers(ctx.command_pool(), &self.command_buffers);
            for s in &self.slots {
                device.destroy_semaphore(s.image_available, None);
                device.destroy_fence(s.in_flight, None);
            }
            for &s in &self.render_finished {
                device.destroy_semaphore(s, None);
            }
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            for u in &self.uniforms {
                device.destroy_buffer(u.buffer, None);
                device.free_memory(u.memory, None);
            }
            for &fb in &self.framebuffers {
                device.destroy_framebuffer(fb, None);
            }
            device.destroy_render_pass(self.render_pass_load, None);
            device.destroy_render_pass(self.render_pass_clear, None);
            for t in self.color.iter().chain(std::iter::once(&self.depth)) {
                device.destroy_image_view(t.view, None);
                device.destroy_image(t.alloc.image, None);
                device.free_memory(t.alloc.memory, None);
            }
            for &v in &self.views {
                device.destroy_image_view(v, None);
            }
            loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

// ---------------------------------------------------------------------------
// SwapChain
// ---------------------------------------------------------------------------

pub struct SwapChain {
    ctx: Arc<DeviceContext>,
    loader: swapchain::Device,
    config: SwapChainConfig,
    state: SwapChainState,
    /// Set 0 layout (frame uniforms); outlives every rebuild.
    set_layout: vk::DescriptorSetLayout,
    res: Option<Resources>,
    ring: SlotRing,
}

impl SwapChain {
    pub fn new(ctx: Arc<DeviceContext>, config: SwapChainConfig) -> Result<Self> {
        if ctx.surface().is_none() {
            bail!("a swapchain needs a device context created with a window");
        }
        let loader = swapchain::Device::new(ctx.instance(), ctx.device());
        let binding = utils::layout_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let set_layout = unsafe { utils::create_descriptor_set_layout(ctx.device(), &[binding])? };
        Ok(Self {
            ctx,
            loader,
            config,
            state: SwapChainState::Uninitialized,
            set_layout,
            res: None,
            ring: SlotRing::new(1),
        })
    }

    pub fn init(&mut self, width: u32, height: u32) -> Result<()> {
        if self.state != SwapChainState::Uninitialized {
            bail!("swapchain already initialized");
        }
        let want = RenderSize { width, height };
        if want.is_empty() {
            bail!("cannot create a swapchain of {width}x{height}");
        }
        let res = unsafe {
            Resources::build(
                &self.ctx,
                &self.loader,
                &self.config,
                want,
                self.set_layout,
                vk::SwapchainKHR::null(),
            )?
        }
        .ok_or_else(|| anyhow!("surface has a zero extent"))?;
        self.ring = SlotRing::new(res.slots.len());
        self.res = Some(res);
        self.state = SwapChainState::Ready;
        Ok(())
    }

    /// Rebuilds every size-dependent object. A zero dimension (minimized window)
    /// changes nothing and reports [`Recreate::Deferred`].
    pub fn reinit(&mut self, width: u32, height: u32) -> Result<Recreate> {
        let want = RenderSize { width, height };
        if want.is_empty() {
            return Ok(Recreate::Deferred);
        }
        match self.state {
            SwapChainState::Uninitialized => bail!("reinit before init"),
            SwapChainState::Rendering => bail!("reinit while a frame is being recorded"),
            SwapChainState::Ready | SwapChainState::Recreating => {}
        }

        self.ctx.wait_idle()?;
        self.state = SwapChainState::Recreating;

        let old = self
            .res
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |r| r.swapchain);
        let built = unsafe {
            Resources::build(
                &self.ctx,
                &self.loader,
                &self.config,
                want,
                self.set_layout,
                old,
            )
        };
        match built {
            Ok(Some(res)) => {
                if let Some(old) = self.res.replace(res) {
                    unsafe { old.destroy(&self.ctx, &self.loader) };
                }
                let depth = self.res.as_ref().map_or(1, |r| r.slots.len());
                self.ring = SlotRing::new(depth);
                self.state = SwapChainState::Ready;
                Ok(Recreate::Rebuilt)
            }
            // Nothing was created; the old swapchain is still usable later.
            Ok(None) => Ok(Recreate::Deferred),
            Err(e) => {
                // `old` is retired even though creation failed.
                if let Some(old) = self.res.take() {
                    unsafe { old.destroy(&self.ctx, &self.loader) };
                }
                Err(e.context("rebuilding swapchain"))
            }
        }
    }

    /// Waits for a free slot, acquires an image and starts recording into its
    /// command buffer. `uniforms` is copied into the image's uniform buffer;
    /// an empty slice leaves it as it was.
    ///
    /// A failure after the image was acquired leaves that slot's semaphore
    /// signalled, so the swapchain moves to `Recreating` and must be rebuilt
    /// with [`SwapChain::reinit`] before the next frame.
    pub fn acquire(&mut self, uniforms: &[u8]) -> Result<Frame, FrameError> {
        if self.state != SwapChainState::Ready {
            return Err(FrameError::NotReady(self.state));
        }
        if uniforms.len() as vk::DeviceSize > self.config.uniform_size {
            return Err(FrameError::UniformOverflow {
                got: uniforms.len(),
                max: self.config.uniform_size,
            });
        }
        let slot = self
            .ring
            .begin()
            .ok_or(FrameError::NotReady(self.state))?;
        match self.acquire_in_slot(slot, uniforms) {
            Ok(frame) => {
                self.state = SwapChainState::Rendering;
                Ok(frame)
            }
            Err(failure) => {
                self.ring.cancel(slot);
                if failure.image_acquired {
                    warn!("vk: frame setup failed after acquire ({}) → recreating", failure.error);
                }
                if failure.needs_rebuild() {
                    self.state = SwapChainState::Recreating;
                }
                Err(failure.error)
            }
        }
    }

    fn acquire_in_slot(&mut self, slot: usize, uniforms: &[u8]) -> Result<Frame, AcquireFailure> {
        let timeout = self.config.fence_timeout.as_nanos().min(u64::MAX as u128) as u64;
        let device = self.ctx.device();
        let res = self
            .res
            .as_mut()
            .ok_or(AcquireFailure::before(FrameError::NotReady(SwapChainState::Uninitialized)))?;
        let sync = &res.slots[slot];

        let (image_index, suboptimal) = unsafe {
            device
                .wait_for_fences(&[sync.in_flight], true, timeout)
                .map_err(|e| AcquireFailure::before(timeout_or(e)))?;

            self.loader
                .acquire_next_image(res.swapchain, timeout, sync.image_available, vk::Fence::null())
                .map_err(|e| {
                    AcquireFailure::before(match e {
                        vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::OutOfDate,
                        other => timeout_or(other),
                    })
                })?
        };
        let img = image_index as usize;

        // From here on the image is ours and `image_available` has a pending signal.
        let cmd = unsafe { res.prepare_image(device, slot, img, uniforms, timeout) }
            .map_err(AcquireFailure::after)?;
        res.images_in_flight[img] = Some(slot);

        Ok(Frame {
            slot,
            image_index,
            command_buffer: cmd,
            framebuffer: res.framebuffers[img],
            render_pass_clear: res.render_pass_clear,
            render_pass_load: res.render_pass_load,
            extent: res.extent,
            descriptor_set: res.descriptor_sets[img],
            suboptimal,
        })
    }

    // STRICT PER-FRAME ORDER:
    // 1) end recording
    // 2) reset the slot fence, then queue_submit (wait image_available,
    //    signal render_finished[image] and the slot fence)
    // 3) queue_present (wait render_finished[image])
    pub fn present(&mut self, frame: Frame) -> Result<(), FrameError> {
        if self.state != SwapChainState::Rendering {
            return Err(FrameError::NotReady(self.state));
        }
        let device = self.ctx.device();
        let res = self
            .res
            .as_ref()
            .ok_or(FrameError::NotReady(SwapChainState::Uninitialized))?;
        let sync = &res.slots[frame.slot];
        let render_finished = res.render_finished[frame.image_index as usize];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submitted = unsafe {
            device.end_command_buffer(frame.command_buffer).and_then(|_| {
                // Reset only right before the submit that signals it again.
                device.reset_fences(&[sync.in_flight])?;
                let submit = vk::SubmitInfo {
                    s_type: vk::StructureType::SUBMIT_INFO,
                    wait_semaphore_count: 1,
                    p_wait_semaphores: &sync.image_available,
                    p_wait_dst_stage_mask: wait_stages.as_ptr(),
                    command_buffer_count: 1,
                    p_command_buffers: &frame.command_buffer,
                    signal_semaphore_count: 1,
                    p_signal_semaphores: &render_finished,
                    ..Default::default()
                };
                device.queue_submit(self.ctx.queue(), std::slice::from_ref(&submit), sync.in_flight)
            })
        };
        if let Err(e) = submitted {
            // The acquire semaphore is still pending and the fence may be
            // unsignalled; only a rebuild gives this slot clean sync objects.
            self.ring.cancel(frame.slot);
            self.state = SwapChainState::Recreating;
            warn!("vk: submit failed ({e}) → recreating");
            return Err(e.into());
        }
        self.state = SwapChainState::Ready;
        self.ring.submit(frame.slot);

        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_finished,
            swapchain_count: 1,
            p_swapchains: &res.swapchain,
            p_image_indices: &frame.image_index,
            ..Default::default()
        };
        match unsafe { self.loader.queue_present(self.ctx.queue(), &present) } {
            Ok(false) if !frame.suboptimal => Ok(()),
            Ok(_) => Err(FrameError::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state = SwapChainState::Recreating;
                Err(FrameError::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn state(&self) -> SwapChainState {
        self.state
    }
    #[inline]
    pub fn config(&self) -> &SwapChainConfig {
        &self.config
    }
    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.vsync = vsync;
    }
    #[inline]
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
    /// Number of frames that may be in flight at once.
    #[inline]
    pub fn buffering_depth(&self) -> usize {
        self.ring.depth()
    }
    pub fn image_count(&self) -> usize {
        self.res.as_ref().map_or(0, |r| r.images.len())
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.res.as_ref().map_or(vk::Extent2D::default(), |r| r.extent)
    }
    pub fn format(&self) -> vk::Format {
        self.res
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |r| r.format.format)
    }
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.res
            .as_ref()
            .map_or(vk::SampleCountFlags::TYPE_1, |r| r.samples)
    }
    /// Clearing pass; pipelines built against it are also compatible with the loading pass.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.res
            .as_ref()
            .map_or(vk::RenderPass::null(), |r| r.render_pass_clear)
    }
    pub fn load_render_pass(&self) -> vk::RenderPass {
        self.res
            .as_ref()
            .map_or(vk::RenderPass::null(), |r| r.render_pass_load)
    }
}

/// Error from `acquire_in_slot`, remembering whether an image was already
/// acquired (its semaphore then carries a signal nobody will wait on).
#[derive(Debug)]
struct AcquireFailure {
    error: FrameError,
    image_acquired: bool,
}

impl AcquireFailure {
    fn before(error: FrameError) -> Self {
        Self {
            error,
            image_acquired: false,
        }
    }

    fn after(error: FrameError) -> Self {
        Self {
            error,
            image_acquired: true,
        }
    }

    fn needs_rebuild(&self) -> bool {
        self.image_acquired || matches!(self.error, FrameError::OutOfDate)
    }
}

fn timeout_or(e: vk::Result) -> FrameError {
    match e {
        vk::Result::TIMEOUT | vk::Result::NOT_READY => FrameError::Timeout,
        other => FrameError::Vulkan(other),
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        if let Some(res) = self.res.take() {
            unsafe { res.destroy(&self.ctx, &self.loader) };
        }
        unsafe {
            self.ctx
                .device()
                .destroy_descriptor_set_layout(self.set_layout, None)
        };
        debug!("swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn buffering_depth_is_min_plus_one_clamped() {
        assert_eq!(buffering_depth(&caps(2, 0, (1, 1))), 3);
        assert_eq!(buffering_depth(&caps(2, 8, (1, 1))), 3);
        assert_eq!(buffering_depth(&caps(2, 2, (1, 1))), 2);
        assert_eq!(buffering_depth(&caps(1, 3, (1, 1))), 2);
    }

    #[test]
    fn extent_follows_surface_or_clamps_request() {
        let fixed = caps(2, 0, (800, 600));
        assert_eq!(
            extent_from_caps(&fixed, RenderSize { width: 10, height: 10 }),
            vk::Extent2D { width: 800, height: 600 }
        );
        let free = caps(2, 0, (u32::MAX, u32::MAX));
        assert_eq!(
            extent_from_caps(&free, RenderSize { width: 9000, height: 300 }),
            vk::Extent2D { width: 4096, height: 300 }
        );
    }

    #[test]
    fn present_mode_preferences() {
        use vk::PresentModeKHR as P;
        let all = [P::FIFO, P::MAILBOX, P::IMMEDIATE];
        assert_eq!(choose_present_mode(&all, true, VsyncMode::Mailbox), P::MAILBOX);
        assert_eq!(choose_present_mode(&all, true, VsyncMode::Fifo), P::FIFO);
        assert_eq!(choose_present_mode(&all, false, VsyncMode::Mailbox), P::IMMEDIATE);
        assert_eq!(choose_present_mode(&[P::FIFO], true, VsyncMode::Mailbox), P::FIFO);
        assert_eq!(choose_present_mode(&[P::FIFO], false, VsyncMode::Fifo), P::FIFO);
    }

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn surface_format_preference_order() {
        let cs = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let other = vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT;
        let list = [
            sf(vk::Format::R16G16B16A16_SFLOAT, other),
            sf(vk::Format::B8G8R8A8_UNORM, cs),
            sf(vk::Format::R8G8B8A8_SRGB, cs),
            sf(vk::Format::B8G8R8A8_SRGB, cs),
        ];
        assert_eq!(pick_surface_format(&list).unwrap().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(pick_surface_format(&list[..3]).unwrap().format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(pick_surface_format(&list[..2]).unwrap().format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(
            pick_surface_format(&list[..1]).unwrap().format,
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert!(pick_surface_format(&[]).is_none());
    }

    #[test]
    fn unorm_needs_srgb_colorspace() {
        let list = [
            sf(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
        ];
        assert_eq!(
            pick_surface_format(&list).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
    }

    #[test]
    fn slot_ring_cycles_and_bounds_outstanding_frames() {
        let mut ring = SlotRing::new(3);
        let mut seen = Vec::new();
        for _ in 0..10 {
            let slot = ring.begin().unwrap();
            seen.push(slot);
            ring.submit(slot);
            assert!(ring.outstanding() <= ring.depth());
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(ring.outstanding(), 3);
    }

    #[test]
    fn slot_ring_allows_one_recording_frame() {
        let mut ring = SlotRing::new(2);
        let slot = ring.begin().unwrap();
        assert_eq!(ring.begin(), None);
        ring.submit(slot);
        assert_eq!(ring.begin(), Some(1));
    }

    #[test]
    fn cancelled_slot_is_reused() {
        let mut ring = SlotRing::new(2);
        let slot = ring.begin().unwrap();
        ring.cancel(slot);
        assert_eq!(ring.state(slot), SlotState::Free);
        assert_eq!(ring.begin(), Some(slot));
    }

    #[test]
    fn consecutive_frames_never_share_a_slot_within_depth() {
        let depth = 3;
        let mut ring = SlotRing::new(depth);
        let mut history: Vec<usize> = Vec::new();
        for _ in 0..12 {
            let slot = ring.begin().unwrap();
            let recent = history.iter().rev().take(depth - 1);
            assert!(recent.clone().all(|&s| s != slot));
            history.push(slot);
            ring.submit(slot);
        }
    }

    #[test]
    fn reset_returns_to_first_slot() {
        let mut ring = SlotRing::new(3);
        let s = ring.begin().unwrap();
        ring.submit(s);
        ring.reset();
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.current(), 0);
    }

    #[test]
    fn only_surface_errors_need_recreate() {
        assert!(FrameError::OutOfDate.needs_recreate());
        assert!(FrameError::Suboptimal.needs_recreate());
        assert!(!FrameError::Timeout.needs_recreate());
        assert!(!FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST).needs_recreate());
    }

    #[test]
    fn failure_after_acquire_always_forces_a_rebuild() {
        // Nothing acquired yet: a timeout just skips the frame.
        assert!(!AcquireFailure::before(FrameError::Timeout).needs_rebuild());
        assert!(AcquireFailure::before(FrameError::OutOfDate).needs_rebuild());
        // The slot semaphore has a pending signal; only a rebuild clears it.
        assert!(AcquireFailure::after(FrameError::Timeout).needs_rebuild());
        assert!(AcquireFailure::after(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)).needs_rebuild());
    }
}
