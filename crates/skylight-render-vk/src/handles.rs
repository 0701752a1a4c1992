// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::utils::{BufferAlloc, ImageAlloc};

/// A Vulkan object that can be destroyed with nothing but the device.
pub(crate) trait Destroy: Copy {
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! impl_destroy {
    ($($ty:ty => $f:ident),* $(,)?) => {
        $(
            impl Destroy for $ty {
                unsafe fn destroy(self, device: &ash::Device) {
                    unsafe { device.$f(self, None) };
                }
            }
        )*
    };
}

impl_destroy!(
    vk::Buffer => destroy_buffer,
    vk::Image => destroy_image,
    vk::ImageView => destroy_image_view,
    vk::Sampler => destroy_sampler,
    vk::DeviceMemory => free_memory,
    vk::RenderPass => destroy_render_pass,
    vk::Framebuffer => destroy_framebuffer,
    vk::Pipeline => destroy_pipeline,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::Semaphore => destroy_semaphore,
    vk::Fence => destroy_fence,
    vk::ShaderModule => destroy_shader_module,
    vk::QueryPool => destroy_query_pool,
);

impl Destroy for BufferAlloc {
    unsafe fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Destroy for ImageAlloc {
    unsafe fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Rollback guard for multi-step construction.
///
/// Every object created on the way to a finished resource is wrapped in a
/// `Guard`; an early `?` return drops the guards and destroys what was built so
/// far. Once construction succeeds, `keep()` disarms the guard and hands the raw
/// handle to the owner, whose own `Drop` takes over.
pub(crate) struct Guard<'d, T: Destroy> {
    device: &'d ash::Device,
    raw: T,
    armed: bool,
}

impl<'d, T: Destroy> Guard<'d, T> {
    pub(crate) fn new(device: &'d ash::Device, raw: T) -> Self {
        Self {
            device,
            raw,
            armed: true,
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> T {
        self.raw
    }

    pub(crate) fn keep(mut self) -> T {
        self.armed = false;
        self.raw
    }
}

impl<T: Destroy> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            unsafe { self.raw.destroy(self.device) };
        }
    }
}

pub(crate) fn keep_all<T: Destroy>(guards: Vec<Guard<'_, T>>) -> Vec<T> {
    guards.into_iter().map(Guard::keep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceContext;
    use crate::utils;

    #[test]
    fn guards_destroy_unless_kept() {
        let Ok(ctx) = DeviceContext::headless() else { return };
        let device = ctx.device();
        let props = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        unsafe {
            let dropped = utils::create_buffer(&ctx, 64, vk::BufferUsageFlags::UNIFORM_BUFFER, props).unwrap();
            drop(Guard::new(device, dropped));

            let kept = utils::create_buffer(&ctx, 64, vk::BufferUsageFlags::UNIFORM_BUFFER, props).unwrap();
            let raw = Guard::new(device, kept).keep();
            assert_eq!(raw.buffer, kept.buffer);
            utils::write_host_visible(device, raw.memory, 0, &[7; 64]).unwrap();
            assert_eq!(utils::read_host_visible(device, raw.memory, 64).unwrap(), [7; 64]);
            raw.destroy(device);

            let info = vk::FenceCreateInfo::default();
            let fences = (0..2)
                .map(|_| Guard::new(device, device.create_fence(&info, None).unwrap()))
                .collect();
            for fence in keep_all(fences) {
                assert_eq!(device.get_fence_status(fence), Ok(false));
                fence.destroy(device);
            }
        }
    }
}
