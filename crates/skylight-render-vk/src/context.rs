// SPDX-License-Identifier: CEPL-1.0
//! Instance, device and queue shared by every GPU object in the engine.
//!
//! Each resource holds an `Arc<DeviceContext>`, so the device is only destroyed
//! after the last texture, mesh or pipeline that was created from it.
use std::ffi::{c_void, CStr};

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, warn};

const APP_NAME: &CStr = c"Skylight";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

pub struct SurfaceState {
    pub loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
}

pub struct DeviceContext {
    entry: Entry,
    instance: Instance,
    debug: DebugState,
    surface: Option<SurfaceState>,
    physical: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    anisotropy: bool,
    timestamps: bool,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance, enabled: bool) -> DebugState {
    if !enabled {
        return None;
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
        Ok(m) => Some((loader, m)),
        Err(e) => {
            warn!("debug messenger unavailable: {e}");
            None
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance, _enabled: bool) -> DebugState {}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(dbg: &DebugState) {
    if let Some((loader, m)) = dbg {
        unsafe { loader.destroy_debug_utils_messenger(*m, None) };
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_dbg: &DebugState) {}

fn has_name(props: &[vk::ExtensionProperties], name: &CStr) -> bool {
    props
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
}

/// Returns the instance and whether validation (and debug utils) were enabled.
unsafe fn create_instance(entry: &Entry, display: Option<RawDisplayHandle>) -> Result<(Instance, bool)> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    let mut exts: Vec<*const std::ffi::c_char> = match display {
        Some(dh) => ash_window::enumerate_required_extensions(dh)
            .context("enumerate_required_extensions")?
            .to_vec(),
        None => Vec::new(),
    };

    let available = unsafe { entry.enumerate_instance_extension_properties(None) }
        .context("enumerate_instance_extension_properties")?;
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let have_validation = layers
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));

    let validation = cfg!(debug_assertions)
        && have_validation
        && has_name(&available, ash::ext::debug_utils::NAME);
    if cfg!(debug_assertions) && !validation {
        warn!("validation layer not available; continuing without it");
    }
    if validation {
        exts.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layer_ptrs = [VALIDATION_LAYER.as_ptr()];
    let (enabled_layer_count, pp_enabled_layer_names) = if validation {
        (1, layer_ptrs.as_ptr())
    } else {
        (0, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count,
        pp_enabled_layer_names,
        ..Default::default()
    };

    let instance = unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?;
    Ok((instance, validation))
}

fn device_score(props: &vk::PhysicalDeviceProperties) -> u32 {
    match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

/// First graphics queue family able to present (when a surface exists), on the
/// highest-ranked physical device that supports Vulkan 1.2.
unsafe fn pick_device_and_queue(
    instance: &Instance,
    surface: Option<&SurfaceState>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut best: Option<(u32, vk::PhysicalDevice, u32)> = None;
    for phys in unsafe { instance.enumerate_physical_devices()? } {
        let props = unsafe { instance.get_physical_device_properties(phys) };
        if props.api_version < vk::API_VERSION_1_2 {
            continue;
        }
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let family = qprops.iter().enumerate().find_map(|(i, q)| {
            let graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = match surface {
                Some(s) => unsafe {
                    s.loader
                        .get_physical_device_surface_support(phys, i as u32, s.surface)
                        .unwrap_or(false)
                },
                None => true,
            };
            (graphics && present).then_some(i as u32)
        });
        if let Some(family) = family {
            let score = device_score(&props);
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, phys, family));
            }
        }
    }
    best.map(|(_, p, f)| (p, f))
        .ok_or_else(|| anyhow!("no Vulkan 1.2 device with a suitable graphics queue"))
}

impl DeviceContext {
    /// Creates an instance, a surface for `window` and a device able to present to it.
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        unsafe { Self::create(Some((dh, wh))) }
    }

    /// Device without a surface, for offline baking and tests.
    pub fn headless() -> Result<Self> {
        unsafe { Self::create(None) }
    }

    // STRICT ORDER:
    // 1) instance (with WSI extensions when presenting)
    // 2) surface from this instance
    // 3) physical device and queue checked against that surface
    // 4) device, then the shared command pool
    unsafe fn create(
        handles: Option<(RawDisplayHandle, raw_window_handle::RawWindowHandle)>,
    ) -> Result<Self> {
        let entry = Entry::linked();
        let (instance, validation) = unsafe { create_instance(&entry, handles.map(|(d, _)| d))? };
        let debug = unsafe { create_debug_messenger(&entry, &instance, validation) };

        let surface = match handles {
            Some((dh, wh)) => {
                let loader = surface::Instance::new(&entry, &instance);
                match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) } {
                    Ok(surface) => Some(SurfaceState { loader, surface }),
                    Err(e) => {
                        unsafe {
                            destroy_debug_messenger(&debug);
                            instance.destroy_instance(None);
                        }
                        return Err(anyhow!(e).context("ash_window::create_surface"));
                    }
                }
            }
            None => None,
        };

        let teardown = |surface: &Option<SurfaceState>| unsafe {
            if let Some(s) = surface {
                s.loader.destroy_surface(s.surface, None);
            }
            destroy_debug_messenger(&debug);
            instance.destroy_instance(None);
        };

        let (physical, queue_family) = match unsafe { pick_device_and_queue(&instance, surface.as_ref()) } {
            Ok(v) => v,
            Err(e) => {
                teardown(&surface);
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };
        let supported = unsafe { instance.get_physical_device_features(physical) };
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let timestamps = properties.limits.timestamp_compute_and_graphics == vk::TRUE
            && qprops[queue_family as usize].timestamp_valid_bits > 0;

        let device = match unsafe {
            create_device(&instance, physical, queue_family, &supported, surface.is_some())
        } {
            Ok(d) => d,
            Err(e) => {
                teardown(&surface);
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(p) => p,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                teardown(&surface);
                return Err(anyhow!(e).context("create_command_pool"));
            }
        };

        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            "device: {} (api {}.{}), queue family {}, validation={}, timestamps={}",
            name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            queue_family,
            validation,
            timestamps,
        );

        Ok(Self {
            entry,
            instance,
            debug,
            surface,
            physical,
            properties,
            memory_properties,
            device,
            queue_family,
            queue,
            command_pool,
            anisotropy: supported.sampler_anisotropy == vk::TRUE,
            timestamps,
        })
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }
    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }
    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
    #[inline]
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }
    #[inline]
    pub fn surface(&self) -> Option<&SurfaceState> {
        self.surface.as_ref()
    }
    #[inline]
    pub fn anisotropy_enabled(&self) -> bool {
        self.anisotropy
    }
    #[inline]
    pub fn timestamps_supported(&self) -> bool {
        self.timestamps
    }
    /// Nanoseconds per timestamp tick.
    #[inline]
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical, format)
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle")
    }
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
    supported: &vk::PhysicalDeviceFeatures,
    presenting: bool,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let ext_props = unsafe { instance.enumerate_device_extension_properties(phys) }
        .context("enumerate_device_extension_properties")?;
    let mut device_exts: Vec<*const std::ffi::c_char> = Vec::new();
    if presenting {
        if !has_name(&ext_props, ash::khr::swapchain::NAME) {
            return Err(anyhow!("device lacks VK_KHR_swapchain"));
        }
        device_exts.push(ash::khr::swapchain::NAME.as_ptr());
    }

    // STRICT ORDER (feature pNext chain): feats12 -> feats2.
    // Framebuffers are created imageless, so that 1.2 feature is mandatory.
    let mut query12 = vk::PhysicalDeviceVulkan12Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        ..Default::default()
    };
    let mut query2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut query12) as *mut _ as *mut c_void,
        ..Default::default()
    };
    unsafe { instance.get_physical_device_features2(phys, &mut query2) };
    if query12.imageless_framebuffer != vk::TRUE {
        return Err(anyhow!("device lacks imagelessFramebuffer"));
    }

    let mut feats12 = vk::PhysicalDeviceVulkan12Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        imageless_framebuffer: vk::TRUE,
        ..Default::default()
    };
    let feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        p_next: (&mut feats12) as *mut _ as *mut c_void,
        features: vk::PhysicalDeviceFeatures {
            sampler_anisotropy: supported.sampler_anisotropy,
            ..Default::default()
        },
        ..Default::default()
    };

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&feats2) as *const _ as *const c_void,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    unsafe { instance.create_device(phys, &dinfo, None) }.context("create_device")
}

// STRICT TEARDOWN ORDER:
// - every dependent resource has already dropped its Arc
// - command pool before device
// - device before surface; debug messenger and instance last
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let Some(s) = &self.surface {
                s.loader.destroy_surface(s.surface, None);
            }
            destroy_debug_messenger(&self.debug);
            self.instance.destroy_instance(None);
        }
    }
}
