// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::descriptor::{DescriptorPool, PoolConfig};
use crate::instance::{Instance, Surface};
use crate::memory::DeviceMemory;

#[derive(Debug, Error)]
pub enum DeviceSelectionError {
    #[error("no Vulkan physical devices found")]
    NoDevices,
    #[error("none of the {0} physical device(s) supports graphics, present and VK_KHR_swapchain on this surface")]
    NoSuitableDevice(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    /// Recorded when available; never required and no queue is opened on it.
    pub compute: Option<u32>,
}

impl QueueFamilies {
    /// Distinct graphics/present family indices, one queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present];
        families.dedup();
        families
    }

    /// Graphics and present run on different families, so swapchain images
    /// must be shared between them.
    pub fn split_present(&self) -> bool {
        self.graphics != self.present
    }
}

/// Device extensions that are used when present but do not gate selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalExtensions {
    pub descriptor_indexing: bool,
}

pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub(crate) families: QueueFamilies,
    pub(crate) optional: OptionalExtensions,
    has_maintenance3: bool,
}

/// First family that can both draw and present, otherwise the first family
/// with at least one queue for each role.
pub(crate) fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;
    let mut shared = None;
    let mut compute = None;

    for (i, family) in props.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }
        let can_draw = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = supports_present(i);
        if graphics.is_none() && can_draw {
            graphics = Some(i);
        }
        if present.is_none() && can_present {
            present = Some(i);
        }
        if shared.is_none() && can_draw && can_present {
            shared = Some(i);
        }
        if compute.is_none() && family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            compute = Some(i);
        }
    }

    let (graphics, present) = match shared {
        Some(i) => (i, i),
        None => (graphics?, present?),
    };
    Some(QueueFamilies {
        graphics,
        present,
        compute,
    })
}

pub(crate) fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
}

/// First discrete GPU if there is one, otherwise the first candidate.
pub(crate) fn prefer_discrete<T>(
    candidates: Vec<T>,
    device_type: impl Fn(&T) -> vk::PhysicalDeviceType,
) -> Option<T> {
    let discrete = candidates
        .iter()
        .position(|c| device_type(c) == vk::PhysicalDeviceType::DISCRETE_GPU);
    let index = discrete.unwrap_or(0);
    candidates.into_iter().nth(index)
}

/// Picks the device used for rendering to `surface`.
pub(crate) unsafe fn select_physical_device(
    instance: &Instance,
    surface: &Surface,
) -> Result<PhysicalDevice> {
    let devices = unsafe { instance.raw.enumerate_physical_devices() }
        .context("enumerate_physical_devices")?;
    if devices.is_empty() {
        return Err(DeviceSelectionError::NoDevices.into());
    }

    let mut candidates = Vec::new();
    for &phys in &devices {
        if let Some(candidate) = unsafe { probe_device(instance, surface, phys) }? {
            candidates.push(candidate);
        }
    }

    let chosen = prefer_discrete(candidates, |c| c.device_type)
        .ok_or(DeviceSelectionError::NoSuitableDevice(devices.len()))?;
    if chosen.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
        warn!(
            "no suitable discrete GPU; using {} ({:?})",
            chosen.name, chosen.device_type
        );
    }
    info!(
        "device: {} ({:?}) families={:?} optional={:?}",
        chosen.name, chosen.device_type, chosen.families, chosen.optional
    );
    Ok(chosen)
}

unsafe fn probe_device(
    instance: &Instance,
    surface: &Surface,
    phys: vk::PhysicalDevice,
) -> Result<Option<PhysicalDevice>> {
    let props = unsafe { instance.raw.get_physical_device_properties(phys) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let queue_props = unsafe { instance.raw.get_physical_device_queue_family_properties(phys) };
    let families = find_queue_families(&queue_props, |i| unsafe {
        surface
            .loader
            .get_physical_device_surface_support(phys, i, surface.raw)
            .unwrap_or(false)
    });
    let Some(families) = families else {
        debug!("{name}: missing graphics or present queue family");
        return Ok(None);
    };

    let extensions = unsafe { instance.raw.enumerate_device_extension_properties(phys) }
        .with_context(|| format!("enumerate_device_extension_properties({name})"))?;
    if !has_extension(&extensions, swapchain::NAME) {
        debug!("{name}: VK_KHR_swapchain unsupported");
        return Ok(None);
    }

    let formats = unsafe {
        surface
            .loader
            .get_physical_device_surface_formats(phys, surface.raw)
    }
    .with_context(|| format!("get_physical_device_surface_formats({name})"))?;
    let modes = unsafe {
        surface
            .loader
            .get_physical_device_surface_present_modes(phys, surface.raw)
    }
    .with_context(|| format!("get_physical_device_surface_present_modes({name})"))?;
    if formats.is_empty() || modes.is_empty() {
        debug!(
            "{name}: {} surface format(s), {} present mode(s)",
            formats.len(),
            modes.len()
        );
        return Ok(None);
    }

    Ok(Some(PhysicalDevice {
        raw: phys,
        name,
        device_type: props.device_type,
        families,
        optional: OptionalExtensions {
            descriptor_indexing: has_extension(&extensions, ash::ext::descriptor_indexing::NAME),
        },
        has_maintenance3: has_extension(&extensions, ash::khr::maintenance3::NAME),
    }))
}

/// Opened device with its queues, graphics command pool, descriptor pool and
/// memory allocator. The pool and allocator are released before the device.
pub(crate) struct LogicalDevice {
    pub(crate) raw: ash::Device,
    pub(crate) physical: vk::PhysicalDevice,
    pub(crate) families: QueueFamilies,
    pub(crate) optional: OptionalExtensions,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) command_pool: vk::CommandPool,
    descriptors: ManuallyDrop<DescriptorPool>,
    memory: ManuallyDrop<DeviceMemory>,
}

impl LogicalDevice {
    pub(crate) unsafe fn new(
        instance: &Instance,
        physical: &PhysicalDevice,
        descriptor_pools: &Path,
    ) -> Result<Self> {
        let families = physical.families;
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let mut extensions: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];
        if physical.optional.descriptor_indexing {
            extensions.push(ash::ext::descriptor_indexing::NAME.as_ptr());
            if physical.has_maintenance3 {
                extensions.push(ash::khr::maintenance3::NAME.as_ptr());
            }
        }

        let create_info = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { instance.raw.create_device(physical.raw, &create_info, None) }
            .context("create_device")?;

        let graphics_queue = unsafe { raw.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { raw.get_device_queue(families.present, 0) };

        // Everything below is released by hand if a later step fails.
        let owned = unsafe { Self::create_owned(instance, physical, &raw, descriptor_pools) };
        let (command_pool, descriptors, memory) = match owned {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { raw.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Self {
            raw,
            physical: physical.raw,
            families,
            optional: physical.optional,
            graphics_queue,
            present_queue,
            command_pool,
            descriptors: ManuallyDrop::new(descriptors),
            memory: ManuallyDrop::new(memory),
        })
    }

    unsafe fn create_owned(
        instance: &Instance,
        physical: &PhysicalDevice,
        device: &ash::Device,
        descriptor_pools: &Path,
    ) -> Result<(vk::CommandPool, DescriptorPool, DeviceMemory)> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: physical.families.graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("create_command_pool")?;

        let built = PoolConfig::load(descriptor_pools)
            .with_context(|| format!("descriptor pool file {}", descriptor_pools.display()))
            .and_then(|config| unsafe { DescriptorPool::new(device, &config) })
            .and_then(|descriptors| {
                DeviceMemory::new(&instance.raw, device, physical.raw)
                    .map(|memory| (descriptors, memory))
            });
        match built {
            Ok((descriptors, memory)) => Ok((command_pool, descriptors, memory)),
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                Err(e)
            }
        }
    }

    pub(crate) fn descriptors(&mut self) -> &mut DescriptorPool {
        &mut self.descriptors
    }

    pub(crate) fn memory(&mut self) -> &mut DeviceMemory {
        &mut self.memory
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
            ManuallyDrop::drop(&mut self.descriptors);
            ManuallyDrop::drop(&mut self.memory);
            self.raw.destroy_command_pool(self.command_pool, None);
            self.raw.destroy_device(None);
        }
    }
}
