// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use tracing::warn;

/// Where a buffer's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemoryUsage {
    /// Host visible and persistently mapped.
    Upload,
    DeviceLocal,
}

impl MemoryUsage {
    fn location(self) -> MemoryLocation {
        match self {
            MemoryUsage::Upload => MemoryLocation::CpuToGpu,
            MemoryUsage::DeviceLocal => MemoryLocation::GpuOnly,
        }
    }
}

pub(crate) struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl Buffer {
    /// Placeholder that owns nothing; destroying it is a no-op.
    pub(crate) fn null() -> Self {
        Self {
            raw: vk::Buffer::null(),
            size: 0,
            allocation: None,
        }
    }
}

/// Device memory sub-allocator. Buffers it hands out must be returned through
/// [`DeviceMemory::destroy_buffer`] before it is dropped.
pub(crate) struct DeviceMemory {
    device: ash::Device,
    allocator: Allocator,
}

impl DeviceMemory {
    pub(crate) fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("create gpu allocator")?;
        Ok(Self {
            device: device.clone(),
            allocator,
        })
    }

    pub(crate) unsafe fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let raw = unsafe { self.device.create_buffer(&info, None) }
            .with_context(|| format!("create_buffer({name})"))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(raw) };

        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(raw, None) };
                return Err(e).with_context(|| format!("allocate memory for {name}"));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) }
        {
            unsafe { self.device.destroy_buffer(raw, None) };
            let _ = self.allocator.free(allocation);
            bail!("bind_buffer_memory({name}): {e:?}");
        }

        Ok(Buffer {
            raw,
            size,
            allocation: Some(allocation),
        })
    }

    /// Copies `bytes` to the start of a host-visible buffer.
    pub(crate) fn write(&self, buffer: &Buffer, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > buffer.size {
            bail!(
                "write of {} bytes overflows a {} byte buffer",
                bytes.len(),
                buffer.size
            );
        }
        let Some(ptr) = buffer.allocation.as_ref().and_then(Allocation::mapped_ptr) else {
            bail!("buffer is not host visible");
        };
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().cast::<u8>(), bytes.len());
        }
        Ok(())
    }

    pub(crate) unsafe fn destroy_buffer(&mut self, buffer: &mut Buffer) {
        if buffer.raw != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.raw, None) };
            buffer.raw = vk::Buffer::null();
        }
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = self.allocator.free(allocation) {
                warn!("free buffer memory: {e}");
            }
        }
    }
}
