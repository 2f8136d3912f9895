//! Acceleration structure ownership.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::vulkan::error::RtResult;
use crate::vulkan::memory::{Buffer, BufferAllocator};

use super::RayTracingDevice;

/// An acceleration structure and the buffer that backs it.
///
/// The pair is created by [`AccelerationStructure::create`] and released by
/// [`AccelerationStructure::destroy`]; the handle is always destroyed before
/// its buffer.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub level: vk::AccelerationStructureTypeKHR,
    pub size: vk::DeviceSize,
}

impl AccelerationStructure {
    /// Allocate a backing buffer of `size` bytes and create a structure on it.
    pub unsafe fn create(
        device: &dyn RayTracingDevice,
        allocator: &dyn BufferAllocator,
        level: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> RtResult<Self> {
        let buffer = allocator.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(size)
            .ty(level);

        let handle = match device.create_acceleration_structure(&create_info) {
            Ok(handle) => handle,
            Err(e) => {
                allocator.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let device_address = device.acceleration_structure_address(handle);

        Ok(Self {
            handle,
            buffer,
            device_address,
            level,
            size,
        })
    }

    /// Destroy the structure, then its buffer.
    pub unsafe fn destroy(self, device: &dyn RayTracingDevice, allocator: &dyn BufferAllocator) {
        device.destroy_acceleration_structure(self.handle);
        allocator.destroy_buffer(self.buffer);
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("handle", &self.handle)
            .field("buffer", &self.buffer.handle)
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .field("level", &self.level)
            .field("size", &self.size)
            .finish()
    }
}
