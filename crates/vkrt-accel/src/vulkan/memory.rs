//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

use super::error::{RtError, RtResult};
use super::VulkanContext;

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    /// Wrap a buffer whose memory is owned by something other than gpu-allocator.
    pub fn external(
        handle: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        device_address: Option<vk::DeviceAddress>,
        mapped: Option<NonNull<u8>>,
    ) -> Self {
        Self {
            handle,
            allocation: None,
            size,
            usage,
            device_address,
            mapped,
        }
    }

    /// Host pointer to the buffer memory, if it was allocated CPU-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(|p| p.as_ptr())
    }

    /// Device address, or an error if the buffer was created without
    /// `SHADER_DEVICE_ADDRESS`.
    pub fn address(&self) -> RtResult<vk::DeviceAddress> {
        self.device_address.ok_or_else(|| {
            let msg = format!("buffer {:?} has no device address (usage {:?})", self.handle, self.usage);
            log::error!("{}", msg);
            RtError::Allocation(msg)
        })
    }

    /// Write plain data to the start of the buffer.
    ///
    /// # Safety
    /// The GPU must not be accessing the buffer while it is written.
    pub unsafe fn write<T: bytemuck::Pod>(&self, data: &[T]) -> RtResult<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at `offset`.
    ///
    /// # Safety
    /// The GPU must not be accessing the buffer while it is written.
    pub unsafe fn write_bytes(&self, offset: usize, bytes: &[u8]) -> RtResult<()> {
        let ptr = self.mapped_ptr()
            .ok_or_else(|| RtError::Allocation("buffer is not host visible".to_string()))?;

        if (offset + bytes.len()) as vk::DeviceSize > self.size {
            return Err(RtError::Allocation(format!(
                "write of {} bytes at offset {} overflows buffer of {} bytes",
                bytes.len(), offset, self.size
            )));
        }

        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        Ok(())
    }
}

/// Buffer allocation service consumed by the acceleration structure and SBT
/// builders.
pub trait BufferAllocator {
    /// Create a buffer with the specified usage and memory location.
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> RtResult<Buffer>;

    /// Destroy a buffer and release its memory.
    unsafe fn destroy_buffer(&self, buffer: Buffer);
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> RtResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        // Every acceleration structure input is referenced by device address.
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }
}

impl BufferAllocator for MemoryManager {
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> RtResult<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None)
            .map_err(RtError::vk("vkCreateBuffer"))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(a) => a,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                log::error!("Failed to allocate {} bytes for '{}': {}", size, name, e);
                return Err(e.into());
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(RtError::vk("vkBindBufferMemory")(e));
        }

        // Get device address if usage includes it
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        let mapped = allocation.mapped_ptr().map(|p| p.cast::<u8>());

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
            mapped,
        })
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Buffer (host-backed)
    // ============================================================

    fn host_buffer(storage: &mut [u8]) -> Buffer {
        Buffer::external(
            vk::Buffer::null(),
            storage.len() as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            Some(0x1000),
            NonNull::new(storage.as_mut_ptr()),
        )
    }

    #[test]
    fn test_write_bytes_at_offset() {
        let mut storage = vec![0u8; 16];
        let buffer = host_buffer(&mut storage);
        unsafe { buffer.write_bytes(4, &[1, 2, 3]).unwrap() };
        assert_eq!(&storage[..8], &[0, 0, 0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_write_pod_slice() {
        let mut storage = vec![0u8; 8];
        let buffer = host_buffer(&mut storage);
        unsafe { buffer.write(&[0x0403_0201u32, 0x0807_0605u32]).unwrap() };
        assert_eq!(storage, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_write_overflow_rejected() {
        let mut storage = vec![0u8; 4];
        let buffer = host_buffer(&mut storage);
        let result = unsafe { buffer.write_bytes(2, &[1, 2, 3]) };
        assert!(matches!(result, Err(RtError::Allocation(_))));
        assert_eq!(storage, vec![0; 4]);
    }

    #[test]
    fn test_write_unmapped_rejected() {
        let buffer = Buffer::external(
            vk::Buffer::null(),
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            None,
            None,
        );
        assert!(unsafe { buffer.write_bytes(0, &[1]) }.is_err());
    }

    #[test]
    fn test_address_requires_device_address_usage() {
        let buffer = Buffer::external(vk::Buffer::null(), 64, vk::BufferUsageFlags::STORAGE_BUFFER, None, None);
        assert!(buffer.address().is_err());

        let mut storage = vec![0u8; 4];
        let addressed = host_buffer(&mut storage);
        assert_eq!(addressed.address().unwrap(), 0x1000);
    }
}
