//! Shader Binding Table (SBT) management for ray tracing pipelines.
//!
//! The table holds one raygen record followed by the miss, hit and callable
//! regions. Each region starts on a base-aligned offset and its records are
//! spaced by the handle size rounded up to the handle alignment.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::vulkan::error::{RtError, RtResult};
use crate::vulkan::memory::{Buffer, BufferAllocator};

use super::{align_up, DeviceRayTracingCapabilities, RayTracingDevice};

/// Placement of one region inside the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub count: u32,
}

impl RegionLayout {
    fn address(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            // Empty regions are never dereferenced by a dispatch.
            device_address: if self.count > 0 { base + self.offset } else { 0 },
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Table layout derived from the device's shader group properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub handle_size_aligned: vk::DeviceSize,
    pub base_alignment: vk::DeviceSize,
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    pub callable: RegionLayout,
}

impl SbtLayout {
    /// Lay out one raygen group plus the given miss, hit and callable groups.
    pub fn compute(caps: &DeviceRayTracingCapabilities, miss_count: u32, hit_count: u32, callable_count: u32) -> Self {
        let base_alignment = caps.shader_group_base_alignment.max(1) as vk::DeviceSize;
        let handle_size_aligned = align_up(
            caps.shader_group_handle_size as vk::DeviceSize,
            caps.shader_group_handle_alignment as vk::DeviceSize,
        );

        // The raygen region's size must equal its stride.
        let raygen_size = align_up(handle_size_aligned, base_alignment);
        let raygen = RegionLayout {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
            count: 1,
        };

        let region = |offset: vk::DeviceSize, count: u32| RegionLayout {
            offset,
            stride: handle_size_aligned,
            size: align_up(handle_size_aligned * count as vk::DeviceSize, base_alignment),
            count,
        };

        let miss = region(raygen.offset + raygen.size, miss_count);
        let hit = region(miss.offset + miss.size, hit_count);
        let callable = region(hit.offset + hit.size, callable_count);

        Self {
            handle_size: caps.shader_group_handle_size,
            handle_size_aligned,
            base_alignment,
            raygen,
            miss,
            hit,
            callable,
        }
    }

    /// Shader groups the pipeline must have, in raygen, miss, hit, callable order.
    pub fn group_count(&self) -> u32 {
        self.raygen.count + self.miss.count + self.hit.count + self.callable.count
    }

    /// Bytes covered by all four regions.
    pub fn total_size(&self) -> vk::DeviceSize {
        self.callable.offset + self.callable.size
    }

    /// Regions addressed from `base`, which must be base-aligned.
    pub fn regions(&self, base: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            raygen: self.raygen.address(base),
            miss: self.miss.address(base),
            hit: self.hit.address(base),
            callable: self.callable.address(base),
        }
    }

    fn records(&self) -> impl Iterator<Item = vk::DeviceSize> + '_ {
        [self.raygen, self.miss, self.hit, self.callable]
            .into_iter()
            .flat_map(|r| (0..r.count as vk::DeviceSize).map(move |i| r.offset + i * r.stride))
    }
}

/// The four regions passed to `vkCmdTraceRaysKHR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Shader Binding Table for ray tracing.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub layout: SbtLayout,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Create a shader binding table from a ray tracing pipeline.
    ///
    /// # Arguments
    /// * `pipeline` - Pipeline whose groups are ordered raygen, miss, hit, callable
    /// * `miss_count` - Number of miss shaders
    /// * `hit_count` - Number of hit groups
    /// * `callable_count` - Number of callable shaders
    pub unsafe fn new(
        device: &dyn RayTracingDevice,
        allocator: &dyn BufferAllocator,
        caps: &DeviceRayTracingCapabilities,
        pipeline: vk::Pipeline,
        miss_count: u32,
        hit_count: u32,
        callable_count: u32,
    ) -> RtResult<Self> {
        if caps.shader_group_handle_size == 0 {
            return Err(RtError::CapabilityMissing("shader group handle size is 0".to_string()));
        }

        let layout = SbtLayout::compute(caps, miss_count, hit_count, callable_count);
        let group_count = layout.group_count();
        let handle_size = layout.handle_size as usize;

        let handles_size = group_count as usize * handle_size;
        let handles = device.get_shader_group_handles(pipeline, 0, group_count, handles_size)?;
        if handles.len() < handles_size {
            return Err(RtError::precondition(format!(
                "pipeline returned {} bytes of shader group handles, expected {}",
                handles.len(),
                handles_size
            )));
        }

        // Padding lets the table start on a base-aligned address whatever
        // alignment the allocation ends up with.
        let buffer = allocator.create_buffer(
            layout.total_size() + layout.base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;

        match Self::fill(&buffer, &layout, &handles) {
            Ok(regions) => {
                log::debug!(
                    "SBT: {} groups, {} bytes, handle stride {}",
                    group_count,
                    layout.total_size(),
                    layout.handle_size_aligned
                );
                Ok(Self { buffer, layout, regions })
            }
            Err(e) => {
                allocator.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    unsafe fn fill(buffer: &Buffer, layout: &SbtLayout, handles: &[u8]) -> RtResult<SbtRegions> {
        let buffer_address = buffer.address()?;
        let base = align_up(buffer_address, layout.base_alignment);
        let start = (base - buffer_address) as usize;

        let handle_size = layout.handle_size as usize;
        for (group, offset) in layout.records().enumerate() {
            let handle = &handles[group * handle_size..(group + 1) * handle_size];
            buffer.write_bytes(start + offset as usize, handle)?;
        }

        Ok(layout.regions(base))
    }

    /// Regions for `vkCmdTraceRaysKHR`.
    pub fn regions(&self) -> SbtRegions {
        self.regions
    }

    /// Destroy the shader binding table.
    pub unsafe fn destroy(self, allocator: &dyn BufferAllocator) {
        allocator.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::testing::FakeDevice;

    fn caps(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> DeviceRayTracingCapabilities {
        DeviceRayTracingCapabilities {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            ..DeviceRayTracingCapabilities::default()
        }
    }

    // ============================================================
    // SbtLayout
    // ============================================================

    #[test]
    fn test_layout_one_of_each() {
        let layout = SbtLayout::compute(&caps(32, 32, 64), 1, 1, 0);
        assert_eq!((layout.raygen.stride, layout.raygen.size), (64, 64));
        assert_eq!((layout.miss.stride, layout.miss.size), (32, 64));
        assert_eq!((layout.hit.stride, layout.hit.size), (32, 64));
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.total_size(), 192);
        assert_eq!(layout.group_count(), 3);
    }

    #[test]
    fn test_layout_handle_rounded_to_alignment() {
        let layout = SbtLayout::compute(&caps(24, 32, 64), 3, 2, 0);
        assert_eq!(layout.handle_size_aligned, 32);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.size, 64);
    }

    #[test]
    fn test_raygen_is_one_base_aligned_handle() {
        for (handle, align, base) in [(32, 32, 64), (32, 64, 64), (64, 64, 256), (16, 16, 16), (48, 16, 64)] {
            let layout = SbtLayout::compute(&caps(handle, align, base), 4, 4, 4);
            assert_eq!(layout.raygen.size, layout.raygen.stride);
            assert_eq!(layout.raygen.size, align_up(layout.handle_size_aligned, base as u64));
            for region in [layout.raygen, layout.miss, layout.hit, layout.callable] {
                assert_eq!(region.size % base as u64, 0);
                assert_eq!(region.offset % base as u64, 0);
                assert_eq!(region.stride % align as u64, 0);
            }
        }
    }

    #[test]
    fn test_empty_regions_have_null_address() {
        let layout = SbtLayout::compute(&caps(32, 32, 64), 0, 1, 0);
        let regions = layout.regions(0x10_0000);
        assert_eq!(regions.raygen.device_address, 0x10_0000);
        assert_eq!(regions.miss.device_address, 0);
        assert_eq!(regions.miss.size, 0);
        assert_eq!(regions.hit.device_address, 0x10_0040);
        assert_eq!(regions.callable.device_address, 0);
    }

    // ============================================================
    // ShaderBindingTable
    // ============================================================

    #[test]
    fn test_table_regions_and_records() {
        let fake = FakeDevice::new();
        let caps = caps(32, 32, 64);

        let sbt = unsafe {
            ShaderBindingTable::new(&fake, &fake, &caps, vk::Pipeline::null(), 1, 1, 0).unwrap()
        };
        let regions = sbt.regions();

        assert_eq!((regions.raygen.stride, regions.raygen.size), (64, 64));
        assert_eq!((regions.miss.stride, regions.miss.size), (32, 64));
        assert_eq!((regions.hit.stride, regions.hit.size), (32, 64));
        assert_eq!(regions.raygen.device_address % 64, 0);
        assert_eq!(regions.miss.device_address, regions.raygen.device_address + 64);
        assert_eq!(regions.hit.device_address, regions.raygen.device_address + 128);
        assert_eq!(regions.callable.device_address, 0);

        // Each record starts with its group's handle.
        let bytes = fake.host_bytes(sbt.buffer.handle);
        let start = (regions.raygen.device_address - sbt.buffer.address().unwrap()) as usize;
        for (group, region) in [regions.raygen, regions.miss, regions.hit].iter().enumerate() {
            let offset = start + (region.device_address - regions.raygen.device_address) as usize;
            assert_eq!(bytes[offset..offset + 32], [FakeDevice::handle_byte(group as u32); 32]);
        }

        unsafe { sbt.destroy(&fake) };
        assert_eq!(fake.live_buffers(), 0);
    }

    #[test]
    fn test_table_records_spaced_by_stride() {
        let fake = FakeDevice::new();
        let caps = caps(16, 32, 64);

        let sbt = unsafe {
            ShaderBindingTable::new(&fake, &fake, &caps, vk::Pipeline::null(), 2, 3, 1).unwrap()
        };
        let regions = sbt.regions();
        let bytes = fake.host_bytes(sbt.buffer.handle);
        let start = (regions.raygen.device_address - sbt.buffer.address().unwrap()) as usize;

        // Hit groups are groups 3, 4 and 5.
        for i in 0..3u64 {
            let offset = start + (regions.hit.device_address - regions.raygen.device_address + i * 32) as usize;
            assert_eq!(bytes[offset..offset + 16], [FakeDevice::handle_byte(3 + i as u32); 16]);
            // Padding between records stays zeroed.
            assert_eq!(bytes[offset + 16..offset + 32], [0u8; 16]);
        }
    }

    #[test]
    fn test_zero_handle_size_rejected() {
        let fake = FakeDevice::new();
        let result = unsafe {
            ShaderBindingTable::new(&fake, &fake, &caps(0, 32, 64), vk::Pipeline::null(), 1, 1, 0)
        };
        assert!(matches!(result, Err(RtError::CapabilityMissing(_))));
        assert_eq!(fake.live_buffers(), 0);
    }
}
