//! Host-only stand-in for the device, allocator and command services.
//!
//! `FakeDevice` records every command the builders issue and keeps track of
//! live buffers, structures and query pools so tests can check both the
//! recorded sequence and that nothing leaks.

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;

use super::commands::CommandExecutor;
use super::error::{RtError, RtResult};
use super::memory::{Buffer, BufferAllocator};
use super::raytracing::capabilities::{AccelerationStructureProperties, PipelineProperties};
use super::raytracing::{DeviceRayTracingCapabilities, RayTracingDevice, RayTracingFeatures};

const BYTES_PER_PRIMITIVE: u64 = 64;
const SCRATCH_PER_PRIMITIVE: u64 = 32;
const BYTES_PER_INSTANCE: u64 = 128;

/// A command recorded into a fake command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Build {
        level: vk::AccelerationStructureTypeKHR,
        update: bool,
        primitive_count: u32,
        scratch_address: vk::DeviceAddress,
        dst: vk::AccelerationStructureKHR,
    },
    Barrier {
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    },
    ResetQueryPool {
        first: u32,
        count: u32,
    },
    WriteCompactedSize {
        structure: vk::AccelerationStructureKHR,
        query: u32,
    },
    CopyCompact {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    },
    CopyBuffer {
        size: vk::DeviceSize,
    },
}

struct FakeBuffer {
    host: Option<Box<[u8]>>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<u64, FakeBuffer>,
    created_buffers: Vec<(String, vk::DeviceSize)>,
    structures: HashMap<u64, vk::DeviceSize>,
    query_pools: HashMap<u64, HashMap<u32, vk::DeviceSize>>,
    recorded: Vec<Recorded>,
    submissions: usize,
    fail_structure_creation: bool,
    fail_submission_in: Option<usize>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct FakeDevice {
    state: RefCell<State>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_handle: 0x100,
                // Deliberately off a 64-byte boundary.
                next_address: 0x1_0000_0010,
                ..State::default()
            }),
        }
    }

    pub fn capabilities(&self) -> DeviceRayTracingCapabilities {
        DeviceRayTracingCapabilities::merge(
            RayTracingFeatures {
                acceleration_structure_extension: true,
                ray_tracing_pipeline_extension: true,
                acceleration_structure: true,
                ray_tracing_pipeline: true,
                buffer_device_address: true,
            },
            PipelineProperties {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_ray_recursion_depth: 31,
            },
            AccelerationStructureProperties {
                max_geometry_count: 1 << 24,
                max_instance_count: 1 << 24,
                max_primitive_count: 1 << 29,
                min_scratch_offset_alignment: 128,
            },
        )
    }

    pub fn bytes_per_primitive(&self) -> u64 {
        BYTES_PER_PRIMITIVE
    }

    pub fn structure_size_for(&self, primitives: u32) -> vk::DeviceSize {
        primitives.max(1) as u64 * BYTES_PER_PRIMITIVE
    }

    pub fn scratch_size_for(&self, primitives: u32) -> vk::DeviceSize {
        primitives.max(1) as u64 * SCRATCH_PER_PRIMITIVE
    }

    /// Byte every shader group handle of group `group` is filled with.
    pub fn handle_byte(group: u32) -> u8 {
        0xA0u8.wrapping_add(group as u8)
    }

    pub fn fail_next_structure_creation(&self) {
        self.state.borrow_mut().fail_structure_creation = true;
    }

    /// Let `successes` submissions through, then fail the next one.
    pub fn fail_submission_after(&self, successes: usize) {
        self.state.borrow_mut().fail_submission_in = Some(successes);
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_structures(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub fn live_query_pools(&self) -> usize {
        self.state.borrow().query_pools.len()
    }

    pub fn submissions(&self) -> usize {
        self.state.borrow().submissions
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.state.borrow().recorded.clone()
    }

    /// Sizes of every buffer created under `name`, in creation order.
    pub fn created_buffers_named(&self, name: &str) -> Vec<vk::DeviceSize> {
        self.state.borrow().created_buffers.iter()
            .filter(|(n, _)| n == name)
            .map(|&(_, size)| size)
            .collect()
    }

    /// Host memory of a live CPU-visible buffer.
    pub fn host_bytes(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.borrow().buffers.get(&buffer.as_raw())
            .and_then(|b| b.host.as_ref())
            .map(|host| host.to_vec())
            .unwrap_or_default()
    }
}

impl BufferAllocator for FakeDevice {
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> RtResult<Buffer> {
        let mut state = self.state.borrow_mut();
        let handle = state.handle();

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let address = state.next_address;
            state.next_address += (size | 0xFFF) + 1 + 0x1000;
            Some(address)
        } else {
            None
        };

        let mut host = match location {
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu => Some(vec![0u8; size as usize].into_boxed_slice()),
            _ => None,
        };
        let mapped = host.as_mut().and_then(|h| NonNull::new(h.as_mut_ptr()));

        state.buffers.insert(handle, FakeBuffer { host });
        state.created_buffers.push((name.to_string(), size));

        Ok(Buffer::external(vk::Buffer::from_raw(handle), size, usage, device_address, mapped))
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        let removed = self.state.borrow_mut().buffers.remove(&buffer.handle.as_raw());
        assert!(removed.is_some(), "destroyed unknown buffer {:?}", buffer.handle);
    }
}

impl CommandExecutor for FakeDevice {
    unsafe fn begin_one_time(&self) -> RtResult<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    unsafe fn end_one_time(&self, _cmd: vk::CommandBuffer) -> RtResult<()> {
        let mut state = self.state.borrow_mut();
        match state.fail_submission_in {
            Some(0) => {
                state.fail_submission_in = None;
                Err(RtError::Submission("device lost".to_string()))
            }
            Some(n) => {
                state.fail_submission_in = Some(n - 1);
                state.submissions += 1;
                Ok(())
            }
            None => {
                state.submissions += 1;
                Ok(())
            }
        }
    }
}

impl RayTracingDevice for FakeDevice {
    unsafe fn get_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let primitives = max_primitive_counts.iter().sum::<u32>();
        let (structure, scratch) = if build_info.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            let size = primitives.max(1) as u64 * BYTES_PER_INSTANCE;
            (size, size / 2)
        } else {
            (self.structure_size_for(primitives), self.scratch_size_for(primitives))
        };

        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(structure)
            .build_scratch_size(scratch)
            .update_scratch_size(scratch / 2)
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> RtResult<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_structure_creation) {
            return Err(RtError::Vulkan {
                op: "vkCreateAccelerationStructureKHR",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        assert!(state.buffers.contains_key(&create_info.buffer.as_raw()), "structure on unknown buffer");

        let handle = state.handle();
        state.structures.insert(handle, create_info.size);
        Ok(vk::AccelerationStructureKHR::from_raw(handle))
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        let removed = self.state.borrow_mut().structures.remove(&handle.as_raw());
        assert!(removed.is_some(), "destroyed unknown structure {:?}", handle);
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        0x2_0000_0000 + handle.as_raw() * 0x1_0000
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        _cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let mut state = self.state.borrow_mut();
        for (info, range) in infos.iter().zip(ranges) {
            state.recorded.push(Recorded::Build {
                level: info.ty,
                update: info.mode == vk::BuildAccelerationStructureModeKHR::UPDATE,
                primitive_count: range.iter().map(|r| r.primitive_count).sum(),
                scratch_address: info.scratch_data.device_address,
                dst: info.dst_acceleration_structure,
            });
        }
    }

    unsafe fn cmd_write_compacted_sizes(
        &self,
        _cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    ) {
        let mut state = self.state.borrow_mut();
        for (i, structure) in structures.iter().enumerate() {
            let size = state.structures.get(&structure.as_raw()).copied().unwrap_or(0);
            let query = first_query + i as u32;
            if let Some(pool) = state.query_pools.get_mut(&query_pool.as_raw()) {
                pool.insert(query, size / 2);
            }
            state.recorded.push(Recorded::WriteCompactedSize { structure: *structure, query });
        }
    }

    unsafe fn cmd_copy_acceleration_structure(
        &self,
        _cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        assert_eq!(info.mode, vk::CopyAccelerationStructureModeKHR::COMPACT);
        self.state.borrow_mut().recorded.push(Recorded::CopyCompact { src: info.src, dst: info.dst });
    }

    unsafe fn cmd_memory_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        _dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        self.state.borrow_mut().recorded.push(Recorded::Barrier { src_access, dst_access });
    }

    unsafe fn cmd_copy_buffer(&self, _cmd: vk::CommandBuffer, _src: vk::Buffer, _dst: vk::Buffer, size: vk::DeviceSize) {
        self.state.borrow_mut().recorded.push(Recorded::CopyBuffer { size });
    }

    unsafe fn cmd_reset_query_pool(&self, _cmd: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, count: u32) {
        let mut state = self.state.borrow_mut();
        if let Some(queries) = state.query_pools.get_mut(&pool.as_raw()) {
            for query in first_query..first_query + count {
                queries.remove(&query);
            }
        }
        state.recorded.push(Recorded::ResetQueryPool { first: first_query, count });
    }

    unsafe fn create_compaction_query_pool(&self, _count: u32) -> RtResult<vk::QueryPool> {
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.query_pools.insert(handle, HashMap::new());
        Ok(vk::QueryPool::from_raw(handle))
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.borrow_mut().query_pools.remove(&pool.as_raw());
    }

    unsafe fn get_compacted_sizes(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        count: u32,
    ) -> RtResult<Vec<vk::DeviceSize>> {
        let state = self.state.borrow();
        let queries = state.query_pools.get(&pool.as_raw())
            .ok_or(RtError::Vulkan { op: "vkGetQueryPoolResults", result: vk::Result::ERROR_DEVICE_LOST })?;

        (first_query..first_query + count)
            .map(|query| {
                queries.get(&query).copied().ok_or(RtError::Vulkan {
                    op: "vkGetQueryPoolResults",
                    result: vk::Result::NOT_READY,
                })
            })
            .collect()
    }

    unsafe fn get_shader_group_handles(
        &self,
        _pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> RtResult<Vec<u8>> {
        let handle_size = data_size / group_count.max(1) as usize;
        Ok((0..group_count)
            .flat_map(|g| std::iter::repeat(Self::handle_byte(first_group + g)).take(handle_size))
            .collect())
    }
}
