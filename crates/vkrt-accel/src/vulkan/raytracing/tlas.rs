//! Top-level acceleration structure builds.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use rayon::prelude::*;

use crate::vulkan::build_config::BuildConfig;
use crate::vulkan::commands::CommandExecutor;
use crate::vulkan::error::{RtError, RtResult};
use crate::vulkan::memory::{Buffer, BufferAllocator};

use super::acceleration::AccelerationStructure;
use super::{align_up, DeviceRayTracingCapabilities, RayTracingDevice};

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// One placement of a BLAS in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    /// Column-major world transform: `transform[column][row]`.
    pub transform: [[f32; 4]; 4],
    /// 24-bit value visible to shaders as the custom index.
    pub custom_index: u32,
    pub mask: u8,
    /// 24-bit hit group record offset.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            transform: IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
            blas_address: 0,
        }
    }
}

impl Instance {
    /// Create a new instance with the given transform and BLAS reference.
    pub fn new(transform: [[f32; 4]; 4], custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            custom_index,
            blas_address,
            ..Self::default()
        }
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.sbt_record_offset = offset;
        self.flags = flags;
        self
    }

    /// Pack into the layout the device reads from the instance buffer.
    pub fn to_record(&self) -> InstanceRecord {
        let mut transform = [[0.0f32; 4]; 3];
        for (row, values) in transform.iter_mut().enumerate() {
            for (column, value) in values.iter_mut().enumerate() {
                *value = self.transform[column][row];
            }
        }

        InstanceRecord {
            transform,
            instance_custom_index_and_mask: ((self.mask as u32) << 24) | (self.custom_index & 0xFF_FFFF),
            instance_shader_binding_table_record_offset_and_flags:
                ((self.flags.as_raw() & 0xFF) << 24) | (self.sbt_record_offset & 0xFF_FFFF),
            acceleration_structure_reference: self.blas_address,
        }
    }
}

/// `VkAccelerationStructureInstanceKHR` with a row-major 3x4 transform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

/// Convert instances, in parallel from `threshold` instances upwards.
pub fn convert_instances(instances: &[Instance], threshold: usize) -> Vec<InstanceRecord> {
    if instances.len() >= threshold {
        instances.par_iter().map(Instance::to_record).collect()
    } else {
        instances.iter().map(Instance::to_record).collect()
    }
}

/// Builds, updates and owns the scene's single TLAS.
pub struct TlasBuilder<'a> {
    device: &'a dyn RayTracingDevice,
    allocator: &'a dyn BufferAllocator,
    commands: &'a dyn CommandExecutor,
    caps: DeviceRayTracingCapabilities,
    config: BuildConfig,
    tlas: Option<AccelerationStructure>,
    instance_count: u32,
    built_flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl<'a> TlasBuilder<'a> {
    pub fn new(
        device: &'a dyn RayTracingDevice,
        allocator: &'a dyn BufferAllocator,
        commands: &'a dyn CommandExecutor,
        caps: DeviceRayTracingCapabilities,
        config: BuildConfig,
    ) -> Self {
        Self {
            device,
            allocator,
            commands,
            config: config.validated(&caps),
            caps,
            tlas: None,
            instance_count: 0,
            built_flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
        }
    }

    /// Build the TLAS, or refit it in place when `is_update` is set.
    ///
    /// A fresh build requires that no TLAS exists yet. An update requires a
    /// TLAS built with `ALLOW_UPDATE` over the same number of instances.
    pub unsafe fn build_tlas(&mut self, instances: &[Instance], is_update: bool) -> RtResult<&AccelerationStructure> {
        self.check_preconditions(instances.len(), is_update)?;

        let instance_count = instances.len() as u32;
        let records = convert_instances(instances, self.config.parallel_instance_threshold);
        let data_size = std::mem::size_of_val(records.as_slice()) as vk::DeviceSize;

        let mut transient = Vec::with_capacity(3);
        let created_tlas = self.tlas.is_none();

        let result = self.record_build(&records, data_size, instance_count, is_update, &mut transient);

        for buffer in transient {
            self.allocator.destroy_buffer(buffer);
        }

        if let Err(e) = result {
            if created_tlas {
                if let Some(tlas) = self.tlas.take() {
                    tlas.destroy(self.device, self.allocator);
                }
            }
            return Err(e);
        }

        self.instance_count = instance_count;

        log::info!(
            "{} TLAS over {} instance(s)",
            if is_update { "Updated" } else { "Built" },
            instance_count
        );

        self.tlas.as_ref()
            .ok_or_else(|| RtError::precondition("TLAS missing after build"))
    }

    fn check_preconditions(&self, count: usize, is_update: bool) -> RtResult<()> {
        match (&self.tlas, is_update) {
            (Some(_), false) => {
                return Err(RtError::precondition("TLAS already built; request an update or destroy it first"));
            }
            (None, true) => {
                return Err(RtError::precondition("TLAS update requested before the first build"));
            }
            (Some(_), true) => {
                if !self.built_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
                    return Err(RtError::precondition("TLAS was not built with ALLOW_UPDATE"));
                }
                if count as u32 != self.instance_count {
                    return Err(RtError::precondition(format!(
                        "TLAS update with {} instances, built with {}",
                        count, self.instance_count
                    )));
                }
            }
            (None, false) => {}
        }

        if self.caps.max_instance_count > 0 && count as u64 > self.caps.max_instance_count {
            return Err(RtError::precondition(format!(
                "{} instances exceed device limit {}",
                count, self.caps.max_instance_count
            )));
        }

        Ok(())
    }

    unsafe fn record_build(
        &mut self,
        records: &[InstanceRecord],
        data_size: vk::DeviceSize,
        instance_count: u32,
        is_update: bool,
        transient: &mut Vec<Buffer>,
    ) -> RtResult<()> {
        // Zero-sized buffers are invalid; an empty scene still gets one record.
        let buffer_size = data_size.max(std::mem::size_of::<InstanceRecord>() as vk::DeviceSize);

        let staging = self.allocator.create_buffer(
            buffer_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "tlas_instances_staging",
        )?;
        staging.write(records)?;
        let staging_handle = staging.handle;
        transient.push(staging);

        let instance_buffer = self.allocator.create_buffer(
            buffer_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS |
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "tlas_instances",
        )?;
        let instance_address = instance_buffer.address()?;
        let instance_handle = instance_buffer.handle;
        transient.push(instance_buffer);

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

        let geometries = [geometry];
        let flags = self.config.tlas_flags;
        let size_query = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let size_info = self.device.get_build_sizes(&size_query, &[instance_count]);

        if self.tlas.is_none() {
            let tlas = AccelerationStructure::create(
                self.device,
                self.allocator,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                size_info.acceleration_structure_size,
                "tlas",
            )?;
            self.tlas = Some(tlas);
            self.built_flags = flags;
        }
        let tlas_handle = self.tlas.as_ref()
            .map(|t| t.handle)
            .ok_or_else(|| RtError::precondition("TLAS missing before build"))?;

        let scratch_size = if is_update {
            size_info.update_scratch_size
        } else {
            size_info.build_scratch_size
        };
        let scratch_alignment = self.caps.min_scratch_offset_alignment.max(1) as vk::DeviceSize;
        let scratch = self.allocator.create_buffer(
            scratch_size + scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "tlas_scratch",
        )?;
        let scratch_address = align_up(scratch.address()?, scratch_alignment);
        transient.push(scratch);

        let (mode, src) = if is_update {
            (vk::BuildAccelerationStructureModeKHR::UPDATE, tlas_handle)
        } else {
            (vk::BuildAccelerationStructureModeKHR::BUILD, vk::AccelerationStructureKHR::null())
        };

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(flags)
            .mode(mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(tlas_handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(instance_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

        let cmd = self.commands.begin_one_time()?;
        if data_size > 0 {
            self.device.cmd_copy_buffer(cmd, staging_handle, instance_handle, data_size);
        }
        self.device.cmd_memory_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            // The build reads the instance buffer through its device address.
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR | vk::AccessFlags::SHADER_READ,
        );
        self.device.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
        self.commands.end_one_time(cmd)
    }

    /// The TLAS, once built.
    pub fn tlas(&self) -> Option<&AccelerationStructure> {
        self.tlas.as_ref()
    }

    /// Instance count of the current TLAS, 0 before the first build.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Destroy the TLAS so the next call can be a fresh build.
    pub unsafe fn destroy(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(self.device, self.allocator);
        }
        self.instance_count = 0;
        self.built_flags = vk::BuildAccelerationStructureFlagsKHR::empty();
    }
}
