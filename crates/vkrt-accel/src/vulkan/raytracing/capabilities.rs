//! Ray tracing capability detection and the extension function table.
//!
//! Capability detection runs once when the context is created. The builders
//! never check for individual entry points; they receive a fully loaded
//! [`RayTracingDevice`] or nothing at all.

use ash::vk;
use ash::khr::{acceleration_structure, ray_tracing_pipeline};
use ash::Instance;
use std::ffi::CStr;

use crate::vulkan::error::{RtError, RtResult};
use crate::vulkan::VulkanContext;

/// Feature bits and extension presence relevant to ray tracing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingFeatures {
    pub acceleration_structure_extension: bool,
    pub ray_tracing_pipeline_extension: bool,
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
    pub buffer_device_address: bool,
}

/// Shader group record properties of the ray tracing pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Acceleration structure limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelerationStructureProperties {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

/// Everything the builders need to know about the device, merged from the
/// individual feature and property queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceRayTracingCapabilities {
    pub features: RayTracingFeatures,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

impl DeviceRayTracingCapabilities {
    /// Combine independently queried results into one value.
    pub fn merge(
        features: RayTracingFeatures,
        pipeline: PipelineProperties,
        accel: AccelerationStructureProperties,
    ) -> Self {
        Self {
            features,
            shader_group_handle_size: pipeline.shader_group_handle_size,
            shader_group_handle_alignment: pipeline.shader_group_handle_alignment.max(1),
            shader_group_base_alignment: pipeline.shader_group_base_alignment.max(1),
            max_ray_recursion_depth: pipeline.max_ray_recursion_depth,
            max_geometry_count: accel.max_geometry_count,
            max_instance_count: accel.max_instance_count,
            max_primitive_count: accel.max_primitive_count,
            min_scratch_offset_alignment: accel.min_scratch_offset_alignment.max(1),
        }
    }

    /// Query a physical device.
    pub unsafe fn query(instance: &Instance, physical_device: vk::PhysicalDevice) -> Self {
        let features = query_features(instance, physical_device);
        if !features.acceleration_structure_extension || !features.ray_tracing_pipeline_extension {
            return Self::merge(features, PipelineProperties::default(), AccelerationStructureProperties::default());
        }

        let (pipeline, accel) = query_properties(instance, physical_device);
        Self::merge(features, pipeline, accel)
    }

    /// Names of the missing extensions or features, empty when supported.
    pub fn missing(&self) -> Vec<&'static str> {
        let f = &self.features;
        let mut missing = Vec::new();
        if !f.acceleration_structure_extension {
            missing.push("VK_KHR_acceleration_structure");
        }
        if !f.ray_tracing_pipeline_extension {
            missing.push("VK_KHR_ray_tracing_pipeline");
        }
        if !f.acceleration_structure {
            missing.push("accelerationStructure");
        }
        if !f.ray_tracing_pipeline {
            missing.push("rayTracingPipeline");
        }
        if !f.buffer_device_address {
            missing.push("bufferDeviceAddress");
        }
        missing
    }

    pub fn is_supported(&self) -> bool {
        self.missing().is_empty()
    }

    /// Fail with [`RtError::CapabilityMissing`] unless everything is present.
    pub fn ensure_supported(&self) -> RtResult<()> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            let msg = missing.join(", ");
            log::error!("Ray tracing unavailable, missing: {}", msg);
            Err(RtError::CapabilityMissing(msg))
        }
    }
}

unsafe fn query_features(instance: &Instance, physical_device: vk::PhysicalDevice) -> RayTracingFeatures {
    let extensions = match instance.enumerate_device_extension_properties(physical_device) {
        Ok(ext) => ext,
        Err(_) => return RayTracingFeatures::default(),
    };

    let has_ext = |needle: &CStr| {
        extensions.iter().any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == needle)
    };

    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut accel_features)
        .push_next(&mut rt_features)
        .push_next(&mut bda_features);

    instance.get_physical_device_features2(physical_device, &mut features2);

    RayTracingFeatures {
        acceleration_structure_extension: has_ext(acceleration_structure::NAME),
        ray_tracing_pipeline_extension: has_ext(ray_tracing_pipeline::NAME),
        acceleration_structure: accel_features.acceleration_structure == vk::TRUE,
        ray_tracing_pipeline: rt_features.ray_tracing_pipeline == vk::TRUE,
        buffer_device_address: bda_features.buffer_device_address == vk::TRUE,
    }
}

unsafe fn query_properties(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> (PipelineProperties, AccelerationStructureProperties) {
    let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut rt_props)
        .push_next(&mut accel_props);

    instance.get_physical_device_properties2(physical_device, &mut props2);

    (
        PipelineProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        },
        AccelerationStructureProperties {
            max_geometry_count: accel_props.max_geometry_count,
            max_instance_count: accel_props.max_instance_count,
            max_primitive_count: accel_props.max_primitive_count,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        },
    )
}

/// Device operations the acceleration structure and SBT builders issue.
///
/// Implemented by [`RayTracingFunctions`] for a real device. Everything the
/// builders record goes through this trait, so it is also the seam used to
/// exercise them without a GPU.
pub trait RayTracingDevice {
    unsafe fn get_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> RtResult<vk::AccelerationStructureKHR>;

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    unsafe fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    /// Record a compacted-size query for each structure, starting at `first_query`.
    unsafe fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    );

    unsafe fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    );

    unsafe fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    );

    unsafe fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize);

    unsafe fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, count: u32);

    /// Create a pool of `count` compacted-size queries.
    unsafe fn create_compaction_query_pool(&self, count: u32) -> RtResult<vk::QueryPool>;

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Read `count` compacted sizes starting at `first_query`, waiting for availability.
    unsafe fn get_compacted_sizes(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        count: u32,
    ) -> RtResult<Vec<vk::DeviceSize>>;

    unsafe fn get_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> RtResult<Vec<u8>>;
}

/// Loaded ray tracing entry points of a device.
pub struct RayTracingFunctions {
    device: ash::Device,
    accel: acceleration_structure::Device,
    pipeline: ray_tracing_pipeline::Device,
    capabilities: DeviceRayTracingCapabilities,
}

impl RayTracingFunctions {
    /// Resolve the function tables from the context's device.
    ///
    /// Fails if the device was not created with the ray tracing extensions.
    pub fn load(ctx: &VulkanContext) -> RtResult<Self> {
        ctx.rt_capabilities.ensure_supported()?;
        if !ctx.ray_tracing_enabled {
            return Err(RtError::CapabilityMissing(
                "device was created without ray tracing extensions".to_string(),
            ));
        }

        let accel = acceleration_structure::Device::new(&ctx.instance, &ctx.device);
        let pipeline = ray_tracing_pipeline::Device::new(&ctx.instance, &ctx.device);

        log::info!(
            "Ray tracing loaded: handle size {}, handle alignment {}, base alignment {}",
            ctx.rt_capabilities.shader_group_handle_size,
            ctx.rt_capabilities.shader_group_handle_alignment,
            ctx.rt_capabilities.shader_group_base_alignment,
        );

        Ok(Self {
            device: ctx.device.clone(),
            accel,
            pipeline,
            capabilities: ctx.rt_capabilities,
        })
    }

    pub fn capabilities(&self) -> &DeviceRayTracingCapabilities {
        &self.capabilities
    }
}

impl RayTracingDevice for RayTracingFunctions {
    unsafe fn get_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            build_info,
            max_primitive_counts,
            &mut size_info,
        );
        size_info
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> RtResult<vk::AccelerationStructureKHR> {
        self.accel.create_acceleration_structure(create_info, None)
            .map_err(RtError::vk("vkCreateAccelerationStructureKHR"))
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.accel.destroy_acceleration_structure(handle, None);
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        self.accel.get_acceleration_structure_device_address(&addr_info)
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        self.accel.cmd_build_acceleration_structures(cmd, infos, ranges);
    }

    unsafe fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    ) {
        self.accel.cmd_write_acceleration_structures_properties(
            cmd,
            structures,
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            query_pool,
            first_query,
        );
    }

    unsafe fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        self.accel.cmd_copy_acceleration_structure(cmd, info);
    }

    unsafe fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }

    unsafe fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.device.cmd_copy_buffer(cmd, src, dst, &[region]);
    }

    unsafe fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first_query: u32, count: u32) {
        self.device.cmd_reset_query_pool(cmd, pool, first_query, count);
    }

    unsafe fn create_compaction_query_pool(&self, count: u32) -> RtResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);

        self.device.create_query_pool(&info, None)
            .map_err(RtError::vk("vkCreateQueryPool"))
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.device.destroy_query_pool(pool, None);
    }

    unsafe fn get_compacted_sizes(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        count: u32,
    ) -> RtResult<Vec<vk::DeviceSize>> {
        let mut sizes = vec![0u64; count as usize];
        self.device.get_query_pool_results(
            pool,
            first_query,
            &mut sizes,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
        ).map_err(RtError::vk("vkGetQueryPoolResults"))?;
        Ok(sizes)
    }

    unsafe fn get_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> RtResult<Vec<u8>> {
        self.pipeline.get_ray_tracing_shader_group_handles(pipeline, first_group, group_count, data_size)
            .map_err(RtError::vk("vkGetRayTracingShaderGroupHandlesKHR"))
    }
}
