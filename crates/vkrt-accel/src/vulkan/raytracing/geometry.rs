//! Triangle geometry description for bottom-level builds.

use ash::vk;

use crate::vulkan::error::{RtError, RtResult};

/// GPU-resident mesh buffers as produced by the model loader.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub vertex_address: vk::DeviceAddress,
    /// Must match the stride used when the vertex buffer was filled.
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

impl MeshBuffers {
    /// Tightly packed `vec3` positions with `u32` indices.
    pub fn positions_u32(
        vertex_address: vk::DeviceAddress,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        index_count: u32,
    ) -> Self {
        Self {
            vertex_address,
            vertex_stride: (3 * std::mem::size_of::<f32>()) as vk::DeviceSize,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count,
            index_address,
            index_type: vk::IndexType::UINT32,
            index_count,
        }
    }
}

/// One mesh's triangle data plus the flags it should be built with.
#[derive(Debug, Clone, Copy)]
pub struct GeometryDescriptor {
    pub vertex_format: vk::Format,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_address: vk::DeviceAddress,
    pub max_vertex: u32,
    pub index_type: vk::IndexType,
    pub index_address: vk::DeviceAddress,
    pub primitive_count: u32,
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl GeometryDescriptor {
    /// Describe an opaque triangle mesh.
    pub fn from_mesh(mesh: &MeshBuffers, build_flags: vk::BuildAccelerationStructureFlagsKHR) -> RtResult<Self> {
        if mesh.index_count == 0 || mesh.index_count % 3 != 0 {
            return Err(RtError::precondition(format!(
                "mesh index count {} is not a positive multiple of 3",
                mesh.index_count
            )));
        }
        if mesh.vertex_stride == 0 {
            return Err(RtError::precondition("mesh vertex stride is 0"));
        }

        Ok(Self {
            vertex_format: mesh.vertex_format,
            vertex_stride: mesh.vertex_stride,
            vertex_address: mesh.vertex_address,
            max_vertex: mesh.vertex_count.saturating_sub(1),
            index_type: mesh.index_type,
            index_address: mesh.index_address,
            primitive_count: mesh.index_count / 3,
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            build_flags,
        })
    }

    pub fn requests_compaction(&self) -> bool {
        self.build_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    /// Hardware geometry description referencing the mesh buffers.
    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(self.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: self.vertex_address })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.max_vertex)
            .index_type(self.index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: self.index_address });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(self.geometry_flags)
    }

    /// The single primitive range covering the whole mesh.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}
