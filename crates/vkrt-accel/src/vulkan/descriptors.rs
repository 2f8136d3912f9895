//! Descriptor writes for the ray tracing set.
//!
//! The set itself (pool, layout and allocation) belongs to the renderer; this
//! module only describes the TLAS and output image bindings and writes them.

use ash::vk;

/// Resource bound by one [`RtDescriptorWrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtDescriptorResource {
    AccelerationStructure(vk::AccelerationStructureKHR),
    /// Output image, expected in `GENERAL` layout.
    StorageImage(vk::ImageView),
}

/// One binding of the ray tracing descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtDescriptorWrite {
    pub binding: u32,
    pub resource: RtDescriptorResource,
}

impl RtDescriptorWrite {
    /// Bind the top-level acceleration structure at `binding`.
    pub fn acceleration_structure(binding: u32, tlas: vk::AccelerationStructureKHR) -> Self {
        Self {
            binding,
            resource: RtDescriptorResource::AccelerationStructure(tlas),
        }
    }

    /// Bind the output image at `binding`.
    pub fn storage_image(binding: u32, view: vk::ImageView) -> Self {
        Self {
            binding,
            resource: RtDescriptorResource::StorageImage(view),
        }
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self.resource {
            RtDescriptorResource::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            RtDescriptorResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// Info structs the Vulkan writes point into (must outlive the writes).
struct PreparedWrites {
    set: vk::DescriptorSet,
    writes: Vec<RtDescriptorWrite>,
    tlas_handles: Vec<vk::AccelerationStructureKHR>,
    image_infos: Vec<vk::DescriptorImageInfo>,
}

impl PreparedWrites {
    fn new(set: vk::DescriptorSet, writes: &[RtDescriptorWrite]) -> Self {
        let mut tlas_handles = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match write.resource {
                RtDescriptorResource::AccelerationStructure(handle) => tlas_handles.push(handle),
                RtDescriptorResource::StorageImage(view) => image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                }),
            }
        }

        Self {
            set,
            writes: writes.to_vec(),
            tlas_handles,
            image_infos,
        }
    }

    fn tlas_infos(&self) -> Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'_>> {
        self.tlas_handles.iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect()
    }

    fn vk_writes<'a>(
        &'a self,
        tlas_infos: &'a mut [vk::WriteDescriptorSetAccelerationStructureKHR<'_>],
    ) -> Vec<vk::WriteDescriptorSet<'a>> {
        let mut tlas_iter = tlas_infos.iter_mut();
        let mut image_iter = self.image_infos.iter();

        self.writes.iter()
            .filter_map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type());

                match write.resource {
                    // The count is not implied by the chained struct.
                    RtDescriptorResource::AccelerationStructure(_) => tlas_iter.next()
                        .map(|info| base.descriptor_count(1).push_next(info)),
                    RtDescriptorResource::StorageImage(_) => image_iter.next()
                        .map(|info| base.image_info(std::slice::from_ref(info))),
                }
            })
            .collect()
    }
}

/// Write the TLAS and output image bindings into `set` in one call.
pub unsafe fn write_ray_tracing_descriptors(device: &ash::Device, set: vk::DescriptorSet, writes: &[RtDescriptorWrite]) {
    if writes.is_empty() {
        return;
    }

    let prepared = PreparedWrites::new(set, writes);
    let mut tlas_infos = prepared.tlas_infos();
    let vk_writes = prepared.vk_writes(&mut tlas_infos);

    device.update_descriptor_sets(&vk_writes, &[]);
}

/// Layout bindings matching the writes above.
pub fn ray_tracing_set_layout_bindings(
    tlas_binding: u32,
    image_binding: u32,
) -> [vk::DescriptorSetLayoutBinding<'static>; 2] {
    [
        vk::DescriptorSetLayoutBinding::default()
            .binding(tlas_binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        vk::DescriptorSetLayoutBinding::default()
            .binding(image_binding)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
    ]
}
