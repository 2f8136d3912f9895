//! Bottom-level acceleration structure builds.
//!
//! Geometries are sized up front, split into batches bounded by
//! [`BuildConfig::blas_batch_limit`], and built one batch per command buffer
//! against a single shared scratch buffer. When the geometries request
//! compaction, each batch is followed by a compaction pass that copies every
//! structure into a buffer of its queried compacted size and destroys the
//! original.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::vulkan::build_config::BuildConfig;
use crate::vulkan::commands::CommandExecutor;
use crate::vulkan::error::{RtError, RtResult};
use crate::vulkan::memory::{Buffer, BufferAllocator};

use super::acceleration::AccelerationStructure;
use super::batch::{Batch, BatchPlan, EntrySizes};
use super::geometry::GeometryDescriptor;
use super::{align_up, DeviceRayTracingCapabilities, RayTracingDevice};

/// Handle to a bottom-level acceleration structure owned by a [`BlasBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(pub usize);

/// Summary of the last `build_blas` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlasBuildReport {
    pub structures: usize,
    pub batches: usize,
    pub scratch_size: vk::DeviceSize,
    pub built_size: vk::DeviceSize,
    /// Equal to `built_size` when compaction was not requested.
    pub final_size: vk::DeviceSize,
    pub compacted: bool,
}

/// Shared state of one `build_blas` call.
struct BuildPass<'g> {
    geometries: &'g [GeometryDescriptor],
    vk_geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    sizes: Vec<EntrySizes>,
    scratch_address: vk::DeviceAddress,
    query_pool: Option<vk::QueryPool>,
}

impl BuildPass<'_> {
    fn build_info(&self, index: usize) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.geometries[index].build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&self.vk_geometries[index]))
    }
}

/// Builds and owns bottom-level acceleration structures.
pub struct BlasBuilder<'a> {
    device: &'a dyn RayTracingDevice,
    allocator: &'a dyn BufferAllocator,
    commands: &'a dyn CommandExecutor,
    caps: DeviceRayTracingCapabilities,
    config: BuildConfig,
    blas: Vec<AccelerationStructure>,
    last_report: Option<BlasBuildReport>,
}

impl<'a> BlasBuilder<'a> {
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
            blas: Vec::new(),
            last_report: None,
        }
    }

    /// Geometry descriptor for a mesh using this builder's configured flags.
    pub fn describe(&self, mesh: &super::MeshBuffers) -> RtResult<GeometryDescriptor> {
        GeometryDescriptor::from_mesh(mesh, self.config.blas_build_flags(self.config.allow_compaction))
    }

    /// Build one BLAS per geometry.
    ///
    /// Either every geometry requests compaction or none does. On error no
    /// structure from this call is kept.
    pub unsafe fn build_blas(&mut self, geometries: &[GeometryDescriptor]) -> RtResult<Vec<BlasHandle>> {
        if geometries.is_empty() {
            return Ok(Vec::new());
        }

        let compact_count = geometries.iter().filter(|g| g.requests_compaction()).count();
        if compact_count != 0 && compact_count != geometries.len() {
            return Err(RtError::precondition(format!(
                "{} of {} geometries request compaction; all or none must",
                compact_count,
                geometries.len()
            )));
        }
        let compact = compact_count > 0;

        if self.caps.max_primitive_count > 0 {
            if let Some(g) = geometries.iter().find(|g| g.primitive_count as u64 > self.caps.max_primitive_count) {
                return Err(RtError::precondition(format!(
                    "geometry with {} triangles exceeds device limit {}",
                    g.primitive_count, self.caps.max_primitive_count
                )));
            }
        }

        let mut pass = BuildPass {
            geometries,
            vk_geometries: geometries.iter().map(GeometryDescriptor::to_vk).collect(),
            sizes: Vec::with_capacity(geometries.len()),
            scratch_address: 0,
            query_pool: None,
        };

        for (idx, geometry) in geometries.iter().enumerate() {
            let size_info = self.device.get_build_sizes(&pass.build_info(idx), &[geometry.primitive_count]);
            pass.sizes.push(EntrySizes {
                structure: size_info.acceleration_structure_size,
                scratch: size_info.build_scratch_size,
            });
        }

        let plan = BatchPlan::new(&pass.sizes, self.config.blas_batch_limit);

        // Scratch addresses must honour the device's offset alignment.
        let scratch_alignment = self.caps.min_scratch_offset_alignment.max(1) as vk::DeviceSize;
        let scratch = self.allocator.create_buffer(
            plan.max_scratch_size + scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "blas_scratch",
        )?;

        let result = self.build_with_scratch(&mut pass, &plan, &scratch, compact);

        if let Some(pool) = pass.query_pool.take() {
            self.device.destroy_query_pool(pool);
        }
        self.allocator.destroy_buffer(scratch);

        let (built, report) = result?;

        let first = self.blas.len();
        self.blas.extend(built);
        self.last_report = Some(report);

        log::info!(
            "Built {} BLAS in {} batch(es): {} bytes{}",
            report.structures,
            report.batches,
            report.final_size,
            if report.compacted {
                format!(" (compacted from {})", report.built_size)
            } else {
                String::new()
            }
        );

        Ok((first..self.blas.len()).map(BlasHandle).collect())
    }

    unsafe fn build_with_scratch(
        &self,
        pass: &mut BuildPass<'_>,
        plan: &BatchPlan,
        scratch: &Buffer,
        compact: bool,
    ) -> RtResult<(Vec<AccelerationStructure>, BlasBuildReport)> {
        let scratch_alignment = self.caps.min_scratch_offset_alignment.max(1) as vk::DeviceSize;
        pass.scratch_address = align_up(scratch.address()?, scratch_alignment);

        if compact {
            pass.query_pool = Some(self.device.create_compaction_query_pool(pass.geometries.len() as u32)?);
        }

        let mut report = BlasBuildReport {
            structures: pass.geometries.len(),
            batches: plan.len(),
            scratch_size: plan.max_scratch_size,
            built_size: plan.total_structure_size,
            final_size: plan.total_structure_size,
            compacted: compact,
        };

        let mut results: Vec<AccelerationStructure> = Vec::with_capacity(pass.geometries.len());

        for batch in &plan.batches {
            let step = self.build_batch(pass, batch).and_then(|built| {
                if compact {
                    self.compact_batch(pass, batch, built)
                } else {
                    Ok(built)
                }
            });

            match step {
                Ok(built) => results.extend(built),
                Err(e) => {
                    self.destroy_all(results);
                    return Err(e);
                }
            }
        }

        report.final_size = results.iter().map(|a| a.size).sum();
        Ok((results, report))
    }

    /// Create, build and (optionally) query every structure of one batch.
    unsafe fn build_batch(&self, pass: &BuildPass<'_>, batch: &Batch) -> RtResult<Vec<AccelerationStructure>> {
        let mut built = Vec::with_capacity(batch.len());
        for idx in batch.entries.clone() {
            match AccelerationStructure::create(
                self.device,
                self.allocator,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                pass.sizes[idx].structure,
                &format!("blas_{}", self.blas.len() + idx),
            ) {
                Ok(accel) => built.push(accel),
                Err(e) => {
                    self.destroy_all(built);
                    return Err(e);
                }
            }
        }

        let recorded = (|| {
            let cmd = self.commands.begin_one_time()?;

            if let Some(pool) = pass.query_pool {
                self.device.cmd_reset_query_pool(cmd, pool, batch.entries.start as u32, batch.len() as u32);
            }

            for (accel, idx) in built.iter().zip(batch.entries.clone()) {
                let info = pass.build_info(idx)
                    .dst_acceleration_structure(accel.handle)
                    .scratch_data(vk::DeviceOrHostAddressKHR { device_address: pass.scratch_address });
                let range = [pass.geometries[idx].build_range()];

                self.device.cmd_build_acceleration_structures(cmd, &[info], &[&range[..]]);

                // The scratch buffer is reused by the next build, and the
                // compaction query must observe a finished structure.
                self.device.cmd_memory_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                );

                if let Some(pool) = pass.query_pool {
                    self.device.cmd_write_compacted_sizes(cmd, &[accel.handle], pool, idx as u32);
                }
            }

            self.commands.end_one_time(cmd)
        })();

        match recorded {
            Ok(()) => {
                log::debug!("Submitted BLAS batch {:?} ({} bytes)", batch.entries, batch.structure_size);
                Ok(built)
            }
            Err(e) => {
                self.destroy_all(built);
                Err(e)
            }
        }
    }

    /// Replace each structure of a built batch with a compacted copy.
    unsafe fn compact_batch(
        &self,
        pass: &BuildPass<'_>,
        batch: &Batch,
        built: Vec<AccelerationStructure>,
    ) -> RtResult<Vec<AccelerationStructure>> {
        let pool = match pass.query_pool {
            Some(pool) => pool,
            None => return Ok(built),
        };

        let sizes = match self.device.get_compacted_sizes(pool, batch.entries.start as u32, batch.len() as u32) {
            Ok(sizes) => sizes,
            Err(e) => {
                self.destroy_all(built);
                return Err(e);
            }
        };

        let mut compacted = Vec::with_capacity(built.len());
        for ((original, &size), idx) in built.iter().zip(&sizes).zip(batch.entries.clone()) {
            // A zero or larger result means the query carried no useful size.
            let size = if size == 0 || size > original.size { original.size } else { size };

            match AccelerationStructure::create(
                self.device,
                self.allocator,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                size,
                &format!("blas_{}_compact", self.blas.len() + idx),
            ) {
                Ok(accel) => compacted.push(accel),
                Err(e) => {
                    self.destroy_all(compacted);
                    self.destroy_all(built);
                    return Err(e);
                }
            }
        }

        let copied = (|| {
            let cmd = self.commands.begin_one_time()?;
            for (src, dst) in built.iter().zip(&compacted) {
                let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                    .src(src.handle)
                    .dst(dst.handle)
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                self.device.cmd_copy_acceleration_structure(cmd, &copy_info);
            }
            self.commands.end_one_time(cmd)
        })();

        if let Err(e) = copied {
            self.destroy_all(compacted);
            self.destroy_all(built);
            return Err(e);
        }

        let before: vk::DeviceSize = built.iter().map(|a| a.size).sum();
        let after: vk::DeviceSize = compacted.iter().map(|a| a.size).sum();
        log::debug!("Compacted BLAS batch {:?}: {} -> {} bytes", batch.entries, before, after);

        self.destroy_all(built);
        Ok(compacted)
    }

    unsafe fn destroy_all(&self, structures: Vec<AccelerationStructure>) {
        for accel in structures {
            accel.destroy(self.device, self.allocator);
        }
    }

    /// Get a BLAS by handle.
    pub fn get(&self, handle: BlasHandle) -> Option<&AccelerationStructure> {
        self.blas.get(handle.0)
    }

    /// Device address to reference from TLAS instances.
    pub fn device_address(&self, handle: BlasHandle) -> Option<vk::DeviceAddress> {
        self.get(handle).map(|b| b.device_address)
    }

    pub fn len(&self) -> usize {
        self.blas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blas.is_empty()
    }

    pub fn last_report(&self) -> Option<&BlasBuildReport> {
        self.last_report.as_ref()
    }

    /// Destroy every BLAS built so far.
    pub unsafe fn destroy(&mut self) {
        let structures = std::mem::take(&mut self.blas);
        self.destroy_all(structures);
    }
}
