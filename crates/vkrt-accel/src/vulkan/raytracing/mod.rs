//! Ray tracing support via Vulkan KHR extensions.
//!
//! This module provides capability detection, acceleration structure builds
//! (BLAS/TLAS) and shader binding table construction.

pub mod capabilities;
pub mod geometry;
pub mod acceleration;
pub mod batch;
pub mod blas;
pub mod tlas;
pub mod sbt;

pub use capabilities::{DeviceRayTracingCapabilities, RayTracingDevice, RayTracingFunctions, RayTracingFeatures};
pub use geometry::{GeometryDescriptor, MeshBuffers};
pub use acceleration::AccelerationStructure;
pub use batch::BatchPlan;
pub use blas::{BlasBuilder, BlasBuildReport, BlasHandle};
pub use tlas::{Instance, InstanceRecord, TlasBuilder};
pub use sbt::{SbtLayout, SbtRegions, ShaderBindingTable};

/// Round `value` up to a multiple of `alignment`.
///
/// `alignment` does not need to be a power of two. An alignment of 0 is
/// treated as 1.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 32), 32);
    }

    #[test]
    fn test_align_up_non_power_of_two() {
        assert_eq!(align_up(10, 3), 12);
        assert_eq!(align_up(9, 3), 9);
    }

    #[test]
    fn test_align_up_zero_alignment() {
        assert_eq!(align_up(17, 0), 17);
    }
}
