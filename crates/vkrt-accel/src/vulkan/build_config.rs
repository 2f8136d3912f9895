//! Acceleration structure build configuration.
//!
//! Holds the batching ceiling and build flags used by the BLAS and TLAS
//! builders, validated against device capabilities.

use ash::vk;

use super::raytracing::DeviceRayTracingCapabilities;

/// Default ceiling for the summed structure size of one BLAS batch (256 MiB).
pub const DEFAULT_BLAS_BATCH_LIMIT: vk::DeviceSize = 256 * 1024 * 1024;

/// Instance counts at or above this convert transforms in parallel.
pub const DEFAULT_PARALLEL_INSTANCE_THRESHOLD: usize = 1024;

/// Build settings shared by the acceleration structure builders.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// Maximum summed structure size of one BLAS batch.
    pub blas_batch_limit: vk::DeviceSize,
    /// Flags applied to every BLAS build (compaction is controlled separately).
    pub blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Whether new geometry descriptors request compaction.
    pub allow_compaction: bool,
    /// Flags applied to the TLAS build.
    pub tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Build the TLAS so it can later be rebuilt in update mode.
    pub allow_tlas_update: bool,
    /// Instance count from which transforms are converted with rayon.
    pub parallel_instance_threshold: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            blas_batch_limit: DEFAULT_BLAS_BATCH_LIMIT,
            blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            allow_compaction: false,
            tlas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            allow_tlas_update: true,
            parallel_instance_threshold: DEFAULT_PARALLEL_INSTANCE_THRESHOLD,
        }
    }
}

impl BuildConfig {
    /// Return a copy adjusted to what the device and Vulkan allow.
    pub fn validated(mut self, caps: &DeviceRayTracingCapabilities) -> Self {
        use vk::BuildAccelerationStructureFlagsKHR as F;

        if self.blas_batch_limit == 0 {
            log::warn!("BLAS batch limit of 0 bytes, using {}", DEFAULT_BLAS_BATCH_LIMIT);
            self.blas_batch_limit = DEFAULT_BLAS_BATCH_LIMIT;
        }

        // PREFER_FAST_TRACE and PREFER_FAST_BUILD are mutually exclusive.
        for (name, flags) in [("BLAS", &mut self.blas_flags), ("TLAS", &mut self.tlas_flags)] {
            if flags.contains(F::PREFER_FAST_TRACE | F::PREFER_FAST_BUILD) {
                log::warn!("{} flags request both fast trace and fast build, keeping fast trace", name);
                *flags &= !F::PREFER_FAST_BUILD;
            }
        }

        // Compaction is requested per geometry, never through the shared flags.
        if self.blas_flags.contains(F::ALLOW_COMPACTION) {
            self.blas_flags &= !F::ALLOW_COMPACTION;
            self.allow_compaction = true;
        }

        if self.allow_tlas_update {
            self.tlas_flags |= F::ALLOW_UPDATE;
        } else if self.tlas_flags.contains(F::ALLOW_UPDATE) {
            self.allow_tlas_update = true;
        }

        if self.parallel_instance_threshold == 0 {
            self.parallel_instance_threshold = 1;
        }

        if caps.max_instance_count > 0 && self.parallel_instance_threshold as u64 > caps.max_instance_count {
            log::debug!(
                "Parallel instance threshold {} exceeds device instance limit {}",
                self.parallel_instance_threshold, caps.max_instance_count
            );
        }

        self
    }

    /// Flags for one BLAS build, with or without compaction.
    pub fn blas_build_flags(&self, compact: bool) -> vk::BuildAccelerationStructureFlagsKHR {
        if compact {
            self.blas_flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
        } else {
            self.blas_flags
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::BuildAccelerationStructureFlagsKHR as F;

    // ============================================================
    // BuildConfig::default
    // ============================================================

    #[test]
    fn test_build_config_default() {
        let config = BuildConfig::default();
        assert_eq!(config.blas_batch_limit, 256 * 1024 * 1024);
        assert_eq!(config.blas_flags, F::PREFER_FAST_TRACE);
        assert!(!config.allow_compaction);
        assert!(config.allow_tlas_update);
        assert_eq!(config.parallel_instance_threshold, 1024);
    }

    // ============================================================
    // validated
    // ============================================================

    #[test]
    fn test_validated_adds_allow_update() {
        let config = BuildConfig::default().validated(&DeviceRayTracingCapabilities::default());
        assert!(config.tlas_flags.contains(F::ALLOW_UPDATE));
    }

    #[test]
    fn test_validated_without_update() {
        let config = BuildConfig {
            allow_tlas_update: false,
            ..BuildConfig::default()
        }
        .validated(&DeviceRayTracingCapabilities::default());
        assert!(!config.tlas_flags.contains(F::ALLOW_UPDATE));
        assert!(!config.allow_tlas_update);
    }

    #[test]
    fn test_validated_zero_batch_limit_restored() {
        let config = BuildConfig {
            blas_batch_limit: 0,
            ..BuildConfig::default()
        }
        .validated(&DeviceRayTracingCapabilities::default());
        assert_eq!(config.blas_batch_limit, DEFAULT_BLAS_BATCH_LIMIT);
    }

    #[test]
    fn test_validated_conflicting_preferences() {
        let config = BuildConfig {
            blas_flags: F::PREFER_FAST_TRACE | F::PREFER_FAST_BUILD,
            ..BuildConfig::default()
        }
        .validated(&DeviceRayTracingCapabilities::default());
        assert_eq!(config.blas_flags, F::PREFER_FAST_TRACE);
    }

    #[test]
    fn test_validated_moves_compaction_out_of_flags() {
        let config = BuildConfig {
            blas_flags: F::PREFER_FAST_TRACE | F::ALLOW_COMPACTION,
            ..BuildConfig::default()
        }
        .validated(&DeviceRayTracingCapabilities::default());
        assert!(config.allow_compaction);
        assert!(!config.blas_flags.contains(F::ALLOW_COMPACTION));
    }

    // ============================================================
    // blas_build_flags
    // ============================================================

    #[test]
    fn test_blas_build_flags_compaction() {
        let config = BuildConfig::default();
        assert!(config.blas_build_flags(true).contains(F::ALLOW_COMPACTION));
        assert!(!config.blas_build_flags(false).contains(F::ALLOW_COMPACTION));
        assert!(config.blas_build_flags(true).contains(F::PREFER_FAST_TRACE));
    }
}
