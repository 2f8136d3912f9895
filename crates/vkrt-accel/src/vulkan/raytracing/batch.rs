//! BLAS batch planning.
//!
//! Builds are grouped so the structure memory created by one command buffer
//! stays under a ceiling. All builds share one scratch buffer, so the scratch
//! requirement of a batch is the largest single entry, not the sum.

use ash::vk;
use std::ops::Range;

/// Size requirements of one pending build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntrySizes {
    pub structure: vk::DeviceSize,
    pub scratch: vk::DeviceSize,
}

/// A contiguous run of build entries recorded into one command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub entries: Range<usize>,
    pub structure_size: vk::DeviceSize,
    pub scratch_size: vk::DeviceSize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Batches for one `build_blas` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    pub total_structure_size: vk::DeviceSize,
    pub max_scratch_size: vk::DeviceSize,
}

impl BatchPlan {
    /// Walk entries in order and split them under `limit`.
    ///
    /// An entry that would push a non-empty batch past the limit starts a new
    /// batch. A batch that reaches the limit is closed. An entry larger than
    /// the limit on its own forms a batch by itself.
    pub fn new(sizes: &[EntrySizes], limit: vk::DeviceSize) -> Self {
        let mut plan = BatchPlan::default();
        let mut start = 0usize;
        let mut structure_size: vk::DeviceSize = 0;
        let mut scratch_size: vk::DeviceSize = 0;

        for (idx, entry) in sizes.iter().enumerate() {
            if idx > start && structure_size + entry.structure > limit {
                plan.push(start..idx, structure_size, scratch_size);
                start = idx;
                structure_size = 0;
                scratch_size = 0;
            }

            structure_size += entry.structure;
            scratch_size = scratch_size.max(entry.scratch);

            if structure_size >= limit {
                plan.push(start..idx + 1, structure_size, scratch_size);
                start = idx + 1;
                structure_size = 0;
                scratch_size = 0;
            }
        }

        if start < sizes.len() {
            plan.push(start..sizes.len(), structure_size, scratch_size);
        }

        plan
    }

    fn push(&mut self, entries: Range<usize>, structure_size: vk::DeviceSize, scratch_size: vk::DeviceSize) {
        log::debug!(
            "BLAS batch {}: entries {:?}, {} bytes, scratch {} bytes",
            self.batches.len(), entries, structure_size, scratch_size
        );
        self.total_structure_size += structure_size;
        self.max_scratch_size = self.max_scratch_size.max(scratch_size);
        self.batches.push(Batch {
            entries,
            structure_size,
            scratch_size,
        });
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
