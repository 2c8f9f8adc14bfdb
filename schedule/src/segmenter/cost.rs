//! Cost model for segment merging.
//!
//! A segment costs one kernel launch plus the global-memory traffic of its
//! boundary: every tensor it reads and every tensor it writes. An
//! intermediate tensor materialized between two segments is therefore paid
//! twice, once by its writer and once by its reader. Merging two segments
//! saves a launch and whatever boundary traffic becomes internal.

use std::collections::HashMap;

use fuser_ir::{Fusion, ValId};

use super::SegmentIo;

/// Launch overhead, expressed in bytes of equivalent memory traffic.
pub const KERNEL_LAUNCH_COST: u64 = 16 * 1024;

/// Bytes assumed for a tensor whose size is not known from the inputs.
const UNKNOWN_TENSOR_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct CostModel {
    bytes: HashMap<ValId, u64>,
}

impl CostModel {
    /// Tensor sizes come from `sizes`, the concrete non-reduction extents of
    /// every tensor in `fusion`.
    pub fn new(fusion: &Fusion, sizes: &HashMap<ValId, Vec<usize>>) -> Self {
        let bytes = fusion
            .all_tensors()
            .into_iter()
            .map(|tv| {
                let bytes = match sizes.get(&tv) {
                    Some(sizes) => (fusion.dtype(tv).bytes() * sizes.iter().product::<usize>()) as u64,
                    None => UNKNOWN_TENSOR_BYTES,
                };
                (tv, bytes)
            })
            .collect();
        Self { bytes }
    }

    /// Bytes of one tensor; scalars are free.
    pub fn tensor_bytes(&self, v: ValId) -> u64 {
        self.bytes.get(&v).copied().unwrap_or(0)
    }

    pub fn segment_cost(&self, io: &SegmentIo) -> u64 {
        let traffic: u64 = io.inputs.iter().chain(&io.outputs).map(|&v| self.tensor_bytes(v)).sum();
        KERNEL_LAUNCH_COST + traffic
    }

    /// Cost saved by replacing segments `a` and `b` with `merged`.
    pub fn merge_saving(&self, a: &SegmentIo, b: &SegmentIo, merged: &SegmentIo) -> i64 {
        (self.segment_cost(a) + self.segment_cost(b)) as i64 - self.segment_cost(merged) as i64
    }
}
