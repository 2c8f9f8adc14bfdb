//! Scheduling for the fusion compiler.
//!
//! Scheduling rewrites the iteration space of each tensor in a [`Fusion`]
//! without changing what it computes. Lowering later turns those iteration
//! spaces into loop nests.
//!
//! # Module Organization
//!
//! - [`domain`] - split, merge, reorder and parallelize on leaf domains
//! - [`rfactor`] - splitting a reduction into a partial and a final stage
//! - [`cache`] - cache tensors and memory types
//! - [`root_map`] - root-domain correspondences between tensors
//! - [`replay`] - replaying transforms between producers and consumers
//! - [`compute_at`] - inlining loop nests into consumers
//! - [`propagate`] - spreading one tensor's schedule over the graph
//! - [`heuristics`] - automatic schedulers
//! - [`segmenter`] - partitioning a fusion into schedulable kernels
//!
//! Every per-tensor operation is reachable through [`ScheduleExt`], which
//! [`Fusion`] implements.
//!
//! [`Fusion`]: fuser_ir::Fusion

pub mod cache;
pub mod compute_at;
pub mod disjoint_sets;
pub mod domain;
pub mod error;
pub mod ext;
pub mod heuristics;
pub mod propagate;
pub mod replay;
pub mod rfactor;
pub mod root_map;
pub mod segmenter;

#[cfg(test)]
pub mod test;

pub use disjoint_sets::DisjointSets;
pub use domain::SplitFactor;
pub use error::{Result, ScheduleError};
pub use ext::ScheduleExt;
pub use heuristics::{
    ArgInfo, HeuristicParams, PointwiseParams, ReductionParams, ScheduleHeuristic, SchedulerRuntimeInfo,
    TransposeParams, can_schedule, propose_heuristic, schedule_fusion,
};
pub use propagate::{parallelize_all_like, propagate_transforms};
pub use replay::{ReplayMode, best_effort_map, replay_consumer_as_producer, replay_producer_as_consumer};
pub use root_map::{ComputeAtRootDomainMap, PairwiseRootDomainMap};
pub use segmenter::{SegmentIo, SegmentedEdge, SegmentedFusion, SegmentedGroup, segment};
