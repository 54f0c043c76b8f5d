//! Streaming: reference clustering, multi-level square grid partitioning and
//! streaming cell generation.
//!
//! # Invariants
//! - Every non-editor-only record ends up in exactly one cluster, and every
//!   cluster lands in at least one cell (possibly the always-loaded cell).
//! - Records linked by hard references, directly or transitively, share a
//!   cluster.
//! - Cell identities depend only on world name, grid name, level, global
//!   coordinates and layer set, so an unchanged input rebuilds identical cells.
//! - Data issues degrade (drop, warn); only invalid settings are errors.

mod builder;
mod cluster;
mod generator;
mod grid;
mod report;
mod settings;

pub use builder::{CellId, StreamingCell, StreamingGrid, StreamingGridBuilder, StreamingGridLevel};
pub use cluster::{ClusterContext, ClusterInstance, ClusterStats, ReferenceClusterer};
pub use generator::{PartitionStats, SpatialHashGenerator};
pub use grid::{
    AlwaysLoadedReason, DataChunk, GridCell, GridCellCoord, GridHelper, GridLevel, Placement,
};
pub use report::dump_state;
pub use settings::{GridSettings, PartitionError, PartitionSettings};

pub fn crate_info() -> &'static str {
    "worldgrid-stream v0.1.0"
}
