//! Aggregate (HLOD) builds: a layer graph processed leaf-first, one aggregate
//! per eligible cell of each layer's grid, rebuilt only when its content hash
//! changes.
//!
//! # Invariants
//! - The layer graph is validated (duplicates, unresolved parents, cycles)
//!   before any record is touched.
//! - A layer is built only after every child layer feeding it.
//! - An aggregate's content hash ignores member order; equal input gives an
//!   equal hash, and an unchanged hash never triggers a bake.
//! - After a pass the store holds exactly the aggregates of that pass's
//!   eligible cells, plus any whose bake failed with previous content.
//! - Memory reclamation never changes build output.

pub mod builder;
pub mod collab;
pub mod error;
pub mod graph;
pub mod hash;
pub mod pipeline;
pub mod reclaim;
pub mod record;
pub mod settings;

pub use builder::{AggregateBuildReport, AggregateBuilder, AggregateStats};
pub use collab::{
    AggregateStore, BakeError, BakeInput, BakeOutput, GeometryBaker, InstancingBaker,
    MemoryAggregateStore,
};
pub use error::AggregateError;
pub use graph::AggregateGraph;
pub use pipeline::{run, run_with_loader, BuildError, BuildOutput, BuildSummary};
pub use reclaim::{MemoryProbe, NoMemoryProbe, ReclaimPolicy, ReclaimReason, SystemMemoryProbe};
pub use record::AggregateRecord;
pub use settings::{
    AggregateLayerSettings, AggregateSettings, BuildSettings, ReclaimSettings, SettingsError,
};

/// Returns the aggregate crate version and name.
pub fn crate_info() -> &'static str {
    "worldgrid-hlod v0.1.0"
}
