//! World Kernel: placed-object records, the container library, and expansion of
//! nested container placements into a tree of container instances.
//!
//! # Invariants
//! - Records are immutable once registered; replacing one means removing it and
//!   registering a new record.
//! - Container instance identities derive from the parent identity and the
//!   instancing object, so the same container placed twice gets two identities.
//! - Instance bounds are final only after expansion completes (bottom-up).

pub mod container;
pub mod instance;
pub mod loader;
pub mod record;
pub mod world;

pub use container::Container;
pub use instance::{
    ContainerInstance, ExpansionSettings, ExpansionStats, InstanceSet, ObjectInstanceRef,
};
pub use loader::{ContainerLoader, LoadBarrier, LoadCallback, LoadError, LoadResult, WorldLoader};
pub use record::{ClusterMode, ContainerRef, PlacedObjectRecord};
pub use world::{World, WorldError};

/// Returns the kernel crate version and name.
pub fn crate_info() -> &'static str {
    "worldgrid-kernel v0.1.0"
}
