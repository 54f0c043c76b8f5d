//! Shared value types for the world partitioner.
//!
//! # Invariants
//! - Every identity that can end up in a persisted artifact is a value
//!   derived from stable inputs, never from a pointer or a process-wide counter.
//! - Hashes used for identities and change detection come from [`hash`], whose
//!   output is stable across platforms and releases.

mod bounds;
pub mod hash;
mod layers;
mod types;

pub use bounds::Aabb;
pub use layers::{LayerSet, LayerSetId};
pub use types::{ContainerId, ObjectId, SurfaceHandle, Transform};
