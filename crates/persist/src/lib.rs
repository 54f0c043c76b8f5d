//! Persistence: aggregate records as content-verified packages on disk.
//!
//! # Invariants
//! - Writes require a prior checkout; a save releases it.
//! - Every record file has a manifest entry holding the sha256 of its bytes.
//! - Schema mismatches fail closed on open; a corrupted record is never
//!   returned as valid.

mod store;

pub use store::{AggregatePackageStore, IntegrityManifest, StoreError, StoreMeta};

pub fn crate_info() -> &'static str {
    "worldgrid-persist v0.1.0"
}
