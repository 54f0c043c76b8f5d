//! Aggregate keys and content hashes.

use worldgrid_common::hash::{self, Fnv64};
use worldgrid_common::{LayerSetId, ObjectId};
use worldgrid_stream::GridCellCoord;

/// 64-bit key of the aggregate for one (grid, cell, layer set).
pub fn cell_hash(grid: &str, coords: &GridCellCoord, layer_id: LayerSetId) -> u64 {
    let mut h = Fnv64::new();
    h.write_str(grid);
    h.write_u32(coords.level);
    h.write_i64(coords.x);
    h.write_i64(coords.y);
    h.write_u32(layer_id.0);
    h.finish()
}

/// Content hash of an aggregate from its members' component hashes. Input
/// order does not matter. Never 0, which marks a record that was never
/// built.
pub fn content_hash(
    settings_hash: u32,
    members: impl IntoIterator<Item = (ObjectId, u32)>,
) -> u32 {
    let mut members: Vec<(ObjectId, u32)> = members.into_iter().collect();
    members.sort_by_key(|(id, _)| *id);
    let per_member = members.iter().map(|(id, component)| {
        hash::combine32(hash::fold32(hash::fnv1a64(id.as_bytes())), *component)
    });
    match hash::combine_unordered32(settings_hash, per_member) {
        0 => 1,
        h => h,
    }
}
