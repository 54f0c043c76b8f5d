use serde::{Deserialize, Serialize};
use worldgrid_common::{Aabb, LayerSet, ObjectId, SurfaceHandle, Transform};
use worldgrid_kernel::PlacedObjectRecord;

/// A persisted aggregate: the stand-in for one (grid, cell, layer set) of an
/// aggregate layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Cell hash; the persistent key.
    pub key: u64,
    /// Object id derived from the key, so it is stable across builds.
    pub id: ObjectId,
    pub name: String,
    pub layer: String,
    pub tier: u32,
    /// Name of the aggregate-layer cell this record stands in for.
    pub cell: String,
    /// Aggregated objects, sorted.
    pub members: Vec<ObjectId>,
    /// Content hash of the last successful build; 0 if never built.
    pub content_hash: u32,
    pub bounds: Aabb,
    pub transform: Transform,
    pub layers: LayerSet,
    pub surfaces: Vec<SurfaceHandle>,
}

impl AggregateRecord {
    pub fn id_for_key(key: u64) -> ObjectId {
        ObjectId::derive(b"aggregate", &key.to_le_bytes())
    }

    pub fn new(key: u64, layer: &str, tier: u32, cell: &str) -> Self {
        Self {
            key,
            id: Self::id_for_key(key),
            name: format!("HLOD_{layer}_{key:016x}"),
            layer: layer.to_string(),
            tier,
            cell: cell.to_string(),
            members: Vec::new(),
            content_hash: 0,
            bounds: Aabb::EMPTY,
            transform: Transform::IDENTITY,
            layers: LayerSet::new(),
            surfaces: Vec::new(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.content_hash != 0
    }

    /// This aggregate as an ordinary placed object, the input form of the
    /// next tier.
    pub fn to_placed(&self, parent_layer: Option<&str>) -> PlacedObjectRecord {
        let mut record = PlacedObjectRecord::new(self.id, self.bounds)
            .with_label(self.name.clone())
            .with_transform(self.transform)
            .with_layers(self.layers.clone())
            .with_surfaces(self.surfaces.iter().copied());
        if let Some(parent) = parent_layer {
            record = record.with_aggregate_layer(parent);
        }
        record
    }
}
