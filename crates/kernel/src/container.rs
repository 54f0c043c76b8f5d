use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use worldgrid_common::{LayerSet, ObjectId};

use crate::record::PlacedObjectRecord;

/// A named, streamable set of placed objects. Records are keyed by id, so
/// iteration order is the same on every platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    /// Content layers active for everything in this container.
    #[serde(default)]
    pub layers: LayerSet,
    #[serde(
        default,
        serialize_with = "records_as_seq",
        deserialize_with = "records_from_seq"
    )]
    records: BTreeMap<ObjectId, PlacedObjectRecord>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_layers(mut self, layers: LayerSet) -> Self {
        self.layers = layers;
        self
    }

    /// Register a record. Returns the record it replaced, if the id was taken.
    pub fn register(&mut self, record: PlacedObjectRecord) -> Option<PlacedObjectRecord> {
        self.records.insert(record.id, record)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<PlacedObjectRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&PlacedObjectRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PlacedObjectRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn records_as_seq<S: Serializer>(
    records: &BTreeMap<ObjectId, PlacedObjectRecord>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(records.values())
}

fn records_from_seq<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<ObjectId, PlacedObjectRecord>, D::Error> {
    let list = Vec::<PlacedObjectRecord>::deserialize(deserializer)?;
    Ok(list.into_iter().map(|r| (r.id, r)).collect())
}
