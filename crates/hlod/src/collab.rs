//! Collaborators the aggregate builder drives: the geometry baker and the
//! record store.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use worldgrid_common::{ObjectId, SurfaceHandle, Transform};

use crate::record::AggregateRecord;

/// One object handed to the baker, in world space.
#[derive(Debug, Clone, PartialEq)]
pub struct BakeInput {
    pub id: ObjectId,
    pub transform: Transform,
    pub surfaces: Vec<SurfaceHandle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BakeOutput {
    pub surfaces: Vec<SurfaceHandle>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BakeError {
    #[error("no inputs to bake")]
    Empty,
    #[error("bake failed: {0}")]
    Failed(String),
}

/// Turns a list of objects into replacement surfaces.
pub trait GeometryBaker {
    fn bake(
        &mut self,
        record: &AggregateRecord,
        inputs: &[BakeInput],
    ) -> Result<BakeOutput, BakeError>;

    /// Release cached working data. Called under memory pressure.
    fn reclaim(&mut self) {}
}

/// Replaces each distinct source surface with one instanced surface holding
/// all its placements. Instanced surfaces are content-addressed, so identical
/// input always produces identical output.
#[derive(Debug, Default)]
pub struct InstancingBaker {
    cache: BTreeMap<[u8; 32], SurfaceHandle>,
    bakes: usize,
    cache_hits: usize,
}

impl InstancingBaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bakes(&self) -> usize {
        self.bakes
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn transform_bytes(t: &Transform, out: &mut Vec<u8>) {
    for v in t
        .position
        .to_array()
        .into_iter()
        .chain(t.rotation.to_array())
        .chain(t.scale.to_array())
    {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

impl GeometryBaker for InstancingBaker {
    fn bake(
        &mut self,
        record: &AggregateRecord,
        inputs: &[BakeInput],
    ) -> Result<BakeOutput, BakeError> {
        if inputs.is_empty() {
            return Err(BakeError::Empty);
        }
        self.bakes += 1;

        // surface -> serialized placements, sorted so input order is irrelevant
        let mut placements: BTreeMap<SurfaceHandle, BTreeSet<Vec<u8>>> = BTreeMap::new();
        for input in inputs {
            let mut bytes = Vec::with_capacity(56);
            bytes.extend_from_slice(input.id.as_bytes());
            transform_bytes(&input.transform, &mut bytes);
            for surface in &input.surfaces {
                placements.entry(*surface).or_default().insert(bytes.clone());
            }
        }

        let mut surfaces = Vec::with_capacity(placements.len());
        for (surface, instances) in &placements {
            let mut hasher = Sha256::new();
            hasher.update(surface.0.to_le_bytes());
            for instance in instances {
                hasher.update(instance);
            }
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&hasher.finalize());
            let handle = match self.cache.get(&digest) {
                Some(&h) => {
                    self.cache_hits += 1;
                    h
                }
                None => {
                    let mut prefix = [0u8; 8];
                    prefix.copy_from_slice(&digest[..8]);
                    let h = SurfaceHandle(u64::from_le_bytes(prefix));
                    self.cache.insert(digest, h);
                    h
                }
            };
            surfaces.push(handle);
        }
        tracing::trace!(
            aggregate = %record.name,
            inputs = inputs.len(),
            surfaces = surfaces.len(),
            "baked instanced surfaces"
        );
        Ok(BakeOutput { surfaces })
    }

    fn reclaim(&mut self) {
        tracing::debug!(cached = self.cache.len(), "dropping instancing cache");
        self.cache.clear();
    }
}

/// Transactional store of aggregate records. Writes require a checkout
/// first; every operation reports success as a flag.
pub trait AggregateStore {
    fn load_all(&mut self) -> Vec<AggregateRecord>;
    fn checkout(&mut self, record: &AggregateRecord) -> bool;
    fn save(&mut self, record: &AggregateRecord) -> bool;
    fn delete(&mut self, key: u64) -> bool;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    records: BTreeMap<u64, AggregateRecord>,
    checked_out: BTreeSet<u64>,
    saves: usize,
    deletes: usize,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> impl Iterator<Item = &AggregateRecord> {
        self.records.values()
    }

    pub fn get(&self, key: u64) -> Option<&AggregateRecord> {
        self.records.get(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn deletes(&self) -> usize {
        self.deletes
    }
}

impl AggregateStore for MemoryAggregateStore {
    fn load_all(&mut self) -> Vec<AggregateRecord> {
        self.records.values().cloned().collect()
    }

    fn checkout(&mut self, record: &AggregateRecord) -> bool {
        self.checked_out.insert(record.key);
        true
    }

    fn save(&mut self, record: &AggregateRecord) -> bool {
        if !self.checked_out.remove(&record.key) {
            return false;
        }
        self.records.insert(record.key, record.clone());
        self.saves += 1;
        true
    }

    fn delete(&mut self, key: u64) -> bool {
        self.checked_out.remove(&key);
        let removed = self.records.remove(&key).is_some();
        if removed {
            self.deletes += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn input(id: u128, x: f32, surfaces: &[u64]) -> BakeInput {
        BakeInput {
            id: ObjectId::from_u128(id),
            transform: Transform::from_position(Vec3::new(x, 0.0, 0.0)),
            surfaces: surfaces.iter().map(|&s| SurfaceHandle(s)).collect(),
        }
    }

    #[test]
    fn instancing_dedups_shared_surfaces() {
        let mut baker = InstancingBaker::new();
        let record = AggregateRecord::new(1, "HLOD0", 0, "cell");
        let out = baker
            .bake(&record, &[input(1, 0.0, &[10, 11]), input(2, 5.0, &[10])])
            .unwrap();
        assert_eq!(out.surfaces.len(), 2);
    }

    #[test]
    fn instancing_is_order_independent_and_cached() {
        let mut baker = InstancingBaker::new();
        let record = AggregateRecord::new(1, "HLOD0", 0, "cell");
        let a = baker
            .bake(&record, &[input(1, 0.0, &[10]), input(2, 5.0, &[10])])
            .unwrap();
        let b = baker
            .bake(&record, &[input(2, 5.0, &[10]), input(1, 0.0, &[10])])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(baker.cache_hits(), 1);
        baker.reclaim();
        assert_eq!(baker.cached(), 0);
        let c = baker
            .bake(&record, &[input(1, 0.0, &[10]), input(2, 5.0, &[10])])
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn empty_bake_fails() {
        let mut baker = InstancingBaker::new();
        let record = AggregateRecord::new(1, "HLOD0", 0, "cell");
        assert_eq!(baker.bake(&record, &[]), Err(BakeError::Empty));
    }

    #[test]
    fn memory_store_requires_checkout() {
        let mut store = MemoryAggregateStore::new();
        let record = AggregateRecord::new(1, "HLOD0", 0, "cell");
        assert!(!store.save(&record));
        assert!(store.checkout(&record));
        assert!(store.save(&record));
        assert_eq!(store.load_all(), vec![record.clone()]);
        assert!(store.delete(1));
        assert!(!store.delete(1));
        assert!(store.is_empty());
        assert_eq!((store.saves(), store.deletes()), (1, 1));
    }
}
