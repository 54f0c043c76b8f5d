use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use worldgrid_common::hash::Fnv64;
use worldgrid_common::ObjectId;

use crate::container::Container;
use crate::record::PlacedObjectRecord;

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("main container '{0}' is not in the container library")]
    MissingMain(String),
}

fn default_main() -> String {
    "Main".to_string()
}

/// A world: its name, the name of the root container, and the library of
/// containers that placements may instance.
///
/// Uses BTreeMap so that iteration order, and everything derived from it, is
/// the same on every platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub name: String,
    #[serde(default = "default_main")]
    pub main: String,
    #[serde(default)]
    containers: BTreeMap<String, Container>,
}

impl World {
    /// Create a world whose root container is named `Main`.
    pub fn new(name: impl Into<String>) -> Self {
        let main = default_main();
        let mut containers = BTreeMap::new();
        containers.insert(main.clone(), Container::new(main.clone()));
        Self {
            name: name.into(),
            main,
            containers,
        }
    }

    /// Register a record into a container, creating the container on demand.
    pub fn register(&mut self, container: &str, record: PlacedObjectRecord) {
        self.containers
            .entry(container.to_string())
            .or_insert_with(|| Container::new(container))
            .register(record);
    }

    pub fn remove(&mut self, container: &str, id: ObjectId) -> Option<PlacedObjectRecord> {
        self.containers.get_mut(container)?.remove(id)
    }

    /// Add or replace a whole container.
    pub fn add_container(&mut self, container: Container) {
        self.containers.insert(container.name.clone(), container);
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    pub fn main_container(&self) -> Option<&Container> {
        self.containers.get(&self.main)
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Total records across every container in the library.
    pub fn object_count(&self) -> usize {
        self.containers.values().map(Container::len).sum()
    }

    /// Load a world description from JSON.
    pub fn load_json(path: &Path) -> Result<Self, WorldError> {
        let bytes = std::fs::read(path)?;
        let world: World = serde_json::from_slice(&bytes)?;
        if !world.containers.contains_key(&world.main) {
            return Err(WorldError::MissingMain(world.main));
        }
        tracing::debug!(
            world = %world.name,
            containers = world.containers.len(),
            objects = world.object_count(),
            "loaded world"
        );
        Ok(world)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), WorldError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Deterministic hash of the whole library for comparison.
    /// Uses canonical (BTreeMap) iteration order.
    pub fn state_hash(&self) -> u64 {
        let mut h = Fnv64::new();
        h.write_str(&self.name);
        h.write_str(&self.main);
        for (name, container) in &self.containers {
            h.write_str(name);
            for layer in container.layers.iter() {
                h.write_str(layer);
            }
            for record in container.records() {
                h.write_u32(record.component_hash());
                h.write(&[
                    record.spatially_loaded as u8,
                    record.editor_only as u8,
                    record.instance.is_some() as u8,
                ]);
                for r in &record.references {
                    h.write(r.as_bytes());
                }
            }
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use worldgrid_common::Aabb;

    fn record(id: u128) -> PlacedObjectRecord {
        PlacedObjectRecord::new(ObjectId::from_u128(id), Aabb::new(Vec3::ZERO, Vec3::ONE))
    }

    #[test]
    fn world_starts_with_empty_main() {
        let w = World::new("Test");
        assert_eq!(w.main, "Main");
        assert_eq!(w.object_count(), 0);
        assert!(w.main_container().is_some());
    }

    #[test]
    fn register_creates_containers_on_demand() {
        let mut w = World::new("Test");
        w.register("Main", record(1));
        w.register("House", record(2));
        assert_eq!(w.object_count(), 2);
        assert_eq!(w.container("House").map(Container::len), Some(1));
        assert!(w.remove("House", ObjectId::from_u128(2)).is_some());
        assert!(w.remove("Nowhere", ObjectId::from_u128(2)).is_none());
    }

    #[test]
    fn state_hash_deterministic() {
        let mut w1 = World::new("Test");
        let mut w2 = World::new("Test");
        for i in [3, 1, 2] {
            w1.register("Main", record(i));
        }
        for i in [1, 2, 3] {
            w2.register("Main", record(i));
        }
        assert_eq!(w1.state_hash(), w2.state_hash());
        w2.register("Main", record(4));
        assert_ne!(w1.state_hash(), w2.state_hash());
    }

    #[test]
    fn json_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        let mut w = World::new("Disk");
        w.register("Main", record(1).with_references([ObjectId::from_u128(2)]));
        w.register("Main", record(2));
        w.save_json(&path).unwrap();
        let back = World::load_json(&path).unwrap();
        assert_eq!(back, w);
        assert_eq!(back.state_hash(), w.state_hash());
    }

    #[test]
    fn load_rejects_missing_main() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        std::fs::write(&path, r#"{ "name": "Broken", "main": "Root" }"#).unwrap();
        assert!(matches!(
            World::load_json(&path),
            Err(WorldError::MissingMain(name)) if name == "Root"
        ));
    }
}
