//! Expansion of nested container placements into a tree of container
//! instances, breadth-first, with one load barrier per frontier.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use worldgrid_common::{Aabb, ContainerId, LayerSet, ObjectId, Transform};

use crate::container::Container;
use crate::loader::{ContainerLoader, LoadBarrier, LoadError};
use crate::record::{ClusterMode, PlacedObjectRecord};

/// Address of one placed object in the expanded world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectInstanceRef {
    pub container: ContainerId,
    pub object: ObjectId,
}

impl ObjectInstanceRef {
    pub fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// Identity of the object in world space. Objects of the main container
    /// keep their own id; nested objects get an id derived from the
    /// container instance, so two placements of one container never collide.
    pub fn world_id(&self) -> ObjectId {
        if self.container.is_main() {
            return self.object;
        }
        let mut local = [0u8; 24];
        local[..8].copy_from_slice(&self.container.0.to_le_bytes());
        local[8..].copy_from_slice(self.object.as_bytes());
        ObjectId::derive(b"instance", &local)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionSettings {
    /// Deepest nesting level that is still expanded. The main container is
    /// depth 0.
    pub max_depth: u32,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionStats {
    pub instances: usize,
    pub records: usize,
    pub failed_loads: usize,
    pub nesting_cycles: usize,
    pub depth_limited: usize,
}

/// One occurrence of a container in the expanded world.
#[derive(Debug, Clone)]
pub struct ContainerInstance {
    pub id: ContainerId,
    pub parent: Option<ContainerId>,
    /// Name of the source container in the library.
    pub container: String,
    pub instancing_object: Option<ObjectId>,
    /// Container space to world space.
    pub transform: Transform,
    pub cluster_mode: ClusterMode,
    /// Inherited layers plus the container's own.
    pub layers: LayerSet,
    /// Records owned directly by this instance. Placements of other
    /// containers are not in here; they became child instances.
    pub records: BTreeMap<ObjectId, PlacedObjectRecord>,
    pub children: Vec<ContainerId>,
    /// World-space bounds; final after expansion.
    pub bounds: Aabb,
    pub depth: u32,
    placement_bounds: Aabb,
}

impl ContainerInstance {
    fn root(container: &Container) -> Self {
        Self {
            id: ContainerId::MAIN,
            parent: None,
            container: container.name.clone(),
            instancing_object: None,
            transform: Transform::IDENTITY,
            cluster_mode: ClusterMode::Partitioned,
            layers: container.layers.clone(),
            records: owned_records(container),
            children: Vec::new(),
            bounds: Aabb::EMPTY,
            depth: 0,
            placement_bounds: Aabb::EMPTY,
        }
    }

    /// A free-standing partitioned instance at the world origin. Used for
    /// generated content that never lived in a container library.
    pub fn synthetic(
        id: ContainerId,
        name: impl Into<String>,
        records: impl IntoIterator<Item = PlacedObjectRecord>,
    ) -> Self {
        let records: BTreeMap<_, _> = records.into_iter().map(|r| (r.id, r)).collect();
        let bounds = records
            .values()
            .fold(Aabb::EMPTY, |acc, r| acc.union(&r.bounds));
        Self {
            id,
            parent: None,
            container: name.into(),
            instancing_object: None,
            transform: Transform::IDENTITY,
            cluster_mode: ClusterMode::Partitioned,
            layers: LayerSet::new(),
            records,
            children: Vec::new(),
            bounds,
            depth: 0,
            placement_bounds: Aabb::EMPTY,
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&PlacedObjectRecord> {
        self.records.get(&id)
    }

    pub fn instance_ref(&self, object: ObjectId) -> ObjectInstanceRef {
        ObjectInstanceRef::new(self.id, object)
    }

    pub fn world_bounds(&self, record: &PlacedObjectRecord) -> Aabb {
        record.bounds.transformed(&self.transform)
    }

    pub fn world_transform(&self, record: &PlacedObjectRecord) -> Transform {
        self.transform.compose(&record.transform)
    }
}

fn owned_records(container: &Container) -> BTreeMap<ObjectId, PlacedObjectRecord> {
    container
        .records()
        .filter(|r| !r.is_container_instance())
        .map(|r| (r.id, r.clone()))
        .collect()
}

/// The expanded instance tree. Instances are stored in creation order, so a
/// parent always precedes its children.
#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    instances: Vec<ContainerInstance>,
    index: BTreeMap<ContainerId, usize>,
    stats: ExpansionStats,
}

impl InstanceSet {
    /// Expand the world rooted at container `main`.
    ///
    /// A failed load of `main` is an error. A failed load of any nested
    /// container is logged and that container is left out of the pass.
    pub fn expand(
        world_name: &str,
        main: &str,
        loader: &mut dyn ContainerLoader,
        settings: &ExpansionSettings,
    ) -> Result<Self, LoadError> {
        let _span = tracing::info_span!("expand_instances", world = world_name).entered();

        let mut barrier = LoadBarrier::new();
        barrier.request(loader, main);
        let root = match barrier.wait_all()?.remove(main) {
            Some(Ok(container)) => container,
            Some(Err(e)) => {
                tracing::error!(container = main, error = %e, "main container failed to load");
                return Err(e);
            }
            None => return Err(LoadError::NotFound(main.to_string())),
        };

        let mut set = InstanceSet::default();
        let mut library: BTreeMap<String, Arc<Container>> = BTreeMap::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        set.push(ContainerInstance::root(&root));
        library.insert(main.to_string(), root);

        let mut frontier = vec![0usize];
        while !frontier.is_empty() {
            let mut placements: Vec<(usize, PlacedObjectRecord)> = Vec::new();
            for &idx in &frontier {
                let Some(source) = library.get(&set.instances[idx].container) else {
                    continue;
                };
                for record in source.records() {
                    if record.is_container_instance() && !record.editor_only {
                        placements.push((idx, record.clone()));
                    }
                }
            }

            let mut barrier = LoadBarrier::new();
            for (_, record) in &placements {
                if let Some(r) = &record.instance {
                    if !library.contains_key(&r.container) && !failed.contains(&r.container) {
                        barrier.request(loader, &r.container);
                    }
                }
            }
            if barrier.pending() > 0 {
                for (name, result) in barrier.wait_all()? {
                    match result {
                        Ok(container) => {
                            library.insert(name, container);
                        }
                        Err(e) => {
                            tracing::warn!(
                                container = %name,
                                error = %e,
                                "sub-container failed to load; skipping"
                            );
                            set.stats.failed_loads += 1;
                            failed.insert(name);
                        }
                    }
                }
            }

            let mut next = Vec::new();
            for (parent_idx, record) in placements {
                let Some(container_ref) = &record.instance else {
                    continue;
                };
                let Some(source) = library.get(&container_ref.container) else {
                    continue;
                };
                let parent = &set.instances[parent_idx];
                let depth = parent.depth + 1;
                if depth > settings.max_depth {
                    tracing::warn!(
                        container = %container_ref.container,
                        depth,
                        max_depth = settings.max_depth,
                        "nesting too deep; skipping"
                    );
                    set.stats.depth_limited += 1;
                    continue;
                }
                if set.has_ancestor_named(parent_idx, &container_ref.container) {
                    tracing::warn!(
                        container = %container_ref.container,
                        object = %record.id,
                        "container nests itself; skipping"
                    );
                    set.stats.nesting_cycles += 1;
                    continue;
                }

                let mut layers = parent.layers.union(&source.layers);
                layers.extend_from(&record.layers);
                let instance = ContainerInstance {
                    id: parent.id.child(record.id),
                    parent: Some(parent.id),
                    container: source.name.clone(),
                    instancing_object: Some(record.id),
                    transform: parent.transform.compose(&record.transform),
                    cluster_mode: container_ref.cluster_mode,
                    layers,
                    records: owned_records(source),
                    children: Vec::new(),
                    bounds: Aabb::EMPTY,
                    depth,
                    placement_bounds: record.bounds.transformed(&parent.transform),
                };
                tracing::trace!(
                    id = %instance.id,
                    container = %instance.container,
                    depth,
                    "instanced container"
                );
                let id = instance.id;
                if set.index.contains_key(&id) {
                    tracing::warn!(id = %id, "duplicate container instance id; skipping");
                    continue;
                }
                set.instances[parent_idx].children.push(id);
                next.push(set.push(instance));
            }
            frontier = next;
        }

        set.finalize_bounds();
        set.stats.instances = set.instances.len();
        set.stats.records = set.instances.iter().map(|i| i.records.len()).sum();
        tracing::info!(
            instances = set.stats.instances,
            records = set.stats.records,
            failed_loads = set.stats.failed_loads,
            "expanded container instances"
        );
        Ok(set)
    }

    /// Wrap one free-standing instance.
    pub fn single(instance: ContainerInstance) -> Self {
        let mut set = InstanceSet::default();
        set.stats.records = instance.records.len();
        set.push(instance);
        set.stats.instances = 1;
        set
    }

    fn push(&mut self, instance: ContainerInstance) -> usize {
        let idx = self.instances.len();
        self.index.insert(instance.id, idx);
        self.instances.push(instance);
        idx
    }

    fn has_ancestor_named(&self, mut idx: usize, name: &str) -> bool {
        loop {
            let instance = &self.instances[idx];
            if instance.container == name {
                return true;
            }
            match instance.parent.and_then(|p| self.index.get(&p)) {
                Some(&p) => idx = p,
                None => return false,
            }
        }
    }

    /// Children are created after their parents, so walking in reverse
    /// creation order sees every child before its parent.
    fn finalize_bounds(&mut self) {
        for idx in (0..self.instances.len()).rev() {
            let instance = &self.instances[idx];
            let bounds = match instance.cluster_mode {
                ClusterMode::Embedded => instance.placement_bounds,
                ClusterMode::Partitioned => {
                    let mut b = instance
                        .records
                        .values()
                        .filter(|r| !r.editor_only)
                        .fold(Aabb::EMPTY, |acc, r| acc.union(&instance.world_bounds(r)));
                    for child in &instance.children {
                        if let Some(&c) = self.index.get(child) {
                            b = b.union(&self.instances[c].bounds);
                        }
                    }
                    b
                }
            };
            self.instances[idx].bounds = bounds;
        }
    }

    pub fn main(&self) -> Option<&ContainerInstance> {
        self.instances.first()
    }

    pub fn get(&self, id: ContainerId) -> Option<&ContainerInstance> {
        self.index.get(&id).map(|&i| &self.instances[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerInstance> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Bounds of the whole expanded world.
    pub fn world_bounds(&self) -> Aabb {
        self.main().map(|m| m.bounds).unwrap_or(Aabb::EMPTY)
    }

    pub fn resolve(
        &self,
        r: &ObjectInstanceRef,
    ) -> Option<(&ContainerInstance, &PlacedObjectRecord)> {
        let instance = self.get(r.container)?;
        let record = instance.get(r.object)?;
        Some((instance, record))
    }

    pub fn stats(&self) -> ExpansionStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::WorldLoader;
    use crate::world::World;
    use glam::Vec3;

    fn cube(id: u128, at: Vec3, half: f32) -> PlacedObjectRecord {
        PlacedObjectRecord::new(
            ObjectId::from_u128(id),
            Aabb::from_center_extent(at, Vec3::splat(half)),
        )
    }

    fn placement(id: u128, at: Vec3, container: &str, mode: ClusterMode) -> PlacedObjectRecord {
        cube(id, at, 10.0)
            .with_transform(Transform::from_position(at))
            .instancing(container, mode)
    }

    fn expand(world: &World) -> InstanceSet {
        let mut loader = WorldLoader::new(world);
        InstanceSet::expand(&world.name, &world.main, &mut loader, &ExpansionSettings::default())
            .unwrap()
    }

    #[test]
    fn flat_world_has_one_instance() {
        let mut w = World::new("Flat");
        w.register("Main", cube(1, Vec3::ZERO, 1.0));
        w.register("Main", cube(2, Vec3::new(100.0, 0.0, 0.0), 1.0));
        let set = expand(&w);
        assert_eq!(set.len(), 1);
        let bounds = set.world_bounds();
        assert_eq!(bounds.min, Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(bounds.max, Vec3::new(101.0, 1.0, 1.0));
    }

    #[test]
    fn same_container_placed_twice_gets_distinct_ids() {
        let mut w = World::new("Town");
        w.register("House", cube(10, Vec3::ZERO, 1.0));
        for (id, x) in [(1, 1000.0), (2, -1000.0)] {
            let at = Vec3::new(x, 0.0, 0.0);
            w.register("Main", placement(id, at, "House", ClusterMode::Partitioned));
        }
        let set = expand(&w);
        assert_eq!(set.len(), 3);
        let ids: BTreeSet<_> = set.iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 3);
        let main = set.main().unwrap();
        assert!(main.records.is_empty());
        assert_eq!(main.children.len(), 2);
        // partitioned bounds come from the transformed contents
        assert_eq!(set.world_bounds().min.x, -1001.0);
        assert_eq!(set.world_bounds().max.x, 1001.0);
    }

    #[test]
    fn embedded_bounds_come_from_placement() {
        let mut w = World::new("Town");
        w.register("Shed", cube(10, Vec3::ZERO, 1.0));
        w.register("Main", placement(1, Vec3::new(50.0, 0.0, 0.0), "Shed", ClusterMode::Embedded));
        let set = expand(&w);
        let shed = set.iter().find(|i| i.container == "Shed").unwrap();
        assert_eq!(shed.bounds.min.x, 40.0);
        assert_eq!(shed.bounds.max.x, 60.0);
    }

    #[test]
    fn nesting_cycles_are_skipped() {
        let mut w = World::new("Loop");
        w.register("Main", placement(1, Vec3::ZERO, "A", ClusterMode::Partitioned));
        w.register("A", placement(2, Vec3::ZERO, "B", ClusterMode::Partitioned));
        w.register("B", placement(3, Vec3::ZERO, "A", ClusterMode::Partitioned));
        let set = expand(&w);
        assert_eq!(set.len(), 3);
        assert_eq!(set.stats().nesting_cycles, 1);
    }

    #[test]
    fn missing_sub_container_is_not_fatal() {
        let mut w = World::new("Gap");
        w.register("Main", cube(1, Vec3::ZERO, 1.0));
        w.register("Main", placement(2, Vec3::ZERO, "Nowhere", ClusterMode::Partitioned));
        let set = expand(&w);
        assert_eq!(set.len(), 1);
        assert_eq!(set.stats().failed_loads, 1);
        assert_eq!(set.stats().records, 1);
    }

    #[test]
    fn missing_main_is_fatal() {
        let w = World::new("Empty");
        let mut loader = WorldLoader::new(&w);
        let err = InstanceSet::expand("Empty", "Root", &mut loader, &ExpansionSettings::default());
        assert!(matches!(err, Err(LoadError::NotFound(_))));
    }

    #[test]
    fn depth_limit_bounds_expansion() {
        let mut w = World::new("Deep");
        w.register("Main", placement(1, Vec3::ZERO, "L1", ClusterMode::Partitioned));
        w.register("L1", placement(2, Vec3::ZERO, "L2", ClusterMode::Partitioned));
        w.register("L2", placement(3, Vec3::ZERO, "L3", ClusterMode::Partitioned));
        let mut loader = WorldLoader::new(&w);
        let settings = ExpansionSettings { max_depth: 2 };
        let set = InstanceSet::expand("Deep", "Main", &mut loader, &settings).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.stats().depth_limited, 1);
    }

    #[test]
    fn layers_are_inherited() {
        let mut w = World::new("Layers");
        w.add_container(Container::new("Main").with_layers(LayerSet::from_names(["base"])));
        w.add_container(Container::new("Sub").with_layers(LayerSet::from_names(["night"])));
        w.register("Sub", cube(10, Vec3::ZERO, 1.0));
        w.register("Main", placement(1, Vec3::ZERO, "Sub", ClusterMode::Partitioned));
        let set = expand(&w);
        let sub = set.iter().find(|i| i.container == "Sub").unwrap();
        assert!(sub.layers.contains("base"));
        assert!(sub.layers.contains("night"));
    }

    #[test]
    fn world_ids_of_nested_objects_are_distinct() {
        let obj = ObjectId::from_u128(10);
        let a = ObjectInstanceRef::new(ContainerId::MAIN.child(ObjectId::from_u128(1)), obj);
        let b = ObjectInstanceRef::new(ContainerId::MAIN.child(ObjectId::from_u128(2)), obj);
        assert_ne!(a.world_id(), b.world_id());
        assert_eq!(ObjectInstanceRef::new(ContainerId::MAIN, obj).world_id(), obj);
    }
}
