//! Reference clustering: records linked by hard references load together.

use std::collections::BTreeMap;

use worldgrid_common::hash::{self, Fnv64};
use worldgrid_common::{Aabb, ContainerId, LayerSet, LayerSetId, ObjectId};
use worldgrid_kernel::{
    ClusterMode, ContainerInstance, InstanceSet, ObjectInstanceRef, PlacedObjectRecord,
};

/// A set of records from one container instance that must load as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInstance {
    /// Stable id derived from the container and the smallest member id.
    pub id: u64,
    pub container: ContainerId,
    /// Member ids, sorted.
    pub members: Vec<ObjectId>,
    /// World-space union of member bounds.
    pub bounds: Aabb,
    /// `None` when no member names a grid or the members disagree.
    pub runtime_grid: Option<String>,
    pub grid_conflict: bool,
    /// Member layers plus the layers inherited from the container instance.
    pub layers: LayerSet,
    pub layer_id: LayerSetId,
    /// False as soon as one member is not spatially loaded.
    pub spatially_loaded: bool,
}

impl ClusterInstance {
    pub fn member_refs(&self) -> impl Iterator<Item = ObjectInstanceRef> + '_ {
        self.members
            .iter()
            .map(|&object| ObjectInstanceRef::new(self.container, object))
    }

    fn from_records(instance: &ContainerInstance, records: &[&PlacedObjectRecord]) -> Self {
        let mut members: Vec<ObjectId> = records.iter().map(|r| r.id).collect();
        members.sort();

        let mut bounds = Aabb::EMPTY;
        let mut layers = instance.layers.clone();
        let mut spatially_loaded = true;
        for r in records {
            bounds = bounds.union(&instance.world_bounds(r));
            layers.extend_from(&r.layers);
            spatially_loaded &= r.spatially_loaded;
        }
        if instance.cluster_mode == ClusterMode::Embedded {
            bounds = instance.bounds;
        }

        let first_grid = records.first().and_then(|r| r.runtime_grid.clone());
        let grid_conflict = records.iter().any(|r| r.runtime_grid != first_grid);
        let runtime_grid = if grid_conflict { None } else { first_grid };
        if grid_conflict {
            tracing::warn!(
                container = %instance.container,
                instance = %instance.id,
                members = members.len(),
                "cluster members disagree on runtime grid; using the default grid"
            );
        }

        let mut h = Fnv64::new();
        h.write_u64(instance.id.0);
        if let Some(first) = members.first() {
            h.write(first.as_bytes());
        }

        let layer_id = layers.fingerprint();
        Self {
            id: hash::splitmix64(h.finish()),
            container: instance.id,
            members,
            bounds,
            runtime_grid,
            grid_conflict,
            layers,
            layer_id,
            spatially_loaded,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub containers: usize,
    pub clusters: usize,
    pub records: usize,
    pub editor_only: usize,
    pub dropped_references: usize,
    pub grid_conflicts: usize,
}

impl ClusterStats {
    pub fn merge(&mut self, other: &ClusterStats) {
        self.containers += other.containers;
        self.clusters += other.clusters;
        self.records += other.records;
        self.editor_only += other.editor_only;
        self.dropped_references += other.dropped_references;
        self.grid_conflicts += other.grid_conflicts;
    }
}

/// Disjoint-set forest with path compression and union by rank.
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Groups the records of one container instance into clusters.
pub struct ReferenceClusterer;

impl ReferenceClusterer {
    /// Connected components of the reference graph of `instance`, ignoring
    /// editor-only records. References to missing or editor-only records are
    /// dropped. An embedded instance always yields a single cluster.
    pub fn cluster(instance: &ContainerInstance) -> (Vec<ClusterInstance>, ClusterStats) {
        let mut stats = ClusterStats {
            containers: 1,
            ..Default::default()
        };

        let records: Vec<&PlacedObjectRecord> = instance
            .records
            .values()
            .filter(|r| {
                if r.editor_only {
                    stats.editor_only += 1;
                }
                !r.editor_only
            })
            .collect();
        stats.records = records.len();
        if records.is_empty() {
            return (Vec::new(), stats);
        }

        if instance.cluster_mode == ClusterMode::Embedded {
            let cluster = ClusterInstance::from_records(instance, &records);
            stats.clusters = 1;
            stats.grid_conflicts = cluster.grid_conflict as usize;
            return (vec![cluster], stats);
        }

        let slots: BTreeMap<ObjectId, usize> =
            records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        let mut sets = DisjointSet::new(records.len());
        for (i, record) in records.iter().enumerate() {
            for target in &record.references {
                match slots.get(target) {
                    Some(&j) => sets.union(i, j),
                    None => {
                        let reason = match instance.get(*target) {
                            Some(t) if t.editor_only => "editor-only",
                            _ => "missing",
                        };
                        tracing::debug!(
                            container = %instance.container,
                            from = %record.id,
                            to = %target,
                            reason,
                            "dropping reference"
                        );
                        stats.dropped_references += 1;
                    }
                }
            }
        }

        // Components in order of their smallest member.
        let mut component_of_root: BTreeMap<usize, usize> = BTreeMap::new();
        let mut components: Vec<Vec<&PlacedObjectRecord>> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let root = sets.find(i);
            let slot = *component_of_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(*record);
        }

        let clusters: Vec<ClusterInstance> = components
            .iter()
            .map(|members| ClusterInstance::from_records(instance, members))
            .collect();
        stats.clusters = clusters.len();
        stats.grid_conflicts = clusters.iter().filter(|c| c.grid_conflict).count();
        tracing::trace!(
            container = %instance.container,
            records = stats.records,
            clusters = stats.clusters,
            "clustered container instance"
        );
        (clusters, stats)
    }
}

/// Clusters of every instance in an expanded world.
#[derive(Debug, Clone, Default)]
pub struct ClusterContext {
    clusters: Vec<ClusterInstance>,
    stats: ClusterStats,
}

impl ClusterContext {
    pub fn build(instances: &InstanceSet) -> Self {
        let _span = tracing::info_span!("cluster", instances = instances.len()).entered();
        let mut ctx = ClusterContext::default();
        for instance in instances.iter() {
            let (clusters, stats) = ReferenceClusterer::cluster(instance);
            ctx.clusters.extend(clusters);
            ctx.stats.merge(&stats);
        }
        tracing::info!(
            clusters = ctx.stats.clusters,
            records = ctx.stats.records,
            dropped_references = ctx.stats.dropped_references,
            grid_conflicts = ctx.stats.grid_conflicts,
            "clustering complete"
        );
        ctx
    }

    pub fn clusters(&self) -> &[ClusterInstance] {
        &self.clusters
    }

    pub fn stats(&self) -> ClusterStats {
        self.stats
    }
}
