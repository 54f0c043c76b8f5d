//! Incremental aggregate build: tiers leaf-first, one record per eligible
//! cell, rebuild only when the content hash changes, orphan sweep at the end.

use std::collections::{BTreeMap, BTreeSet};

use worldgrid_common::{Aabb, ContainerId, ObjectId, Transform};
use worldgrid_kernel::{ContainerInstance, InstanceSet, PlacedObjectRecord};
use worldgrid_stream::{
    ClusterInstance, PartitionSettings, ReferenceClusterer, SpatialHashGenerator, StreamingCell,
    StreamingGrid,
};

use crate::collab::{AggregateStore, BakeInput, GeometryBaker};
use crate::error::AggregateError;
use crate::graph::AggregateGraph;
use crate::hash::{cell_hash, content_hash};
use crate::reclaim::{MemoryProbe, ReclaimPolicy};
use crate::record::AggregateRecord;
use crate::settings::{AggregateLayerSettings, AggregateSettings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub layers: usize,
    pub inputs: usize,
    /// Eligible cells, one aggregate each.
    pub cells: usize,
    pub rebuilt: usize,
    pub reused: usize,
    pub failed: usize,
    pub deleted: usize,
    pub opted_out: usize,
    pub missing_members: usize,
    pub reclaims: usize,
    pub store_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateBuildReport {
    /// Every live aggregate after the pass, sorted by key.
    pub records: Vec<AggregateRecord>,
    pub stats: AggregateStats,
}

/// Drives the aggregate pass against the baker and store collaborators.
pub struct AggregateBuilder<'a> {
    settings: &'a AggregateSettings,
    partition: &'a PartitionSettings,
    graph: AggregateGraph,
    baker: &'a mut dyn GeometryBaker,
    store: &'a mut dyn AggregateStore,
    probe: &'a mut dyn MemoryProbe,
    reclaim: ReclaimPolicy,
}

struct LayerPass<'l> {
    layer: &'l AggregateLayerSettings,
    tier: u32,
    settings_hash: u32,
    container: ContainerInstance,
}

impl<'a> AggregateBuilder<'a> {
    /// Validates the layer graph and every layer grid before any work.
    pub fn new(
        settings: &'a AggregateSettings,
        partition: &'a PartitionSettings,
        baker: &'a mut dyn GeometryBaker,
        store: &'a mut dyn AggregateStore,
        probe: &'a mut dyn MemoryProbe,
        reclaim: ReclaimPolicy,
    ) -> Result<Self, AggregateError> {
        let graph = settings.validate(partition)?;
        Ok(Self {
            settings,
            partition,
            graph,
            baker,
            store,
            probe,
            reclaim,
        })
    }

    pub fn graph(&self) -> &AggregateGraph {
        &self.graph
    }

    pub fn build(
        &mut self,
        world_name: &str,
        instances: &InstanceSet,
        grids: &mut [StreamingGrid],
    ) -> Result<AggregateBuildReport, AggregateError> {
        let _span = tracing::info_span!("aggregate_build", world = world_name).entered();
        let mut stats = AggregateStats {
            layers: self.graph.len(),
            ..Default::default()
        };

        let previous: BTreeMap<u64, AggregateRecord> = self
            .store
            .load_all()
            .into_iter()
            .map(|r| (r.key, r))
            .collect();
        let mut visited: BTreeSet<u64> = BTreeSet::new();
        let mut outputs: BTreeMap<String, Vec<AggregateRecord>> = BTreeMap::new();
        let mut contributes: BTreeMap<ObjectId, BTreeSet<ObjectId>> = BTreeMap::new();
        let mut direct_inputs = self.collect_inputs(instances);

        let tiers: Vec<Vec<AggregateLayerSettings>> = self
            .graph
            .tiers()
            .into_iter()
            .map(|t| t.into_iter().cloned().collect())
            .collect();

        for (tier, layers) in tiers.iter().enumerate() {
            for layer in layers {
                let mut inputs = direct_inputs.remove(&layer.name).unwrap_or_default();
                for child in self.graph.children(&layer.name) {
                    if let Some(records) = outputs.get(child) {
                        let parent = Some(layer.name.as_str());
                        inputs.extend(records.iter().map(|r| r.to_placed(parent)));
                    }
                }
                stats.inputs += inputs.len();
                if inputs.is_empty() {
                    tracing::debug!(layer = %layer.name, "no inputs for aggregate layer");
                    outputs.insert(layer.name.clone(), Vec::new());
                    continue;
                }

                let pass = LayerPass {
                    layer,
                    tier: tier as u32,
                    settings_hash: layer.settings_hash(),
                    container: ContainerInstance::synthetic(
                        ContainerId::named(&layer.name),
                        layer.name.clone(),
                        inputs,
                    ),
                };
                let records = self.build_layer(
                    world_name,
                    instances.world_bounds(),
                    &pass,
                    &previous,
                    &mut visited,
                    &mut stats,
                )?;
                for record in &records {
                    for member in &record.members {
                        contributes.entry(*member).or_default().insert(record.id);
                    }
                }
                outputs.insert(layer.name.clone(), records);
            }
        }

        for key in previous.keys().filter(|k| !visited.contains(k)) {
            if self.store.delete(*key) {
                tracing::debug!(key = format_args!("{key:016x}"), "deleted orphaned aggregate");
                stats.deleted += 1;
            } else {
                tracing::warn!(
                    key = format_args!("{key:016x}"),
                    "failed to delete orphaned aggregate"
                );
                stats.store_failures += 1;
            }
        }

        for grid in grids.iter_mut() {
            for cell in grid.cells_mut() {
                assign_back_pointers(cell, &contributes);
            }
        }

        let mut records: Vec<AggregateRecord> = outputs.into_values().flatten().collect();
        records.sort_by_key(|r| r.key);
        tracing::info!(
            layers = stats.layers,
            cells = stats.cells,
            rebuilt = stats.rebuilt,
            reused = stats.reused,
            failed = stats.failed,
            deleted = stats.deleted,
            "aggregate pass complete"
        );
        Ok(AggregateBuildReport { records, stats })
    }

    /// World-space inputs per layer from the expanded world. Nested objects
    /// get instance-derived ids.
    fn collect_inputs(&self, instances: &InstanceSet) -> BTreeMap<String, Vec<PlacedObjectRecord>> {
        let mut inputs: BTreeMap<String, Vec<PlacedObjectRecord>> = BTreeMap::new();
        for instance in instances.iter() {
            for record in instance.records.values() {
                if record.editor_only || !record.spatially_loaded {
                    continue;
                }
                let Some(layer) = &record.aggregate_layer else {
                    continue;
                };
                if !self.graph.contains(layer) {
                    tracing::warn!(object = %record.id, layer = %layer, "unknown aggregate layer");
                    continue;
                }
                let references = record
                    .references
                    .iter()
                    .map(|r| instance.instance_ref(*r).world_id());
                let mut placed = PlacedObjectRecord::new(
                    instance.instance_ref(record.id).world_id(),
                    instance.world_bounds(record),
                )
                .with_label(record.label.clone())
                .with_transform(instance.world_transform(record))
                .with_references(references)
                .with_layers(instance.layers.union(&record.layers))
                .with_surfaces(record.surfaces.iter().copied());
                placed.aggregate_layer = Some(layer.clone());
                inputs.entry(layer.clone()).or_default().push(placed);
            }
        }
        inputs
    }

    fn build_layer(
        &mut self,
        world_name: &str,
        world_bounds: Aabb,
        pass: &LayerPass<'_>,
        previous: &BTreeMap<u64, AggregateRecord>,
        visited: &mut BTreeSet<u64>,
        stats: &mut AggregateStats,
    ) -> Result<Vec<AggregateRecord>, AggregateError> {
        let layer = pass.layer;
        let _span =
            tracing::info_span!("aggregate_layer", layer = %layer.name, tier = pass.tier).entered();

        let (clusters, _) = ReferenceClusterer::cluster(&pass.container);
        let refs: Vec<&ClusterInstance> = clusters.iter().collect();
        let partition = layer.partition_settings(self.partition);
        partition.validate()?;
        let grid_settings = layer.grid_settings();
        let bounds = world_bounds.union(&pass.container.bounds);
        let (grid, _) = SpatialHashGenerator::partition_grid(
            world_name,
            &grid_settings,
            &partition,
            bounds,
            &refs,
        );

        let mut records = Vec::new();
        for cell in grid.cells() {
            if cell.top_level {
                tracing::trace!(cell = %cell.name, "always-loaded cell gets no aggregate");
                continue;
            }
            if self.settings.opts_out(&cell.layers) {
                tracing::debug!(
                    cell = %cell.name,
                    layers = %cell.layers,
                    "cell opts out of aggregates"
                );
                stats.opted_out += 1;
                continue;
            }
            let key = cell_hash(&layer.name, &cell.coords, cell.layer_id);
            if !visited.insert(key) {
                tracing::warn!(
                    cell = %cell.name,
                    key = format_args!("{key:016x}"),
                    "aggregate key collision; skipping"
                );
                continue;
            }
            stats.cells += 1;
            if let Some(record) = self.build_cell(pass, cell, key, previous.get(&key), stats) {
                records.push(record);
            }
            if let Some(reason) = self.reclaim.poll(&mut *self.probe) {
                tracing::debug!(?reason, "reclaiming bake working data");
                self.baker.reclaim();
                stats.reclaims += 1;
            }
        }
        Ok(records)
    }

    /// Reuse, rebuild or keep the aggregate of one cell. Returns the record
    /// that stands for the cell after this pass, if any.
    fn build_cell(
        &mut self,
        pass: &LayerPass<'_>,
        cell: &StreamingCell,
        key: u64,
        previous: Option<&AggregateRecord>,
        stats: &mut AggregateStats,
    ) -> Option<AggregateRecord> {
        let mut members: Vec<&PlacedObjectRecord> = Vec::with_capacity(cell.members.len());
        for r in &cell.members {
            match pass.container.get(r.object) {
                Some(record) => members.push(record),
                None => {
                    tracing::warn!(
                        cell = %cell.name,
                        object = %r.object,
                        "aggregate member missing; skipping"
                    );
                    stats.missing_members += 1;
                }
            }
        }
        let hash = content_hash(
            pass.settings_hash,
            members.iter().map(|m| (m.id, m.component_hash())),
        );

        let mut record = previous
            .cloned()
            .unwrap_or_else(|| AggregateRecord::new(key, &pass.layer.name, pass.tier, &cell.name));
        if previous.is_some_and(|p| p.content_hash == hash) {
            tracing::trace!(aggregate = %record.name, "content unchanged; reusing");
            stats.reused += 1;
            if record.tier != pass.tier || record.cell != cell.name {
                // the layer moved in the graph or the cell was renamed
                record.tier = pass.tier;
                record.cell = cell.name.clone();
                if !(self.store.checkout(&record) && self.store.save(&record)) {
                    tracing::warn!(aggregate = %record.name, "failed to persist reused aggregate");
                    stats.store_failures += 1;
                }
            }
            return Some(record);
        }

        let mut ids: Vec<ObjectId> = members.iter().map(|m| m.id).collect();
        ids.sort();
        record.tier = pass.tier;
        record.cell = cell.name.clone();
        record.members = ids;
        record.layers = cell.layers.clone();
        record.bounds = members.iter().fold(Aabb::EMPTY, |acc, m| acc.union(&m.bounds));
        record.transform = Transform::from_position(record.bounds.center());

        let inputs: Vec<BakeInput> = members
            .iter()
            .map(|m| BakeInput {
                id: m.id,
                transform: m.transform,
                surfaces: m.surfaces.clone(),
            })
            .collect();
        match self.baker.bake(&record, &inputs) {
            Ok(output) => {
                record.surfaces = output.surfaces;
                record.content_hash = hash;
                if self.store.checkout(&record) && self.store.save(&record) {
                    tracing::debug!(
                        aggregate = %record.name,
                        members = record.members.len(),
                        "rebuilt aggregate"
                    );
                } else {
                    tracing::warn!(aggregate = %record.name, "failed to persist rebuilt aggregate");
                    stats.store_failures += 1;
                }
                stats.rebuilt += 1;
                Some(record)
            }
            Err(e) => {
                tracing::warn!(
                    aggregate = %record.name,
                    error = %e,
                    "bake failed; keeping previous content"
                );
                stats.failed += 1;
                previous.cloned()
            }
        }
    }
}


/// Every aggregate a cell's content feeds, following aggregates into the
/// aggregates built from them.
fn assign_back_pointers(
    cell: &mut StreamingCell,
    contributes: &BTreeMap<ObjectId, BTreeSet<ObjectId>>,
) {
    let mut found: BTreeSet<ObjectId> = BTreeSet::new();
    let mut pending: Vec<ObjectId> = cell.members.iter().map(|m| m.world_id()).collect();
    while let Some(id) = pending.pop() {
        if let Some(targets) = contributes.get(&id) {
            for target in targets {
                if found.insert(*target) {
                    pending.push(*target);
                }
            }
        }
    }
    cell.aggregate_ids = found.into_iter().collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{BakeError, BakeOutput, InstancingBaker, MemoryAggregateStore};
    use crate::reclaim::NoMemoryProbe;
    use glam::Vec3;
    use worldgrid_common::SurfaceHandle;
    use worldgrid_kernel::{ExpansionSettings, World, WorldLoader};
    use worldgrid_stream::{ClusterContext, GridSettings};

    struct FailingBaker;

    impl GeometryBaker for FailingBaker {
        fn bake(&mut self, _: &AggregateRecord, _: &[BakeInput]) -> Result<BakeOutput, BakeError> {
            Err(BakeError::Failed("out of texture space".to_string()))
        }
    }

    fn world() -> World {
        let mut w = World::new("Agg");
        for i in 0..4u128 {
            let p = Vec3::new(50.0 + i as f32 * 300.0, 50.0, 0.0);
            w.register(
                "Main",
                PlacedObjectRecord::new(
                    ObjectId::from_u128(i + 1),
                    Aabb::from_center_extent(p, Vec3::splat(10.0)),
                )
                .with_transform(Transform::from_position(p))
                .with_surfaces([SurfaceHandle(100)])
                .with_aggregate_layer("HLOD0"),
            );
        }
        w
    }

    fn partition() -> PartitionSettings {
        PartitionSettings {
            grids: vec![GridSettings::named("MainGrid", 100)],
            ..Default::default()
        }
    }

    fn aggregates() -> AggregateSettings {
        AggregateSettings {
            layers: vec![
                crate::settings::AggregateLayerSettings::named("HLOD0", 400).with_parent("HLOD1"),
                crate::settings::AggregateLayerSettings::named("HLOD1", 1600),
            ],
            ..Default::default()
        }
    }

    fn prepare(w: &World, partition: &PartitionSettings) -> (InstanceSet, Vec<StreamingGrid>) {
        let mut loader = WorldLoader::new(w);
        let instances =
            InstanceSet::expand(&w.name, &w.main, &mut loader, &ExpansionSettings::default())
                .unwrap();
        let clusters = ClusterContext::build(&instances);
        let grids =
            SpatialHashGenerator::generate(&w.name, partition, &instances, &clusters).unwrap();
        (instances, grids)
    }

    #[test]
    fn builds_tiers_and_back_pointers() {
        let w = world();
        let partition = partition();
        let settings = aggregates();
        let (instances, mut grids) = prepare(&w, &partition);
        let mut baker = InstancingBaker::new();
        let mut store = MemoryAggregateStore::new();
        let mut probe = NoMemoryProbe;
        let mut builder = AggregateBuilder::new(
            &settings,
            &partition,
            &mut baker,
            &mut store,
            &mut probe,
            ReclaimPolicy::disabled(),
        )
        .unwrap();
        let report = builder.build(&w.name, &instances, &mut grids).unwrap();
        assert!(report.stats.rebuilt > 0);
        assert!(report.records.iter().any(|r| r.layer == "HLOD0"));
        assert!(report.records.iter().any(|r| r.layer == "HLOD1" && r.tier == 1));
        for cell in grids.iter().flat_map(|g| g.cells()) {
            // every base cell feeds an HLOD0 aggregate and, through it, HLOD1
            assert_eq!(cell.aggregate_ids.len(), 2);
        }
        assert_eq!(store.len(), report.records.len());
    }

    #[test]
    fn bake_failure_keeps_previous_content() {
        let w = world();
        let partition = partition();
        let settings = aggregates();
        let (instances, mut grids) = prepare(&w, &partition);
        let mut baker = FailingBaker;
        let mut store = MemoryAggregateStore::new();
        let mut probe = NoMemoryProbe;
        let report = AggregateBuilder::new(
            &settings,
            &partition,
            &mut baker,
            &mut store,
            &mut probe,
            ReclaimPolicy::disabled(),
        )
        .unwrap()
        .build(&w.name, &instances, &mut grids)
        .unwrap();
        assert!(report.stats.failed > 0);
        assert_eq!(report.stats.rebuilt, 0);
        assert!(report.records.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn reclaim_does_not_change_output() {
        let w = world();
        let partition = partition();
        let settings = aggregates();
        let run = |policy: ReclaimPolicy| {
            let (instances, mut grids) = prepare(&w, &partition);
            let mut baker = InstancingBaker::new();
            let mut store = MemoryAggregateStore::new();
            let mut probe = NoMemoryProbe;
            let report = AggregateBuilder::new(
                &settings,
                &partition,
                &mut baker,
                &mut store,
                &mut probe,
                policy,
            )
            .unwrap()
            .build(&w.name, &instances, &mut grids)
            .unwrap();
            (report.records, report.stats.reclaims, grids)
        };
        let (a, reclaims_a, grids_a) = run(ReclaimPolicy::disabled());
        let (b, reclaims_b, grids_b) = run(ReclaimPolicy::new(std::time::Duration::ZERO, 0));
        assert_eq!(reclaims_a, 0);
        assert!(reclaims_b > 0);
        assert_eq!(a, b);
        assert_eq!(grids_a, grids_b);
    }

    #[test]
    fn excluded_layers_opt_out() {
        let mut w = world();
        w.register(
            "Main",
            PlacedObjectRecord::new(
                ObjectId::from_u128(50),
                Aabb::from_center_extent(Vec3::new(0.0, 0.0, 0.0), Vec3::splat(10.0)),
            )
            .with_layers(worldgrid_common::LayerSet::from_names(["interior"]))
            .with_aggregate_layer("HLOD0"),
        );
        let partition = partition();
        let mut settings = aggregates();
        settings.excluded_content_layers = worldgrid_common::LayerSet::from_names(["interior"]);
        let (instances, mut grids) = prepare(&w, &partition);
        let mut baker = InstancingBaker::new();
        let mut store = MemoryAggregateStore::new();
        let mut probe = NoMemoryProbe;
        let report = AggregateBuilder::new(
            &settings,
            &partition,
            &mut baker,
            &mut store,
            &mut probe,
            ReclaimPolicy::disabled(),
        )
        .unwrap()
        .build(&w.name, &instances, &mut grids)
        .unwrap();
        assert!(report.stats.opted_out >= 1);
        assert!(report
            .records
            .iter()
            .all(|r| !r.members.contains(&ObjectId::from_u128(50))));
    }

    #[test]
    fn reused_aggregates_follow_tier_changes() {
        let w = world();
        let partition = partition();
        let mut store = MemoryAggregateStore::new();
        let build = |settings: &AggregateSettings, store: &mut MemoryAggregateStore| {
            let (instances, mut grids) = prepare(&w, &partition);
            let mut baker = InstancingBaker::new();
            let mut probe = NoMemoryProbe;
            AggregateBuilder::new(
                settings,
                &partition,
                &mut baker,
                store,
                &mut probe,
                ReclaimPolicy::disabled(),
            )
            .unwrap()
            .build(&w.name, &instances, &mut grids)
            .unwrap()
        };

        let first = build(&aggregates(), &mut store);
        assert!(first.records.iter().all(|r| r.tier == u32::from(r.layer == "HLOD1")));

        // a new leaf layer with no content pushes both layers up one tier
        let mut deeper = aggregates();
        deeper.layers.push(
            crate::settings::AggregateLayerSettings::named("HLOD00", 200).with_parent("HLOD0"),
        );
        let second = build(&deeper, &mut store);
        assert_eq!(second.stats.rebuilt, 0);
        assert_eq!(second.stats.reused, first.records.len());
        for record in second.records.iter().chain(store.load_all().iter()) {
            let expected = if record.layer == "HLOD0" { 1 } else { 2 };
            assert_eq!(record.tier, expected, "{}", record.name);
        }
    }

    #[test]
    fn invalid_layer_grid_is_fatal() {
        let partition = partition();
        let settings = AggregateSettings {
            layers: vec![crate::settings::AggregateLayerSettings::named("HLOD0", 0)],
            ..Default::default()
        };
        let mut baker = InstancingBaker::new();
        let mut store = MemoryAggregateStore::new();
        let mut probe = NoMemoryProbe;
        let result = AggregateBuilder::new(
            &settings,
            &partition,
            &mut baker,
            &mut store,
            &mut probe,
            ReclaimPolicy::disabled(),
        );
        assert!(matches!(result, Err(AggregateError::Grid(_))));
    }
}
