//! One full build pass: expand the world, cluster, partition into streaming
//! grids, then run the aggregate pass over the result.

use std::fmt;
use std::time::{Duration, Instant};

use worldgrid_kernel::{ContainerLoader, InstanceSet, LoadError, World, WorldLoader};
use worldgrid_stream::{ClusterContext, PartitionError, SpatialHashGenerator, StreamingGrid};

use crate::builder::{AggregateBuilder, AggregateStats};
use crate::collab::{AggregateStore, GeometryBaker};
use crate::error::AggregateError;
use crate::reclaim::{MemoryProbe, ReclaimPolicy};
use crate::record::AggregateRecord;
use crate::settings::BuildSettings;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to load world: {0}")]
    Load(#[from] LoadError),
    #[error("invalid partition settings: {0}")]
    Partition(#[from] PartitionError),
    #[error("invalid aggregate settings: {0}")]
    Aggregate(#[from] AggregateError),
}

impl BuildError {
    /// True when the settings, not the world data, are at fault.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, BuildError::Partition(_) | BuildError::Aggregate(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSummary {
    pub world: String,
    pub instances: usize,
    pub records: usize,
    pub failed_loads: usize,
    pub nesting_cycles: usize,
    pub clusters: usize,
    pub dropped_references: usize,
    pub grid_conflicts: usize,
    pub grids: usize,
    pub cells: usize,
    pub always_loaded_cells: usize,
    pub aggregates: AggregateStats,
    pub elapsed: Duration,
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "World '{}'", self.world)?;
        writeln!(
            f,
            "  instances: {} ({} records, {} failed loads, {} nesting cycles)",
            self.instances, self.records, self.failed_loads, self.nesting_cycles
        )?;
        writeln!(
            f,
            "  clusters: {} ({} dropped references, {} grid conflicts)",
            self.clusters, self.dropped_references, self.grid_conflicts
        )?;
        writeln!(
            f,
            "  grids: {} with {} cells ({} always loaded)",
            self.grids, self.cells, self.always_loaded_cells
        )?;
        let a = &self.aggregates;
        writeln!(
            f,
            "  aggregates: {} cells, {} rebuilt, {} reused, {} failed, {} deleted",
            a.cells, a.rebuilt, a.reused, a.failed, a.deleted
        )?;
        write!(f, "  elapsed: {:.1?}", self.elapsed)
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub grids: Vec<StreamingGrid>,
    /// Live aggregates, sorted by key.
    pub aggregates: Vec<AggregateRecord>,
    pub summary: BuildSummary,
}

/// Build `world` with its own containers as the library.
pub fn run(
    world: &World,
    settings: &BuildSettings,
    baker: &mut dyn GeometryBaker,
    store: &mut dyn AggregateStore,
    probe: &mut dyn MemoryProbe,
) -> Result<BuildOutput, BuildError> {
    let mut loader = WorldLoader::new(world);
    let world_name = settings.world_name.as_deref().unwrap_or(&world.name);
    run_with_loader(world_name, &world.main, &mut loader, settings, baker, store, probe)
}

/// Build from an arbitrary container source. Settings are validated before
/// anything is loaded.
pub fn run_with_loader(
    world_name: &str,
    main: &str,
    loader: &mut dyn ContainerLoader,
    settings: &BuildSettings,
    baker: &mut dyn GeometryBaker,
    store: &mut dyn AggregateStore,
    probe: &mut dyn MemoryProbe,
) -> Result<BuildOutput, BuildError> {
    let _span = tracing::info_span!("build", world = world_name).entered();
    let start = Instant::now();

    if let Err(e) = settings.partition.validate() {
        tracing::error!(error = %e, "invalid partition settings");
        return Err(e.into());
    }
    let mut builder = match AggregateBuilder::new(
        &settings.aggregates,
        &settings.partition,
        baker,
        store,
        probe,
        ReclaimPolicy::from_settings(&settings.reclaim),
    ) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!(error = %e, "invalid aggregate settings");
            return Err(e.into());
        }
    };

    let instances = InstanceSet::expand(world_name, main, loader, &settings.expansion)?;
    let clusters = ClusterContext::build(&instances);
    let mut grids =
        SpatialHashGenerator::generate(world_name, &settings.partition, &instances, &clusters)?;
    let report = builder.build(world_name, &instances, &mut grids)?;

    let expansion = instances.stats();
    let cluster_stats = clusters.stats();
    let summary = BuildSummary {
        world: world_name.to_string(),
        instances: expansion.instances,
        records: expansion.records,
        failed_loads: expansion.failed_loads,
        nesting_cycles: expansion.nesting_cycles,
        clusters: cluster_stats.clusters,
        dropped_references: cluster_stats.dropped_references,
        grid_conflicts: cluster_stats.grid_conflicts,
        grids: grids.len(),
        cells: grids.iter().map(|g| g.cell_count()).sum(),
        always_loaded_cells: grids
            .iter()
            .flat_map(|g| g.cells())
            .filter(|c| c.always_loaded)
            .count(),
        aggregates: report.stats,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        cells = summary.cells,
        aggregates = report.records.len(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "build complete"
    );

    Ok(BuildOutput {
        grids,
        aggregates: report.records,
        summary,
    })
}
