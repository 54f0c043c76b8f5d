use std::time::Instant;

use glam::Vec2;
use worldgrid_common::Aabb;
use worldgrid_kernel::InstanceSet;

use crate::builder::{StreamingGrid, StreamingGridBuilder};
use crate::cluster::{ClusterContext, ClusterInstance};
use crate::grid::{AlwaysLoadedReason, GridHelper, Placement};
use crate::settings::{GridSettings, PartitionError, PartitionSettings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub clusters: usize,
    pub always_loaded: usize,
    pub too_large: usize,
    pub covers_grid: usize,
    pub outside_grid: usize,
    /// Level 0 cell assignments, counting duplicates.
    pub placements: usize,
    pub cells: usize,
}

/// Partitions clustered content into every configured runtime grid.
pub struct SpatialHashGenerator;

impl SpatialHashGenerator {
    /// Build one grid from the clusters assigned to it.
    pub fn partition_grid(
        world_name: &str,
        grid: &GridSettings,
        settings: &PartitionSettings,
        world_bounds: Aabb,
        clusters: &[&ClusterInstance],
    ) -> (StreamingGrid, PartitionStats) {
        let _span = tracing::info_span!("partition_grid", grid = %grid.name).entered();
        let origin = Vec2::from_array(grid.origin);
        let mut helper = GridHelper::new(world_bounds, origin, grid.cell_size);
        let mut stats = PartitionStats {
            clusters: clusters.len(),
            ..Default::default()
        };
        for cluster in clusters {
            match helper.place(cluster, settings) {
                Placement::Cells(n) => stats.placements += n,
                Placement::AlwaysLoaded(reason) => {
                    stats.always_loaded += 1;
                    match reason {
                        AlwaysLoadedReason::TooLarge => stats.too_large += 1,
                        AlwaysLoadedReason::CoversGrid => stats.covers_grid += 1,
                        AlwaysLoadedReason::OutsideGrid => stats.outside_grid += 1,
                        _ => {}
                    }
                    tracing::trace!(cluster = cluster.id, ?reason, "always loaded");
                }
            }
        }
        let streaming = StreamingGridBuilder::build(world_name, grid, &helper);
        stats.cells = streaming.cell_count();
        tracing::debug!(
            levels = helper.level_count(),
            clusters = stats.clusters,
            always_loaded = stats.always_loaded,
            cells = stats.cells,
            "partitioned grid"
        );
        (streaming, stats)
    }

    /// Route each cluster to its runtime grid and partition every grid.
    /// Clusters with no grid, a conflicting grid or an unknown grid go to the
    /// first grid.
    pub fn generate(
        world_name: &str,
        settings: &PartitionSettings,
        instances: &InstanceSet,
        clusters: &ClusterContext,
    ) -> Result<Vec<StreamingGrid>, PartitionError> {
        settings.validate()?;
        let _span = tracing::info_span!("generate_streaming", world = world_name).entered();
        let start = Instant::now();

        let mut per_grid: Vec<Vec<&ClusterInstance>> = vec![Vec::new(); settings.grids.len()];
        for cluster in clusters.clusters() {
            let index = match &cluster.runtime_grid {
                None => 0,
                Some(name) => settings.grid_index(name).unwrap_or_else(|| {
                    tracing::error!(
                        grid = %name,
                        cluster = cluster.id,
                        "invalid runtime grid; using the default grid"
                    );
                    0
                }),
            };
            per_grid[index].push(cluster);
        }

        let world_bounds = instances.world_bounds();
        let mut grids = Vec::with_capacity(settings.grids.len());
        let mut cells = 0;
        for (grid, assigned) in settings.grids.iter().zip(&per_grid) {
            let (streaming, stats) =
                Self::partition_grid(world_name, grid, settings, world_bounds, assigned);
            cells += stats.cells;
            grids.push(streaming);
        }

        tracing::info!(
            grids = grids.len(),
            cells,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generated streaming grids"
        );
        Ok(grids)
    }
}
