use std::fmt;

use worldgrid_common::hash;
use worldgrid_common::{Aabb, LayerSet, LayerSetId, ObjectId};
use worldgrid_kernel::ObjectInstanceRef;

use crate::grid::{GridCellCoord, GridHelper};
use crate::settings::GridSettings;

/// Stable identity of a streaming cell: FNV-1a 64 of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Final output unit: one (cell, layer set) pair with its members.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingCell {
    pub id: CellId,
    pub name: String,
    pub grid: String,
    /// Global coordinates (origin cell is (0, 0)).
    pub coords: GridCellCoord,
    pub layer_id: LayerSetId,
    pub layers: LayerSet,
    /// Cell footprint with the Z range of its members.
    pub bounds: Aabb,
    /// Lives in the top cell of its grid.
    pub top_level: bool,
    pub always_loaded: bool,
    pub members: Vec<ObjectInstanceRef>,
    /// Aggregates this cell's content contributes to.
    pub aggregate_ids: Vec<ObjectId>,
    pub priority: i32,
    pub block_on_slow_loading: bool,
    pub client_only_visible: bool,
}

impl StreamingCell {
    pub fn name_for(
        world: &str,
        grid: &str,
        coords: &GridCellCoord,
        layer_id: LayerSetId,
    ) -> String {
        format!(
            "{world}_{grid}_L{}_X{}_Y{}_DL{:X}",
            coords.level, coords.x, coords.y, layer_id
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingGridLevel {
    pub level: u32,
    pub cell_size: i64,
    pub grid_size: i64,
    pub cells: Vec<StreamingCell>,
}

/// All streaming cells of one named grid.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingGrid {
    pub name: String,
    pub origin: [f32; 2],
    pub cell_size: u32,
    pub world_bounds: Aabb,
    pub loading_range: f32,
    pub debug_color: [f32; 4],
    pub priority: i32,
    pub block_on_slow_streaming: bool,
    pub client_only_visible: bool,
    pub levels: Vec<StreamingGridLevel>,
}

impl StreamingGrid {
    pub fn cells(&self) -> impl Iterator<Item = &StreamingCell> {
        self.levels.iter().flat_map(|l| l.cells.iter())
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = &mut StreamingCell> {
        self.levels.iter_mut().flat_map(|l| l.cells.iter_mut())
    }

    pub fn cell_count(&self) -> usize {
        self.levels.iter().map(|l| l.cells.len()).sum()
    }

    pub fn find(&self, id: CellId) -> Option<&StreamingCell> {
        self.cells().find(|c| c.id == id)
    }
}

/// Turns a populated [`GridHelper`] into streaming cells.
pub struct StreamingGridBuilder;

impl StreamingGridBuilder {
    /// One cell per non-empty (cell, chunk) pair, walking levels bottom-up and
    /// cells in row-major order. Only a chunk of the top cell that carries
    /// no layers is always loaded.
    pub fn build(world_name: &str, settings: &GridSettings, helper: &GridHelper) -> StreamingGrid {
        let top = helper.top_level();
        let mut levels = Vec::with_capacity(helper.level_count());
        for level in helper.levels() {
            let mut cells = Vec::new();
            for cell in level.cells() {
                let coords = helper.global_coords(&cell.coords);
                let footprint = helper.cell_bounds(&cell.coords);
                for chunk in cell.chunks().filter(|c| !c.is_empty()) {
                    let top_level = level.level == top;
                    let always_loaded = top_level && !chunk.has_layers();
                    let name = StreamingCell::name_for(
                        world_name,
                        &settings.name,
                        &coords,
                        chunk.layer_id,
                    );
                    let (min_z, max_z) = if chunk.min_z <= chunk.max_z {
                        (chunk.min_z, chunk.max_z)
                    } else {
                        (0.0, 0.0)
                    };
                    let mut bounds = footprint;
                    bounds.min.z = min_z;
                    bounds.max.z = max_z;
                    tracing::debug!(
                        cell = %name,
                        always_loaded,
                        members = chunk.members.len(),
                        ?bounds,
                        "streaming cell"
                    );
                    cells.push(StreamingCell {
                        id: CellId(hash::fnv1a64(name.as_bytes())),
                        name,
                        grid: settings.name.clone(),
                        coords,
                        layer_id: chunk.layer_id,
                        layers: chunk.layers.clone(),
                        bounds,
                        top_level,
                        always_loaded,
                        members: chunk.members.iter().copied().collect(),
                        aggregate_ids: Vec::new(),
                        priority: settings.priority,
                        block_on_slow_loading: settings.block_on_slow_streaming,
                        client_only_visible: settings.client_only_visible,
                    });
                }
            }
            levels.push(StreamingGridLevel {
                level: level.level,
                cell_size: level.cell_size,
                grid_size: level.grid_size,
                cells,
            });
        }

        StreamingGrid {
            name: settings.name.clone(),
            origin: settings.origin,
            cell_size: settings.cell_size,
            world_bounds: helper.world_bounds,
            loading_range: settings.loading_range,
            debug_color: settings.debug_color,
            priority: settings.priority,
            block_on_slow_streaming: settings.block_on_slow_streaming,
            client_only_visible: settings.client_only_visible,
            levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterInstance;
    use crate::settings::PartitionSettings;
    use glam::{Vec2, Vec3};
    use worldgrid_common::ContainerId;

    fn cluster(id: u128, min: Vec3, max: Vec3, layers: &[&str], resident: bool) -> ClusterInstance {
        let layers = LayerSet::from_names(layers.iter().copied());
        ClusterInstance {
            id: id as u64,
            container: ContainerId::MAIN,
            members: vec![ObjectId::from_u128(id)],
            bounds: Aabb::new(min, max),
            runtime_grid: None,
            grid_conflict: false,
            layer_id: layers.fingerprint(),
            layers,
            spatially_loaded: !resident,
        }
    }

    fn build(clusters: &[ClusterInstance]) -> StreamingGrid {
        let settings = GridSettings::named("MainGrid", 100);
        let world = Aabb::new(Vec3::splat(-500.0), Vec3::splat(500.0));
        let mut helper = GridHelper::new(world, Vec2::ZERO, settings.cell_size);
        for c in clusters {
            helper.place(c, &PartitionSettings::default());
        }
        StreamingGridBuilder::build("World", &settings, &helper)
    }

    #[test]
    fn names_follow_global_coordinates() {
        let c = cluster(
            1,
            Vec3::new(10.0, 10.0, 2.0),
            Vec3::new(20.0, 20.0, 8.0),
            &[],
            false,
        );
        let grid = build(&[c]);
        let cells: Vec<_> = grid.cells().collect();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].name, "World_MainGrid_L0_X0_Y0_DL0");
        assert_eq!(cells[0].id, CellId(hash::fnv1a64(b"World_MainGrid_L0_X0_Y0_DL0")));
        assert_eq!(cells[0].bounds.min, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(cells[0].bounds.max, Vec3::new(100.0, 100.0, 8.0));
        assert!(!cells[0].always_loaded);
    }

    #[test]
    fn layered_top_chunks_are_not_always_loaded() {
        let grid = build(&[
            cluster(1, Vec3::ZERO, Vec3::ONE, &[], true),
            cluster(2, Vec3::ZERO, Vec3::ONE, &["night"], true),
        ]);
        let top: Vec<_> = grid.cells().filter(|c| c.top_level).collect();
        assert_eq!(top.len(), 2);
        assert!(top.iter().any(|c| c.always_loaded && c.layers.is_empty()));
        assert!(top.iter().any(|c| !c.always_loaded && c.layers.contains("night")));
    }

    #[test]
    fn rebuild_is_identical() {
        let clusters = [
            cluster(1, Vec3::splat(-300.0), Vec3::splat(-250.0), &[], false),
            cluster(2, Vec3::splat(120.0), Vec3::splat(130.0), &["rain"], false),
            cluster(3, Vec3::ZERO, Vec3::ONE, &[], true),
        ];
        let a = build(&clusters);
        let b = build(&clusters);
        assert_eq!(a, b);
        assert_eq!(a.cell_count(), 3);
    }
}
