use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use glam::{DVec2, Vec2};
use worldgrid_common::{Aabb, LayerSet, LayerSetId};
use worldgrid_kernel::ObjectInstanceRef;

use crate::cluster::ClusterInstance;
use crate::settings::PartitionSettings;

/// A cell address within one grid: level plus integer x/y on that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCellCoord {
    pub x: i64,
    pub y: i64,
    pub level: u32,
}

impl GridCellCoord {
    pub fn new(x: i64, y: i64, level: u32) -> Self {
        Self { x, y, level }
    }
}

impl fmt::Display for GridCellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}_X{}_Y{}", self.level, self.x, self.y)
    }
}

/// The members of one cell that share a layer set.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    pub layers: LayerSet,
    pub layer_id: LayerSetId,
    pub members: BTreeSet<ObjectInstanceRef>,
    pub min_z: f32,
    pub max_z: f32,
}

impl DataChunk {
    fn new(layers: LayerSet, layer_id: LayerSetId) -> Self {
        Self {
            layers,
            layer_id,
            members: BTreeSet::new(),
            min_z: f32::MAX,
            max_z: f32::MIN,
        }
    }

    pub fn has_layers(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub coords: GridCellCoord,
    chunks: BTreeMap<LayerSetId, DataChunk>,
}

impl GridCell {
    fn new(coords: GridCellCoord) -> Self {
        Self {
            coords,
            chunks: BTreeMap::new(),
        }
    }

    fn add(&mut self, cluster: &ClusterInstance) {
        let chunk = self
            .chunks
            .entry(cluster.layer_id)
            .or_insert_with(|| DataChunk::new(cluster.layers.clone(), cluster.layer_id));
        chunk.members.extend(cluster.member_refs());
        if cluster.bounds.is_valid() {
            chunk.min_z = chunk.min_z.min(cluster.bounds.min.z);
            chunk.max_z = chunk.max_z.max(cluster.bounds.max.z);
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &DataChunk> {
        self.chunks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.values().all(DataChunk::is_empty)
    }
}

/// One level of the square grid. Cells are created on first use and keyed
/// row-major, so iteration order is stable.
#[derive(Debug, Clone)]
pub struct GridLevel {
    pub level: u32,
    /// World position of the minimum corner of cell (0, 0).
    pub corner: DVec2,
    pub cell_size: i64,
    /// Cells per side.
    pub grid_size: i64,
    cells: BTreeMap<i64, GridCell>,
}

impl GridLevel {
    pub fn cell_index(&self, x: i64, y: i64) -> Option<i64> {
        (x >= 0 && y >= 0 && x < self.grid_size && y < self.grid_size)
            .then_some(y * self.grid_size + x)
    }

    /// Cell containing `p`, if `p` is inside the grid.
    pub fn cell_coords(&self, p: DVec2) -> Option<GridCellCoord> {
        let rel = (p - self.corner) / self.cell_size as f64;
        let (x, y) = (rel.x.floor() as i64, rel.y.floor() as i64);
        self.cell_index(x, y)?;
        Some(GridCellCoord::new(x, y, self.level))
    }

    /// 2D footprint of a cell as (min, max).
    pub fn cell_bounds(&self, x: i64, y: i64) -> (DVec2, DVec2) {
        let size = self.cell_size as f64;
        let min = self.corner + DVec2::new(x as f64 * size, y as f64 * size);
        (min, min + DVec2::splat(size))
    }

    /// Inclusive cell rectangle touched by `[min, max]`, unclamped. A box
    /// that ends exactly on a cell edge does not touch the next cell.
    fn footprint(&self, min: DVec2, max: DVec2) -> (i64, i64, i64, i64) {
        let size = self.cell_size as f64;
        let lo = (min - self.corner) / size;
        let hi = (max - self.corner) / size;
        let (min_x, min_y) = (lo.x.floor() as i64, lo.y.floor() as i64);
        let max_x = (hi.x.ceil() as i64).saturating_sub(1).max(min_x);
        let max_y = (hi.y.ceil() as i64).saturating_sub(1).max(min_y);
        (min_x, min_y, max_x, max_y)
    }

    /// World-space extent of the whole level as (min, max).
    pub fn extent(&self) -> (DVec2, DVec2) {
        let side = (self.grid_size * self.cell_size) as f64;
        (self.corner, self.corner + DVec2::splat(side))
    }

    /// True when `[min, max]` lies entirely inside the level.
    pub fn contains(&self, min: DVec2, max: DVec2) -> bool {
        let (lo, hi) = self.extent();
        min.cmpge(lo).all() && max.cmple(hi).all()
    }

    fn clamp(&self, v: i64) -> i64 {
        v.clamp(0, self.grid_size - 1)
    }

    /// Footprint of `[min, max]` clamped to the level, or `None` when the
    /// box misses it entirely.
    fn clamped_footprint(&self, min: DVec2, max: DVec2) -> Option<(i64, i64, i64, i64)> {
        let (x0, y0, x1, y1) = self.footprint(min, max);
        if x1 < 0 || y1 < 0 || x0 >= self.grid_size || y0 >= self.grid_size {
            return None;
        }
        Some((self.clamp(x0), self.clamp(y0), self.clamp(x1), self.clamp(y1)))
    }

    /// Number of cells `[min, max]` touches, without visiting them.
    pub fn count_intersecting_cells(&self, min: DVec2, max: DVec2) -> usize {
        self.clamped_footprint(min, max)
            .map(|(x0, y0, x1, y1)| ((x1 - x0 + 1) * (y1 - y0 + 1)) as usize)
            .unwrap_or(0)
    }

    pub fn for_each_intersecting_cell(
        &self,
        min: DVec2,
        max: DVec2,
        mut f: impl FnMut(GridCellCoord),
    ) -> usize {
        let Some((x0, y0, x1, y1)) = self.clamped_footprint(min, max) else {
            return 0;
        };
        let mut count = 0;
        for y in y0..=y1 {
            for x in x0..=x1 {
                f(GridCellCoord::new(x, y, self.level));
                count += 1;
            }
        }
        count
    }

    fn cell_mut(&mut self, x: i64, y: i64) -> &mut GridCell {
        let index = y * self.grid_size + x;
        let level = self.level;
        self.cells
            .entry(index)
            .or_insert_with(|| GridCell::new(GridCellCoord::new(x, y, level)))
    }

    pub fn cell(&self, x: i64, y: i64) -> Option<&GridCell> {
        self.cells.get(&self.cell_index(x, y)?)
    }

    /// Populated cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = &GridCell> {
        self.cells.values()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

/// Why a cluster went to the always-loaded cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlwaysLoadedReason {
    NotSpatiallyLoaded,
    InvalidBounds,
    /// Footprint wider than the configured cell span on some axis.
    TooLarge,
    /// Footprint covers more than the configured fraction of the world.
    CoversGrid,
    /// Bounds reach past the grid, which is capped at
    /// [`MAX_CELLS_PER_SIDE`] level 0 cells per side.
    OutsideGrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    AlwaysLoaded(AlwaysLoadedReason),
    /// Number of level 0 cells the cluster was added to.
    Cells(usize),
}

/// Upper bound on level 0 cells per side. Keeps cell indices and level
/// extents inside `i64` for any `u32` cell size.
pub const MAX_CELLS_PER_SIDE: u64 = 1 << 24;

/// A power-of-two square grid centred on the origin. Level 0 uses the
/// configured cell size; each level above doubles it; the top level is one
/// cell covering the whole world and holds always-loaded content.
#[derive(Debug, Clone)]
pub struct GridHelper {
    pub origin: DVec2,
    pub cell_size: i64,
    pub world_bounds: Aabb,
    levels: Vec<GridLevel>,
    /// Level 0 cells covered by the world bounds.
    world_cells: usize,
}

impl GridHelper {
    pub fn new(world_bounds: Aabb, origin: Vec2, cell_size: u32) -> Self {
        let origin = origin.as_dvec2();
        let cell = i64::from(cell_size.max(1));
        let bounds = if world_bounds.is_valid() {
            world_bounds
        } else {
            Aabb::from_point(origin.as_vec2().extend(0.0))
        };

        let reach = [
            (f64::from(bounds.min.x) - origin.x).abs(),
            (f64::from(bounds.max.x) - origin.x).abs(),
            (f64::from(bounds.min.y) - origin.y).abs(),
            (f64::from(bounds.max.y) - origin.y).abs(),
        ]
        .into_iter()
        .fold(0.0f64, f64::max);
        let wanted = (reach * 2.0 / cell as f64).ceil();
        let cells_per_side = if wanted.is_finite() && wanted <= MAX_CELLS_PER_SIDE as f64 {
            (wanted as u64).max(1)
        } else {
            tracing::warn!(
                reach,
                cell_size = cell,
                max_cells = MAX_CELLS_PER_SIDE,
                "world bounds exceed the grid limit; outlying content becomes always loaded"
            );
            MAX_CELLS_PER_SIDE
        };
        let grid_size = cells_per_side.next_power_of_two();
        let level_count = (grid_size.trailing_zeros() + 1).max(2);

        let levels = (0..level_count)
            .map(|level| {
                let cell_size = cell << level;
                let grid_size = ((grid_size >> level) as i64).max(1);
                let half = (grid_size * cell_size) as f64 * 0.5;
                GridLevel {
                    level,
                    corner: origin - DVec2::splat(half),
                    cell_size,
                    grid_size,
                    cells: BTreeMap::new(),
                }
            })
            .collect::<Vec<_>>();

        let world_cells = levels[0].count_intersecting_cells(
            bounds.min.truncate().as_dvec2(),
            bounds.max.truncate().as_dvec2(),
        );

        Self {
            origin,
            cell_size: cell,
            world_bounds,
            levels,
            world_cells: world_cells.max(1),
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level(&self, level: u32) -> Option<&GridLevel> {
        self.levels.get(level as usize)
    }

    pub fn top_level(&self) -> u32 {
        self.levels.len() as u32 - 1
    }

    pub fn always_loaded_cell(&self) -> Option<&GridCell> {
        self.levels.last()?.cell(0, 0)
    }

    pub fn is_always_loaded_cell(&self, coords: &GridCellCoord) -> bool {
        coords.level == self.top_level()
    }

    /// Level 0 cell containing `p`.
    pub fn cell_coords(&self, p: Vec2) -> Option<GridCellCoord> {
        self.levels[0].cell_coords(p.as_dvec2())
    }

    /// 2D footprint of a cell, with a zero Z extent.
    pub fn cell_bounds(&self, coords: &GridCellCoord) -> Aabb {
        let Some(level) = self.level(coords.level) else {
            return Aabb::EMPTY;
        };
        let (min, max) = level.cell_bounds(coords.x, coords.y);
        Aabb::new(
            min.as_vec2().extend(0.0),
            max.as_vec2().extend(0.0),
        )
    }

    /// Coordinates recentred so the cell at the origin is (0, 0).
    pub fn global_coords(&self, coords: &GridCellCoord) -> GridCellCoord {
        let half = self
            .level(coords.level)
            .map(|l| l.grid_size >> 1)
            .unwrap_or(0);
        GridCellCoord::new(coords.x - half, coords.y - half, coords.level)
    }

    pub fn for_each_intersecting_cell(
        &self,
        level: u32,
        bounds: &Aabb,
        f: impl FnMut(GridCellCoord),
    ) -> usize {
        match self.level(level) {
            Some(l) if bounds.is_valid() => l.for_each_intersecting_cell(
                bounds.min.truncate().as_dvec2(),
                bounds.max.truncate().as_dvec2(),
                f,
            ),
            _ => 0,
        }
    }

    fn add_always_loaded(&mut self, cluster: &ClusterInstance) {
        if let Some(top) = self.levels.last_mut() {
            top.cell_mut(0, 0).add(cluster);
        }
    }

    /// Assign `cluster` to the level 0 cells its bounds touch, or to the
    /// always-loaded cell when it cannot be localized.
    pub fn place(&mut self, cluster: &ClusterInstance, settings: &PartitionSettings) -> Placement {
        let reason = if !cluster.spatially_loaded {
            Some(AlwaysLoadedReason::NotSpatiallyLoaded)
        } else if !cluster.bounds.is_valid() {
            Some(AlwaysLoadedReason::InvalidBounds)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.add_always_loaded(cluster);
            return Placement::AlwaysLoaded(reason);
        }

        let level0 = &self.levels[0];
        let min = cluster.bounds.min.truncate().as_dvec2();
        let max = cluster.bounds.max.truncate().as_dvec2();
        if !level0.contains(min, max) {
            tracing::warn!(
                cluster = cluster.id,
                min = ?cluster.bounds.min,
                max = ?cluster.bounds.max,
                "cluster lies outside the grid; treating as always loaded"
            );
            self.add_always_loaded(cluster);
            return Placement::AlwaysLoaded(AlwaysLoadedReason::OutsideGrid);
        }
        let (x0, y0, x1, y1) = level0.footprint(min, max);
        let span = i64::from(settings.max_cluster_cell_span);
        if x1 - x0 + 1 > span || y1 - y0 + 1 > span {
            self.add_always_loaded(cluster);
            return Placement::AlwaysLoaded(AlwaysLoadedReason::TooLarge);
        }

        let (x0, y0) = (level0.clamp(x0), level0.clamp(y0));
        let (x1, y1) = (level0.clamp(x1), level0.clamp(y1));
        let count = ((x1 - x0 + 1) * (y1 - y0 + 1)) as usize;
        let ratio = f64::from(settings.always_loaded_ratio);
        if count > 1 && count as f64 > ratio * self.world_cells as f64 {
            self.add_always_loaded(cluster);
            return Placement::AlwaysLoaded(AlwaysLoadedReason::CoversGrid);
        }

        let level0 = &mut self.levels[0];
        for y in y0..=y1 {
            for x in x0..=x1 {
                level0.cell_mut(x, y).add(cluster);
            }
        }
        debug_assert!(count >= 1);
        Placement::Cells(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use worldgrid_common::{ContainerId, ObjectId};

    fn cluster(id: u128, min: Vec3, max: Vec3) -> ClusterInstance {
        let layers = LayerSet::new();
        ClusterInstance {
            id: id as u64,
            container: ContainerId::MAIN,
            members: vec![ObjectId::from_u128(id)],
            bounds: Aabb::new(min, max),
            runtime_grid: None,
            grid_conflict: false,
            layer_id: layers.fingerprint(),
            layers,
            spatially_loaded: true,
        }
    }

    fn world(half: f32) -> Aabb {
        Aabb::new(Vec3::new(-half, -half, 0.0), Vec3::new(half, half, 10.0))
    }

    #[test]
    fn levels_double_until_one_cell() {
        // 1000 units across at cell size 100 -> 10 cells -> 16 per side
        let helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        assert_eq!(helper.level_count(), 5);
        let sizes: Vec<_> = helper.levels().iter().map(|l| (l.cell_size, l.grid_size)).collect();
        assert_eq!(sizes, vec![(100, 16), (200, 8), (400, 4), (800, 2), (1600, 1)]);
        assert_eq!(helper.levels()[0].corner, DVec2::splat(-800.0));
    }

    #[test]
    fn tiny_world_still_has_top_level() {
        let helper = GridHelper::new(world(10.0), Vec2::ZERO, 100);
        assert_eq!(helper.level_count(), 2);
        assert_eq!(helper.levels()[0].grid_size, 1);
        assert_eq!(helper.levels()[1].grid_size, 1);
    }

    #[test]
    fn small_cluster_lands_in_one_cell() {
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let c = cluster(1, Vec3::new(10.0, 10.0, 0.0), Vec3::new(20.0, 20.0, 5.0));
        assert_eq!(helper.place(&c, &PartitionSettings::default()), Placement::Cells(1));
        let level0 = &helper.levels()[0];
        assert_eq!(level0.cell_count(), 1);
        let cell = level0.cell(8, 8).unwrap();
        assert_eq!(helper.global_coords(&cell.coords), GridCellCoord::new(0, 0, 0));
    }

    #[test]
    fn box_ending_on_edge_does_not_spill() {
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let c = cluster(1, Vec3::new(0.0, 0.0, 0.0), Vec3::new(100.0, 100.0, 0.0));
        assert_eq!(helper.place(&c, &PartitionSettings::default()), Placement::Cells(1));
    }

    #[test]
    fn point_cluster_uses_containing_cell() {
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let p = Vec3::new(-150.0, 250.0, 0.0);
        let c = cluster(1, p, p);
        assert_eq!(helper.place(&c, &PartitionSettings::default()), Placement::Cells(1));
        let expected = helper.cell_coords(p.truncate()).unwrap();
        assert!(helper.levels()[0].cell(expected.x, expected.y).is_some());
    }

    #[test]
    fn straddling_cluster_is_duplicated() {
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let c = cluster(1, Vec3::new(-10.0, -10.0, 0.0), Vec3::new(10.0, 10.0, 0.0));
        assert_eq!(helper.place(&c, &PartitionSettings::default()), Placement::Cells(4));
        for cell in helper.levels()[0].cells() {
            assert_eq!(cell.chunks().next().unwrap().members.len(), 1);
        }
    }

    #[test]
    fn oversized_and_resident_clusters_go_to_top() {
        let settings = PartitionSettings {
            max_cluster_cell_span: 4,
            ..Default::default()
        };
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let wide = cluster(1, Vec3::new(-450.0, 0.0, 0.0), Vec3::new(50.0, 10.0, 0.0));
        assert_eq!(
            helper.place(&wide, &settings),
            Placement::AlwaysLoaded(AlwaysLoadedReason::TooLarge)
        );
        let mut resident = cluster(2, Vec3::ZERO, Vec3::ONE);
        resident.spatially_loaded = false;
        assert_eq!(
            helper.place(&resident, &settings),
            Placement::AlwaysLoaded(AlwaysLoadedReason::NotSpatiallyLoaded)
        );
        let top = helper.always_loaded_cell().unwrap();
        assert_eq!(top.chunks().next().unwrap().members.len(), 2);
        assert!(helper.levels()[0].cells().next().is_none());
    }

    #[test]
    fn world_footprint_counts_covered_cells() {
        let helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        assert_eq!(helper.world_cells, 100);
    }

    #[test]
    fn world_spanning_cluster_goes_to_top() {
        let settings = PartitionSettings {
            max_cluster_cell_span: 64,
            ..Default::default()
        };
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let all = cluster(1, Vec3::new(-500.0, -500.0, 0.0), Vec3::new(500.0, 500.0, 0.0));
        assert_eq!(
            helper.place(&all, &settings),
            Placement::AlwaysLoaded(AlwaysLoadedReason::CoversGrid)
        );
    }

    #[test]
    fn chunks_split_by_layer_set() {
        let mut helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let plain = cluster(1, Vec3::splat(10.0), Vec3::splat(20.0));
        let mut night = cluster(2, Vec3::splat(10.0), Vec3::splat(20.0));
        night.layers = LayerSet::from_names(["night"]);
        night.layer_id = night.layers.fingerprint();
        helper.place(&plain, &PartitionSettings::default());
        helper.place(&night, &PartitionSettings::default());
        let cell = helper.levels()[0].cells().next().unwrap();
        assert_eq!(cell.chunks().count(), 2);
        assert!(cell.chunks().any(DataChunk::has_layers));
    }

    #[test]
    fn far_object_is_capped_and_always_loaded() {
        let far = Aabb::new(Vec3::new(-10.0, -10.0, 0.0), Vec3::new(1e30, 10.0, 0.0));
        assert!(far.is_valid());
        let mut helper = GridHelper::new(far, Vec2::ZERO, 12_800);
        assert_eq!(helper.levels()[0].grid_size as u64, MAX_CELLS_PER_SIDE);
        assert_eq!(helper.level_count(), 25);
        assert_eq!(helper.levels().last().unwrap().grid_size, 1);

        let settings = PartitionSettings::default();
        let huge = cluster(1, far.min, far.max);
        assert_eq!(
            helper.place(&huge, &settings),
            Placement::AlwaysLoaded(AlwaysLoadedReason::OutsideGrid)
        );
        let near = cluster(2, Vec3::new(10.0, 10.0, 0.0), Vec3::new(20.0, 20.0, 0.0));
        assert_eq!(helper.place(&near, &settings), Placement::Cells(1));
        let top = helper.always_loaded_cell().unwrap();
        assert_eq!(top.chunks().next().unwrap().members.len(), 1);
    }

    #[test]
    fn far_negative_bounds_do_not_overflow() {
        let helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let far = Aabb::new(Vec3::splat(-1e30), Vec3::splat(-1e29));
        assert_eq!(helper.for_each_intersecting_cell(0, &far, |_| {}), 0);
    }

    #[test]
    fn intersecting_cells_are_clamped() {
        let helper = GridHelper::new(world(500.0), Vec2::ZERO, 100);
        let mut seen = Vec::new();
        let n = helper.for_each_intersecting_cell(
            1,
            &Aabb::new(Vec3::new(-10_000.0, -10.0, 0.0), Vec3::new(-700.0, 10.0, 0.0)),
            |c| seen.push(c),
        );
        assert_eq!(n, 2);
        assert_eq!(seen[0], GridCellCoord::new(0, 3, 1));
    }
}
