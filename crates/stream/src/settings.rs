use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PartitionError {
    #[error("no runtime grids configured")]
    NoGrids,
    #[error("runtime grid '{0}' is declared more than once")]
    DuplicateGrid(String),
    #[error("runtime grid '{name}' has invalid cell size {cell_size}")]
    InvalidCellSize { name: String, cell_size: u32 },
    #[error("always-loaded ratio {0} is outside (0, 1]")]
    InvalidRatio(f32),
    #[error("max cluster cell span must be at least 1")]
    InvalidCellSpan,
}

/// One named runtime grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub name: String,
    /// Level 0 cell size in world units.
    pub cell_size: u32,
    pub loading_range: f32,
    pub debug_color: [f32; 4],
    /// Grid origin on the ground plane (x, y).
    pub origin: [f32; 2],
    pub priority: i32,
    pub block_on_slow_streaming: bool,
    pub client_only_visible: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            name: "MainGrid".to_string(),
            cell_size: 12800,
            loading_range: 25600.0,
            debug_color: [0.5, 0.5, 0.5, 1.0],
            origin: [0.0, 0.0],
            priority: 0,
            block_on_slow_streaming: false,
            client_only_visible: false,
        }
    }
}

impl GridSettings {
    pub fn named(name: impl Into<String>, cell_size: u32) -> Self {
        Self {
            name: name.into(),
            cell_size,
            loading_range: cell_size as f32 * 2.0,
            ..Default::default()
        }
    }
}

/// Partition configuration. The first grid is the default grid: clusters
/// with no grid, a conflicting grid or an unknown grid land there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub grids: Vec<GridSettings>,
    /// A cluster whose level 0 footprint spans more cells than this on
    /// either axis goes to the always-loaded cell.
    pub max_cluster_cell_span: u32,
    /// A multi-cell cluster whose footprint covers more than this fraction
    /// of all level 0 cells goes to the always-loaded cell.
    pub always_loaded_ratio: f32,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            grids: vec![GridSettings::default()],
            max_cluster_cell_span: 16,
            always_loaded_ratio: 0.5,
        }
    }
}

impl PartitionSettings {
    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.grids.is_empty() {
            return Err(PartitionError::NoGrids);
        }
        let mut seen = BTreeSet::new();
        for grid in &self.grids {
            if !seen.insert(grid.name.as_str()) {
                return Err(PartitionError::DuplicateGrid(grid.name.clone()));
            }
            if grid.cell_size == 0 {
                return Err(PartitionError::InvalidCellSize {
                    name: grid.name.clone(),
                    cell_size: grid.cell_size,
                });
            }
        }
        if !(self.always_loaded_ratio > 0.0 && self.always_loaded_ratio <= 1.0) {
            return Err(PartitionError::InvalidRatio(self.always_loaded_ratio));
        }
        if self.max_cluster_cell_span == 0 {
            return Err(PartitionError::InvalidCellSpan);
        }
        Ok(())
    }

    pub fn grid_index(&self, name: &str) -> Option<usize> {
        self.grids.iter().position(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_main_grid() {
        let s = PartitionSettings::default();
        assert_eq!(s.grids.len(), 1);
        assert_eq!(s.grids[0].name, "MainGrid");
        assert_eq!(s.grids[0].cell_size, 12800);
        assert_eq!(s.grids[0].loading_range, 25600.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_grids() {
        let mut s = PartitionSettings::default();
        s.grids.push(GridSettings::default());
        assert_eq!(
            s.validate(),
            Err(PartitionError::DuplicateGrid("MainGrid".to_string()))
        );

        let s = PartitionSettings {
            grids: vec![GridSettings::named("Zero", 0)],
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(PartitionError::InvalidCellSize { .. })));

        let s = PartitionSettings {
            grids: vec![],
            ..Default::default()
        };
        assert_eq!(s.validate(), Err(PartitionError::NoGrids));

        let s = PartitionSettings {
            always_loaded_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(s.validate(), Err(PartitionError::InvalidRatio(0.0)));
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let s: PartitionSettings =
            serde_json::from_str(r#"{ "grids": [{ "name": "Foliage", "cell_size": 3200 }] }"#)
                .unwrap();
        assert_eq!(s.grids[0].name, "Foliage");
        assert_eq!(s.grids[0].loading_range, 25600.0);
        assert_eq!(s.max_cluster_cell_span, 16);
        assert_eq!(s.grid_index("Foliage"), Some(0));
        assert_eq!(s.grid_index("MainGrid"), None);
    }
}
