use std::path::Path;

use serde::{Deserialize, Serialize};
use worldgrid_common::LayerSet;
use worldgrid_common::hash::{self, Fnv64};
use worldgrid_kernel::ExpansionSettings;
use worldgrid_stream::{GridSettings, PartitionSettings};

use crate::error::AggregateError;
use crate::graph::AggregateGraph;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// One aggregate layer: a grid of aggregates, optionally feeding a coarser
/// parent layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateLayerSettings {
    pub name: String,
    pub cell_size: u32,
    pub loading_range: f32,
    pub debug_color: [f32; 4],
    pub origin: [f32; 2],
    /// Layer that consumes this layer's aggregates as input.
    pub parent: Option<String>,
}

impl Default for AggregateLayerSettings {
    fn default() -> Self {
        Self {
            name: "HLOD0".to_string(),
            cell_size: 25600,
            loading_range: 51200.0,
            debug_color: [0.2, 0.6, 1.0, 1.0],
            origin: [0.0, 0.0],
            parent: None,
        }
    }
}

impl AggregateLayerSettings {
    pub fn named(name: impl Into<String>, cell_size: u32) -> Self {
        Self {
            name: name.into(),
            cell_size,
            loading_range: cell_size as f32 * 2.0,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn grid_settings(&self) -> GridSettings {
        GridSettings {
            name: self.name.clone(),
            cell_size: self.cell_size,
            loading_range: self.loading_range,
            debug_color: self.debug_color,
            origin: self.origin,
            ..Default::default()
        }
    }

    /// Partition settings for this layer: its own grid with the world's
    /// placement thresholds.
    pub fn partition_settings(&self, base: &PartitionSettings) -> PartitionSettings {
        PartitionSettings {
            grids: vec![self.grid_settings()],
            ..base.clone()
        }
    }

    /// Hash of the settings that change generated geometry. Folded into
    /// every content hash of this layer.
    pub fn settings_hash(&self) -> u32 {
        let mut h = Fnv64::new();
        h.write_str(&self.name);
        h.write_u32(self.cell_size);
        h.write_f32(self.origin[0]);
        h.write_f32(self.origin[1]);
        hash::fold32(h.finish())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSettings {
    pub layers: Vec<AggregateLayerSettings>,
    /// Cell content carrying any of these layers gets no aggregate.
    pub excluded_content_layers: LayerSet,
}

impl AggregateSettings {
    pub fn opts_out(&self, layers: &LayerSet) -> bool {
        layers.contains_any(&self.excluded_content_layers)
    }

    /// Check the layer graph and every layer grid against `partition`.
    /// Returns the graph on success.
    pub fn validate(
        &self,
        partition: &PartitionSettings,
    ) -> Result<AggregateGraph, AggregateError> {
        let graph = AggregateGraph::new(&self.layers)?;
        for layer in &self.layers {
            layer.partition_settings(partition).validate()?;
        }
        Ok(graph)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_available_mb: u64,
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            min_available_mb: 1024,
        }
    }
}

/// Everything one build pass needs besides the world itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Overrides the world's own name in cell names.
    pub world_name: Option<String>,
    pub partition: PartitionSettings,
    pub expansion: ExpansionSettings,
    pub aggregates: AggregateSettings,
    pub reclaim: ReclaimSettings,
}

impl BuildSettings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SettingsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml_str(&text)?;
        tracing::debug!(
            path = %path.display(),
            grids = settings.partition.grids.len(),
            aggregate_layers = settings.aggregates.layers.len(),
            "loaded build settings"
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldgrid_stream::PartitionError;

    #[test]
    fn empty_yaml_gives_defaults() {
        let s = BuildSettings::from_yaml_str("{}").unwrap();
        assert_eq!(s, BuildSettings::default());
        assert_eq!(s.partition.grids[0].name, "MainGrid");
        assert_eq!(s.expansion.max_depth, 16);
        assert!(s.reclaim.enabled);
    }

    #[test]
    fn yaml_layers_and_exclusions() {
        let yaml = r#"
world_name: Overworld
partition:
  grids:
    - name: MainGrid
      cell_size: 6400
aggregates:
  excluded_content_layers: [interior]
  layers:
    - name: HLOD0
      cell_size: 25600
      parent: HLOD1
    - name: HLOD1
      cell_size: 102400
"#;
        let s = BuildSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(s.world_name.as_deref(), Some("Overworld"));
        assert_eq!(s.partition.grids[0].cell_size, 6400);
        assert_eq!(s.aggregates.layers.len(), 2);
        assert_eq!(s.aggregates.layers[0].parent.as_deref(), Some("HLOD1"));
        assert!(s.aggregates.opts_out(&LayerSet::from_names(["interior", "day"])));
        assert!(!s.aggregates.opts_out(&LayerSet::from_names(["day"])));
    }

    #[test]
    fn settings_hash_tracks_geometry_settings() {
        let a = AggregateLayerSettings::named("HLOD0", 25600);
        let mut b = a.clone();
        b.loading_range = 1.0;
        let mut c = a.clone();
        c.cell_size = 12800;
        assert_eq!(a.settings_hash(), b.settings_hash());
        assert_ne!(a.settings_hash(), c.settings_hash());
    }

    #[test]
    fn validate_checks_each_layer_grid() {
        let partition = PartitionSettings::default();
        let mut aggregates = AggregateSettings {
            layers: vec![
                AggregateLayerSettings::named("HLOD0", 400).with_parent("HLOD1"),
                AggregateLayerSettings::named("HLOD1", 1600),
            ],
            ..Default::default()
        };
        let graph = aggregates.validate(&partition).unwrap();
        assert_eq!(graph.len(), 2);

        aggregates.layers[1].cell_size = 0;
        assert!(matches!(
            aggregates.validate(&partition),
            Err(AggregateError::Grid(PartitionError::InvalidCellSize { .. }))
        ));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.yaml");
        std::fs::write(&path, "reclaim:\n  enabled: false\n").unwrap();
        let s = BuildSettings::load(&path).unwrap();
        assert!(!s.reclaim.enabled);
        assert!(matches!(
            BuildSettings::load(&dir.path().join("missing.yaml")),
            Err(SettingsError::Io(_))
        ));
    }
}
