use serde::{Deserialize, Serialize};
use worldgrid_common::hash::{self, Fnv64};
use worldgrid_common::{Aabb, LayerSet, ObjectId, SurfaceHandle, Transform};

/// How a nested container contributes to partitioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Contents are clustered individually; bounds are the union of contents.
    #[default]
    Partitioned,
    /// The whole container loads as one unit with the bounds of its placement.
    Embedded,
}

/// Marks a record as the placement of another container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container: String,
    #[serde(default)]
    pub cluster_mode: ClusterMode,
}

fn default_true() -> bool {
    true
}

/// Descriptor of one placed object. Bounds and transform are expressed in the
/// space of the owning container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedObjectRecord {
    pub id: ObjectId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub transform: Transform,
    pub bounds: Aabb,
    /// `false` means the object is resident whenever its container is.
    #[serde(default = "default_true")]
    pub spatially_loaded: bool,
    /// Named grid affinity; `None` means the default grid.
    #[serde(default)]
    pub runtime_grid: Option<String>,
    #[serde(default)]
    pub layers: LayerSet,
    /// Hard references to records in the same container.
    #[serde(default)]
    pub references: Vec<ObjectId>,
    #[serde(default)]
    pub editor_only: bool,
    /// Aggregate layer this object feeds, if any.
    #[serde(default)]
    pub aggregate_layer: Option<String>,
    #[serde(default)]
    pub surfaces: Vec<SurfaceHandle>,
    #[serde(default)]
    pub instance: Option<ContainerRef>,
}

impl PlacedObjectRecord {
    pub fn new(id: ObjectId, bounds: Aabb) -> Self {
        Self {
            id,
            label: String::new(),
            transform: Transform::default(),
            bounds,
            spatially_loaded: true,
            runtime_grid: None,
            layers: LayerSet::new(),
            references: Vec::new(),
            editor_only: false,
            aggregate_layer: None,
            surfaces: Vec::new(),
            instance: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_references(mut self, references: impl IntoIterator<Item = ObjectId>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn with_layers(mut self, layers: LayerSet) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_grid(mut self, grid: impl Into<String>) -> Self {
        self.runtime_grid = Some(grid.into());
        self
    }

    pub fn always_loaded(mut self) -> Self {
        self.spatially_loaded = false;
        self
    }

    pub fn editor_only(mut self) -> Self {
        self.editor_only = true;
        self
    }

    pub fn with_aggregate_layer(mut self, layer: impl Into<String>) -> Self {
        self.aggregate_layer = Some(layer.into());
        self
    }

    pub fn with_surfaces(mut self, surfaces: impl IntoIterator<Item = SurfaceHandle>) -> Self {
        self.surfaces.extend(surfaces);
        self
    }

    pub fn instancing(mut self, container: impl Into<String>, cluster_mode: ClusterMode) -> Self {
        self.instance = Some(ContainerRef {
            container: container.into(),
            cluster_mode,
        });
        self
    }

    pub fn is_container_instance(&self) -> bool {
        self.instance.is_some()
    }

    /// Hash of everything that changes how this object looks from afar.
    pub fn component_hash(&self) -> u32 {
        let mut h = Fnv64::new();
        h.write(self.id.as_bytes());
        self.transform.hash_into(&mut h);
        for v in self.bounds.min.to_array().into_iter().chain(self.bounds.max.to_array()) {
            h.write_f32(v);
        }
        h.write_u64(self.surfaces.len() as u64);
        for s in &self.surfaces {
            h.write_u64(s.0);
        }
        hash::fold32(h.finish())
    }
}
