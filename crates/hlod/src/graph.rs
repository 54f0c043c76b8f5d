//! Dependency graph of aggregate layers. A layer feeds its parent, so
//! children are built first.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::AggregateError;
use crate::settings::AggregateLayerSettings;

#[derive(Debug, Clone)]
pub struct AggregateGraph {
    layers: BTreeMap<String, AggregateLayerSettings>,
    children: BTreeMap<String, Vec<String>>,
    depth: BTreeMap<String, u32>,
}

impl AggregateGraph {
    /// Validate the layer list and compute tiers. Duplicate names, unknown
    /// parents and cycles are errors.
    pub fn new(layers: &[AggregateLayerSettings]) -> Result<Self, AggregateError> {
        let mut by_name = BTreeMap::new();
        for layer in layers {
            if by_name.insert(layer.name.clone(), layer.clone()).is_some() {
                return Err(AggregateError::DuplicateLayer(layer.name.clone()));
            }
        }

        let mut children: BTreeMap<String, Vec<String>> =
            by_name.keys().map(|k| (k.clone(), Vec::new())).collect();
        for layer in by_name.values() {
            if let Some(parent) = &layer.parent {
                match children.get_mut(parent) {
                    Some(list) => list.push(layer.name.clone()),
                    None => {
                        return Err(AggregateError::UnresolvedParent {
                            layer: layer.name.clone(),
                            parent: parent.clone(),
                        });
                    }
                }
            }
        }

        let mut done = BTreeSet::new();
        for name in by_name.keys() {
            let mut visiting = Vec::new();
            detect_cycle_dfs(name, &by_name, &mut visiting, &mut done)?;
        }

        // Walk each parent chain, so a layer's depth ends up one more than
        // its deepest child.
        let mut depth: BTreeMap<String, u32> = by_name.keys().map(|k| (k.clone(), 0)).collect();
        for name in by_name.keys() {
            let mut d = 0;
            let mut current = name;
            while let Some(parent) = by_name.get(current).and_then(|l| l.parent.as_ref()) {
                d += 1;
                let entry = depth.entry(parent.clone()).or_insert(0);
                *entry = (*entry).max(d);
                current = parent;
            }
        }

        Ok(Self {
            layers: by_name,
            children,
            depth,
        })
    }

    /// Layers grouped by depth, leaves first, sorted by name within a tier.
    pub fn tiers(&self) -> Vec<Vec<&AggregateLayerSettings>> {
        let max = self.depth.values().copied().max();
        let Some(max) = max else {
            return Vec::new();
        };
        (0..=max)
            .map(|tier| {
                self.layers
                    .values()
                    .filter(|l| self.depth.get(&l.name) == Some(&tier))
                    .collect()
            })
            .collect()
    }

    pub fn children(&self, layer: &str) -> &[String] {
        self.children.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn depth(&self, layer: &str) -> Option<u32> {
        self.depth.get(layer).copied()
    }

    pub fn get(&self, layer: &str) -> Option<&AggregateLayerSettings> {
        self.layers.get(layer)
    }

    pub fn contains(&self, layer: &str) -> bool {
        self.layers.contains_key(layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Depth-first walk along parent edges. `visiting` is the current path; a
/// layer met again while still on the path closes a cycle.
fn detect_cycle_dfs(
    name: &str,
    layers: &BTreeMap<String, AggregateLayerSettings>,
    visiting: &mut Vec<String>,
    done: &mut BTreeSet<String>,
) -> Result<(), AggregateError> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(pos) = visiting.iter().position(|v| v == name) {
        let mut path: Vec<String> = visiting[pos..].to_vec();
        path.push(name.to_string());
        tracing::error!(cycle = ?path, "aggregate layer graph is cyclic");
        return Err(AggregateError::Cycle { path });
    }
    visiting.push(name.to_string());
    if let Some(parent) = layers.get(name).and_then(|l| l.parent.as_deref()) {
        detect_cycle_dfs(parent, layers, visiting, done)?;
    }
    visiting.pop();
    done.insert(name.to_string());
    Ok(())
}
