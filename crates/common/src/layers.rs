use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash;

/// Compact identity of a [`LayerSet`], stable across runs. The empty set is
/// always [`LayerSetId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerSetId(pub u32);

impl LayerSetId {
    pub const NONE: LayerSetId = LayerSetId(0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::UpperHex for LayerSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// Sorted set of data-layer names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerSet(BTreeSet<String>);

impl LayerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn contains_any(&self, other: &LayerSet) -> bool {
        other.0.iter().any(|n| self.0.contains(n))
    }

    pub fn union(&self, other: &LayerSet) -> LayerSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn extend_from(&mut self, other: &LayerSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// FNV-1a over the sorted names, each followed by a zero byte. Never
    /// returns [`LayerSetId::NONE`] for a non-empty set.
    pub fn fingerprint(&self) -> LayerSetId {
        if self.0.is_empty() {
            return LayerSetId::NONE;
        }
        let mut bytes = Vec::new();
        for name in &self.0 {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }
        match hash::fnv1a32(&bytes) {
            0 => LayerSetId(1),
            h => LayerSetId(h),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for LayerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_names(iter)
    }
}

impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}")?;
        }
        write!(f, "]")
    }
}
