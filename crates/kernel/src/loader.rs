//! Container loading collaborator and the barrier that waits on a batch of
//! loads before expansion continues.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::container::Container;
use crate::world::World;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("loading container '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
    #[error("loader dropped pending requests: {missing:?}")]
    Disconnected { missing: Vec<String> },
}

pub type LoadResult = Result<Arc<Container>, LoadError>;

/// Completion callback. Invoked exactly once per request, either before
/// `request` returns or later from any thread.
pub type LoadCallback = Box<dyn FnOnce(LoadResult) + Send>;

/// Resolves container names to loaded containers.
pub trait ContainerLoader {
    fn request(&mut self, name: &str, on_loaded: LoadCallback);
}

/// Serves containers that are already resident in a [`World`].
#[derive(Debug, Clone, Default)]
pub struct WorldLoader {
    containers: BTreeMap<String, Arc<Container>>,
}

impl WorldLoader {
    pub fn new(world: &World) -> Self {
        Self {
            containers: world
                .containers()
                .map(|c| (c.name.clone(), Arc::new(c.clone())))
                .collect(),
        }
    }
}

impl ContainerLoader for WorldLoader {
    fn request(&mut self, name: &str, on_loaded: LoadCallback) {
        let result = self
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_string()));
        on_loaded(result);
    }
}

/// Collects the completions of a batch of load requests. Nothing downstream
/// sees partial data: [`LoadBarrier::wait_all`] returns only once every
/// request has completed.
pub struct LoadBarrier {
    tx: Sender<(String, LoadResult)>,
    rx: Receiver<(String, LoadResult)>,
    pending: BTreeSet<String>,
}

impl LoadBarrier {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            pending: BTreeSet::new(),
        }
    }

    /// Request `name` unless it is already pending in this batch.
    pub fn request(&mut self, loader: &mut dyn ContainerLoader, name: &str) {
        if !self.pending.insert(name.to_string()) {
            return;
        }
        tracing::trace!(container = name, "load requested");
        let tx = self.tx.clone();
        let key = name.to_string();
        loader.request(
            name,
            Box::new(move |result| {
                // the barrier may already have given up on this batch
                let _ = tx.send((key, result));
            }),
        );
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Block until every requested load has completed.
    pub fn wait_all(self) -> Result<BTreeMap<String, LoadResult>, LoadError> {
        let LoadBarrier {
            tx,
            rx,
            mut pending,
        } = self;
        drop(tx);
        let mut out = BTreeMap::new();
        while !pending.is_empty() {
            match rx.recv() {
                Ok((name, result)) => {
                    pending.remove(&name);
                    out.insert(name, result);
                }
                Err(_) => {
                    return Err(LoadError::Disconnected {
                        missing: pending.into_iter().collect(),
                    });
                }
            }
        }
        Ok(out)
    }
}

impl Default for LoadBarrier {
    fn default() -> Self {
        Self::new()
    }
}
