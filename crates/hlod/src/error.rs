use worldgrid_stream::PartitionError;

/// Fatal aggregate configuration errors. Data problems inside a pass are
/// logged and skipped instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    #[error("aggregate layer '{0}' is declared more than once")]
    DuplicateLayer(String),
    #[error("aggregate layer '{layer}' names unknown parent '{parent}'")]
    UnresolvedParent { layer: String, parent: String },
    #[error("aggregate layer graph has a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("aggregate layer grid is invalid: {0}")]
    Grid(#[from] PartitionError),
}
