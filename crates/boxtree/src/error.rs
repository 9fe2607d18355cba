use boxtree_storage::StorageError;
use thiserror::Error;

/// An event could not be inserted.
#[derive(Clone, Error, Debug, PartialEq)]
pub enum InsertError {
    /// The event's coordinates lie outside the box it was routed to.
    #[error("Event at {coordinates:?} lies outside box {box_id}.")]
    OutOfBounds { box_id: u64, coordinates: Vec<f64> },

    /// The event has a different number of coordinates than the tree has
    /// dimensions.
    #[error("Event has {found} coordinates but the tree has {expected} dimensions.")]
    DimensionMismatch { expected: usize, found: usize },
}

/// The tree or one of its policies was configured inconsistently.
#[derive(Clone, Error, Debug, PartialEq)]
pub enum ConfigurationError {
    /// The split policy is frozen once the first event has been inserted.
    #[error("The split policy cannot change after events have been inserted.")]
    AlreadyInserted,

    #[error("Split threshold must be at least 1.")]
    InvalidSplitThreshold,

    /// `fan_out` must be at least 2, and `fan_out^dimensions` children must
    /// be representable.
    #[error("Fan-out {fan_out} is invalid for a {dimensions}-dimensional tree.")]
    InvalidFanOut { fan_out: usize, dimensions: usize },

    #[error("Maximum depth must be at least 1.")]
    InvalidMaxDepth,

    #[error("Invalid extents: {0}")]
    InvalidExtents(String),

    #[error("Memory release ratio {0} is outside (0, 1].")]
    InvalidReleaseRatio(f32),

    /// A new tree must start from an empty store.
    #[error("Cannot create a tree in a store that already holds {0} bytes.")]
    StoreNotEmpty(u64),

    /// A persisted tree was reopened with an incompatible event type.
    #[error("Store holds {found} events but the tree was opened for {expected} events.")]
    EventKindMismatch {
        expected: &'static str,
        found: String,
    },
}

/// Any error the box-tree can report.
#[derive(Clone, Error, Debug, PartialEq)]
pub enum BoxTreeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Insert(#[from] InsertError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl BoxTreeError {
    /// Whether the error was caused by unreadable or inconsistent persisted
    /// data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BoxTreeError::Storage(e) if e.is_corruption())
    }
}
