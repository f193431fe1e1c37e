//! Key-value client error types

use crate::client::{LeaseId, Revision};

/// Error type for key-value client operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("{0}")]
    Other(String),
}

impl KvError {
    /// Whether the error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KvError::Unavailable(_))
    }
}
