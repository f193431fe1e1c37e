//! Error types for Waypoint
//!
//! `DiscoveryError` is shared by the registry, the watcher and the resolver so
//! that consumers of the `Discovery` trait see one taxonomy regardless of the
//! backing store.

use std::time::Duration;

/// Errors surfaced by registration, discovery and resolution
#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("cannot reach the backing store: {0}")]
    Connect(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("lease {lease_id} lost after {attempts} keep-alive attempts")]
    LeaseLost { lease_id: i64, attempts: u32 },

    #[error("watch stream error: {0}")]
    WatchStream(String),

    #[error("failed to decode instance at '{key}': {reason}")]
    Decode { key: String, reason: String },

    #[error("invalid service instance: {0}")]
    InvalidInstance(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("watcher stopped")]
    Stopped,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DiscoveryError {
    /// Whether the error ends the operation for good rather than describing
    /// a condition that a retry may clear.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryError::Cancelled | DiscoveryError::Stopped)
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
