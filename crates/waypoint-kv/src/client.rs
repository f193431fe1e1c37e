//! `KvClient` trait and the value types it exchanges

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::KvError;

pub type LeaseId = i64;
pub type Revision = i64;

/// A stored key with its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub lease: Option<LeaseId>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

/// Result of a prefix read, with the store revision it was served at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: Revision,
}

/// A granted lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
    pub mod_revision: Revision,
}

/// All events of one store revision that match a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Stream of watch batches. The stream ending means the watch was
/// disconnected; callers reconnect from the last seen revision.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch, KvError>> + Send>>;

/// Client of a strongly-consistent key-value store with leases and watches.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Write `key`, optionally bound to `lease`. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
    -> Result<Revision, KvError>;

    /// Read every key starting with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, KvError>;

    /// Delete `key`. Returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64, KvError>;

    /// Grant a lease with the given time-to-live.
    async fn grant(&self, ttl: Duration) -> Result<Lease, KvError>;

    /// Refresh a lease once. Returns the renewed time-to-live.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KvError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Watch every key starting with `prefix`, replaying history from
    /// `start_revision` when given.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<Revision>,
    ) -> Result<WatchStream, KvError>;
}
