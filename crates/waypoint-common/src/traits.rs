//! Discovery capability traits
//!
//! Consumers such as the resolver depend only on these two traits, never on
//! a concrete backing store.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::ServiceInstance;

/// A live subscription to the membership of one service name.
///
/// Every successful `next()` yields the full current membership, never a
/// delta.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Block until the next membership snapshot is available.
    ///
    /// Returns `DiscoveryError::Stopped` once `stop()` has been called and
    /// `DiscoveryError::Cancelled` once the token given to `watch` fires.
    async fn next(&self) -> Result<Vec<ServiceInstance>>;

    /// Stop the watcher. Idempotent; unblocks any pending `next()`.
    fn stop(&self) -> Result<()>;
}

/// Read side of the registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// One-shot listing of the currently registered instances of `name`.
    async fn get_service(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Vec<ServiceInstance>>;

    /// Start watching the membership of `name`.
    async fn watch(&self, cancel: &CancellationToken, name: &str) -> Result<Box<dyn Watcher>>;
}
