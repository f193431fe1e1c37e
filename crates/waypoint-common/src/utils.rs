//! Utility functions for Waypoint

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DiscoveryError, Result};

/// Run `fut` until it completes or `cancel` fires.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiscoveryError::Cancelled),
        result = fut => result,
    }
}

/// Run `fut` with a time budget.
pub async fn with_timeout<F, T>(budget: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| DiscoveryError::Timeout(budget))?
}
