//! Lease heartbeat
//!
//! One task per registration keeps the instance's lease alive:
//!
//! - `Active`: a keep-alive is sent every `keep_alive_interval`
//! - `Retrying`: a keep-alive failed; up to `max_retry` further attempts are
//!   made on the same lease with exponential backoff
//! - `Failed`: the lease is considered lost; a fresh lease is granted and the
//!   instance re-written under it, retrying with backoff until it succeeds
//!
//! The task only exits when its cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use waypoint_common::{Backoff, DiscoveryError, Result};
use waypoint_kv::{KvClient, KvError, LeaseId};

use crate::config::RegistryConfig;
use crate::metric;
use crate::registry::registration_error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatState {
    Active,
    Retrying,
    Failed,
}

impl std::fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatState::Active => write!(f, "active"),
            HeartbeatState::Retrying => write!(f, "retrying"),
            HeartbeatState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a registration's heartbeat
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeartbeatStatus {
    pub state: HeartbeatState,
    /// Lease the instance key is currently bound to
    pub lease_id: LeaseId,
    /// Number of times the registration was re-established under a new lease
    pub recoveries: u64,
    pub last_error: Option<String>,
}

/// Run one store call under `cancel` and a deadline.
async fn bounded<T, F>(cancel: &CancellationToken, budget: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, KvError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiscoveryError::Cancelled),
        result = tokio::time::timeout(budget, call) => match result {
            Ok(result) => result.map_err(registration_error),
            Err(_) => Err(DiscoveryError::Timeout(budget)),
        },
    }
}

/// Revoke `lease_id`, ignoring failures. Not bound to any cancellation
/// token so that it also runs on the cancel path.
pub(crate) async fn revoke_quietly(client: &dyn KvClient, lease_id: LeaseId, budget: Duration) {
    match tokio::time::timeout(budget, client.revoke(lease_id)).await {
        Ok(Ok(())) | Ok(Err(KvError::LeaseNotFound(_))) => {}
        Ok(Err(e)) => debug!(lease_id, "Failed to revoke lease: {}", e),
        Err(_) => debug!(lease_id, "Timed out revoking lease"),
    }
}

/// Grant a lease and write `value` under it. Each call is bounded by
/// `budget`. If the write fails, times out or is cancelled, the lease is
/// revoked again so that no orphan lease is left behind.
pub(crate) async fn register_with_kv(
    client: &dyn KvClient,
    key: &str,
    value: Vec<u8>,
    ttl: Duration,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<LeaseId> {
    let lease = bounded(cancel, budget, client.grant(ttl)).await?;
    match bounded(cancel, budget, client.put(key, value, Some(lease.id))).await {
        Ok(_) => Ok(lease.id),
        Err(e) => {
            revoke_quietly(client, lease.id, budget).await;
            Err(e)
        }
    }
}

pub(crate) struct Heartbeat {
    client: Arc<dyn KvClient>,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    interval: Duration,
    request_timeout: Duration,
    max_retry: u32,
    backoff: Backoff,
    cancel: CancellationToken,
    status: watch::Sender<HeartbeatStatus>,
}

impl Heartbeat {
    /// Start heartbeating `lease_id`, which `key` must already be bound to.
    pub(crate) fn spawn(
        client: Arc<dyn KvClient>,
        config: &RegistryConfig,
        key: String,
        value: Vec<u8>,
        lease_id: LeaseId,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, watch::Receiver<HeartbeatStatus>) {
        let (status, rx) = watch::channel(HeartbeatStatus {
            state: HeartbeatState::Active,
            lease_id,
            recoveries: 0,
            last_error: None,
        });
        let heartbeat = Self {
            client,
            key,
            value,
            ttl: config.register_ttl,
            interval: config.keep_alive_interval(),
            request_timeout: config.request_timeout(),
            max_retry: config.max_retry,
            backoff: config.backoff(),
            cancel,
            status,
        };
        (tokio::spawn(heartbeat.run()), rx)
    }

    async fn run(self) {
        debug!(key = %self.key, "Heartbeat started");
        loop {
            if !self.keep_alive_until_failure().await {
                break;
            }
            match self.retry_same_lease().await {
                None => break,
                Some(true) => continue,
                Some(false) => {
                    if !self.recover().await {
                        break;
                    }
                }
            }
        }
        debug!(key = %self.key, "Heartbeat stopped");
    }

    fn lease_id(&self) -> LeaseId {
        self.status.borrow().lease_id
    }

    fn publish(&self, state: HeartbeatState, last_error: Option<String>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.last_error = last_error;
        });
    }

    /// Sleep for `duration`; false if cancelled first.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// `None` if cancelled while the keep-alive was in flight. A keep-alive
    /// exceeding the request timeout counts as failed.
    async fn keep_alive(&self, lease_id: LeaseId) -> Option<std::result::Result<Duration, KvError>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.request_timeout, self.client.keep_alive(lease_id)) => {
                Some(result.unwrap_or_else(|_| {
                    Err(KvError::Unavailable(format!(
                        "keep-alive timed out after {:?}",
                        self.request_timeout
                    )))
                }))
            }
        }
    }

    /// Active state. Returns true once a keep-alive fails, false on cancel.
    async fn keep_alive_until_failure(&self) -> bool {
        loop {
            if !self.sleep(self.interval).await {
                return false;
            }
            let lease_id = self.lease_id();
            match self.keep_alive(lease_id).await {
                None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    metrics::counter!(metric::HEARTBEAT_FAILURES).increment(1);
                    warn!(key = %self.key, lease_id, "Keep-alive failed: {}", e);
                    self.publish(HeartbeatState::Retrying, Some(e.to_string()));
                    return true;
                }
            }
        }
    }

    /// Retrying state. `Some(true)` when the lease was kept, `Some(false)`
    /// when it has to be replaced, `None` on cancel.
    async fn retry_same_lease(&self) -> Option<bool> {
        let lease_id = self.lease_id();
        let mut last_error = None;
        let mut attempts = 1;
        for attempt in 0..self.max_retry {
            if !self.sleep(self.backoff.jittered(attempt)).await {
                return None;
            }
            attempts += 1;
            match self.keep_alive(lease_id).await? {
                Ok(_) => {
                    info!(key = %self.key, lease_id, attempt = attempt + 1, "Keep-alive restored");
                    self.publish(HeartbeatState::Active, None);
                    return Some(true);
                }
                Err(KvError::LeaseNotFound(_)) => {
                    last_error = Some(KvError::LeaseNotFound(lease_id));
                    break;
                }
                Err(e) => {
                    metrics::counter!(metric::HEARTBEAT_FAILURES).increment(1);
                    debug!(key = %self.key, lease_id, attempt = attempt + 1, "Keep-alive retry failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        let lost = DiscoveryError::LeaseLost { lease_id, attempts };
        error!(key = %self.key, "{}", lost);
        let reason = last_error.map_or_else(|| lost.to_string(), |e| format!("{}: {}", lost, e));
        self.publish(HeartbeatState::Failed, Some(reason));
        Some(false)
    }

    /// Failed state. Re-registers under a new lease until it succeeds.
    /// Returns false on cancel.
    async fn recover(&self) -> bool {
        let old_lease = self.lease_id();
        let mut attempt = 0u32;
        loop {
            let result = register_with_kv(
                self.client.as_ref(),
                &self.key,
                self.value.clone(),
                self.ttl,
                self.request_timeout,
                &self.cancel,
            )
            .await;
            match result {
                Ok(lease_id) => {
                    revoke_quietly(self.client.as_ref(), old_lease, self.request_timeout).await;
                    metrics::counter!(metric::LEASE_RECOVERIES).increment(1);
                    info!(key = %self.key, old_lease, lease_id, "Registration recovered under a new lease");
                    self.status.send_modify(|status| {
                        status.state = HeartbeatState::Active;
                        status.lease_id = lease_id;
                        status.recoveries += 1;
                        status.last_error = None;
                    });
                    return true;
                }
                Err(DiscoveryError::Cancelled) => return false,
                Err(e) => {
                    warn!(key = %self.key, attempt = attempt + 1, "Re-registration failed: {}", e);
                    self.status.send_modify(|status| {
                        status.last_error = Some(e.to_string());
                    });
                    if !self.sleep(self.backoff.jittered(attempt)).await {
                        return false;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
