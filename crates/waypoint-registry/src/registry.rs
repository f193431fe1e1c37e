//! Registry: registration lifecycle and discovery over a `KvClient`

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_common::model::service_prefix;
use waypoint_common::{
    Discovery, DiscoveryError, Result, ServiceInstance, Watcher, cancellable,
};
use waypoint_kv::{KvClient, KvError, LeaseId};

use crate::config::RegistryConfig;
use crate::heartbeat::{
    Heartbeat, HeartbeatState, HeartbeatStatus, register_with_kv, revoke_quietly,
};
use crate::metric;
use crate::watcher::KvWatcher;

/// A live registration owned by the registry
struct Registration {
    cancel: CancellationToken,
    status: watch::Receiver<HeartbeatStatus>,
    task: JoinHandle<()>,
}

impl Registration {
    /// Stop the heartbeat and wait for it, so it cannot write the key again.
    /// Returns the lease the key was last bound to.
    async fn stop(self) -> LeaseId {
        let Registration {
            cancel,
            status,
            task,
        } = self;
        cancel.cancel();
        if let Err(e) = task.await
            && e.is_panic()
        {
            warn!("Heartbeat task panicked: {}", e);
        }
        status.borrow().lease_id
    }
}

/// Maps store errors for register/deregister calls.
pub(crate) fn registration_error(e: KvError) -> DiscoveryError {
    match e {
        KvError::Unavailable(msg) => DiscoveryError::Connect(msg),
        other => DiscoveryError::Registration(other.to_string()),
    }
}

/// Maps store errors for read paths.
pub(crate) fn read_error(e: KvError) -> DiscoveryError {
    match e {
        KvError::Unavailable(msg) => DiscoveryError::Connect(msg),
        other => DiscoveryError::Other(other.into()),
    }
}

/// Decode every entry of a prefix read, skipping the ones that fail.
pub(crate) fn decode_entries<'a, I>(entries: I) -> Vec<(String, ServiceInstance)>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    entries
        .into_iter()
        .filter_map(|(key, value)| match ServiceInstance::decode(key, value) {
            Ok(instance) => Some((key.to_string(), instance)),
            Err(e) => {
                metrics::counter!(metric::DECODE_ERRORS).increment(1);
                warn!("Skipping registry entry: {}", e);
                None
            }
        })
        .collect()
}

/// Service registry backed by a consistent key-value store.
///
/// Each registered instance is written under `{namespace}/{name}/{id}`,
/// bound to a lease that a dedicated heartbeat task keeps alive. Dropping
/// the registry stops every heartbeat; the keys then disappear when their
/// leases expire.
pub struct Registry {
    client: Arc<dyn KvClient>,
    config: RegistryConfig,
    registrations: DashMap<String, Registration>,
    /// Serializes register/deregister of the same key
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    pub fn new(client: Arc<dyn KvClient>, config: RegistryConfig) -> Self {
        Self {
            client,
            config,
            registrations: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `instance` and keep it alive until `cancel` fires or the
    /// instance is deregistered.
    pub async fn register(&self, cancel: &CancellationToken, instance: &ServiceInstance) -> Result<()> {
        instance.validate()?;
        let key = instance.key(&self.config.namespace);
        let value = instance.encode()?;

        let guard = self.lock_key(cancel, &key).await?;
        let result = self.register_locked(cancel, &key, value).await;
        drop(guard);
        self.release_key(&key);
        result
    }

    async fn register_locked(&self, cancel: &CancellationToken, key: &str, value: Vec<u8>) -> Result<()> {
        // Same (name, id) again: the old heartbeat must not outlive its key
        if let Some((_, previous)) = self.registrations.remove(key) {
            let old_lease = previous.stop().await;
            debug!(key = %key, lease_id = old_lease, "Replacing existing registration");
            revoke_quietly(self.client.as_ref(), old_lease, self.config.request_timeout()).await;
        }

        let lease_id = register_with_kv(
            self.client.as_ref(),
            key,
            value.clone(),
            self.config.register_ttl,
            self.config.request_timeout(),
            cancel,
        )
        .await?;

        let heartbeat_cancel = cancel.child_token();
        let (task, status) = Heartbeat::spawn(
            self.client.clone(),
            &self.config,
            key.to_string(),
            value,
            lease_id,
            heartbeat_cancel.clone(),
        );

        info!(
            key = %key,
            lease_id,
            ttl_secs = self.config.register_ttl.as_secs(),
            "Registered service instance"
        );
        self.registrations.insert(
            key.to_string(),
            Registration {
                cancel: heartbeat_cancel,
                status,
                task,
            },
        );
        Ok(())
    }

    /// Remove `instance` from the registry. Deregistering an instance that
    /// is not registered, or whose lease already expired, succeeds.
    pub async fn deregister(&self, cancel: &CancellationToken, instance: &ServiceInstance) -> Result<()> {
        let key = instance.key(&self.config.namespace);

        let guard = self.lock_key(cancel, &key).await?;
        let result = self.deregister_locked(cancel, &key).await;
        drop(guard);
        self.release_key(&key);
        result
    }

    async fn deregister_locked(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        let lease_id = match self.registrations.remove(key) {
            Some((_, registration)) => Some(registration.stop().await),
            None => None,
        };

        cancellable(cancel, async {
            self.client.delete(key).await.map_err(registration_error)?;
            if let Some(lease_id) = lease_id {
                match self.client.revoke(lease_id).await {
                    Ok(()) | Err(KvError::LeaseNotFound(_)) => {}
                    Err(e) => return Err(registration_error(e)),
                }
            }
            Ok(())
        })
        .await?;

        info!(key = %key, "Deregistered service instance");
        Ok(())
    }

    async fn lock_key(&self, cancel: &CancellationToken, key: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let guard = cancellable(cancel, async { Ok(lock.lock_owned().await) }).await;
        if guard.is_err() {
            self.release_key(key);
        }
        guard
    }

    /// Forget the lock of `key` once nobody holds or waits for it.
    fn release_key(&self, key: &str) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Current heartbeat state of a registered instance.
    pub fn heartbeat_state(&self, instance: &ServiceInstance) -> Option<HeartbeatState> {
        self.registrations
            .get(&instance.key(&self.config.namespace))
            .map(|r| r.status.borrow().state)
    }

    /// Follow the heartbeat of a registered instance.
    pub fn subscribe_heartbeat(
        &self,
        instance: &ServiceInstance,
    ) -> Option<watch::Receiver<HeartbeatStatus>> {
        self.registrations
            .get(&instance.key(&self.config.namespace))
            .map(|r| r.status.clone())
    }

    /// Number of instances registered through this registry.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Stop every heartbeat without touching the stored keys.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            if let Some((_, registration)) = self.registrations.remove(&key) {
                registration.stop().await;
            }
        }
        info!("Registry shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for registration in self.registrations.iter() {
            registration.cancel.cancel();
        }
    }
}

#[async_trait]
impl Discovery for Registry {
    async fn get_service(&self, cancel: &CancellationToken, name: &str) -> Result<Vec<ServiceInstance>> {
        let prefix = service_prefix(&self.config.namespace, name);
        let resp = cancellable(cancel, async {
            self.client.get_prefix(&prefix).await.map_err(read_error)
        })
        .await?;

        let instances = decode_entries(
            resp.kvs
                .iter()
                .map(|kv| (kv.key.as_str(), kv.value.as_slice())),
        )
        .into_iter()
        .map(|(_, instance)| instance)
        .collect();
        Ok(instances)
    }

    async fn watch(&self, cancel: &CancellationToken, name: &str) -> Result<Box<dyn Watcher>> {
        let watcher = KvWatcher::start(
            self.client.clone(),
            service_prefix(&self.config.namespace, name),
            self.config.backoff(),
            cancel.clone(),
        )
        .await?;
        Ok(Box::new(watcher))
    }
}
