//! Backing store selection

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use waypoint_kv::{KvClient, MemoryKv};

use crate::config::{StoreConfig, StoreKind};

/// How often the in-memory store expires leases
const MEMORY_REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvClient>> {
    match config.kind {
        StoreKind::Memory => {
            warn!("Using the in-memory store: registrations are only visible to this process");
            Ok(Arc::new(MemoryKv::with_reaper(MEMORY_REAP_INTERVAL)))
        }
        StoreKind::Etcd => connect_etcd(config).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvClient>> {
    use waypoint_kv::{EtcdKv, EtcdOptions};

    if config.endpoints.is_empty() {
        anyhow::bail!("etcd store selected but no endpoints configured");
    }
    let options = EtcdOptions {
        dial_timeout: config.dial_timeout,
        username: config.username.clone(),
        password: config.password.clone(),
        ..Default::default()
    };
    let client = EtcdKv::connect(&config.endpoints, options).await?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &StoreConfig) -> anyhow::Result<Arc<dyn KvClient>> {
    anyhow::bail!("etcd store selected but waypoint-agent was built without the `etcd` feature")
}
