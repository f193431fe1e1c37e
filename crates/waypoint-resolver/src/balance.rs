//! tonic balance-channel adapter
//!
//! `Channel::balance_channel` is driven by a stream of `Change::Insert` /
//! `Change::Remove` messages keyed by address. `BalanceSink` diffs every
//! published state against what it has already announced and sends only
//! the difference.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;
use tracing::{debug, warn};
use waypoint_common::{DiscoveryError, Result};

use crate::address::{Address, ResolverState};
use crate::sink::UpdateSink;

/// Hook applied to every endpoint before it is handed to the channel, e.g.
/// to set TLS credentials or connect timeouts.
pub type EndpointCustomizer = Arc<dyn Fn(Endpoint) -> anyhow::Result<Endpoint> + Send + Sync>;

/// `UpdateSink` feeding a tonic balance channel.
pub struct BalanceSink {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    uri_scheme: &'static str,
    customizer: Option<EndpointCustomizer>,
    announced: Mutex<HashSet<String>>,
}

impl BalanceSink {
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>, secure: bool) -> Self {
        Self {
            tx,
            uri_scheme: if secure { "https" } else { "http" },
            customizer: None,
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_customizer(mut self, customizer: EndpointCustomizer) -> Self {
        self.customizer = Some(customizer);
        self
    }

    fn endpoint(&self, address: &Address) -> Result<Endpoint> {
        let uri = format!("{}://{}", self.uri_scheme, address.addr);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| DiscoveryError::Other(anyhow!("invalid endpoint '{}': {}", uri, e)))?;
        match &self.customizer {
            Some(customize) => customize(endpoint).map_err(DiscoveryError::Other),
            None => Ok(endpoint),
        }
    }

    fn send(&self, change: Change<String, Endpoint>) -> Result<()> {
        self.tx
            .try_send(change)
            .map_err(|e| DiscoveryError::Other(anyhow!("balance channel rejected change: {}", e)))
    }
}

impl UpdateSink for BalanceSink {
    fn update_state(&self, state: ResolverState) -> Result<()> {
        let mut announced = self.announced.lock();
        let wanted = state.endpoint_set();

        let removed: Vec<String> = announced
            .iter()
            .filter(|addr| !wanted.contains(*addr))
            .cloned()
            .collect();
        for addr in removed {
            debug!(addr = %addr, "Removing endpoint from balance channel");
            self.send(Change::Remove(addr.clone()))?;
            announced.remove(&addr);
        }

        for address in &state.addresses {
            if announced.contains(&address.addr) {
                continue;
            }
            let endpoint = match self.endpoint(address) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(addr = %address.addr, "Skipping endpoint: {}", e);
                    continue;
                }
            };
            debug!(addr = %address.addr, "Adding endpoint to balance channel");
            self.send(Change::Insert(address.addr.clone(), endpoint))?;
            announced.insert(address.addr.clone());
        }
        Ok(())
    }
}
