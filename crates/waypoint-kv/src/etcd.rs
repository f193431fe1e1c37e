//! etcd v3 backend

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::client::{
    EventKind, KeyValue, KvClient, Lease, LeaseId, RangeResponse, Revision, WatchBatch,
    WatchEvent, WatchStream,
};
use crate::error::KvError;

/// Connection options for the etcd backend
#[derive(Clone, Debug)]
pub struct EtcdOptions {
    pub dial_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            username: None,
            password: None,
        }
    }
}

/// `KvClient` backed by an etcd cluster.
///
/// `etcd_client::Client` is a cheap handle over a shared channel, so every
/// call works on its own clone.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connect to the given etcd endpoints.
    pub async fn connect(endpoints: &[String], options: EtcdOptions) -> Result<Self, KvError> {
        let mut connect_options = ConnectOptions::new()
            .with_connect_timeout(options.dial_timeout)
            .with_keep_alive(options.keep_alive_interval, options.keep_alive_timeout);
        if let (Some(user), Some(password)) = (options.username, options.password) {
            connect_options = connect_options.with_user(user, password);
        }

        let client = Client::connect(endpoints, Some(connect_options))
            .await
            .map_err(|e| KvError::Unavailable(format!("failed to connect to etcd: {}", e)))?;

        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

const GRPC_DEADLINE_EXCEEDED: i32 = 4;
const GRPC_UNAVAILABLE: i32 = 14;

fn classify(err: etcd_client::Error, lease: Option<LeaseId>) -> KvError {
    match err {
        etcd_client::Error::GRpcStatus(status) => {
            if let Some(id) = lease
                && status.message().contains("lease not found")
            {
                return KvError::LeaseNotFound(id);
            }
            let code: i32 = status.code().into();
            match code {
                GRPC_UNAVAILABLE | GRPC_DEADLINE_EXCEEDED => {
                    KvError::Unavailable(status.message().to_string())
                }
                _ => KvError::Other(status.to_string()),
            }
        }
        etcd_client::Error::TransportError(e) => KvError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => KvError::Unavailable(e.to_string()),
        other => KvError::Other(other.to_string()),
    }
}

fn batch_from_response(resp: &WatchResponse) -> Option<WatchBatch> {
    let events: Vec<WatchEvent> = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => EventKind::Put,
                EventType::Delete => EventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
        })
        .collect();
    let revision = events.iter().map(|e| e.mod_revision).max()?;
    Some(WatchBatch { revision, events })
}

#[async_trait]
impl KvClient for EtcdKv {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, KvError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = self
            .client
            .clone()
            .put(key, value, options)
            .await
            .map_err(|e| classify(e, lease))?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, KvError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| classify(e, None))?;

        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                lease: (kv.lease() != 0).then_some(kv.lease()),
                create_revision: kv.create_revision(),
                mod_revision: kv.mod_revision(),
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        let resp = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn grant(&self, ttl: Duration) -> Result<Lease, KvError> {
        // etcd leases have whole-second granularity
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .client
            .clone()
            .lease_grant(secs, None)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(Lease {
            id: resp.id(),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KvError> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(|e| classify(e, Some(lease)))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| classify(e, Some(lease)))?;

        match stream.message().await.map_err(|e| classify(e, Some(lease)))? {
            Some(resp) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
            Some(_) => Err(KvError::LeaseNotFound(lease)),
            None => Err(KvError::Unavailable("keep-alive stream closed".to_string())),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        self.client
            .clone()
            .lease_revoke(lease)
            .await
            .map_err(|e| classify(e, Some(lease)))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<Revision>,
    ) -> Result<WatchStream, KvError> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix, Some(options))
            .await
            .map_err(|e| classify(e, None))?;

        let (tx, rx) = mpsc::channel::<Result<WatchBatch, KvError>>(64);
        let prefix = prefix.to_string();

        // Forward etcd responses until either side goes away; the watcher
        // handle lives in the task so the server-side watch stays open.
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let compacted = resp.compact_revision();
                            if compacted > 0 {
                                let _ = tx
                                    .send(Err(KvError::Compacted {
                                        requested: start_revision.unwrap_or_default(),
                                        compacted,
                                    }))
                                    .await;
                            } else {
                                warn!(prefix = %prefix, "etcd cancelled the watch: {}", resp.cancel_reason());
                            }
                            break;
                        }
                        if let Some(batch) = batch_from_response(&resp)
                            && tx.send(Ok(batch)).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(classify(e, None))).await;
                        break;
                    }
                }
            }
            debug!(prefix = %prefix, "etcd watch forwarder ended");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
