//! Test doubles shared by the inline tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use waypoint_kv::{
    KvClient, KvError, Lease, LeaseId, MemoryKv, RangeResponse, Revision, WatchStream,
};

/// `MemoryKv` whose writes and keep-alives can be made to hang forever,
/// like a store that accepts connections but never answers.
#[derive(Clone, Default)]
pub(crate) struct StallingKv {
    pub(crate) inner: MemoryKv,
    stall_put: Arc<AtomicBool>,
    stall_keep_alive: Arc<AtomicBool>,
}

impl StallingKv {
    pub(crate) fn new(inner: MemoryKv) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub(crate) fn stall_puts(&self, stall: bool) {
        self.stall_put.store(stall, Ordering::SeqCst);
    }

    pub(crate) fn stall_keep_alives(&self, stall: bool) {
        self.stall_keep_alive.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvClient for StallingKv {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, KvError> {
        if self.stall_put.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.put(key, value, lease).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, KvError> {
        self.inner.get_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        self.inner.delete(key).await
    }

    async fn grant(&self, ttl: Duration) -> Result<Lease, KvError> {
        self.inner.grant(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KvError> {
        if self.stall_keep_alive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.keep_alive(lease).await
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        self.inner.revoke(lease).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<Revision>,
    ) -> Result<WatchStream, KvError> {
        self.inner.watch_prefix(prefix, start_revision).await
    }
}
