//! Membership watcher
//!
//! Keeps a local view (key → instance) of one service prefix. The view is
//! seeded from a full read; the revision of that read is where the watch
//! stream starts, so no change between the two is lost. Every `next()`
//! returns the full view, never a delta.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_common::{Backoff, DiscoveryError, Result, ServiceInstance, Watcher, cancellable};
use waypoint_kv::{EventKind, KvClient, KvError, Revision, WatchBatch, WatchStream};

use crate::metric;
use crate::registry::{decode_entries, read_error};

type View = BTreeMap<String, ServiceInstance>;

async fn read_view(client: &dyn KvClient, prefix: &str) -> Result<(View, Revision)> {
    let resp = client.get_prefix(prefix).await.map_err(read_error)?;
    let view = decode_entries(
        resp.kvs
            .iter()
            .map(|kv| (kv.key.as_str(), kv.value.as_slice())),
    )
    .into_iter()
    .collect();
    Ok((view, resp.revision))
}

struct WatchState {
    view: View,
    /// Last revision reflected in `view`
    revision: Revision,
    stream: Option<WatchStream>,
    /// Set when the store compacted past `revision`
    needs_resync: bool,
    last_emitted: Option<Vec<ServiceInstance>>,
}

impl WatchState {
    fn apply(&mut self, batch: WatchBatch) {
        for event in batch.events {
            match event.kind {
                EventKind::Put => match ServiceInstance::decode(&event.key, &event.value) {
                    Ok(instance) => {
                        self.view.insert(event.key, instance);
                    }
                    Err(e) => {
                        metrics::counter!(metric::DECODE_ERRORS).increment(1);
                        warn!("Dropping undecodable instance from view: {}", e);
                        self.view.remove(&event.key);
                    }
                },
                EventKind::Delete => {
                    self.view.remove(&event.key);
                }
            }
        }
        self.revision = self.revision.max(batch.revision);
    }

    /// The current view, if it differs from what was handed out last.
    fn take_changed(&mut self) -> Option<Vec<ServiceInstance>> {
        let snapshot: Vec<ServiceInstance> = self.view.values().cloned().collect();
        if self.last_emitted.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last_emitted = Some(snapshot.clone());
        Some(snapshot)
    }
}

/// `Watcher` over a key-value watch stream.
///
/// Stream disconnects are handled internally: the watcher resumes from the
/// last revision it saw, or re-reads the prefix when that revision has been
/// compacted away. Callers only ever see `Stopped` or `Cancelled`.
pub struct KvWatcher {
    client: Arc<dyn KvClient>,
    prefix: String,
    backoff: Backoff,
    cancel: CancellationToken,
    stopped: CancellationToken,
    state: Mutex<WatchState>,
}

impl KvWatcher {
    /// Seed the view from a full read of `prefix` and open the watch stream.
    pub async fn start(
        client: Arc<dyn KvClient>,
        prefix: String,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (view, revision) = cancellable(&cancel, read_view(client.as_ref(), &prefix)).await?;
        let stream = cancellable(&cancel, async {
            client
                .watch_prefix(&prefix, Some(revision + 1))
                .await
                .map_err(read_error)
        })
        .await?;

        debug!(prefix = %prefix, revision, instances = view.len(), "Watcher started");
        Ok(Self {
            client,
            prefix,
            backoff,
            cancel,
            stopped: CancellationToken::new(),
            state: Mutex::new(WatchState {
                view,
                revision,
                stream: Some(stream),
                needs_resync: false,
                last_emitted: None,
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn check_open(&self) -> Result<()> {
        if self.stopped.is_cancelled() {
            Err(DiscoveryError::Stopped)
        } else if self.cancel.is_cancelled() {
            Err(DiscoveryError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn advance(&self, state: &mut WatchState) -> Vec<ServiceInstance> {
        loop {
            if let Some(snapshot) = state.take_changed() {
                return snapshot;
            }

            let Some(stream) = state.stream.as_mut() else {
                self.reconnect(state).await;
                continue;
            };

            match stream.next().await {
                Some(Ok(batch)) => {
                    state.apply(batch);
                    self.drain_ready(state);
                }
                Some(Err(e)) => self.on_stream_error(state, e),
                None => {
                    debug!(prefix = %self.prefix, revision = state.revision, "Watch stream closed");
                    state.stream = None;
                }
            }
        }
    }

    /// Apply every batch that is already buffered so a burst of changes
    /// yields one snapshot.
    fn drain_ready(&self, state: &mut WatchState) {
        loop {
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            match stream.next().now_or_never() {
                Some(Some(Ok(batch))) => state.apply(batch),
                Some(Some(Err(e))) => {
                    self.on_stream_error(state, e);
                    return;
                }
                Some(None) => {
                    state.stream = None;
                    return;
                }
                None => return,
            }
        }
    }

    fn on_stream_error(&self, state: &mut WatchState, err: KvError) {
        match err {
            KvError::Compacted { compacted, .. } => {
                info!(prefix = %self.prefix, revision = state.revision, compacted, "Watch revision compacted, resyncing");
                state.needs_resync = true;
            }
            other => warn!(prefix = %self.prefix, "Watch stream error: {}", other),
        }
        state.stream = None;
    }

    /// Drop the store watch if nobody is using it.
    fn release_stream(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.stream = None;
        }
    }

    /// Re-open the watch stream, re-reading the prefix first if needed.
    /// Retries with backoff until it succeeds; callers bound it with the
    /// cancellation tokens.
    async fn reconnect(&self, state: &mut WatchState) {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(self.backoff.jittered(attempt)).await;
            attempt = attempt.saturating_add(1);

            if state.needs_resync {
                match read_view(self.client.as_ref(), &self.prefix).await {
                    Ok((view, revision)) => {
                        metrics::counter!(metric::WATCH_RESYNCS).increment(1);
                        state.view = view;
                        state.revision = revision;
                        state.needs_resync = false;
                    }
                    Err(e) => {
                        warn!(prefix = %self.prefix, attempt, "Resync read failed: {}", e);
                        continue;
                    }
                }
            }

            match self
                .client
                .watch_prefix(&self.prefix, Some(state.revision + 1))
                .await
            {
                Ok(stream) => {
                    info!(prefix = %self.prefix, revision = state.revision, "Watch stream re-established");
                    state.stream = Some(stream);
                    return;
                }
                Err(KvError::Compacted { compacted, .. }) => {
                    info!(prefix = %self.prefix, compacted, "Resume revision compacted, resyncing");
                    state.needs_resync = true;
                }
                Err(e) => {
                    warn!(prefix = %self.prefix, attempt, "Failed to re-open watch: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl Watcher for KvWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if let Err(e) = self.check_open() {
            self.release_stream();
            return Err(e);
        }
        let result = tokio::select! {
            biased;
            _ = self.stopped.cancelled() => Err(DiscoveryError::Stopped),
            _ = self.cancel.cancelled() => Err(DiscoveryError::Cancelled),
            snapshot = async {
                let mut state = self.state.lock().await;
                self.advance(&mut state).await
            } => Ok(snapshot),
        };
        // The losing branch has released the lock by now
        if result.is_err() {
            self.release_stream();
        }
        result
    }

    fn stop(&self) -> Result<()> {
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        self.stopped.cancel();
        // A pending next() holds the lock and releases the stream itself
        self.release_stream();
        debug!(prefix = %self.prefix, "Watcher stopped");
        Ok(())
    }
}
