//! In-memory key-value store
//!
//! Behaves like a single-node etcd: every mutation bumps a global revision,
//! keys can be bound to expiring leases, and watches can replay retained
//! history from a start revision. Expired leases are collected lazily on
//! every call and, when a reaper is started, periodically in the background
//! so that watchers observe the resulting deletes.
//!
//! Fault injection hooks (`set_available`, `fail_next_keep_alives`,
//! `expire_lease`, `disconnect_watchers`, `compact`) make it usable as a test
//! double for partition and lease-loss scenarios.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::client::{
    EventKind, KeyValue, KvClient, Lease, LeaseId, RangeResponse, Revision, WatchBatch,
    WatchEvent, WatchStream,
};
use crate::error::KvError;

/// Number of revisions kept for watch replay before compaction.
const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchSlot {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchBatch, KvError>>,
}

struct State {
    revision: Revision,
    compacted: Revision,
    next_lease: LeaseId,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchBatch>,
    history_limit: usize,
    watchers: Vec<WatchSlot>,
    available: bool,
    keep_alive_failures: u32,
}

impl State {
    fn new() -> Self {
        Self {
            revision: 0,
            compacted: 0,
            next_lease: 0,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            watchers: Vec::new(),
            available: true,
            keep_alive_failures: 0,
        }
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory store is partitioned".to_string()))
        }
    }

    /// Record one revision worth of events and fan it out to watchers.
    fn commit(&mut self, events: Vec<(EventKind, String, Vec<u8>)>) -> Revision {
        if events.is_empty() {
            return self.revision;
        }
        self.revision += 1;
        let revision = self.revision;
        let batch = WatchBatch {
            revision,
            events: events
                .into_iter()
                .map(|(kind, key, value)| WatchEvent {
                    kind,
                    key,
                    value,
                    mod_revision: revision,
                })
                .collect(),
        };

        self.watchers.retain(|slot| match filter_batch(&batch, &slot.prefix) {
            Some(filtered) => slot.tx.send(Ok(filtered)).is_ok(),
            None => !slot.tx.is_closed(),
        });

        self.history.push_back(batch);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
        revision
    }

    fn remove_key(&mut self, key: &str) -> Option<KeyValue> {
        let removed = self.data.remove(key)?;
        if let Some(lease_id) = removed.lease
            && let Some(lease) = self.leases.get_mut(&lease_id)
        {
            lease.keys.remove(key);
        }
        Some(removed)
    }

    /// Drop a lease and every key bound to it as a single revision.
    fn drop_lease(&mut self, lease_id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        let events = lease
            .keys
            .into_iter()
            .filter(|key| self.data.remove(key).is_some())
            .map(|key| (EventKind::Delete, key, Vec::new()))
            .collect();
        self.commit(events);
        true
    }

    fn expire(&mut self, now: Instant) {
        let mut expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for lease_id in expired {
            debug!(lease_id, "Lease expired");
            self.drop_lease(lease_id);
        }
    }
}

fn filter_batch(batch: &WatchBatch, prefix: &str) -> Option<WatchBatch> {
    let events: Vec<WatchEvent> = batch
        .events
        .iter()
        .filter(|event| event.key.starts_with(prefix))
        .cloned()
        .collect();
    if events.is_empty() {
        return None;
    }
    Some(WatchBatch {
        revision: batch.revision,
        events,
    })
}

/// Lease-aware, revision-tracking in-memory store.
///
/// Cloning is cheap; clones share the same data.
#[derive(Clone)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
}

impl MemoryKv {
    /// Create a store that expires leases lazily, on access.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Create a store with a background reaper expiring leases every
    /// `interval`. Must be called from within a tokio runtime. The reaper
    /// exits once every clone of the store has been dropped.
    pub fn with_reaper(interval: Duration) -> Self {
        let store = Self::new();
        let weak: Weak<Mutex<State>> = Arc::downgrade(&store.state);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(state) => state.lock().expire(Instant::now()),
                    None => break,
                }
            }
        });

        store
    }

    /// Limit the number of revisions retained for watch replay.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = limit.max(1);
        self
    }

    /// Simulate a network partition (`false`) or its end (`true`).
    ///
    /// While unavailable every call fails and open watch streams are closed.
    /// Leases keep ageing, exactly like a real server that cannot hear from
    /// its client.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            state.watchers.clear();
        }
    }

    /// Make the next `count` keep-alive calls fail as if the network dropped.
    pub fn fail_next_keep_alives(&self, count: u32) {
        self.state.lock().keep_alive_failures = count;
    }

    /// Expire a lease immediately, deleting its keys.
    pub fn expire_lease(&self, lease_id: LeaseId) -> bool {
        self.state.lock().drop_lease(lease_id)
    }

    /// Close every open watch stream without touching the data.
    pub fn disconnect_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    /// Discard watch history up to and including `revision`.
    pub fn compact(&self, revision: Revision) {
        let mut state = self.state.lock();
        while state
            .history
            .front()
            .is_some_and(|batch| batch.revision <= revision)
        {
            state.history.pop_front();
        }
        state.compacted = state.compacted.max(revision.min(state.revision));
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    /// Ids of the leases that are currently alive.
    pub fn lease_ids(&self) -> Vec<LeaseId> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        let mut ids: Vec<LeaseId> = state.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Lease a key is currently bound to.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.data.get(key).and_then(|kv| kv.lease)
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|slot| !slot.tx.is_closed());
        state.watchers.len()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());

        if let Some(lease_id) = lease
            && !state.leases.contains_key(&lease_id)
        {
            return Err(KvError::LeaseNotFound(lease_id));
        }

        let create_revision = match state.remove_key(key) {
            Some(previous) => previous.create_revision,
            None => state.revision + 1,
        };
        if let Some(lease_id) = lease
            && let Some(entry) = state.leases.get_mut(&lease_id)
        {
            entry.keys.insert(key.to_string());
        }
        let mod_revision = state.revision + 1;
        state.data.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                lease,
                create_revision,
                mod_revision,
            },
        );
        Ok(state.commit(vec![(EventKind::Put, key.to_string(), value)]))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());

        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());

        if state.remove_key(key).is_none() {
            return Ok(0);
        }
        state.commit(vec![(EventKind::Delete, key.to_string(), Vec::new())]);
        Ok(1)
    }

    async fn grant(&self, ttl: Duration) -> Result<Lease, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;

        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease_id = id, ttl_ms = ttl.as_millis() as u64, "Lease granted");
        Ok(Lease { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.keep_alive_failures > 0 {
            state.keep_alive_failures -= 1;
            return Err(KvError::Unavailable(
                "keep-alive stream closed".to_string(),
            ));
        }

        let now = Instant::now();
        state.expire(now);
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + entry.ttl;
                Ok(entry.ttl)
            }
            None => Err(KvError::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());

        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(KvError::LeaseNotFound(lease))
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<Revision>,
    ) -> Result<WatchStream, KvError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(start) = start_revision {
            if start <= state.compacted {
                return Err(KvError::Compacted {
                    requested: start,
                    compacted: state.compacted,
                });
            }
            for batch in state.history.iter().filter(|b| b.revision >= start) {
                if let Some(filtered) = filter_batch(batch, prefix) {
                    // The receiver is still in scope, so this cannot fail
                    let _ = tx.send(Ok(filtered));
                }
            }
        }
        state.watchers.push(WatchSlot {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
