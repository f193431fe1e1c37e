//! Resolver behaviour against a scripted discovery and against the real
//! registry over the in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use waypoint_common::{Discovery, DiscoveryError, Result, ServiceInstance, Watcher};
use waypoint_kv::MemoryKv;
use waypoint_registry::{Registry, RegistryConfig};
use waypoint_resolver::{
    DialOptions, FnUpdateSink, ResolverBuilder, ResolverOptions, ResolverState, UpdateSink,
    WatchSink, dial, dial_insecure,
};

/// Watcher fed by a channel; closing or erroring is under test control.
struct ScriptedWatcher {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<ServiceInstance>>>>,
    stopped: CancellationToken,
}

#[async_trait]
impl Watcher for ScriptedWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => Err(DiscoveryError::Stopped),
            item = async { self.rx.lock().await.recv().await } => {
                item.unwrap_or_else(|| Err(DiscoveryError::WatchStream("closed".to_string())))
            }
        }
    }

    fn stop(&self) -> Result<()> {
        self.stopped.cancel();
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedDiscovery {
    instances: Mutex<Vec<ServiceInstance>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<Result<Vec<ServiceInstance>>>>>,
    stop_tokens: Mutex<Vec<CancellationToken>>,
    watch_calls: AtomicUsize,
    fail_watch: AtomicBool,
    hang_watch: AtomicBool,
    /// The next watcher opens with an error instead of a snapshot
    fail_first_snapshot: AtomicBool,
    /// The next watcher delivers nothing until membership changes
    withhold_first_snapshot: AtomicBool,
}

impl ScriptedDiscovery {
    fn with(instances: Vec<ServiceInstance>) -> Arc<Self> {
        let discovery = Self::default();
        *discovery.instances.lock() = instances;
        Arc::new(discovery)
    }

    /// Change membership and notify the latest watcher.
    fn set(&self, instances: Vec<ServiceInstance>) {
        *self.instances.lock() = instances.clone();
        if let Some(tx) = self.senders.lock().last() {
            let _ = tx.send(Ok(instances));
        }
    }

    /// Change membership without telling any watcher.
    fn set_silently(&self, instances: Vec<ServiceInstance>) {
        *self.instances.lock() = instances;
    }

    fn fail_current_watcher(&self) {
        if let Some(tx) = self.senders.lock().last() {
            let _ = tx.send(Err(DiscoveryError::WatchStream("connection reset".to_string())));
        }
    }

    fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    fn stopped_watchers(&self) -> usize {
        self.stop_tokens
            .lock()
            .iter()
            .filter(|t| t.is_cancelled())
            .count()
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn get_service(&self, _cancel: &CancellationToken, _name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.instances.lock().clone())
    }

    async fn watch(&self, _cancel: &CancellationToken, _name: &str) -> Result<Box<dyn Watcher>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_watch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Connect("store unreachable".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if self.fail_first_snapshot.swap(false, Ordering::SeqCst) {
            let _ = tx.send(Err(DiscoveryError::WatchStream("stream reset".to_string())));
        } else if !self.withhold_first_snapshot.swap(false, Ordering::SeqCst) {
            let _ = tx.send(Ok(self.instances.lock().clone()));
        }
        self.senders.lock().push(tx);
        let stopped = CancellationToken::new();
        self.stop_tokens.lock().push(stopped.clone());
        Ok(Box::new(ScriptedWatcher {
            rx: tokio::sync::Mutex::new(rx),
            stopped,
        }))
    }
}

fn instance(id: &str, endpoints: &[String]) -> ServiceInstance {
    ServiceInstance::new("foo", endpoints.to_vec()).with_id(id)
}

fn grpc(id: &str) -> ServiceInstance {
    instance(id, &[format!("grpc://10.0.0.{id}:9000")])
}

/// Sink recording every published state
fn recording_sink() -> (Arc<dyn UpdateSink>, Arc<Mutex<Vec<BTreeSet<String>>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let recorded = updates.clone();
    let sink = FnUpdateSink::new(move |state: ResolverState| {
        recorded.lock().push(state.endpoint_set());
    });
    (Arc::new(sink), updates)
}

/// Sink refusing a number of updates before accepting again
#[derive(Default)]
struct FlakySink {
    reject: AtomicUsize,
    rejected: AtomicUsize,
    accepted: Mutex<Vec<BTreeSet<String>>>,
}

impl UpdateSink for FlakySink {
    fn update_state(&self, state: ResolverState) -> Result<()> {
        if self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(DiscoveryError::Other(anyhow::anyhow!("balancer busy")));
        }
        self.accepted.lock().push(state.endpoint_set());
        Ok(())
    }
}

fn set(addrs: &[&str]) -> BTreeSet<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

fn insecure() -> ResolverOptions {
    ResolverOptions::default()
        .with_insecure(true)
        .with_retry_backoff(Duration::from_millis(100), Duration::from_secs(1))
}

/// Let the resolver task run and any debounce window elapse.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn seed_is_published_on_build() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1"), grpc("2")]);
    let (sink, updates) = recording_sink();

    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;

    assert_eq!(*updates.lock(), vec![set(&["10.0.0.1:9000", "10.0.0.2:9000"])]);
    assert_eq!(handle.name(), "foo");
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_first_snapshot_seeds_from_listing() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1"), grpc("2")]);
    discovery.fail_first_snapshot.store(true, Ordering::SeqCst);
    let (sink, updates) = recording_sink();

    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(*updates.lock(), vec![set(&["10.0.0.1:9000", "10.0.0.2:9000"])]);

    discovery.set(vec![grpc("2"), grpc("3")]);
    settle().await;
    assert_eq!(
        updates.lock().last().unwrap(),
        &set(&["10.0.0.2:9000", "10.0.0.3:9000"])
    );
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_watch_seeds_from_listing_after_timeout() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    discovery.withhold_first_snapshot.store(true, Ordering::SeqCst);
    let (sink, updates) = recording_sink();

    let handle = ResolverBuilder::new(discovery.clone(), insecure().with_timeout(Duration::from_secs(1)))
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(*updates.lock(), vec![set(&["10.0.0.1:9000"])]);
    // The same watcher is kept and still delivers changes
    assert_eq!(discovery.watch_calls(), 1);

    discovery.set(vec![grpc("1"), grpc("4")]);
    settle().await;
    assert_eq!(
        updates.lock().last().unwrap(),
        &set(&["10.0.0.1:9000", "10.0.0.4:9000"])
    );
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_update_is_retried_without_new_changes() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let sink = Arc::new(FlakySink::default());

    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink.clone())
        .await?;
    assert_eq!(*sink.accepted.lock(), vec![set(&["10.0.0.1:9000"])]);

    sink.reject.store(2, Ordering::SeqCst);
    discovery.set(vec![grpc("1"), grpc("2")]);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(sink.rejected.load(Ordering::SeqCst), 2);
    assert_eq!(
        *sink.accepted.lock(),
        vec![set(&["10.0.0.1:9000"]), set(&["10.0.0.1:9000", "10.0.0.2:9000"])]
    );
    // Nothing more to push once accepted
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sink.accepted.lock().len(), 2);
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn same_set_in_new_order_is_not_republished() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1"), grpc("2")]);
    let (sink, updates) = recording_sink();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;

    discovery.set(vec![grpc("2"), grpc("1")]);
    settle().await;
    // Different instance ids behind the same endpoints change nothing either
    discovery.set(vec![
        instance("a", &["grpc://10.0.0.1:9000".to_string()]),
        instance("b", &["grpc://10.0.0.2:9000".to_string()]),
    ]);
    settle().await;
    assert_eq!(updates.lock().len(), 1);

    discovery.set(vec![grpc("2"), grpc("3")]);
    settle().await;
    assert_eq!(
        updates.lock().last().unwrap(),
        &set(&["10.0.0.2:9000", "10.0.0.3:9000"])
    );
    assert_eq!(updates.lock().len(), 2);
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_endpoints_collapse() -> anyhow::Result<()> {
    let shared = vec!["grpc://10.0.0.9:9000".to_string()];
    let discovery = ScriptedDiscovery::with(vec![instance("1", &shared), instance("2", &shared)]);
    let (sink, rx) = WatchSink::new();
    let handle = ResolverBuilder::new(discovery, insecure())
        .build(&CancellationToken::new(), "foo", Arc::new(sink))
        .await?;

    let state = rx.borrow().clone();
    assert_eq!(state.len(), 1);
    assert_eq!(state.addresses[0].addr, "10.0.0.9:9000");
    assert_eq!(state.addresses[0].instance.id, "1");
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn endpoints_are_filtered_by_transport_scheme() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![
        instance("1", &["grpc://10.0.0.1:9000".to_string()]),
        instance("2", &["grpcs://10.0.0.2:9443".to_string()]),
        instance("3", &["http://10.0.0.3:8000".to_string()]),
    ]);

    let (sink, plain) = recording_sink();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(plain.lock()[0], set(&["10.0.0.1:9000"]));
    handle.stop().await;

    let (sink, tls) = recording_sink();
    let handle = ResolverBuilder::new(discovery, ResolverOptions::default())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(tls.lock()[0], set(&["10.0.0.2:9443"]));
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn empty_update_keeps_last_known_addresses() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, rx) = WatchSink::new();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", Arc::new(sink))
        .await?;

    discovery.set(vec![]);
    settle().await;
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.1:9000"]));

    discovery.set(vec![instance("4", &["http://10.0.0.4:8000".to_string()])]);
    settle().await;
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.1:9000"]));

    discovery.set(vec![grpc("5")]);
    settle().await;
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.5:9000"]));
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn empty_seed_is_published() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![]);
    let (sink, updates) = recording_sink();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(*updates.lock(), vec![BTreeSet::new()]);

    discovery.set(vec![grpc("1")]);
    settle().await;
    assert_eq!(updates.lock().last().unwrap(), &set(&["10.0.0.1:9000"]));
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bursts_are_debounced() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, updates) = recording_sink();
    let handle = ResolverBuilder::new(discovery.clone(), insecure().with_debounce(Duration::from_millis(50)))
        .build(&CancellationToken::new(), "foo", sink)
        .await?;

    discovery.set(vec![grpc("1"), grpc("2")]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    discovery.set(vec![grpc("1"), grpc("2"), grpc("3")]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    discovery.set(vec![grpc("3")]);
    settle().await;

    assert_eq!(
        *updates.lock(),
        vec![set(&["10.0.0.1:9000"]), set(&["10.0.0.3:9000"])]
    );
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_watcher_is_reopened_and_reseeded() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, rx) = WatchSink::new();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", Arc::new(sink))
        .await?;
    assert_eq!(discovery.watch_calls(), 1);

    // Membership changes while the watch is broken
    discovery.set_silently(vec![grpc("2")]);
    discovery.fail_current_watcher();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(discovery.watch_calls(), 2);
    assert_eq!(discovery.stopped_watchers(), 1);
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.2:9000"]));

    // The new watcher is live
    discovery.set(vec![grpc("2"), grpc("3")]);
    settle().await;
    assert_eq!(rx.borrow().len(), 2);
    handle.stop().await;
    assert_eq!(discovery.stopped_watchers(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reopen_retries_while_store_is_down() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, rx) = WatchSink::new();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&CancellationToken::new(), "foo", Arc::new(sink))
        .await?;

    discovery.fail_watch.store(true, Ordering::SeqCst);
    discovery.fail_current_watcher();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(discovery.watch_calls() > 2);
    // Last known good addresses are kept meanwhile
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.1:9000"]));

    discovery.set_silently(vec![grpc("7")]);
    discovery.fail_watch.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rx.borrow().endpoint_set(), set(&["10.0.0.7:9000"]));
    handle.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn build_fails_when_watch_cannot_open() {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    discovery.fail_watch.store(true, Ordering::SeqCst);
    let (sink, updates) = recording_sink();

    let result = ResolverBuilder::new(discovery, insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await;
    assert!(matches!(result, Err(DiscoveryError::Connect(_))));
    assert!(updates.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn build_times_out() {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    discovery.hang_watch.store(true, Ordering::SeqCst);
    let (sink, _updates) = recording_sink();

    let result = ResolverBuilder::new(discovery, insecure().with_timeout(Duration::from_secs(3)))
        .build(&CancellationToken::new(), "foo", sink)
        .await;
    assert!(matches!(result, Err(DiscoveryError::Timeout(d)) if d == Duration::from_secs(3)));
}

#[tokio::test(start_paused = true)]
async fn build_is_cancellable() {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    discovery.hang_watch.store(true, Ordering::SeqCst);
    let (sink, _updates) = recording_sink();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let result = ResolverBuilder::new(discovery, insecure())
        .build(&cancel, "foo", sink)
        .await;
    assert!(matches!(result, Err(DiscoveryError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn no_callbacks_after_stop() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, updates) = recording_sink();
    let handle = Arc::new(
        ResolverBuilder::new(discovery.clone(), insecure())
            .build(&CancellationToken::new(), "foo", sink)
            .await?,
    );

    // Concurrent and repeated stops
    let other = handle.clone();
    let concurrent = tokio::spawn(async move { other.stop().await });
    handle.stop().await;
    concurrent.await?;
    handle.stop().await;
    assert!(handle.is_stopped());
    assert_eq!(discovery.stopped_watchers(), 1);

    let before = updates.lock().len();
    discovery.set(vec![grpc("2")]);
    settle().await;
    assert_eq!(updates.lock().len(), before);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_no_tasks_behind() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let metrics = tokio::runtime::Handle::current().metrics();
    let baseline = metrics.num_alive_tasks();

    let (sink, _updates) = recording_sink();
    let handle = ResolverBuilder::new(discovery, insecure())
        .build(&CancellationToken::new(), "foo", sink)
        .await?;
    assert_eq!(metrics.num_alive_tasks(), baseline + 1);

    handle.stop().await;
    assert_eq!(metrics.num_alive_tasks(), baseline);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_stops_resolver() -> anyhow::Result<()> {
    let discovery = ScriptedDiscovery::with(vec![grpc("1")]);
    let (sink, updates) = recording_sink();
    let cancel = CancellationToken::new();
    let handle = ResolverBuilder::new(discovery.clone(), insecure())
        .build(&cancel, "foo", sink)
        .await?;

    cancel.cancel();
    settle().await;
    assert!(handle.is_stopped());
    assert_eq!(discovery.stopped_watchers(), 1);

    discovery.set(vec![grpc("2")]);
    settle().await;
    assert_eq!(updates.lock().len(), 1);
    Ok(())
}

fn registry_setup() -> (MemoryKv, Arc<Registry>) {
    let kv = MemoryKv::with_reaper(Duration::from_millis(100));
    let config = RegistryConfig::default().with_register_ttl(Duration::from_secs(2));
    (kv.clone(), Arc::new(Registry::new(Arc::new(kv), config)))
}

#[tokio::test(start_paused = true)]
async fn follows_registry_membership() -> anyhow::Result<()> {
    let (_kv, registry) = registry_setup();
    let cancel = CancellationToken::new();
    let a = grpc("1");
    let b = grpc("2");
    registry.register(&cancel, &a).await?;

    let (sink, mut rx) = WatchSink::new();
    let handle = ResolverBuilder::new(registry.clone(), insecure())
        .build(&cancel, "foo", Arc::new(sink))
        .await?;
    assert_eq!(rx.borrow_and_update().endpoint_set(), set(&["10.0.0.1:9000"]));

    registry.register(&cancel, &b).await?;
    rx.changed().await?;
    assert_eq!(
        rx.borrow_and_update().endpoint_set(),
        set(&["10.0.0.1:9000", "10.0.0.2:9000"])
    );

    registry.deregister(&cancel, &a).await?;
    rx.changed().await?;
    assert_eq!(rx.borrow_and_update().endpoint_set(), set(&["10.0.0.2:9000"]));

    handle.stop().await;
    cancel.cancel();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dial_insecure_builds_balanced_channel() -> anyhow::Result<()> {
    let (_kv, registry) = registry_setup();
    let cancel = CancellationToken::new();
    registry.register(&cancel, &grpc("1")).await?;

    let (_channel, handle) = dial_insecure(
        &cancel,
        registry.clone(),
        "discovery:///foo",
        DialOptions::default(),
    )
    .await?;
    assert_eq!(handle.name(), "foo");
    handle.stop().await;

    let err = dial_insecure(&cancel, registry.clone(), "dns:///foo", DialOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidTarget(_)));

    let err = dial(&cancel, registry, "discovery:///foo", DialOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("TLS credentials"));
    cancel.cancel();
    Ok(())
}
