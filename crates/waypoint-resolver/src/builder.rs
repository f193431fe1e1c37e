//! Resolver builder and update loop
//!
//! `build` opens a watch for one service name, publishes the initial
//! address list and spawns a task that keeps the sink up to date. The task
//! owns the watcher; when the watcher fails for good the task re-opens it
//! with backoff and reseeds from a one-shot listing, so the sink keeps its
//! last known addresses in the meantime.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use waypoint_common::{
    Backoff, Discovery, DiscoveryError, Result, ServiceInstance, Watcher, cancellable, with_timeout,
};

use crate::address::{ResolverState, build_addresses};
use crate::metric;
use crate::options::ResolverOptions;
use crate::sink::UpdateSink;

/// Builds resolvers on top of a `Discovery` implementation.
#[derive(Clone)]
pub struct ResolverBuilder {
    discovery: Arc<dyn Discovery>,
    options: ResolverOptions,
}

impl ResolverBuilder {
    pub fn new(discovery: Arc<dyn Discovery>, options: ResolverOptions) -> Self {
        Self { discovery, options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Start resolving `name` into `sink`.
    ///
    /// Fails if the watch cannot be opened or no initial membership can be
    /// obtained within the configured timeout. The resolver runs until the
    /// returned handle is stopped or dropped, or `cancel` fires.
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        name: &str,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<ResolverHandle> {
        let token = cancel.child_token();
        let timeout = self.options.timeout;

        let watcher = cancellable(&token, with_timeout(timeout, self.discovery.watch(&token, name)))
            .await?;

        let seed = match cancellable(&token, with_timeout(timeout, watcher.next())).await {
            Ok(seed) => Ok(seed),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                warn!(service = %name, "Initial watch snapshot failed, falling back to a listing: {}", e);
                cancellable(&token, with_timeout(timeout, self.discovery.get_service(&token, name)))
                    .await
            }
        };
        let seed = match seed {
            Ok(seed) => seed,
            Err(e) => {
                let _ = watcher.stop();
                return Err(e);
            }
        };

        let mut updater = Updater {
            discovery: self.discovery.clone(),
            name: name.to_string(),
            scheme: self.options.endpoint_scheme(),
            options: self.options.clone(),
            backoff: self.options.backoff(),
            sink,
            token: token.clone(),
            published: None,
            rejected: None,
            rejections: 0,
        };
        updater.publish(&seed, true);

        info!(service = %name, instances = seed.len(), "Resolver started");
        let task = tokio::spawn(updater.run(watcher));
        Ok(ResolverHandle {
            name: name.to_string(),
            token,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running resolver. Dropping it cancels the resolver.
#[derive(Debug)]
pub struct ResolverHandle {
    name: String,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResolverHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the resolver and wait for its task to finish. No sink callback
    /// happens after this returns. Safe to call repeatedly and concurrently.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            if let Err(e) = task.await
                && e.is_panic()
            {
                error!(service = %self.name, "Resolver task panicked: {}", e);
            }
            debug!(service = %self.name, "Resolver stopped");
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Outcome of collecting snapshots during the debounce window
enum Debounced {
    Settled(Vec<ServiceInstance>),
    Failed(Vec<ServiceInstance>, DiscoveryError),
    Cancelled,
}

struct Updater {
    discovery: Arc<dyn Discovery>,
    name: String,
    scheme: String,
    options: ResolverOptions,
    backoff: Backoff,
    sink: Arc<dyn UpdateSink>,
    token: CancellationToken,
    /// Address set last accepted by the sink
    published: Option<BTreeSet<String>>,
    /// Membership the sink refused, pushed again after a backoff
    rejected: Option<Vec<ServiceInstance>>,
    rejections: u32,
}

impl Updater {
    async fn run(mut self, mut watcher: Box<dyn Watcher>) {
        loop {
            let retry = self
                .rejected
                .as_ref()
                .map(|_| self.backoff.jittered(self.rejections.saturating_sub(1)));
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(retry.unwrap_or_default()), if retry.is_some() => {
                    self.retry_rejected();
                    continue;
                }
                next = watcher.next() => next,
            };

            let failure = match next {
                Ok(snapshot) => match self.debounce(watcher.as_ref(), snapshot).await {
                    Debounced::Settled(latest) => {
                        self.publish(&latest, false);
                        None
                    }
                    Debounced::Failed(latest, e) => {
                        self.publish(&latest, false);
                        Some(e)
                    }
                    Debounced::Cancelled => break,
                },
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                if self.token.is_cancelled() {
                    break;
                }
                error!(service = %self.name, "Watcher failed, re-opening: {}", e);
                let _ = watcher.stop();
                match self.reopen().await {
                    Some(reopened) => watcher = reopened,
                    None => return,
                }
            }
        }
        let _ = watcher.stop();
        debug!(service = %self.name, "Resolver update loop exited");
    }

    /// Keep taking snapshots until none arrives for `debounce`, returning
    /// the latest one.
    async fn debounce(&self, watcher: &dyn Watcher, mut latest: Vec<ServiceInstance>) -> Debounced {
        if self.options.debounce.is_zero() {
            return Debounced::Settled(latest);
        }
        let deadline = Instant::now() + self.options.debounce;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Debounced::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Debounced::Settled(latest),
                next = watcher.next() => match next {
                    Ok(snapshot) => latest = snapshot,
                    Err(e) => return Debounced::Failed(latest, e),
                },
            }
        }
    }

    /// Open a fresh watcher and reseed from a listing, retrying with backoff.
    /// `None` once cancelled.
    async fn reopen(&mut self) -> Option<Box<dyn Watcher>> {
        let timeout = self.options.timeout;
        let mut attempt = 0u32;
        loop {
            let delay = self.backoff.jittered(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            metrics::counter!(metric::RESOLVER_RECOVERIES).increment(1);

            let watcher = match cancellable(
                &self.token,
                with_timeout(timeout, self.discovery.watch(&self.token, &self.name)),
            )
            .await
            {
                Ok(watcher) => watcher,
                Err(_) if self.token.is_cancelled() => return None,
                Err(e) => {
                    warn!(service = %self.name, attempt, "Failed to re-open watch: {}", e);
                    continue;
                }
            };

            match cancellable(
                &self.token,
                with_timeout(timeout, self.discovery.get_service(&self.token, &self.name)),
            )
            .await
            {
                Ok(instances) => {
                    info!(service = %self.name, attempt, "Watch re-opened");
                    self.publish(&instances, false);
                    return Some(watcher);
                }
                Err(e) => {
                    let _ = watcher.stop();
                    if self.token.is_cancelled() {
                        return None;
                    }
                    warn!(service = %self.name, attempt, "Failed to reseed after re-opening watch: {}", e);
                }
            }
        }
    }

    fn retry_rejected(&mut self) {
        if let Some(instances) = self.rejected.take() {
            debug!(service = %self.name, attempt = self.rejections, "Retrying rejected resolver update");
            let seed = self.published.is_none();
            self.publish(&instances, seed);
        }
    }

    /// Push the addresses of `instances` to the sink if they differ from
    /// what it already has. Outside the seed an empty list is never pushed.
    /// A rejected update is kept for `run` to retry.
    fn publish(&mut self, instances: &[ServiceInstance], seed: bool) {
        let addresses = build_addresses(instances, &self.scheme);
        if addresses.is_empty() && !seed {
            warn!(service = %self.name, "Zero endpoints found, keeping the last known addresses");
            return;
        }

        let state = ResolverState::new(addresses);
        let set = state.endpoint_set();
        if self.published.as_ref() == Some(&set) {
            self.rejected = None;
            self.rejections = 0;
            return;
        }

        let count = state.len();
        let summary = if self.options.disable_debug_log {
            None
        } else {
            Some(set.iter().cloned().collect::<Vec<_>>().join(", "))
        };
        match self.sink.update_state(state) {
            Ok(()) => {
                metrics::counter!(metric::RESOLVER_UPDATES).increment(1);
                if let Some(summary) = summary {
                    info!(service = %self.name, count, "Resolver update: [{}]", summary);
                }
                self.published = Some(set);
                self.rejected = None;
                self.rejections = 0;
            }
            Err(e) => {
                self.rejections = self.rejections.saturating_add(1);
                error!(
                    service = %self.name,
                    rejections = self.rejections,
                    "Failed to update resolver state, will retry: {}", e
                );
                self.rejected = Some(instances.to_vec());
            }
        }
    }
}
