//! Update sinks
//!
//! A sink receives every address list a resolver decides to publish.
//! Callbacks happen on the resolver task and must not block.

use tokio::sync::watch;
use waypoint_common::Result;

use crate::address::ResolverState;

/// Receiver of resolved address lists.
pub trait UpdateSink: Send + Sync + 'static {
    /// Called with the full new state whenever the address set changes.
    /// A rejected state is offered again after a backoff until the sink
    /// accepts it or a newer one replaces it.
    fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// A sink that invokes a closure.
pub struct FnUpdateSink<F>
where
    F: Fn(ResolverState) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnUpdateSink<F>
where
    F: Fn(ResolverState) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> UpdateSink for FnUpdateSink<F>
where
    F: Fn(ResolverState) + Send + Sync + 'static,
{
    fn update_state(&self, state: ResolverState) -> Result<()> {
        (self.f)(state);
        Ok(())
    }
}

/// Keeps only the latest state, readable through a `watch::Receiver`.
pub struct WatchSink {
    tx: watch::Sender<ResolverState>,
}

impl WatchSink {
    pub fn new() -> (Self, watch::Receiver<ResolverState>) {
        let (tx, rx) = watch::channel(ResolverState::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.tx.subscribe()
    }
}

impl UpdateSink for WatchSink {
    fn update_state(&self, state: ResolverState) -> Result<()> {
        self.tx.send_replace(state);
        Ok(())
    }
}
