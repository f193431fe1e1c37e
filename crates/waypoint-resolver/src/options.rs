//! Resolver options

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use waypoint_common::{Backoff, DEFAULT_SCHEME, endpoint};

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverOptions {
    /// Plain-text transport: selects `grpc://` endpoints instead of `grpcs://`
    #[serde(default)]
    pub insecure: bool,

    /// Budget for opening the watch and for the first snapshot (default: 10s)
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms", default = "default_timeout")]
    pub timeout: Duration,

    /// Suppress the per-update log line
    #[serde(default)]
    pub disable_debug_log: bool,

    /// Base endpoint scheme; an `s` is appended for secure transports
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Quiet period collapsing bursts of snapshots into one update
    /// (default: 50ms)
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "debounce_ms", default = "default_debounce")]
    pub debounce: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_backoff_ms", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_retry_backoff_ms", default = "default_max_retry_backoff")]
    pub max_retry_backoff: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_debounce() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(30)
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: default_timeout(),
            disable_debug_log: false,
            scheme: default_scheme(),
            debounce: default_debounce(),
            retry_backoff: default_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
        }
    }
}

impl ResolverOptions {
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_disable_debug_log(mut self, disable: bool) -> Self {
        self.disable_debug_log = disable;
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    /// Scheme an instance endpoint must carry to be used.
    pub fn endpoint_scheme(&self) -> String {
        endpoint::scheme(&self.scheme, !self.insecure)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_backoff, self.max_retry_backoff)
    }
}
