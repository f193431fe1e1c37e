//! Registry configuration
//!
//! Durations are written as integers in configuration files: the lease TTL
//! in seconds (etcd leases have whole-second granularity), everything else
//! in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use waypoint_common::{Backoff, DEFAULT_NAMESPACE};

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Key prefix for every registration (default: `/microservices`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Lease time-to-live (default: 15s)
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "register_ttl_secs", default = "default_register_ttl")]
    pub register_ttl: Duration,

    /// Keep-alive attempts on the same lease before a new lease is obtained
    /// (default: 5)
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Interval between keep-alives (default: half the TTL)
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "keep_alive_interval_ms", default)]
    pub keep_alive_interval: Option<Duration>,

    /// Deadline of each store call made while registering or heartbeating
    /// (default: a third of the TTL). A call that exceeds it counts as failed.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "request_timeout_ms", default)]
    pub request_timeout: Option<Duration>,

    /// First retry delay of the exponential backoff (default: 200ms)
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_backoff_ms", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    /// Upper bound of the exponential backoff (default: 5s)
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_retry_backoff_ms", default = "default_max_retry_backoff")]
    pub max_retry_backoff: Duration,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_register_ttl() -> Duration {
    Duration::from_secs(15)
}

fn default_max_retry() -> u32 {
    5
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            register_ttl: default_register_ttl(),
            max_retry: default_max_retry(),
            keep_alive_interval: None,
            request_timeout: None,
            retry_backoff: default_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
        }
    }
}

impl RegistryConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    /// Effective keep-alive interval, never zero.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
            .unwrap_or(self.register_ttl / 2)
            .max(Duration::from_millis(1))
    }

    /// Effective per-call deadline, never zero.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
            .unwrap_or(self.register_ttl / 3)
            .max(Duration::from_millis(1))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_backoff, self.max_retry_backoff)
    }
}
