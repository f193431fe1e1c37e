//! Waypoint Registry - lease-based registration and membership watching
//!
//! - `Registry`: registers local instances under expiring leases, keeps
//!   them alive with a self-healing heartbeat, and implements `Discovery`
//! - `KvWatcher`: turns a key-value watch stream into full membership
//!   snapshots, reconnecting transparently

pub mod config;
pub mod heartbeat;
pub mod registry;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RegistryConfig;
pub use heartbeat::{HeartbeatState, HeartbeatStatus};
pub use registry::Registry;
pub use watcher::KvWatcher;

/// Metric names emitted by this crate
pub mod metric {
    use metrics::describe_counter;

    pub const HEARTBEAT_FAILURES: &str = "waypoint_registry_heartbeat_failures_total";
    pub const LEASE_RECOVERIES: &str = "waypoint_registry_lease_recoveries_total";
    pub const DECODE_ERRORS: &str = "waypoint_registry_decode_errors_total";
    pub const WATCH_RESYNCS: &str = "waypoint_registry_watch_resyncs_total";

    /// Register metric descriptions with the installed recorder.
    pub fn describe() {
        describe_counter!(HEARTBEAT_FAILURES, "Total number of failed lease keep-alives");
        describe_counter!(
            LEASE_RECOVERIES,
            "Total number of registrations re-established under a new lease"
        );
        describe_counter!(DECODE_ERRORS, "Total number of undecodable registry entries");
        describe_counter!(
            WATCH_RESYNCS,
            "Total number of full re-reads after watch compaction"
        );
    }
}
