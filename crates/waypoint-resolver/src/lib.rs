//! Waypoint Resolver - feeds discovery snapshots into an RPC client
//!
//! - `ResolverBuilder`: watches one service name through any `Discovery`
//!   and publishes de-duplicated address lists to an `UpdateSink`
//! - `BalanceSink` / `dial`: drive a load-balanced tonic `Channel`
//! - `Picker`: weighted random choice over a resolved address list

pub mod address;
pub mod balance;
pub mod builder;
pub mod dial;
pub mod options;
pub mod picker;
pub mod sink;

pub use address::{Address, ResolverState};
pub use balance::{BalanceSink, EndpointCustomizer};
pub use builder::{ResolverBuilder, ResolverHandle};
pub use dial::{DISCOVERY_SCHEME, DialOptions, Target, dial, dial_insecure};
pub use options::ResolverOptions;
pub use picker::Picker;
pub use sink::{FnUpdateSink, UpdateSink, WatchSink};

/// Metric names emitted by this crate
pub mod metric {
    use metrics::describe_counter;

    pub const RESOLVER_UPDATES: &str = "waypoint_resolver_updates_total";
    pub const RESOLVER_RECOVERIES: &str = "waypoint_resolver_recoveries_total";

    /// Register metric descriptions with the installed recorder.
    pub fn describe() {
        describe_counter!(
            RESOLVER_UPDATES,
            "Total number of address lists pushed to resolver sinks"
        );
        describe_counter!(
            RESOLVER_RECOVERIES,
            "Total number of times a resolver re-opened its watch"
        );
    }
}
