//! Waypoint Common - Shared types, traits, and utilities
//!
//! This crate provides the foundational types used across all Waypoint components:
//! - `ServiceInstance` and the registration key layout
//! - The `Discovery` / `Watcher` capability traits
//! - The `DiscoveryError` taxonomy
//! - Endpoint parsing and retry backoff helpers

pub mod backoff;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod traits;
pub mod utils;

// Re-exports for convenience
pub use backoff::Backoff;
pub use error::{DiscoveryError, Result};
pub use model::ServiceInstance;
pub use traits::{Discovery, Watcher};
pub use utils::{cancellable, with_timeout};

/// Default key namespace under which instances are registered
pub const DEFAULT_NAMESPACE: &str = "/microservices";

/// Default endpoint scheme used by the resolver
pub const DEFAULT_SCHEME: &str = "grpc";
