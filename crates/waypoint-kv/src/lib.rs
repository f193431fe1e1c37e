//! Waypoint KV - key-value client abstraction
//!
//! The registry talks to its consistent backing store exclusively through
//! the `KvClient` trait:
//! - `MemoryKv`: in-process store with leases, revisions and watch replay,
//!   plus fault injection for tests
//! - `EtcdKv`: etcd v3 backend (feature `etcd`)

pub mod client;
pub mod error;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use client::{
    EventKind, KeyValue, KvClient, Lease, LeaseId, RangeResponse, Revision, WatchBatch,
    WatchEvent, WatchStream,
};
pub use error::KvError;
pub use memory::MemoryKv;

#[cfg(feature = "etcd")]
pub use etcd::{EtcdKv, EtcdOptions};
