//! Resolved addresses

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::error;
use waypoint_common::ServiceInstance;
use waypoint_common::endpoint::parse_endpoint;

/// One dialable address of a service
#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    /// `host:port`
    pub addr: String,
    /// Service name, used as the TLS server name
    pub server_name: String,
    /// Instance metadata
    pub attributes: HashMap<String, String>,
    /// The instance the address was taken from
    pub instance: ServiceInstance,
}

/// State pushed to an `UpdateSink`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

impl ResolverState {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    /// Distinct `host:port` strings of this state.
    pub fn endpoint_set(&self) -> BTreeSet<String> {
        self.addresses.iter().map(|a| a.addr.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Turn a membership snapshot into addresses: the first endpoint of each
/// instance using `scheme` is kept, and an endpoint shared by several
/// instances is only listed once. Order follows the snapshot.
pub(crate) fn build_addresses(instances: &[ServiceInstance], scheme: &str) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::with_capacity(instances.len());
    for instance in instances {
        let addr = match parse_endpoint(&instance.endpoints, scheme) {
            Ok(Some(addr)) => addr,
            Ok(None) => continue,
            Err(e) => {
                error!(service = %instance.name, id = %instance.id, "Failed to parse endpoint: {}", e);
                continue;
            }
        };
        if !seen.insert(addr.clone()) {
            continue;
        }
        addresses.push(Address {
            addr,
            server_name: instance.name.clone(),
            attributes: instance.metadata.clone(),
            instance: instance.clone(),
        });
    }
    addresses
}
