//! Endpoint parsing
//!
//! Instances advertise scheme-qualified endpoints (`grpc://host:port`,
//! `grpcs://host:port`); the resolver keeps the first one whose scheme
//! matches its transport security.

use url::Url;

use crate::error::{DiscoveryError, Result};

/// Endpoint scheme for a transport: `grpc` stays `grpc` when insecure and
/// becomes `grpcs` when secure.
pub fn scheme(scheme: &str, secure: bool) -> String {
    if secure {
        format!("{}s", scheme)
    } else {
        scheme.to_string()
    }
}

/// Build an endpoint string from a scheme and a `host:port` address.
pub fn new_endpoint(scheme: &str, host: &str) -> String {
    format!("{}://{}", scheme, host)
}

/// Return the `host[:port]` of the first endpoint using `scheme`.
///
/// `Ok(None)` means no endpoint uses that scheme; an error means one of the
/// endpoints is not a valid URL.
pub fn parse_endpoint(endpoints: &[String], scheme: &str) -> Result<Option<String>> {
    for endpoint in endpoints {
        let url = Url::parse(endpoint).map_err(|e| {
            DiscoveryError::InvalidInstance(format!("endpoint '{}': {}", endpoint, e))
        })?;
        if url.scheme() != scheme {
            continue;
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => {
                return Err(DiscoveryError::InvalidInstance(format!(
                    "endpoint '{}' has no host",
                    endpoint
                )));
            }
        };
        return Ok(Some(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }));
    }
    Ok(None)
}
