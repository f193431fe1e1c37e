//! Dialing `discovery:///name` targets into a load-balanced tonic channel

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use waypoint_common::{Discovery, DiscoveryError, Result};

use crate::balance::{BalanceSink, EndpointCustomizer};
use crate::builder::{ResolverBuilder, ResolverHandle};
use crate::options::ResolverOptions;

/// URI scheme of discovery targets
pub const DISCOVERY_SCHEME: &str = "discovery";

/// Parsed dial target: `discovery://[authority]/name`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub authority: String,
    pub service: String,
}

impl Target {
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |reason: &str| DiscoveryError::InvalidTarget(format!("'{}': {}", target, reason));

        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme != DISCOVERY_SCHEME {
            return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
        }
        let (authority, path) = rest.split_once('/').ok_or_else(|| invalid("missing service name"))?;
        let service = path.trim_end_matches('/');
        if service.is_empty() {
            return Err(invalid("missing service name"));
        }
        if service.contains('/') {
            return Err(invalid("service name must not contain '/'"));
        }
        Ok(Self {
            authority: authority.to_string(),
            service: service.to_string(),
        })
    }
}

impl FromStr for Target {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", DISCOVERY_SCHEME, self.authority, self.service)
    }
}

/// Options for `dial` / `dial_insecure`
#[derive(Clone)]
pub struct DialOptions {
    pub resolver: ResolverOptions,
    /// Capacity of the channel feeding endpoint changes to the balancer
    pub buffer_size: usize,
    /// Applied to every endpoint; required for secure dialing since it is
    /// where TLS credentials are configured
    pub customizer: Option<EndpointCustomizer>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            resolver: ResolverOptions::default(),
            buffer_size: 1024,
            customizer: None,
        }
    }
}

impl DialOptions {
    pub fn with_resolver(mut self, resolver: ResolverOptions) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_customizer(mut self, customizer: EndpointCustomizer) -> Self {
        self.customizer = Some(customizer);
        self
    }
}

/// Dial `target` over TLS.
///
/// Returns a channel that balances requests over every resolved instance,
/// and the handle of the resolver feeding it.
pub async fn dial(
    cancel: &CancellationToken,
    discovery: Arc<dyn Discovery>,
    target: &str,
    mut options: DialOptions,
) -> Result<(Channel, ResolverHandle)> {
    if options.customizer.is_none() {
        return Err(DiscoveryError::Other(anyhow!(
            "secure dial to '{}' requires an endpoint customizer providing TLS credentials",
            target
        )));
    }
    options.resolver.insecure = false;
    dial_with(cancel, discovery, target, options).await
}

/// Dial `target` over plain-text HTTP/2.
pub async fn dial_insecure(
    cancel: &CancellationToken,
    discovery: Arc<dyn Discovery>,
    target: &str,
    mut options: DialOptions,
) -> Result<(Channel, ResolverHandle)> {
    options.resolver.insecure = true;
    dial_with(cancel, discovery, target, options).await
}

async fn dial_with(
    cancel: &CancellationToken,
    discovery: Arc<dyn Discovery>,
    target: &str,
    options: DialOptions,
) -> Result<(Channel, ResolverHandle)> {
    let target = Target::parse(target)?;
    let (channel, tx) = Channel::balance_channel::<String>(options.buffer_size);

    let mut sink = BalanceSink::new(tx, !options.resolver.insecure);
    if let Some(customizer) = options.customizer {
        sink = sink.with_customizer(customizer);
    }

    let handle = ResolverBuilder::new(discovery, options.resolver)
        .build(cancel, &target.service, Arc::new(sink))
        .await?;
    Ok((channel, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = Target::parse("discovery:///helloworld").unwrap();
        assert_eq!(target.authority, "");
        assert_eq!(target.service, "helloworld");
        assert_eq!(target.to_string(), "discovery:///helloworld");

        let target: Target = "discovery://etcd/user-service/".parse().unwrap();
        assert_eq!(target.authority, "etcd");
        assert_eq!(target.service, "user-service");
    }

    #[test]
    fn test_parse_target_errors() {
        for bad in [
            "helloworld",
            "dns:///helloworld",
            "discovery://",
            "discovery:///",
            "discovery:///a/b",
        ] {
            let err = Target::parse(bad).unwrap_err();
            assert!(
                matches!(err, DiscoveryError::InvalidTarget(_)),
                "{bad}: {err:?}"
            );
        }
    }
}
