//! Service instance model and registration key layout
//!
//! Every live instance is stored under `{namespace}/{name}/{id}` with a
//! JSON-encoded `ServiceInstance` as the value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// One running service endpoint as stored in the registry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique per registration; stable across re-registrations of one process
    pub id: String,
    /// Logical service name, used as the discovery key
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Scheme-qualified addresses, e.g. `grpc://127.0.0.1:9090`
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
}

impl ServiceInstance {
    /// Create an instance with a freshly generated id.
    pub fn new(name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Check that the instance can be turned into a registration key.
    pub fn validate(&self) -> Result<()> {
        validate_segment("name", &self.name)?;
        validate_segment("id", &self.id)?;
        if let Some(weight) = self.weight
            && !(weight.is_finite() && weight >= 0.0)
        {
            return Err(DiscoveryError::InvalidInstance(format!(
                "weight must be a non-negative number, got {}",
                weight
            )));
        }
        Ok(())
    }

    /// Registration key of this instance under `namespace`.
    pub fn key(&self, namespace: &str) -> String {
        instance_key(namespace, &self.name, &self.id)
    }

    /// Serialize into the stored value format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::Other(e.into()))
    }

    /// Deserialize a stored value; `key` is only used for error reporting.
    pub fn decode(key: &str, value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(|e| DiscoveryError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether the instance should receive traffic. Absent means healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.unwrap_or(true)
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(DiscoveryError::InvalidInstance(format!(
            "{} must not be empty",
            field
        )));
    }
    if value.contains('/') {
        return Err(DiscoveryError::InvalidInstance(format!(
            "{} '{}' must not contain '/'",
            field, value
        )));
    }
    Ok(())
}

/// Prefix under which all instances of `name` live, including the trailing
/// separator so that `foo` never matches `foobar`.
pub fn service_prefix(namespace: &str, name: &str) -> String {
    format!("{}/{}/", namespace.trim_end_matches('/'), name)
}

/// Build a registration key: `{namespace}/{name}/{id}`.
pub fn instance_key(namespace: &str, name: &str, id: &str) -> String {
    format!("{}{}", service_prefix(namespace, name), id)
}

/// Split a registration key back into `(name, id)`.
pub fn parse_instance_key<'a>(namespace: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let namespace = namespace.trim_end_matches('/');
    let rest = key.strip_prefix(namespace)?.strip_prefix('/')?;
    let (name, id) = rest.split_once('/')?;
    if name.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((name, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_generates_id() {
        let a = ServiceInstance::new("foo", vec!["grpc://127.0.0.1:9090".to_string()]);
        let b = ServiceInstance::new("foo", vec!["grpc://127.0.0.1:9090".to_string()]);
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "foo");
    }

    #[test]
    fn test_builder() {
        let instance = ServiceInstance::new("foo", vec![])
            .with_id("0")
            .with_version("v1.2.0")
            .with_metadata("zone", "eu-west-1")
            .with_weight(2.5);
        assert_eq!(instance.id, "0");
        assert_eq!(instance.version, "v1.2.0");
        assert_eq!(instance.metadata.get("zone").unwrap(), "eu-west-1");
        assert_eq!(instance.weight, Some(2.5));
        assert!(instance.is_healthy());
    }

    #[test]
    fn test_key_layout() {
        let instance = ServiceInstance::new("helloworld", vec![]).with_id("0");
        assert_eq!(instance.key("/microservices"), "/microservices/helloworld/0");
        assert_eq!(instance.key("/microservices/"), "/microservices/helloworld/0");
        assert_eq!(
            service_prefix("/microservices", "helloworld"),
            "/microservices/helloworld/"
        );
    }

    #[test]
    fn test_parse_instance_key() {
        assert_eq!(
            parse_instance_key("/microservices", "/microservices/foo/abc"),
            Some(("foo", "abc"))
        );
        assert_eq!(parse_instance_key("/microservices", "/other/foo/abc"), None);
        assert_eq!(parse_instance_key("/microservices", "/microservices/foo"), None);
        assert_eq!(
            parse_instance_key("/microservices", "/microservices/foo/a/b"),
            None
        );
    }

    #[test]
    fn test_validate() {
        assert!(ServiceInstance::new("foo", vec![]).validate().is_ok());

        let err = ServiceInstance::new("", vec![]).validate().unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidInstance(_)));

        let err = ServiceInstance::new("foo", vec![])
            .with_id("a/b")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("must not contain '/'"));

        let err = ServiceInstance::new("foo", vec![])
            .with_weight(-1.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn test_json_encoding() {
        let instance = ServiceInstance::new("foo", vec!["grpc://127.0.0.1:9090".to_string()])
            .with_id("1")
            .with_version("v1");
        let json: serde_json::Value = serde_json::from_slice(&instance.encode().unwrap()).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["name"], "foo");
        assert_eq!(json["version"], "v1");
        assert_eq!(json["endpoints"][0], "grpc://127.0.0.1:9090");
        // Optional fields are omitted when absent
        assert!(json.get("weight").is_none());
        assert!(json.get("healthy").is_none());
    }

    #[test]
    fn test_decode_tolerates_missing_optional_fields() {
        let instance =
            ServiceInstance::decode("k", br#"{"id":"0","name":"helloworld","extra":1}"#).unwrap();
        assert_eq!(instance.id, "0");
        assert!(instance.endpoints.is_empty());
        assert!(instance.metadata.is_empty());
    }

    #[test]
    fn test_decode_error_names_key() {
        let err = ServiceInstance::decode("/microservices/foo/1", b"not json").unwrap_err();
        match err {
            DiscoveryError::Decode { key, .. } => assert_eq!(key, "/microservices/foo/1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn prop_key_parses_back(name in "[a-z][a-z0-9-]{0,15}", id in "[a-zA-Z0-9_.-]{1,20}") {
            let key = instance_key("/microservices", &name, &id);
            prop_assert!(key.starts_with(&service_prefix("/microservices", &name)));
            prop_assert_eq!(parse_instance_key("/microservices", &key), Some((name.as_str(), id.as_str())));
        }

        #[test]
        fn prop_prefix_does_not_leak_into_longer_names(name in "[a-z]{1,10}", suffix in "[a-z]{1,5}", id in "[a-z0-9]{1,8}") {
            let other = format!("{name}{suffix}");
            let key = instance_key("/microservices", &other, &id);
            prop_assert!(!key.starts_with(&service_prefix("/microservices", &name)));
        }
    }
}
