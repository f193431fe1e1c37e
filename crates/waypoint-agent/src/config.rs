//! Agent configuration
//!
//! Settings are layered, later sources winning:
//! 1. built-in defaults
//! 2. `conf/agent.yml` (or the file given with `--config`), if present
//! 3. `WAYPOINT_*` environment variables, `__` separating sections
//! 4. command line flags

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use waypoint_registry::RegistryConfig;
use waypoint_resolver::ResolverOptions;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "waypoint-agent", version, about = "Register, list and watch services")]
pub struct Cli {
    /// Configuration file; missing files are ignored
    #[arg(
        short = 'c',
        long = "config",
        env = "WAYPOINT_CONFIG",
        default_value = "conf/agent.yml"
    )]
    pub config: PathBuf,

    /// Backing store
    #[arg(long = "store", value_enum)]
    pub store: Option<StoreKind>,

    /// Comma separated etcd endpoints
    #[arg(long = "etcd-endpoints", env = "WAYPOINT_ETCD_ENDPOINTS", value_delimiter = ',')]
    pub etcd_endpoints: Vec<String>,

    /// Key namespace for registrations
    #[arg(short = 'n', long = "namespace")]
    pub namespace: Option<String>,

    /// Resolve `grpcs://` endpoints instead of `grpc://`
    #[arg(long = "secure")]
    pub secure: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register an instance and keep it alive until interrupted
    Register(RegisterArgs),
    /// Print the current instances of a service as JSON
    List {
        name: String,
    },
    /// Print every membership change of a service
    Watch {
        name: String,
        /// Print resolved addresses instead of raw snapshots
        #[arg(long = "resolve")]
        resolve: bool,
    },
    /// Run registry and resolver against an in-process store
    Demo {
        #[arg(default_value = "demo")]
        name: String,
        #[arg(long = "instances", default_value_t = 3)]
        instances: u16,
    },
}

#[derive(Debug, clap::Args)]
pub struct RegisterArgs {
    /// Service name
    #[arg(long = "name")]
    pub name: String,

    /// Scheme-qualified endpoint, e.g. grpc://10.0.0.1:9090 (repeatable)
    #[arg(short = 'e', long = "endpoint", required = true)]
    pub endpoints: Vec<String>,

    /// Instance id; generated when absent
    #[arg(long = "id")]
    pub id: Option<String>,

    #[arg(long = "version", default_value = "")]
    pub version: String,

    /// Metadata entry as key=value (repeatable)
    #[arg(short = 'm', long = "meta", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    #[arg(long = "weight")]
    pub weight: Option<f64>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Etcd,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Etcd => "etcd",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "dial_timeout_ms", default = "default_dial_timeout")]
    pub dial_timeout: Duration,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            endpoints: default_endpoints(),
            dial_timeout: default_dial_timeout(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub resolver: ResolverOptions,
}

impl AgentConfig {
    /// Load the layered configuration for `cli`.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(cli.config.as_path()).required(false))
            .add_source(
                Environment::with_prefix("WAYPOINT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.endpoints")
                    .try_parsing(true),
            );

        if let Some(store) = cli.store {
            builder = builder.set_override("store.kind", store.as_str())?;
        }
        if !cli.etcd_endpoints.is_empty() {
            builder = builder.set_override("store.endpoints", cli.etcd_endpoints.clone())?;
        }
        if let Some(namespace) = &cli.namespace {
            builder = builder.set_override("registry.namespace", namespace.as_str())?;
        }
        if cli.secure {
            builder = builder.set_override("resolver.insecure", false)?;
        }

        let config: AgentConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
