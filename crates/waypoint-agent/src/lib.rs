//! Waypoint Agent - command line front end
//!
//! Wires the registry and resolver libraries to a real store:
//! - `config`: layered file/environment/flag configuration
//! - `logging`: console and rolling file output
//! - `shutdown`: Ctrl+C/SIGTERM handling
//! - `store`: in-memory or etcd backend selection
//! - `commands`: `register`, `list`, `watch` and `demo`

pub mod commands;
pub mod config;
pub mod logging;
pub mod shutdown;
pub mod store;

pub use commands::Agent;
pub use config::{AgentConfig, Cli, Command};
