//! # Rotation Configuration
//!
//! YAML job files for certificate rotation.
//!
//! A job file names the fleet, how to reach it, and the certificate to roll
//! out. Secrets are never stored inline: credential fields hold references
//! (`${VAR}`, `${VAR:-default}`, `file:<path>`) that a [`resolver::SecretResolver`]
//! turns into plaintext right before sessions are opened.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use session_executor::TransportKind;
use std::path::PathBuf;
use thiserror::Error;

pub mod job;
pub mod parser;
pub mod resolver;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Secret file could not be read
    #[error("Cannot read secret file {path}: {source}")]
    SecretFile {
        /// File the reference pointed at
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Certificate material or fingerprint rejected
    #[error(transparent)]
    Rotation(#[from] cert_rotation::Error),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root of a job file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Configuration version
    pub version: String,

    /// Optional job name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global settings
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,

    /// Fleet members; the first is the presumed primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// Single node to start from, instead of `nodes`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Ask the primary for the fleet membership
    #[serde(default = "default_true")]
    pub discover: bool,

    /// How to reach the nodes
    #[serde(default)]
    pub connection: Connection,

    /// Certificate to roll out
    pub certificate: Certificate,

    /// Account granted read access to the private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_identity: Option<String>,

    /// Service restarted on every node after the switch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_service: Option<String>,

    /// Fingerprint of the certificate being replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal: Option<String>,

    /// Run options
    #[serde(default)]
    pub options: Options,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Default log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl Settings {
    /// Check if settings are default (all None)
    fn is_default(&self) -> bool {
        self == &Settings::default()
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Connection {
    /// Transport for nodes without their own hint
    #[serde(default)]
    pub transport: TransportKind,

    /// Explicit port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Use TLS for WinRM
    #[serde(default)]
    pub use_ssl: bool,

    /// Embed the port in the SPN
    #[serde(default)]
    pub include_port_in_spn: bool,

    /// Account name (secret reference allowed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Account password reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// SSH private key path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,

    /// PowerShell executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_program: Option<String>,
}

/// Certificate bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    /// PFX path
    pub path: String,

    /// Bundle password reference
    pub password: String,

    /// Expected thumbprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Run options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Options {
    /// Per-node time limit in seconds
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,

    /// Nodes worked on concurrently
    #[serde(default = "default_parallel")]
    pub max_parallel_nodes: usize,

    /// Remove superseded certificates
    #[serde(default = "default_true")]
    pub cleanup_superseded: bool,

    /// Verify every node after the switch
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout(),
            max_parallel_nodes: default_parallel(),
            cleanup_superseded: true,
            verify: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_node_timeout() -> u64 {
    300
}
fn default_parallel() -> usize {
    1
}
