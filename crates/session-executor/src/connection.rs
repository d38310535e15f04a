//! Connection parameters shared by every node in a run

use crate::node::{NodeIdentity, TransportHint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default WinRM HTTP port
pub const WINRM_HTTP_PORT: u16 = 5985;
/// Default WinRM HTTPS port
pub const WINRM_HTTPS_PORT: u16 = 5986;
/// Default SSH port
pub const SSH_PORT: u16 = 22;

/// How sessions reach a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process execution on the orchestrating machine
    Local,
    /// Windows Remote Management
    #[default]
    WinRm,
    /// PowerShell remoting over SSH
    Ssh,
}

/// A secret that never appears in debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wrap a plaintext secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the plaintext
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Resolved account used to authenticate sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Account name (`DOMAIN\user` or `user@domain`)
    pub username: String,
    /// Account secret
    pub password: Password,
}

impl Credential {
    /// Create a credential
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Password::new(password),
        }
    }
}

/// Connection settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Transport used for nodes without their own hint
    pub transport: TransportKind,
    /// Explicit port; transport default when absent
    pub port: Option<u16>,
    /// Embed the port in the service principal name (WinRM/Kerberos)
    pub include_port_in_spn: bool,
    /// Use TLS for WinRM
    pub use_ssl: bool,
    /// Account; the ambient identity is used when absent
    pub credential: Option<Credential>,
    /// SSH private key
    pub key_file: Option<PathBuf>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            transport: TransportKind::WinRm,
            port: None,
            include_port_in_spn: false,
            use_ssl: false,
            credential: None,
            key_file: None,
        }
    }
}

impl ConnectionParameters {
    /// Create parameters for the given transport
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Embed the port in the SPN
    pub fn with_port_in_spn(mut self, enabled: bool) -> Self {
        self.include_port_in_spn = enabled;
        self
    }

    /// Use TLS for WinRM
    pub fn with_ssl(mut self, enabled: bool) -> Self {
        self.use_ssl = enabled;
        self
    }

    /// Set the credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Authenticate SSH sessions with this private key
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// Effective settings for `node`, applying its transport hint
    pub fn for_node(&self, node: &NodeIdentity) -> ResolvedConnection {
        if node.is_local() {
            return ResolvedConnection {
                transport: TransportKind::Local,
                port: 0,
                use_ssl: false,
                include_port_in_spn: false,
            };
        }

        let (transport, use_ssl) = match node.transport_hint() {
            None | Some(TransportHint::WinRm) => (self.transport, self.use_ssl),
            Some(TransportHint::Http) => (TransportKind::WinRm, false),
            Some(TransportHint::Https) => (TransportKind::WinRm, true),
            Some(TransportHint::Ssh) => (TransportKind::Ssh, false),
        };

        let default_port = match (transport, use_ssl) {
            (TransportKind::Ssh, _) => SSH_PORT,
            (TransportKind::WinRm, true) => WINRM_HTTPS_PORT,
            (TransportKind::WinRm, false) => WINRM_HTTP_PORT,
            (TransportKind::Local, _) => 0,
        };

        // A hint that changes the transport also drops the run-wide port
        let port = if node.transport_hint().is_some_and(|h| h != TransportHint::WinRm) {
            default_port
        } else {
            self.port.unwrap_or(default_port)
        };

        ResolvedConnection {
            transport,
            port,
            use_ssl,
            include_port_in_spn: self.include_port_in_spn && transport == TransportKind::WinRm,
        }
    }
}

/// Connection settings after applying per-node overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConnection {
    /// Transport to use
    pub transport: TransportKind,
    /// Port to connect to (0 for local)
    pub port: u16,
    /// TLS for WinRM
    pub use_ssl: bool,
    /// Port embedded in the SPN
    pub include_port_in_spn: bool,
}
