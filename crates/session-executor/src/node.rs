//! Node identities and local/remote resolution
//!
//! A node is written as `name` or `name|token`. The token is either a local
//! override (`localmachine`, `local`) or a transport hint (`winrm`, `http`,
//! `https`, `ssh`).
//!
//! Resolution precedence:
//! 1. A visible name that is a local sentinel (`localhost`, `local`, `.`,
//!    `127.0.0.1`, `::1`) always runs locally, whatever the token says.
//! 2. A local override token runs locally even for a remote-looking name.
//! 3. Otherwise the node is remote, optionally with a per-node transport hint.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

const LOCAL_SENTINELS: &[&str] = &["localhost", "local", ".", "127.0.0.1", "::1"];
const LOCAL_TOKENS: &[&str] = &["localmachine", "local"];

/// Per-node transport override carried in the `name|token` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    /// WinRM with the run's TLS setting
    WinRm,
    /// WinRM over plain HTTP
    Http,
    /// WinRM over HTTPS
    Https,
    /// PowerShell remoting over SSH
    Ssh,
}

impl TransportHint {
    fn token(&self) -> &'static str {
        match self {
            TransportHint::WinRm => "winrm",
            TransportHint::Http => "http",
            TransportHint::Https => "https",
            TransportHint::Ssh => "ssh",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "winrm" => Some(TransportHint::WinRm),
            "http" => Some(TransportHint::Http),
            "https" => Some(TransportHint::Https),
            "ssh" => Some(TransportHint::Ssh),
            _ => None,
        }
    }
}

/// A machine taking part in a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeIdentity {
    name: String,
    local_marker: bool,
    transport_hint: Option<TransportHint>,
}

impl NodeIdentity {
    /// A remote node addressed by name, without overrides
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_marker: false,
            transport_hint: None,
        }
    }

    /// A node explicitly marked to run in-process
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_marker: true,
            transport_hint: None,
        }
    }

    /// Attach a transport hint
    pub fn with_transport_hint(mut self, hint: TransportHint) -> Self {
        self.transport_hint = Some(hint);
        self
    }

    /// Parse the `name` / `name|token` form
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidNode {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (name, token) = match input.split_once('|') {
            Some((name, token)) => (name.trim(), Some(token.trim().to_ascii_lowercase())),
            None => (input.trim(), None),
        };

        if name.is_empty() {
            return Err(invalid("empty machine name"));
        }

        let mut node = NodeIdentity::new(name);
        match token.as_deref() {
            None => {}
            Some(t) if LOCAL_TOKENS.contains(&t) => node.local_marker = true,
            Some(t) => match TransportHint::from_token(t) {
                Some(hint) => node.transport_hint = Some(hint),
                None => return Err(invalid("unknown override token")),
            },
        }
        Ok(node)
    }

    /// The visible machine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-node transport hint, if any
    pub fn transport_hint(&self) -> Option<TransportHint> {
        self.transport_hint
    }

    /// Whether the visible name is one of the local sentinels
    pub fn has_local_name(&self) -> bool {
        let lowered = self.name.to_ascii_lowercase();
        LOCAL_SENTINELS.contains(&lowered.as_str())
    }

    /// Whether work for this node runs in-process
    pub fn is_local(&self) -> bool {
        self.has_local_name() || self.local_marker
    }

    /// Whether two identities address the same machine
    ///
    /// Names compare case-insensitively; a bare short name also matches the
    /// first label of a fully qualified name.
    pub fn same_machine(&self, other: &NodeIdentity) -> bool {
        if self.is_local() && other.is_local() {
            return true;
        }
        let a = self.name.to_ascii_lowercase();
        let b = other.name.to_ascii_lowercase();
        if a == b {
            return true;
        }
        if a.parse::<IpAddr>().is_ok() || b.parse::<IpAddr>().is_ok() {
            return false;
        }
        match (a.contains('.'), b.contains('.')) {
            (false, true) => b.split('.').next() == Some(a.as_str()),
            (true, false) => a.split('.').next() == Some(b.as_str()),
            _ => false,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.local_marker {
            write!(f, "|localmachine")?;
        } else if let Some(hint) = self.transport_hint {
            write!(f, "|{}", hint.token())?;
        }
        Ok(())
    }
}

impl From<NodeIdentity> for String {
    fn from(node: NodeIdentity) -> Self {
        node.to_string()
    }
}

impl TryFrom<String> for NodeIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        NodeIdentity::parse(&value)
    }
}

impl std::str::FromStr for NodeIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeIdentity::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name_is_remote() {
        let node = NodeIdentity::parse("web01.corp.example").unwrap();
        assert_eq!(node.name(), "web01.corp.example");
        assert!(!node.is_local());
        assert_eq!(node.transport_hint(), None);
    }

    #[test]
    fn test_local_sentinels_win_over_tokens() {
        for input in ["localhost", "LOCALHOST", "127.0.0.1", "localhost|https", "local|ssh"] {
            let node = NodeIdentity::parse(input).unwrap();
            assert!(node.is_local(), "{input} should resolve locally");
        }
    }

    #[test]
    fn test_local_override_on_remote_looking_name() {
        let node = NodeIdentity::parse("10.1.2.3|LocalMachine").unwrap();
        assert!(node.is_local());
        assert_eq!(node.name(), "10.1.2.3");
        assert_eq!(node.to_string(), "10.1.2.3|localmachine");
    }

    #[test]
    fn test_transport_hints() {
        let node = NodeIdentity::parse("sql01|https").unwrap();
        assert!(!node.is_local());
        assert_eq!(node.transport_hint(), Some(TransportHint::Https));

        let node = NodeIdentity::parse("linuxbox | ssh").unwrap();
        assert_eq!(node.name(), "linuxbox");
        assert_eq!(node.transport_hint(), Some(TransportHint::Ssh));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            NodeIdentity::parse("web01|carrier-pigeon"),
            Err(Error::InvalidNode { .. })
        ));
        assert!(NodeIdentity::parse("  ").is_err());
        assert!(NodeIdentity::parse("|local").is_err());
    }

    #[test]
    fn test_same_machine() {
        let short = NodeIdentity::new("ADFS01");
        let fqdn = NodeIdentity::new("adfs01.corp.example");
        let other = NodeIdentity::new("adfs02.corp.example");
        assert!(short.same_machine(&fqdn));
        assert!(fqdn.same_machine(&short));
        assert!(!fqdn.same_machine(&other));
        assert!(!NodeIdentity::new("10.0.0.1").same_machine(&NodeIdentity::new("10")));
    }

    #[test]
    fn test_serde_uses_display_form() {
        let node = NodeIdentity::parse("web01|http").unwrap();
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, "\"web01|http\"");
        let back: NodeIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
