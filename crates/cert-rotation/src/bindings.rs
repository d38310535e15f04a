//! Endpoint binding reconciliation
//!
//! After a renewal, endpoints that still present the old certificate are
//! rebound to the new one. Each endpoint is handled on its own: one failed
//! rebind never stops the others.

use crate::fingerprint::Fingerprint;
use crate::operations::{GetEndpointBindings, SetEndpointBinding};
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use session_executor::RemoteExecutionSession;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Protocols whose bindings carry a certificate
pub const CREDENTIAL_PROTOCOLS: &[&str] = &["https", "ftps", "sqltls"];

/// Server Name Indication mode of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SniFlag {
    /// No SNI, IP:port binding
    None,
    /// SNI enabled
    SniEnabled,
    /// Central certificate store without SNI
    NonSniCentral,
    /// Central certificate store with SNI
    SniCentral,
}

impl SniFlag {
    /// Numeric value used by the platform
    pub fn code(&self) -> u8 {
        match self {
            SniFlag::None => 0,
            SniFlag::SniEnabled => 1,
            SniFlag::NonSniCentral => 2,
            SniFlag::SniCentral => 3,
        }
    }

    /// Map a numeric value
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(SniFlag::None),
            1 => Ok(SniFlag::SniEnabled),
            2 => Ok(SniFlag::NonSniCentral),
            3 => Ok(SniFlag::SniCentral),
            other => Err(Error::InvalidSniFlag(other.to_string())),
        }
    }

    /// Label used by the platform's legacy string form
    pub fn label(&self) -> &'static str {
        match self {
            SniFlag::None => "No SNI",
            SniFlag::SniEnabled => "SNI Enabled",
            SniFlag::NonSniCentral => "Non SNI Binding",
            SniFlag::SniCentral => "SNI Binding",
        }
    }

    /// Normalize a bare digit or a legacy label such as `"1 - SNI Enabled"`
    ///
    /// A label must name the same mode as its digit (case-insensitive).
    pub fn parse(input: &str) -> Result<Self> {
        static LABEL: OnceLock<Regex> = OnceLock::new();
        let pattern = LABEL.get_or_init(|| {
            Regex::new(r"^\s*(\d+)\s*(?:-\s*(\S.*?))?\s*$").expect("SNI label pattern is valid")
        });

        let invalid = || Error::InvalidSniFlag(input.to_string());
        let caps = pattern.captures(input).ok_or_else(invalid)?;
        let code = caps[1].parse::<i64>().map_err(|_| invalid())?;
        let flag = Self::from_code(code).map_err(|_| invalid())?;
        match caps.get(2) {
            Some(label) if !label.as_str().eq_ignore_ascii_case(flag.label()) => Err(invalid()),
            _ => Ok(flag),
        }
    }

    /// Normalize a JSON value (integer or string); null is rejected
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| Error::InvalidSniFlag(n.to_string()))
                .and_then(Self::from_code),
            Value::String(s) => Self::parse(s),
            other => Err(Error::InvalidSniFlag(other.to_string())),
        }
    }
}

impl fmt::Display for SniFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code(), self.label())
    }
}

impl std::str::FromStr for SniFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SniFlag::parse(s)
    }
}

impl Serialize for SniFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for SniFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SniFlag::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// One service endpoint binding on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDescriptor {
    /// Site or instance name
    pub site: String,
    /// Protocol (`https`, `ftps`, `sqltls`, ...)
    pub protocol: String,
    /// Bound address (`*` for all)
    pub address: String,
    /// Bound port
    pub port: u16,
    /// Host header, if any
    #[serde(default)]
    pub host_header: Option<String>,
    /// Certificate currently bound
    #[serde(default, deserialize_with = "lenient_fingerprint")]
    pub fingerprint: Option<Fingerprint>,
    /// SNI mode; required even for bindings without a certificate
    pub sni_flag: SniFlag,
}

/// Bindings without a certificate report null, empty or junk hashes
fn lenient_fingerprint<'de, D>(deserializer: D) -> std::result::Result<Option<Fingerprint>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| Fingerprint::parse(&s).ok()))
}

impl BindingDescriptor {
    /// Whether this binding's protocol carries a certificate
    pub fn carries_credential(&self) -> bool {
        let protocol = self.protocol.to_ascii_lowercase();
        CREDENTIAL_PROTOCOLS.contains(&protocol.as_str())
    }

    /// Short endpoint label (`https/Default Web Site/*:443:sts.contoso.com`)
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}/{}:{}:{}",
            self.protocol,
            self.site,
            self.address,
            self.port,
            self.host_header.as_deref().unwrap_or("")
        )
    }
}

/// Result for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointResult {
    /// Endpoint label
    pub endpoint: String,
    /// Whether the rebind succeeded
    pub replaced: bool,
    /// Remote error text when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall state of a node's reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// No endpoint referenced the renewed certificate
    NothingToDo,
    /// Every matching endpoint was rebound
    Reconciled,
    /// Some endpoints were rebound, some failed
    PartiallyReconciled,
    /// No matching endpoint could be rebound
    Failed,
}

/// Per-node reconciliation report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Node name
    pub node: String,
    /// Summary status
    pub status: ReconcileStatus,
    /// Certificate being replaced
    pub renewal: Fingerprint,
    /// Certificate bound instead
    pub replacement: Fingerprint,
    /// Per-endpoint results in enumeration order
    pub endpoints: Vec<EndpointResult>,
}

impl ReconcileReport {
    /// Endpoints that were rebound
    pub fn replaced(&self) -> impl Iterator<Item = &EndpointResult> {
        self.endpoints.iter().filter(|e| e.replaced)
    }

    /// Endpoints that failed to rebind
    pub fn failures(&self) -> impl Iterator<Item = &EndpointResult> {
        self.endpoints.iter().filter(|e| !e.replaced)
    }
}

/// Rebinds endpoints from a renewed certificate to its replacement
#[derive(Debug, Clone, Copy, Default)]
pub struct BindingReconciler;

impl BindingReconciler {
    /// Rebind every credential-bearing endpoint on the session's node that
    /// currently presents `renewal`
    ///
    /// Enumeration failures are returned as errors; per-endpoint failures are
    /// recorded in the report.
    pub async fn reconcile(
        &self,
        session: &mut RemoteExecutionSession,
        renewal: &Fingerprint,
        replacement: &Fingerprint,
    ) -> Result<ReconcileReport> {
        let node = session.node().name().to_string();
        let bindings = session.call(&GetEndpointBindings).await?;
        debug!(node = %node, count = bindings.len(), "enumerated endpoint bindings");

        let matching: Vec<&BindingDescriptor> = bindings
            .iter()
            .filter(|b| b.carries_credential() && b.fingerprint.as_ref() == Some(renewal))
            .collect();

        let mut endpoints = Vec::with_capacity(matching.len());
        for binding in matching {
            let endpoint = binding.endpoint();
            let operation = SetEndpointBinding {
                binding,
                fingerprint: replacement,
            };
            match session.call(&operation).await {
                Ok(_) => {
                    info!(node = %node, endpoint = %endpoint, "rebound endpoint");
                    endpoints.push(EndpointResult {
                        endpoint,
                        replaced: true,
                        error: None,
                    });
                }
                Err(e) => {
                    let message = Error::from(e).node_message();
                    warn!(node = %node, endpoint = %endpoint, "failed to rebind endpoint: {}", message);
                    endpoints.push(EndpointResult {
                        endpoint,
                        replaced: false,
                        error: Some(message),
                    });
                }
            }
        }

        let replaced = endpoints.iter().filter(|e| e.replaced).count();
        let status = match (endpoints.len(), replaced) {
            (0, _) => ReconcileStatus::NothingToDo,
            (total, done) if total == done => ReconcileStatus::Reconciled,
            (_, 0) => ReconcileStatus::Failed,
            _ => ReconcileStatus::PartiallyReconciled,
        };

        Ok(ReconcileReport {
            node,
            status,
            renewal: renewal.clone(),
            replacement: replacement.clone(),
            endpoints,
        })
    }
}
