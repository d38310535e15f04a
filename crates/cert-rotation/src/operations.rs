//! Typed entries of the rotation operation library
//!
//! Each struct names one function in `library/FleetRotation.ps1` and the
//! record shape it returns. Records are validated when they are decoded, so
//! a library that drifts from these shapes fails loudly.

use crate::bindings::BindingDescriptor;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use session_executor::{OperationLibrary, Parameters, Password, RemoteOperation};

/// Version the bundled library carries and sessions require
pub const LIBRARY_VERSION: &str = "1";

/// Library source compiled into the crate
pub const BUNDLED_LIBRARY: &str = include_str!("../library/FleetRotation.ps1");

/// Load the bundled library
pub fn bundled_library() -> session_executor::Result<OperationLibrary> {
    OperationLibrary::from_source("library/FleetRotation.ps1", BUNDLED_LIBRARY, LIBRARY_VERSION)
}

/// A fleet member as reported by the primary node
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FleetMember {
    /// Machine name
    pub name: String,
    /// Whether this member holds the farm's primary role
    #[serde(default)]
    pub is_primary: bool,
}

/// Enumerate fleet members (read-only)
#[derive(Debug, Clone, Default)]
pub struct GetFleetNodes;

impl RemoteOperation for GetFleetNodes {
    type Output = FleetMember;
    const NAME: &'static str = "Get-FleetNodes";

    fn parameters(&self) -> Parameters {
        Parameters::new()
    }
}

/// Certificate metadata as read from a store
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Thumbprint
    pub fingerprint: Fingerprint,
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// Result of importing a bundle into the machine store
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InstallReceipt {
    /// Thumbprint
    pub fingerprint: Fingerprint,
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// The certificate was already in the store
    pub already_installed: bool,
}

/// Import a staged bundle into the machine store
#[derive(Debug, Clone)]
pub struct InstallCertificate {
    /// Node-local path of the staged bundle
    pub path: String,
    /// Bundle password
    pub password: Password,
}

impl RemoteOperation for InstallCertificate {
    type Output = InstallReceipt;
    const NAME: &'static str = "Install-FleetCertificate";

    fn parameters(&self) -> Parameters {
        Parameters::new()
            .with("Path", self.path.as_str())
            .with("Password", self.password.expose())
    }
}

/// Result of granting private-key access
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GrantReceipt {
    /// The identity already had read access
    pub already_granted: bool,
}

/// Grant a service identity read access to a certificate's private key
#[derive(Debug, Clone)]
pub struct GrantPrivateKeyAccess {
    /// Certificate
    pub fingerprint: Fingerprint,
    /// Account the consuming service runs as
    pub identity: String,
}

impl RemoteOperation for GrantPrivateKeyAccess {
    type Output = GrantReceipt;
    const NAME: &'static str = "Grant-PrivateKeyAccess";

    fn parameters(&self) -> Parameters {
        Parameters::new()
            .with("Fingerprint", self.fingerprint.as_str())
            .with("Identity", self.identity.as_str())
    }
}

/// Result of switching the farm-wide certificate
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FarmCommit {
    /// Certificate the farm used before
    #[serde(default)]
    pub previous_fingerprint: Option<String>,
}

/// Point the farm at a certificate; run once per rotation from the primary
#[derive(Debug, Clone)]
pub struct SetFarmCertificate {
    /// New certificate
    pub fingerprint: Fingerprint,
}

impl RemoteOperation for SetFarmCertificate {
    type Output = FarmCommit;
    const NAME: &'static str = "Set-FarmCertificate";

    fn parameters(&self) -> Parameters {
        Parameters::new().with("Fingerprint", self.fingerprint.as_str())
    }
}

/// Result of restarting a service
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceRestart {
    /// Service name
    pub service: String,
    /// Status after the restart
    pub status: String,
}

/// Restart the service that consumes the certificate
#[derive(Debug, Clone)]
pub struct RestartFarmService {
    /// Service name
    pub service: String,
}

impl RemoteOperation for RestartFarmService {
    type Output = ServiceRestart;
    const NAME: &'static str = "Restart-FarmService";

    fn parameters(&self) -> Parameters {
        Parameters::new().with("Name", self.service.as_str())
    }
}

/// Presence check for an installed certificate
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CertificateCheck {
    /// The certificate is in the machine store
    pub present: bool,
    /// Its private key is accessible
    pub has_private_key: bool,
}

/// Check that a certificate is installed with its private key
#[derive(Debug, Clone)]
pub struct TestCertificate {
    /// Certificate
    pub fingerprint: Fingerprint,
}

impl RemoteOperation for TestCertificate {
    type Output = CertificateCheck;
    const NAME: &'static str = "Test-FleetCertificate";

    fn parameters(&self) -> Parameters {
        Parameters::new().with("Fingerprint", self.fingerprint.as_str())
    }
}

/// List machine-store certificates with a given subject
#[derive(Debug, Clone)]
pub struct GetCertificates {
    /// Subject distinguished name
    pub subject: String,
}

impl RemoteOperation for GetCertificates {
    type Output = CertificateInfo;
    const NAME: &'static str = "Get-FleetCertificates";

    fn parameters(&self) -> Parameters {
        Parameters::new().with("Subject", self.subject.as_str())
    }
}

/// Result of removing a certificate
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemovalReceipt {
    /// Whether anything was removed
    pub removed: bool,
}

/// Remove a certificate and its private key from the machine store
#[derive(Debug, Clone)]
pub struct RemoveCertificate {
    /// Certificate
    pub fingerprint: Fingerprint,
}

impl RemoteOperation for RemoveCertificate {
    type Output = RemovalReceipt;
    const NAME: &'static str = "Remove-FleetCertificate";

    fn parameters(&self) -> Parameters {
        Parameters::new().with("Fingerprint", self.fingerprint.as_str())
    }
}

/// Enumerate service-endpoint bindings on a node (read-only)
#[derive(Debug, Clone, Default)]
pub struct GetEndpointBindings;

impl RemoteOperation for GetEndpointBindings {
    type Output = BindingDescriptor;
    const NAME: &'static str = "Get-EndpointBindings";

    fn parameters(&self) -> Parameters {
        Parameters::new()
    }
}

/// Acknowledgement of a rebound endpoint
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BindingUpdate {
    /// Endpoint as the node describes it
    pub endpoint: String,
}

/// Rebind one endpoint to a new certificate, keeping its other settings
#[derive(Debug, Clone)]
pub struct SetEndpointBinding<'a> {
    /// Binding being replaced
    pub binding: &'a BindingDescriptor,
    /// Certificate to bind
    pub fingerprint: &'a Fingerprint,
}

impl RemoteOperation for SetEndpointBinding<'_> {
    type Output = BindingUpdate;
    const NAME: &'static str = "Set-EndpointBinding";

    fn parameters(&self) -> Parameters {
        let mut params = Parameters::new()
            .with("Site", self.binding.site.as_str())
            .with("Protocol", self.binding.protocol.as_str())
            .with("Address", self.binding.address.as_str())
            .with("Port", self.binding.port)
            .with("SniFlag", self.binding.sni_flag.code())
            .with("Fingerprint", self.fingerprint.as_str());
        params.set_opt("HostHeader", self.binding.host_header.as_deref());
        params.set_opt(
            "PreviousFingerprint",
            self.binding.fingerprint.as_ref().map(Fingerprint::as_str),
        );
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::SniFlag;
    use serde_json::json;
    use session_executor::OperationResult;

    #[test]
    fn test_bundled_library_loads() {
        let library = bundled_library().unwrap();
        assert_eq!(library.version(), LIBRARY_VERSION);
        for name in [
            GetFleetNodes::NAME,
            InstallCertificate::NAME,
            GrantPrivateKeyAccess::NAME,
            SetFarmCertificate::NAME,
            RestartFarmService::NAME,
            TestCertificate::NAME,
            GetCertificates::NAME,
            RemoveCertificate::NAME,
            GetEndpointBindings::NAME,
            SetEndpointBinding::NAME,
        ] {
            assert!(
                library.contents().contains(&format!("function global:{}", name)),
                "library is missing {}",
                name
            );
        }
    }

    #[test]
    fn test_install_receipt_decodes_timestamps() {
        let result = OperationResult::from_records(vec![json!({
            "fingerprint": "3b2f5c1d9a0e4f6b7c8d9e0f1a2b3c4d5e6f7a8b",
            "subject": "CN=sts.contoso.com",
            "not_before": "2025-01-01T00:00:00.0000000Z",
            "not_after": "2026-01-01T00:00:00Z",
            "already_installed": false,
        })]);
        let receipts: Vec<InstallReceipt> = result.decode(InstallCertificate::NAME).unwrap();
        assert_eq!(receipts[0].fingerprint.as_str(), "3B2F5C1D9A0E4F6B7C8D9E0F1A2B3C4D5E6F7A8B");
        assert!(receipts[0].not_before < receipts[0].not_after);
    }

    #[test]
    fn test_set_binding_parameters() {
        let binding = BindingDescriptor {
            site: "Default Web Site".to_string(),
            protocol: "https".to_string(),
            address: "*".to_string(),
            port: 443,
            host_header: Some("sts.contoso.com".to_string()),
            fingerprint: None,
            sni_flag: SniFlag::SniEnabled,
        };
        let fp = Fingerprint::parse(&"A".repeat(40)).unwrap();
        let params = SetEndpointBinding {
            binding: &binding,
            fingerprint: &fp,
        }
        .parameters();

        assert_eq!(params.get("Port"), Some(&json!(443)));
        assert_eq!(params.get("SniFlag"), Some(&json!(1)));
        assert_eq!(params.get_str("HostHeader"), Some("sts.contoso.com"));
        assert!(params.get("PreviousFingerprint").is_none());
    }
}
