//! Installing the certificate on one node

use crate::fingerprint::Fingerprint;
use crate::material::CredentialMaterial;
use crate::operations::{GrantPrivateKeyAccess, InstallCertificate};
use crate::transfer::{CredentialTransfer, StagedFile};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use session_executor::RemoteExecutionSession;
use tracing::{info, warn};

/// What one node reported after installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Node name
    pub node: String,
    /// Installed certificate
    pub fingerprint: Fingerprint,
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// The certificate was already in the store
    pub already_installed: bool,
    /// Private-key access was already in place; `None` when no identity is configured
    pub already_granted: Option<bool>,
    /// Best-effort problems (staged copy left behind)
    pub warnings: Vec<String>,
}

/// Installs a bundle and grants the service identity access to its key
#[derive(Debug, Clone)]
pub struct PerNodeInstaller<'a> {
    material: &'a CredentialMaterial,
    expected: Option<&'a Fingerprint>,
    identity: Option<&'a str>,
    file_name: String,
}

impl<'a> PerNodeInstaller<'a> {
    /// Create an installer; `file_name` names the staged copy
    pub fn new(material: &'a CredentialMaterial, file_name: impl Into<String>) -> Self {
        Self {
            material,
            expected: None,
            identity: None,
            file_name: file_name.into(),
        }
    }

    /// Reject nodes that report a different certificate
    pub fn expecting(mut self, fingerprint: Option<&'a Fingerprint>) -> Self {
        self.expected = fingerprint;
        self
    }

    /// Grant this account read access to the private key
    pub fn granting(mut self, identity: Option<&'a str>) -> Self {
        self.identity = identity;
        self
    }

    /// Stage, install, grant, and remove the staged copy
    pub async fn install(&self, session: &mut RemoteExecutionSession) -> Result<InstallReport> {
        let transfer = CredentialTransfer;
        let staged = transfer.stage(session, self.material, &self.file_name).await?;

        let result = self.install_staged(session, &staged).await;

        let cleanup = transfer.remove(session, &staged).await;
        match (result, cleanup) {
            (Ok(mut report), Err(e)) => {
                let message = format!("staged bundle {} not removed: {}", staged.path(), e);
                warn!(node = %report.node, "{}", message);
                report.warnings.push(message);
                Ok(report)
            }
            (Err(install), Err(e)) => {
                warn!(node = %session.node(), path = %staged.path(), "staged bundle not removed: {}", e);
                Err(install)
            }
            (result, Ok(())) => result,
        }
    }

    async fn install_staged(
        &self,
        session: &mut RemoteExecutionSession,
        staged: &StagedFile,
    ) -> Result<InstallReport> {
        let node = session.node().name().to_string();
        let receipt = session
            .call_one(&InstallCertificate {
                path: staged.path(),
                password: self.material.password().clone(),
            })
            .await?;

        if let Some(expected) = self.expected {
            if &receipt.fingerprint != expected {
                return Err(Error::FingerprintMismatch {
                    expected: expected.clone(),
                    actual: receipt.fingerprint,
                });
            }
        }

        let already_granted = match self.identity {
            Some(identity) => {
                let grant = session
                    .call_one(&GrantPrivateKeyAccess {
                        fingerprint: receipt.fingerprint.clone(),
                        identity: identity.to_string(),
                    })
                    .await?;
                Some(grant.already_granted)
            }
            None => None,
        };

        info!(
            node = %node,
            fingerprint = %receipt.fingerprint,
            already_installed = receipt.already_installed,
            "certificate installed"
        );
        Ok(InstallReport {
            node,
            fingerprint: receipt.fingerprint,
            subject: receipt.subject,
            not_before: receipt.not_before,
            not_after: receipt.not_after,
            already_installed: receipt.already_installed,
            already_granted,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use session_executor::testing::Script;
    use session_executor::{NodeIdentity, OperationResult};
    use std::sync::{Arc, Mutex};

    const FP: &str = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";

    /// Store and ACL state of one emulated node
    #[derive(Default)]
    struct Store {
        installed: bool,
        granted: bool,
    }

    fn node_script(store: Arc<Mutex<Store>>, fail_remove: bool) -> Script {
        let install_store = store.clone();
        Script::new()
            .on_script(move |call| {
                let text = call.script.unwrap_or_default();
                if text.contains("WriteAllBytes") {
                    Ok(OperationResult::from_records(vec![json!({"path": "C:\\Temp\\b.pfx"})]))
                } else if text.contains("FromBase64String") {
                    Ok(OperationResult::from_records(vec![json!({"length": 3})]))
                } else if fail_remove {
                    Ok(OperationResult::failed("The process cannot access the file"))
                } else {
                    Ok(OperationResult::default())
                }
            })
            .on("Install-FleetCertificate", move |call| {
                assert_eq!(call.parameters.get_str("Password"), Some("pw"));
                let mut store = install_store.lock().unwrap();
                let already = store.installed;
                store.installed = true;
                Ok(OperationResult::from_records(vec![json!({
                    "fingerprint": FP,
                    "subject": "CN=sts.contoso.com",
                    "not_before": "2025-01-01T00:00:00Z",
                    "not_after": "2026-01-01T00:00:00Z",
                    "already_installed": already,
                })]))
            })
            .on("Grant-PrivateKeyAccess", move |_| {
                let mut store = store.lock().unwrap();
                let already = store.granted;
                store.granted = true;
                Ok(OperationResult::from_records(vec![json!({"already_granted": already})]))
            })
    }

    async fn open(script: &Script) -> RemoteExecutionSession {
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs02"),
            Box::new(script.transport("adfs02")),
            Arc::new(crate::operations::bundled_library().unwrap()),
        );
        session.initialize().await.unwrap();
        session
    }

    #[smol_potat::test]
    async fn test_second_install_is_idempotent() {
        let store = Arc::new(Mutex::new(Store::default()));
        let script = node_script(store, false);
        let mut session = open(&script).await;

        let material = CredentialMaterial::from_bytes("b.pfx", vec![1, 2, 3], "pw").unwrap();
        let installer = PerNodeInstaller::new(&material, "b.pfx").granting(Some("NT SERVICE\\adfssrv"));

        let first = installer.install(&mut session).await.unwrap();
        assert!(!first.already_installed);
        assert_eq!(first.already_granted, Some(false));

        let second = installer.install(&mut session).await.unwrap();
        assert!(second.already_installed);
        assert_eq!(second.already_granted, Some(true));
        assert!(second.warnings.is_empty());
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_unexpected_fingerprint_is_rejected() {
        let script = node_script(Arc::new(Mutex::new(Store::default())), false);
        let mut session = open(&script).await;

        let material = CredentialMaterial::from_bytes("b.pfx", vec![1, 2, 3], "pw").unwrap();
        let expected = Fingerprint::parse(&"0".repeat(40)).unwrap();
        let err = PerNodeInstaller::new(&material, "b.pfx")
            .expecting(Some(&expected))
            .install(&mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
        // No grant for a certificate we did not ask for, but the staged copy is gone
        assert_eq!(script.log().count("Grant-PrivateKeyAccess"), 0);
        assert_eq!(script.log().count("<script>"), 3);
        session.terminate().await;
    }

    #[smol_potat::test]
    async fn test_leftover_staged_copy_is_a_warning() {
        let script = node_script(Arc::new(Mutex::new(Store::default())), true);
        let mut session = open(&script).await;

        let material = CredentialMaterial::from_bytes("b.pfx", vec![1, 2, 3], "pw").unwrap();
        let report = PerNodeInstaller::new(&material, "b.pfx").install(&mut session).await.unwrap();
        assert_eq!(report.already_granted, None);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("not removed"));
        session.terminate().await;
    }
}
