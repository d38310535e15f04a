//! # Certificate rotation
//!
//! Rotates an X.509 certificate across every node of a server fleet and
//! reconciles the endpoint bindings that reference it.
//!
//! A run discovers the fleet from its primary node, installs the new
//! certificate on every member, flips the farm-wide certificate pointer once
//! all installs succeeded, and then does best-effort follow-up work per node
//! (binding reconciliation, service restart, verification, cleanup of
//! superseded certificates). Everything goes through
//! [`session_executor::RemoteExecutionSession`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use cert_rotation::{
//!     CredentialMaterial, HostSessionFactory, MultiNodeRotationOrchestrator, RotationContext,
//!     RotationRequest,
//! };
//! use session_executor::{ConnectionParameters, NodeIdentity};
//!
//! # async fn example() -> cert_rotation::Result<()> {
//! let factory = HostSessionFactory::bundled(ConnectionParameters::default())?;
//! let orchestrator = MultiNodeRotationOrchestrator::new(RotationContext::new(factory));
//!
//! let material = CredentialMaterial::load("adfs-2025.pfx", "changeit")?;
//! let request = RotationRequest::new(vec![NodeIdentity::parse("adfs01")?], material);
//! let outcome = orchestrator.rotate(&request).await;
//! println!("{}", outcome.summary);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod bindings;
mod context;
mod discovery;
mod fingerprint;
mod installer;
mod material;
pub mod operations;
mod outcome;
mod rotation;
mod transfer;

pub use bindings::{
    BindingDescriptor, BindingReconciler, EndpointResult, ReconcileReport, ReconcileStatus, SniFlag,
};
pub use context::{
    CancellationFlag, Clock, HostSessionFactory, RotationContext, RotationOptions, SessionFactory,
    SystemClock,
};
pub use discovery::{FleetTopology, NodeTopologyDiscovery};
pub use fingerprint::Fingerprint;
pub use installer::{InstallReport, PerNodeInstaller};
pub use material::CredentialMaterial;
pub use outcome::{FailureKind, NodeFailure, OutcomeBuilder, Phase, PhaseWarning, RotationOutcome};
pub use rotation::{MultiNodeRotationOrchestrator, RotationRequest};
pub use transfer::{CredentialTransfer, StagedFile};

use std::time::Duration;

/// Error types for rotation operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Session layer errors
    #[error(transparent)]
    Session(#[from] session_executor::Error),

    /// Discovery returned no members
    #[error("fleet discovery returned no nodes")]
    EmptyFleet,

    /// A thumbprint could not be normalized
    #[error("invalid fingerprint '{input}': {reason}")]
    InvalidFingerprint {
        /// Raw input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// An SNI flag value outside the known set
    #[error("invalid SNI flag: {0}")]
    InvalidSniFlag(String),

    /// A node installed a different certificate than the one being rotated
    #[error("installed certificate {actual} does not match expected {expected}")]
    FingerprintMismatch {
        /// Fingerprint the run expects
        expected: Fingerprint,
        /// Fingerprint the node reported
        actual: Fingerprint,
    },

    /// The certificate bundle could not be read
    #[error("cannot read certificate material {path}: {reason}")]
    Material {
        /// Bundle location
        path: String,
        /// Why it could not be used
        reason: String,
    },

    /// Staging the bundle on a node failed
    #[error("staging failed: {0}")]
    Staging(String),

    /// A per-node unit did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled before this unit started
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Text recorded for a failed node
    ///
    /// Operation failures keep the raw remote error text; everything else
    /// uses the full error description.
    pub fn node_message(&self) -> String {
        match self {
            Error::Session(e) if e.is_operation() => e
                .remote_message()
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
            other => other.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_message_keeps_remote_text() {
        let err = Error::from(session_executor::Error::operation(
            "Install-FleetCertificate",
            "disk full",
        ));
        assert_eq!(err.node_message(), "disk full");

        let err = Error::from(session_executor::Error::Connection {
            host: "web03".to_string(),
            reason: "unreachable".to_string(),
        });
        assert_eq!(err.node_message(), "connection to web03 failed: unreachable");

        assert_eq!(Error::Cancelled.node_message(), "cancelled");
        assert_eq!(Error::Timeout(Duration::from_secs(30)).node_message(), "timed out after 30s");
    }
}
