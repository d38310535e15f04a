//! Rotation outcomes
//!
//! An outcome is assembled phase by phase through [`OutcomeBuilder`] and is
//! immutable once [`OutcomeBuilder::finish`] hands it out.

use crate::bindings::ReconcileReport;
use crate::fingerprint::Fingerprint;
use crate::installer::InstallReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use session_executor::NodeIdentity;
use std::fmt;
use uuid::Uuid;

/// Phases of a rotation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Fleet discovery
    Discover,
    /// Per-node install
    Install,
    /// Farm-wide certificate switch
    Commit,
    /// Endpoint binding reconciliation
    ReconcileBindings,
    /// Dependent service restart
    Restart,
    /// Post-install verification
    Verify,
    /// Removal of superseded certificates
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discover => "discover",
            Phase::Install => "install",
            Phase::Commit => "commit",
            Phase::ReconcileBindings => "reconcile_bindings",
            Phase::Restart => "restart",
            Phase::Verify => "verify",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The fleet could not be resolved
    Discovery,
    /// At least one node failed to install
    Install,
    /// The farm-wide switch failed
    Commit,
    /// The run was cancelled before all installs finished
    Cancelled,
}

/// A node that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    /// Node
    pub node: NodeIdentity,
    /// Phase the failure happened in
    pub phase: Phase,
    /// Error text (raw remote text for operation failures)
    pub message: String,
}

/// A degraded but non-fatal problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseWarning {
    /// Phase
    pub phase: Phase,
    /// Node, when the warning is node specific
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeIdentity>,
    /// Description
    pub message: String,
}

/// Result of one rotation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    /// Run identifier
    pub run_id: Uuid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Whether the run succeeded (warnings allowed)
    pub success: bool,
    /// Why it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Run-level error text for discovery and commit failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Certificate the fleet now uses (or would have used)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Primary node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<NodeIdentity>,
    /// Nodes that installed the certificate
    pub succeeded: Vec<NodeIdentity>,
    /// Nodes that failed
    pub failed: Vec<NodeFailure>,
    /// Per-node install reports
    pub installs: Vec<InstallReport>,
    /// Per-node binding reconciliation reports
    pub bindings: Vec<ReconcileReport>,
    /// Degraded problems
    pub warnings: Vec<PhaseWarning>,
    /// One-line summary
    pub summary: String,
}

impl RotationOutcome {
    /// Error text recorded for `node`, matched by name
    pub fn failure_for(&self, node: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|f| f.node.name().eq_ignore_ascii_case(node))
            .map(|f| f.message.as_str())
    }

    /// Names of the nodes that succeeded
    pub fn succeeded_names(&self) -> Vec<&str> {
        self.succeeded.iter().map(NodeIdentity::name).collect()
    }

    /// Warnings raised in `phase`
    pub fn warnings_in(&self, phase: Phase) -> impl Iterator<Item = &PhaseWarning> {
        self.warnings.iter().filter(move |w| w.phase == phase)
    }
}

/// Incremental builder for [`RotationOutcome`]
#[derive(Debug)]
pub struct OutcomeBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    failure: Option<FailureKind>,
    error: Option<String>,
    fingerprint: Option<Fingerprint>,
    primary: Option<NodeIdentity>,
    succeeded: Vec<NodeIdentity>,
    failed: Vec<NodeFailure>,
    installs: Vec<InstallReport>,
    bindings: Vec<ReconcileReport>,
    warnings: Vec<PhaseWarning>,
}

impl OutcomeBuilder {
    /// Start an outcome
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            failure: None,
            error: None,
            fingerprint: None,
            primary: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
            installs: Vec::new(),
            bindings: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Run identifier
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record the primary node
    pub fn primary(&mut self, node: NodeIdentity) {
        self.primary = Some(node);
    }

    /// Record the fleet's certificate
    pub fn fingerprint(&mut self, fingerprint: Fingerprint) {
        self.fingerprint = Some(fingerprint);
    }

    /// Record a successful install
    pub fn installed(&mut self, node: NodeIdentity, report: InstallReport) {
        for message in &report.warnings {
            self.warn(Phase::Install, Some(node.clone()), message.clone());
        }
        self.succeeded.push(node);
        self.installs.push(report);
    }

    /// Record a failed node
    pub fn node_failed(&mut self, node: NodeIdentity, phase: Phase, message: impl Into<String>) {
        self.failed.push(NodeFailure {
            node,
            phase,
            message: message.into(),
        });
    }

    /// Record a binding report
    pub fn binding_report(&mut self, report: ReconcileReport) {
        self.bindings.push(report);
    }

    /// Record a warning
    pub fn warn(&mut self, phase: Phase, node: Option<NodeIdentity>, message: impl Into<String>) {
        self.warnings.push(PhaseWarning {
            phase,
            node,
            message: message.into(),
        });
    }

    /// Mark the run failed
    pub fn fail(&mut self, kind: FailureKind, error: Option<String>) {
        self.failure = Some(kind);
        self.error = error;
    }

    /// Freeze the outcome
    pub fn finish(self, finished_at: DateTime<Utc>) -> RotationOutcome {
        let success = self.failure.is_none();
        let summary = summarize(&self, success);
        RotationOutcome {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            success,
            failure: self.failure,
            error: self.error,
            fingerprint: self.fingerprint,
            primary: self.primary,
            succeeded: self.succeeded,
            failed: self.failed,
            installs: self.installs,
            bindings: self.bindings,
            warnings: self.warnings,
            summary,
        }
    }
}

fn summarize(builder: &OutcomeBuilder, success: bool) -> String {
    let fingerprint = builder
        .fingerprint
        .as_ref()
        .map(Fingerprint::to_string)
        .unwrap_or_else(|| "<unknown>".to_string());
    if success {
        let mut summary = format!(
            "rotated {} node(s) to {}",
            builder.succeeded.len(),
            fingerprint
        );
        if !builder.warnings.is_empty() {
            summary.push_str(&format!(" with {} warning(s)", builder.warnings.len()));
        }
        return summary;
    }

    match builder.failure {
        Some(FailureKind::Discovery) => format!(
            "discovery failed: {}",
            builder.error.as_deref().unwrap_or("unknown error")
        ),
        Some(FailureKind::Commit) => format!(
            "installed on {} node(s) but the farm switch to {} failed: {}",
            builder.succeeded.len(),
            fingerprint,
            builder.error.as_deref().unwrap_or("unknown error")
        ),
        Some(FailureKind::Cancelled) => format!(
            "cancelled after installing on {} node(s); farm not switched",
            builder.succeeded.len()
        ),
        _ => {
            let failed: Vec<String> = builder
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.node.name(), f.message))
                .collect();
            format!(
                "install failed on {} of {} node(s) ({}); farm not switched",
                builder.failed.len(),
                builder.failed.len() + builder.succeeded.len(),
                failed.join("; ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_install_failure_summary() {
        let mut builder = OutcomeBuilder::new(Uuid::nil(), started());
        builder.node_failed(NodeIdentity::new("c"), Phase::Install, "disk full");
        builder.fail(FailureKind::Install, None);
        let outcome = builder.finish(started());

        assert!(!outcome.success);
        assert_eq!(outcome.failure_for("C"), Some("disk full"));
        assert!(outcome.summary.contains("c: disk full"));
    }

    #[test]
    fn test_success_with_warnings_serializes() {
        let mut builder = OutcomeBuilder::new(Uuid::nil(), started());
        builder.fingerprint(Fingerprint::parse(&"A".repeat(40)).unwrap());
        builder.warn(Phase::Restart, Some(NodeIdentity::new("b")), "service did not stop");
        let outcome = builder.finish(started());

        assert!(outcome.success);
        assert_eq!(outcome.warnings_in(Phase::Restart).count(), 1);
        assert!(outcome.summary.ends_with("with 1 warning(s)"));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["warnings"][0]["phase"], "restart");
        assert_eq!(json["warnings"][0]["node"], "b");
        assert!(json.get("failure").is_none());
    }
}
