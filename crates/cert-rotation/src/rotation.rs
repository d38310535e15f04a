//! Multi-node rotation engine
//!
//! A run walks the fleet phase by phase. Within a phase nodes are worked on
//! with bounded concurrency; the next phase starts only when every node is
//! done with the current one. The farm-wide switch happens at most once, from
//! the primary, and only after every node installed the certificate.

use crate::bindings::{BindingReconciler, ReconcileReport};
use crate::context::{RotationContext, RotationOptions};
use crate::discovery::{FleetTopology, NodeTopologyDiscovery};
use crate::fingerprint::Fingerprint;
use crate::installer::{InstallReport, PerNodeInstaller};
use crate::material::CredentialMaterial;
use crate::operations::{
    CertificateCheck, GetCertificates, RemoveCertificate, RestartFarmService, ServiceRestart,
    SetFarmCertificate, TestCertificate,
};
use crate::outcome::{FailureKind, OutcomeBuilder, Phase, RotationOutcome};
use crate::{Error, Result};
use async_io::Timer;
use async_trait::async_trait;
use futures::StreamExt;
use futures_lite::future;
use session_executor::{NodeIdentity, RemoteExecutionSession};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to rotate, and where
#[derive(Debug, Clone)]
pub struct RotationRequest {
    /// Supplied nodes; the first is the presumed primary
    pub nodes: Vec<NodeIdentity>,
    /// Ask the primary for the fleet instead of trusting `nodes`
    pub discover: bool,
    /// New certificate bundle
    pub material: CredentialMaterial,
    /// Expected thumbprint of the bundle; taken from the first install when absent
    pub fingerprint: Option<Fingerprint>,
    /// Account granted read access to the private key
    pub service_identity: Option<String>,
    /// Service restarted on every node after the switch
    pub restart_service: Option<String>,
    /// Certificate being replaced; enables binding reconciliation
    pub renewal: Option<Fingerprint>,
    /// Run options
    pub options: RotationOptions,
}

impl RotationRequest {
    /// A request with discovery enabled and default options
    pub fn new(nodes: Vec<NodeIdentity>, material: CredentialMaterial) -> Self {
        Self {
            nodes,
            discover: true,
            material,
            fingerprint: None,
            service_identity: None,
            restart_service: None,
            renewal: None,
            options: RotationOptions::default(),
        }
    }

    /// Enable or disable discovery
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }

    /// Expect a specific thumbprint
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Grant private-key access to `identity`
    pub fn with_service_identity(mut self, identity: impl Into<String>) -> Self {
        self.service_identity = Some(identity.into());
        self
    }

    /// Restart `service` after the switch
    pub fn with_restart_service(mut self, service: impl Into<String>) -> Self {
        self.restart_service = Some(service.into());
        self
    }

    /// Rebind endpoints that present `renewal`
    pub fn with_renewal(mut self, renewal: Fingerprint) -> Self {
        self.renewal = Some(renewal);
        self
    }

    /// Replace the run options
    pub fn with_options(mut self, options: RotationOptions) -> Self {
        self.options = options;
        self
    }
}

/// One phase's work on one node
#[async_trait]
trait NodeWork: Send + Sync {
    type Output: Send;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<Self::Output>;
}

struct InstallWork<'a> {
    installer: PerNodeInstaller<'a>,
}

#[async_trait]
impl NodeWork for InstallWork<'_> {
    type Output = InstallReport;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<InstallReport> {
        self.installer.install(session).await
    }
}

struct ReconcileWork<'a> {
    renewal: &'a Fingerprint,
    replacement: &'a Fingerprint,
}

#[async_trait]
impl NodeWork for ReconcileWork<'_> {
    type Output = ReconcileReport;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<ReconcileReport> {
        BindingReconciler
            .reconcile(session, self.renewal, self.replacement)
            .await
    }
}

struct RestartWork<'a> {
    service: &'a str,
}

#[async_trait]
impl NodeWork for RestartWork<'_> {
    type Output = ServiceRestart;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<ServiceRestart> {
        let restart = RestartFarmService {
            service: self.service.to_string(),
        };
        Ok(session.call_one(&restart).await?)
    }
}

struct VerifyWork<'a> {
    fingerprint: &'a Fingerprint,
}

#[async_trait]
impl NodeWork for VerifyWork<'_> {
    type Output = CertificateCheck;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<CertificateCheck> {
        let check = TestCertificate {
            fingerprint: self.fingerprint.clone(),
        };
        Ok(session.call_one(&check).await?)
    }
}

#[derive(Debug, Default)]
struct CleanupReport {
    removed: Vec<Fingerprint>,
    errors: Vec<String>,
}

struct CleanupWork<'a> {
    installs: &'a [InstallReport],
    /// Certificates that must survive on a node (still bound after a partial reconcile)
    protected: &'a [(String, Fingerprint)],
}

#[async_trait]
impl NodeWork for CleanupWork<'_> {
    type Output = CleanupReport;

    async fn run(&self, session: &mut RemoteExecutionSession) -> Result<CleanupReport> {
        let node = session.node().name().to_string();
        let Some(installed) = self.installs.iter().find(|r| r.node == node) else {
            return Ok(CleanupReport::default());
        };

        let listing = GetCertificates {
            subject: installed.subject.clone(),
        };
        let candidates = session.call(&listing).await?;

        let mut report = CleanupReport::default();
        for certificate in candidates {
            let superseded = certificate.fingerprint != installed.fingerprint
                && certificate.not_after <= installed.not_before;
            let protected = self
                .protected
                .iter()
                .any(|(n, fp)| *n == node && *fp == certificate.fingerprint);
            if !superseded || protected {
                continue;
            }

            let removal = RemoveCertificate {
                fingerprint: certificate.fingerprint.clone(),
            };
            match session.call_one(&removal).await {
                Ok(receipt) if receipt.removed => {
                    info!(node = %node, fingerprint = %certificate.fingerprint, "removed superseded certificate");
                    report.removed.push(certificate.fingerprint);
                }
                Ok(_) => debug!(node = %node, fingerprint = %certificate.fingerprint, "already gone"),
                Err(e) => report.errors.push(format!(
                    "cannot remove {}: {}",
                    certificate.fingerprint,
                    Error::from(e).node_message()
                )),
            }
        }
        Ok(report)
    }
}

/// Race a unit of work against a timer
async fn with_timeout<T>(limit: Duration, unit: impl Future<Output = Result<T>>) -> Result<T> {
    future::or(unit, async move {
        Timer::after(limit).await;
        Err(Error::Timeout(limit))
    })
    .await
}

/// Drives certificate rotation across a fleet
#[derive(Debug, Clone)]
pub struct MultiNodeRotationOrchestrator {
    context: RotationContext,
}

impl MultiNodeRotationOrchestrator {
    /// Create an orchestrator
    pub fn new(context: RotationContext) -> Self {
        Self { context }
    }

    /// The orchestrator's context
    pub fn context(&self) -> &RotationContext {
        &self.context
    }

    /// Run a full rotation
    ///
    /// Never returns an error: every failure is described by the outcome.
    pub async fn rotate(&self, request: &RotationRequest) -> RotationOutcome {
        let run_id = Uuid::new_v4();
        let mut outcome = OutcomeBuilder::new(run_id, self.context.clock.now());
        info!(run_id = %run_id, nodes = request.nodes.len(), "starting certificate rotation");

        if self.context.cancel.is_cancelled() {
            outcome.fail(FailureKind::Cancelled, Some("cancelled before discovery".to_string()));
            return self.finish(outcome);
        }

        let (topology, mut primary) = match self.open_fleet(request).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(run_id = %run_id, "discovery failed: {}", e);
                outcome.fail(FailureKind::Discovery, Some(e.to_string()));
                return self.finish(outcome);
            }
        };
        outcome.primary(topology.primary.clone());

        self.run_phases(request, &topology, &mut primary, &mut outcome).await;
        primary.terminate().await;
        self.finish(outcome)
    }

    /// Resolve the fleet without changing anything
    pub async fn discover(&self, nodes: &[NodeIdentity]) -> Result<FleetTopology> {
        let seed = nodes.first().ok_or(Error::EmptyFleet)?;
        let mut session = self.open_session(seed).await?;
        let topology = NodeTopologyDiscovery.discover(&mut session, nodes).await;
        session.terminate().await;
        topology
    }

    /// Rebind one node's endpoints from `renewal` to `replacement`
    pub async fn reconcile_node(
        &self,
        node: &NodeIdentity,
        renewal: &Fingerprint,
        replacement: &Fingerprint,
    ) -> Result<ReconcileReport> {
        let mut session = self.open_session(node).await?;
        let report = BindingReconciler
            .reconcile(&mut session, renewal, replacement)
            .await;
        session.terminate().await;
        report
    }

    fn finish(&self, outcome: OutcomeBuilder) -> RotationOutcome {
        let run_id = outcome.run_id();
        let outcome = outcome.finish(self.context.clock.now());
        if outcome.success {
            info!(run_id = %run_id, "{}", outcome.summary);
        } else {
            warn!(run_id = %run_id, "{}", outcome.summary);
        }
        outcome
    }

    async fn open_session(&self, node: &NodeIdentity) -> Result<RemoteExecutionSession> {
        let mut session = self.context.sessions.create(node);
        session.initialize().await?;
        Ok(session)
    }

    /// Open `session` and resolve the topology through it
    async fn resolve_fleet(
        &self,
        session: &mut RemoteExecutionSession,
        request: &RotationRequest,
    ) -> Result<FleetTopology> {
        session.initialize().await?;
        if !request.discover {
            return FleetTopology::from_nodes(request.nodes.clone());
        }
        NodeTopologyDiscovery.discover(session, &request.nodes).await
    }

    /// Resolve the topology and return it with an open session to the primary
    ///
    /// Each step races `node_timeout`; a session that loses the race is
    /// still terminated.
    async fn open_fleet(
        &self,
        request: &RotationRequest,
    ) -> Result<(FleetTopology, RemoteExecutionSession)> {
        let limit = request.options.node_timeout;
        let seed = request.nodes.first().ok_or(Error::EmptyFleet)?;
        let mut session = self.context.sessions.create(seed);
        let topology = match with_timeout(limit, self.resolve_fleet(&mut session, request)).await {
            Ok(topology) => topology,
            Err(e) => {
                session.terminate().await;
                return Err(e);
            }
        };
        if topology.primary.same_machine(session.node()) {
            return Ok((topology, session));
        }

        debug!(seed = %seed, primary = %topology.primary, "primary differs from seed node, reconnecting");
        session.terminate().await;
        let mut primary = self.context.sessions.create(&topology.primary);
        let opened = with_timeout(limit, async { primary.initialize().await.map_err(Error::from) }).await;
        if let Err(e) = opened {
            primary.terminate().await;
            return Err(e);
        }
        Ok((topology, primary))
    }

    async fn run_phases(
        &self,
        request: &RotationRequest,
        topology: &FleetTopology,
        primary: &mut RemoteExecutionSession,
        outcome: &mut OutcomeBuilder,
    ) {
        let options = &request.options;

        // Install
        let installer = PerNodeInstaller::new(
            &request.material,
            format!("rotation-{}.pfx", outcome.run_id().simple()),
        )
        .expecting(request.fingerprint.as_ref())
        .granting(request.service_identity.as_deref());
        let results = self
            .run_phase(Phase::Install, &topology.nodes, primary, options, &InstallWork { installer })
            .await;

        let reference = request.fingerprint.clone().or_else(|| {
            results
                .iter()
                .find_map(|(_, r)| r.as_ref().ok().map(|report| report.fingerprint.clone()))
        });

        let mut cancelled = false;
        let mut installs = Vec::new();
        for (node, result) in results {
            let result = result.and_then(|report| match &reference {
                Some(expected) if *expected != report.fingerprint => Err(Error::FingerprintMismatch {
                    expected: expected.clone(),
                    actual: report.fingerprint,
                }),
                _ => Ok(report),
            });
            match result {
                Ok(report) => {
                    installs.push(report.clone());
                    outcome.installed(node, report);
                }
                Err(e) => {
                    cancelled |= matches!(e, Error::Cancelled);
                    warn!(node = %node, "install failed: {}", e);
                    outcome.node_failed(node, Phase::Install, e.node_message());
                }
            }
        }

        let Some(fingerprint) = reference else {
            outcome.fail(FailureKind::Install, Some("no node installed the certificate".to_string()));
            return;
        };
        outcome.fingerprint(fingerprint.clone());

        if cancelled {
            outcome.fail(FailureKind::Cancelled, None);
            return;
        }
        if installs.len() != topology.len() {
            outcome.fail(FailureKind::Install, None);
            return;
        }
        if self.context.cancel.is_cancelled() {
            outcome.fail(FailureKind::Cancelled, Some("cancelled before commit".to_string()));
            return;
        }

        // Commit
        let commit = SetFarmCertificate {
            fingerprint: fingerprint.clone(),
        };
        let committed = with_timeout(options.node_timeout, async {
            primary.call_one(&commit).await.map_err(Error::from)
        })
        .await;
        match committed {
            Ok(committed) => info!(
                primary = %topology.primary,
                fingerprint = %fingerprint,
                previous = committed.previous_fingerprint.as_deref().unwrap_or("<none>"),
                "farm certificate switched"
            ),
            Err(e) => {
                warn!(primary = %topology.primary, "farm certificate switch failed: {}", e);
                outcome.fail(FailureKind::Commit, Some(e.node_message()));
                return;
            }
        }

        // Reconcile bindings
        let mut protected = Vec::new();
        if let Some(renewal) = &request.renewal {
            let work = ReconcileWork {
                renewal,
                replacement: &fingerprint,
            };
            for (node, result) in self
                .run_phase(Phase::ReconcileBindings, &topology.nodes, primary, options, &work)
                .await
            {
                match result {
                    Ok(report) => {
                        for failure in report.failures() {
                            outcome.warn(
                                Phase::ReconcileBindings,
                                Some(node.clone()),
                                format!(
                                    "{}: {}",
                                    failure.endpoint,
                                    failure.error.as_deref().unwrap_or("rebind failed")
                                ),
                            );
                        }
                        if report.failures().next().is_some() {
                            protected.push((node.name().to_string(), renewal.clone()));
                        }
                        outcome.binding_report(report);
                    }
                    Err(e) => {
                        protected.push((node.name().to_string(), renewal.clone()));
                        outcome.warn(Phase::ReconcileBindings, Some(node), e.node_message());
                    }
                }
            }
        }

        // Restart
        if let Some(service) = &request.restart_service {
            let work = RestartWork { service };
            for (node, result) in self
                .run_phase(Phase::Restart, &topology.nodes, primary, options, &work)
                .await
            {
                match result {
                    Ok(restart) => debug!(node = %node, service = %restart.service, status = %restart.status, "service restarted"),
                    Err(e) => outcome.warn(Phase::Restart, Some(node), e.node_message()),
                }
            }
        }

        // Verify
        if options.verify {
            let work = VerifyWork {
                fingerprint: &fingerprint,
            };
            for (node, result) in self
                .run_phase(Phase::Verify, &topology.nodes, primary, options, &work)
                .await
            {
                match result {
                    Ok(check) if !check.present => outcome.warn(
                        Phase::Verify,
                        Some(node),
                        format!("certificate {} not found in the machine store", fingerprint),
                    ),
                    Ok(check) if !check.has_private_key => outcome.warn(
                        Phase::Verify,
                        Some(node),
                        format!("certificate {} has no accessible private key", fingerprint),
                    ),
                    Ok(_) => {}
                    Err(e) => outcome.warn(Phase::Verify, Some(node), e.node_message()),
                }
            }
        }

        // Cleanup
        if options.cleanup_superseded {
            let work = CleanupWork {
                installs: &installs,
                protected: &protected,
            };
            for (node, result) in self
                .run_phase(Phase::Cleanup, &topology.nodes, primary, options, &work)
                .await
            {
                match result {
                    Ok(report) => {
                        for error in report.errors {
                            outcome.warn(Phase::Cleanup, Some(node.clone()), error);
                        }
                        if !report.removed.is_empty() {
                            debug!(node = %node, removed = report.removed.len(), "cleanup done");
                        }
                    }
                    Err(e) => outcome.warn(Phase::Cleanup, Some(node), e.node_message()),
                }
            }
        }
    }

    /// Run `work` on every node, lending the primary session to the node it
    /// targets and opening a direct session for every other node
    async fn run_phase<W: NodeWork>(
        &self,
        phase: Phase,
        nodes: &[NodeIdentity],
        primary: &mut RemoteExecutionSession,
        options: &RotationOptions,
        work: &W,
    ) -> Vec<(NodeIdentity, Result<W::Output>)> {
        info!(phase = %phase, nodes = nodes.len(), parallel = options.max_parallel_nodes, "starting phase");

        let mut lent = Some(primary);
        let units: Vec<_> = nodes
            .iter()
            .map(|node| {
                let session = if lent.as_ref().is_some_and(|p| p.node().same_machine(node)) {
                    lent.take()
                } else {
                    None
                };
                async move {
                    let result = self.node_unit(phase, node, session, options, work).await;
                    (node.clone(), result)
                }
            })
            .collect();

        futures::stream::iter(units)
            .buffered(options.max_parallel_nodes.max(1))
            .collect()
            .await
    }

    async fn node_unit<W: NodeWork>(
        &self,
        phase: Phase,
        node: &NodeIdentity,
        lent: Option<&mut RemoteExecutionSession>,
        options: &RotationOptions,
        work: &W,
    ) -> Result<W::Output> {
        if self.context.cancel.is_cancelled() {
            warn!(phase = %phase, node = %node, "run cancelled, skipping node");
            return Err(Error::Cancelled);
        }
        debug!(phase = %phase, node = %node, reused = lent.is_some(), "starting node");

        match lent {
            Some(session) => with_timeout(options.node_timeout, work.run(session)).await,
            None => {
                let mut session = self.context.sessions.create(node);
                let unit = async {
                    match session.initialize().await {
                        Ok(()) => work.run(&mut session).await,
                        Err(e) => Err(Error::from(e)),
                    }
                };
                let result = with_timeout(options.node_timeout, unit).await;
                session.terminate().await;
                result
            }
        }
    }
}
