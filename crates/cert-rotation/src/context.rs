//! Rotation context
//!
//! Carries the run's collaborators (how sessions are made, what time it is,
//! whether the run was cancelled) so the orchestrator never reaches for
//! globals and tests can swap each of them.

use crate::Result;
use crate::operations::bundled_library;
use chrono::{DateTime, Utc};
use session_executor::{
    ConnectionParameters, HostProgram, NodeIdentity, OperationLibrary, RemoteExecutionSession,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Creates uninitialized sessions for nodes
pub trait SessionFactory: Send + Sync {
    /// A new session in the `Created` state
    fn create(&self, node: &NodeIdentity) -> RemoteExecutionSession;
}

/// Sessions backed by the PowerShell host process
#[derive(Debug, Clone)]
pub struct HostSessionFactory {
    params: ConnectionParameters,
    program: HostProgram,
    library: Arc<OperationLibrary>,
}

impl HostSessionFactory {
    /// Create a factory with an explicit library and host executable
    pub fn new(params: ConnectionParameters, program: HostProgram, library: OperationLibrary) -> Self {
        Self {
            params,
            program,
            library: Arc::new(library),
        }
    }

    /// Create a factory using the bundled operation library
    pub fn bundled(params: ConnectionParameters) -> Result<Self> {
        Ok(Self::new(params, HostProgram::default(), bundled_library()?))
    }

    /// Connection parameters shared by every session
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }
}

impl SessionFactory for HostSessionFactory {
    fn create(&self, node: &NodeIdentity) -> RemoteExecutionSession {
        RemoteExecutionSession::for_node(
            node.clone(),
            &self.params,
            &self.program,
            self.library.clone(),
        )
    }
}

/// Source of timestamps for outcomes
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cooperative cancellation shared between a run and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// A flag that is not set
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; in-flight node work finishes, nothing new starts
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOptions {
    /// Limit for each per-node unit of work
    pub node_timeout: Duration,
    /// Nodes worked on concurrently within a phase
    pub max_parallel_nodes: usize,
    /// Remove superseded certificates after the switch
    pub cleanup_superseded: bool,
    /// Check every node holds the new certificate with its key
    pub verify: bool,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(300),
            max_parallel_nodes: 1,
            cleanup_superseded: true,
            verify: true,
        }
    }
}

/// Everything a run depends on besides its request
#[derive(Clone)]
pub struct RotationContext {
    /// Session factory
    pub sessions: Arc<dyn SessionFactory>,
    /// Clock for outcome timestamps
    pub clock: Arc<dyn Clock>,
    /// Cancellation flag
    pub cancel: CancellationFlag,
}

impl RotationContext {
    /// Create a context with the system clock and a fresh cancellation flag
    pub fn new(sessions: impl SessionFactory + 'static) -> Self {
        Self {
            sessions: Arc::new(sessions),
            clock: Arc::new(SystemClock),
            cancel: CancellationFlag::new(),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share a cancellation flag with the caller
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for RotationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_executor::TransportKind;

    #[test]
    fn test_cancellation_is_shared() {
        let flag = CancellationFlag::new();
        let ctx = RotationContext::new(HostSessionFactory::bundled(ConnectionParameters::default()).unwrap())
            .with_cancellation(flag.clone());
        assert!(!ctx.cancel.is_cancelled());
        flag.cancel();
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn test_host_factory_picks_transport_per_node() {
        let factory = HostSessionFactory::bundled(ConnectionParameters::new(TransportKind::WinRm)).unwrap();
        let remote = factory.create(&NodeIdentity::new("adfs02"));
        assert!(!remote.is_local());
        let local = factory.create(&NodeIdentity::parse("adfs01|localmachine").unwrap());
        assert!(local.is_local());
    }

    #[test]
    fn test_default_options() {
        let options = RotationOptions::default();
        assert_eq!(options.node_timeout, Duration::from_secs(300));
        assert_eq!(options.max_parallel_nodes, 1);
        assert!(options.cleanup_superseded && options.verify);
    }
}
