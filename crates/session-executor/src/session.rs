//! Session lifecycle over a transport
//!
//! A [`RemoteExecutionSession`] moves through `Created → Initialized →
//! Terminated` exactly once. Operations are only accepted while
//! `Initialized`; anything else is reported as [`Error::InvalidState`] so
//! lifecycle bugs fail fast instead of reaching the node.

use crate::backends::transport_for;
use crate::connection::ConnectionParameters;
use crate::error::{Error, Result};
use crate::host::HostProgram;
use crate::node::NodeIdentity;
use crate::operation::{Invocation, OperationLibrary, OperationResult, Parameters, RemoteOperation};
use crate::transport::SessionTransport;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, transport not opened yet
    Created,
    /// Transport open and library loaded
    Initialized,
    /// Closed; cannot be reused
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Initialized => write!(f, "initialized"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// An execution session against one node
pub struct RemoteExecutionSession {
    node: NodeIdentity,
    transport: Box<dyn SessionTransport>,
    library: Arc<OperationLibrary>,
    state: SessionState,
    // Set while `open` is in flight, so an abandoned initialize still releases
    opening: bool,
}

impl fmt::Debug for RemoteExecutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecutionSession")
            .field("node", &self.node)
            .field("transport", &self.transport.describe())
            .field("state", &self.state)
            .finish()
    }
}

impl RemoteExecutionSession {
    /// Create a session over an explicit transport
    pub fn new(
        node: NodeIdentity,
        transport: Box<dyn SessionTransport>,
        library: Arc<OperationLibrary>,
    ) -> Self {
        Self {
            node,
            transport,
            library,
            state: SessionState::Created,
            opening: false,
        }
    }

    /// Create a session using the built-in transport selected for `node`
    pub fn for_node(
        node: NodeIdentity,
        params: &ConnectionParameters,
        program: &HostProgram,
        library: Arc<OperationLibrary>,
    ) -> Self {
        let transport = transport_for(&node, params, program);
        Self::new(node, transport, library)
    }

    /// Node this session targets
    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether invocations run in-process
    pub fn is_local(&self) -> bool {
        self.transport.is_local()
    }

    /// Transport description for logs
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Open the transport and load the operation library
    ///
    /// On failure the transport is released and the session ends up
    /// `Terminated`; the error is wrapped as [`Error::SessionInitialization`].
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(self.invalid_state("initialize"));
        }

        debug!(node = %self.node, transport = %self.transport.describe(), "initializing session");
        self.opening = true;
        let opened = self.transport.open(&self.library).await;
        self.opening = false;
        match opened {
            Ok(()) => {
                self.state = SessionState::Initialized;
                debug!(node = %self.node, "session initialized");
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = self.transport.close().await {
                    debug!(node = %self.node, "release after failed initialize: {}", close_err);
                }
                self.state = SessionState::Terminated;
                Err(e.during_initialization(self.node.name()))
            }
        }
    }

    /// Run an invocation and return its raw result, error flag included
    pub async fn invoke(&mut self, invocation: &Invocation) -> Result<OperationResult> {
        if self.state != SessionState::Initialized {
            return Err(self.invalid_state("invoke"));
        }
        debug!(node = %self.node, operation = invocation.label(), "invoking");
        self.transport.invoke(invocation).await
    }

    /// Run a named library operation
    ///
    /// Error-channel output is returned as one aggregated [`Error::Operation`].
    pub async fn run_operation(
        &mut self,
        name: &str,
        parameters: Parameters,
    ) -> Result<OperationResult> {
        let invocation = Invocation::Operation {
            name: name.to_string(),
            parameters,
        };
        self.invoke(&invocation).await?.into_checked(name)
    }

    /// Run ad hoc script text with bound parameters
    pub async fn run_script(&mut self, text: &str, parameters: Parameters) -> Result<OperationResult> {
        let invocation = Invocation::Script {
            text: text.to_string(),
            parameters,
        };
        self.invoke(&invocation).await?.into_checked("<script>")
    }

    /// Run a typed operation and decode its records
    pub async fn call<O: RemoteOperation>(&mut self, operation: &O) -> Result<Vec<O::Output>> {
        self.invoke(&operation.invocation()).await?.decode(O::NAME)
    }

    /// Run a typed operation that must yield exactly one record
    pub async fn call_one<O: RemoteOperation>(&mut self, operation: &O) -> Result<O::Output> {
        let mut records = self.call(operation).await?;
        match records.len() {
            1 => Ok(records.remove(0)),
            n => Err(Error::Decode {
                operation: O::NAME.to_string(),
                reason: format!("expected one record, got {}", n),
            }),
        }
    }

    /// Close the transport; safe to call repeatedly and never fails
    pub async fn terminate(&mut self) {
        match self.state {
            SessionState::Terminated => {}
            SessionState::Created => {
                self.state = SessionState::Terminated;
                if std::mem::take(&mut self.opening) {
                    if let Err(e) = self.transport.close().await {
                        debug!(node = %self.node, "release after abandoned initialize: {}", e);
                    }
                }
            }
            SessionState::Initialized => {
                self.state = SessionState::Terminated;
                if let Err(e) = self.transport.close().await {
                    warn!(node = %self.node, "error while closing session: {}", e);
                } else {
                    debug!(node = %self.node, "session terminated");
                }
            }
        }
    }

    fn invalid_state(&self, action: &'static str) -> Error {
        Error::InvalidState {
            action,
            state: self.state.to_string(),
        }
    }
}

impl Drop for RemoteExecutionSession {
    fn drop(&mut self) {
        if self.state == SessionState::Initialized {
            warn!(node = %self.node, "session dropped without terminate");
        }
    }
}
