//! Remote execution sessions over a PowerShell host
//!
//! This crate provides one session abstraction for running a fixed library of
//! named operations on a machine, whether that machine is the orchestrating
//! host itself, a WinRM endpoint or an SSH endpoint.

#![warn(missing_docs)]

pub mod backends;
pub mod connection;
pub mod error;
pub mod host;
pub mod node;
pub mod operation;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use backends::{HostTarget, LocalTarget, PowerShellTransport, SshConfig, WinRmConfig, transport_for};
pub use connection::{ConnectionParameters, Credential, Password, ResolvedConnection, TransportKind};
pub use error::{Error, Result};
pub use host::HostProgram;
pub use node::{NodeIdentity, TransportHint};
pub use operation::{Invocation, OperationLibrary, OperationResult, Parameters, RemoteOperation};
pub use session::{RemoteExecutionSession, SessionState};
pub use transport::SessionTransport;
