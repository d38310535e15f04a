//! Transport trait for opening execution channels to one machine

use crate::error::Result;
use crate::operation::{Invocation, OperationLibrary, OperationResult};
use async_trait::async_trait;

/// A channel to one machine that can run library operations
///
/// Implementations are driven by [`RemoteExecutionSession`](crate::RemoteExecutionSession),
/// which enforces the lifecycle; a transport only has to do the I/O.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Short description for logs (`winrm://web01:5985`)
    fn describe(&self) -> String;

    /// Whether invocations run in-process on the orchestrating machine
    fn is_local(&self) -> bool;

    /// Open the channel and load the operation library into its scope
    async fn open(&mut self, library: &OperationLibrary) -> Result<()>;

    /// Run one invocation and collect its records and error-channel output
    ///
    /// Returns `Err` only for transport failures; error-channel output is
    /// reported through [`OperationResult::had_errors`].
    async fn invoke(&mut self, invocation: &Invocation) -> Result<OperationResult>;

    /// Close the channel and release its scope
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: SessionTransport + ?Sized> SessionTransport for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn is_local(&self) -> bool {
        (**self).is_local()
    }

    async fn open(&mut self, library: &OperationLibrary) -> Result<()> {
        (**self).open(library).await
    }

    async fn invoke(&mut self, invocation: &Invocation) -> Result<OperationResult> {
        (**self).invoke(invocation).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
