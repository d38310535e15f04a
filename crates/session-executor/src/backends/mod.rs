//! Transport implementations for different execution contexts
//!
//! All built-in transports drive the same PowerShell host process
//! ([`crate::host`]); they differ only in the init payload that tells the host
//! whether to run in-process or to open a WinRM or SSH remoting session.
//! Users can plug in their own transport by implementing
//! [`SessionTransport`](crate::transport::SessionTransport).

pub mod local;
pub mod ssh;
pub mod winrm;

pub use local::LocalTarget;
pub use ssh::SshConfig;
pub use winrm::WinRmConfig;

use crate::connection::{ConnectionParameters, TransportKind};
use crate::error::{Error, Result};
use crate::host::{HostInit, HostProcess, HostProgram};
use crate::node::NodeIdentity;
use crate::operation::{Invocation, OperationLibrary, OperationResult};
use crate::transport::SessionTransport;
use async_trait::async_trait;
use tracing::debug;

/// Where a host process points its session
pub trait HostTarget: Send + Sync + std::fmt::Debug + 'static {
    /// Machine name used in errors and logs
    fn host_name(&self) -> &str;

    /// Short description (`winrm://web01:5985`)
    fn describe(&self) -> String;

    /// Whether the host runs operations in its own process
    fn is_local(&self) -> bool;

    /// Init payload for the host
    fn init<'a>(&'a self, library: &'a str) -> HostInit<'a>;
}

/// Session transport backed by a PowerShell host process
#[derive(Debug)]
pub struct PowerShellTransport<T: HostTarget> {
    target: T,
    program: HostProgram,
    process: Option<HostProcess>,
}

impl<T: HostTarget> PowerShellTransport<T> {
    /// Create a transport for `target` using the default host executable
    pub fn new(target: T) -> Self {
        Self::with_program(target, HostProgram::default())
    }

    /// Create a transport with an explicit host executable
    pub fn with_program(target: T, program: HostProgram) -> Self {
        Self {
            target,
            program,
            process: None,
        }
    }

    /// The target this transport connects to
    pub fn target(&self) -> &T {
        &self.target
    }
}

#[async_trait]
impl<T: HostTarget> SessionTransport for PowerShellTransport<T> {
    fn describe(&self) -> String {
        self.target.describe()
    }

    fn is_local(&self) -> bool {
        self.target.is_local()
    }

    async fn open(&mut self, library: &OperationLibrary) -> Result<()> {
        let mut process = HostProcess::spawn(&self.program, self.target.host_name())?;
        let init = self.target.init(library.contents());
        if let Err(e) = process.handshake(&init).await {
            // Reap the half-open host before reporting
            if let Err(reap) = process.shutdown().await {
                debug!(target = %self.target.describe(), "reaping host after failed handshake: {}", reap);
            }
            return Err(e);
        }
        debug!(target = %self.target.describe(), "execution host ready");
        self.process = Some(process);
        Ok(())
    }

    async fn invoke(&mut self, invocation: &Invocation) -> Result<OperationResult> {
        let process = self.process.as_mut().ok_or_else(|| Error::HostExited {
            host: self.target.host_name().to_string(),
            reason: "transport not open".to_string(),
        })?;
        process.request(invocation).await
    }

    async fn close(&mut self) -> Result<()> {
        match self.process.take() {
            Some(mut process) => process.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Build the transport for `node` from the run's connection parameters
pub fn transport_for(
    node: &NodeIdentity,
    params: &ConnectionParameters,
    program: &HostProgram,
) -> Box<dyn SessionTransport> {
    let resolved = params.for_node(node);
    match resolved.transport {
        TransportKind::Local => Box::new(PowerShellTransport::with_program(
            LocalTarget::new(node.name()),
            program.clone(),
        )),
        TransportKind::WinRm => {
            let mut config = WinRmConfig::new(node.name())
                .with_port(resolved.port)
                .with_ssl(resolved.use_ssl)
                .with_port_in_spn(resolved.include_port_in_spn);
            if let Some(credential) = &params.credential {
                config = config.with_credential(credential.clone());
            }
            Box::new(PowerShellTransport::with_program(config, program.clone()))
        }
        TransportKind::Ssh => {
            let mut config = SshConfig::new(node.name()).with_port(resolved.port);
            if let Some(credential) = &params.credential {
                config = config.with_user(credential.username.clone());
            }
            if let Some(key_file) = &params.key_file {
                config = config.with_identity_file(key_file.clone());
            }
            Box::new(PowerShellTransport::with_program(config, program.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Credential;

    #[test]
    fn test_transport_selection() {
        let params = ConnectionParameters::new(TransportKind::WinRm)
            .with_credential(Credential::new("CORP\\svc", "pw"));
        let program = HostProgram::new("pwsh");

        let remote = transport_for(&NodeIdentity::new("web01"), &params, &program);
        assert!(!remote.is_local());
        assert_eq!(remote.describe(), "winrm://web01:5985");

        let local = transport_for(&NodeIdentity::parse("web01|localmachine").unwrap(), &params, &program);
        assert!(local.is_local());
        assert_eq!(local.describe(), "local://web01");

        let ssh = transport_for(&NodeIdentity::parse("lnx01|ssh").unwrap(), &params, &program);
        assert_eq!(ssh.describe(), "ssh://CORP\\svc@lnx01:22");
    }

    #[smol_potat::test]
    async fn test_invoke_before_open_is_transport_error() {
        let mut transport = PowerShellTransport::new(LocalTarget::new("localhost"));
        let invocation = Invocation::Operation {
            name: "Get-FleetNodes".to_string(),
            parameters: Default::default(),
        };
        let err = transport.invoke(&invocation).await.unwrap_err();
        assert!(err.is_transport());
        // Closing a never-opened transport is a no-op
        transport.close().await.unwrap();
    }

    #[smol_potat::test]
    async fn test_open_with_missing_host_program() {
        let mut transport = PowerShellTransport::with_program(
            LocalTarget::new("localhost"),
            HostProgram::new("this_host_program_does_not_exist_12345"),
        );
        let library = OperationLibrary::from_source("lib.ps1", "# operation-library-version: 1", "1").unwrap();
        let err = transport.open(&library).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }
}
