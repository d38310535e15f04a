//! Turning a job file into runtime types
//!
//! Secrets are resolved here, once per field, and nowhere else.

use crate::resolver::SecretResolver;
use crate::{ConfigError, JobConfig, Result};
use cert_rotation::{CredentialMaterial, Fingerprint, RotationOptions, RotationRequest};
use session_executor::{ConnectionParameters, Credential, HostProgram, NodeIdentity};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

impl JobConfig {
    /// Resolve `path` against the job file's directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    /// Configured nodes, `target` or `nodes`
    pub fn node_identities(&self) -> Result<Vec<NodeIdentity>> {
        self.target
            .iter()
            .chain(self.nodes.iter())
            .map(|n| NodeIdentity::parse(n).map_err(|e| ConfigError::ValidationError(e.to_string())))
            .collect()
    }

    /// Look up one configured node by name
    pub fn node(&self, name: &str) -> Result<NodeIdentity> {
        let wanted = NodeIdentity::parse(name).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(self
            .node_identities()?
            .into_iter()
            .find(|n| n.same_machine(&wanted))
            .unwrap_or(wanted))
    }

    /// Run options
    pub fn rotation_options(&self) -> RotationOptions {
        RotationOptions {
            node_timeout: Duration::from_secs(self.options.node_timeout_secs),
            max_parallel_nodes: self.options.max_parallel_nodes,
            cleanup_superseded: self.options.cleanup_superseded,
            verify: self.options.verify,
        }
    }

    /// Expected thumbprint of the new certificate
    pub fn expected_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.certificate.fingerprint.as_deref().map(Fingerprint::parse).transpose()?)
    }

    /// Thumbprint of the certificate being replaced
    pub fn renewal_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.renewal.as_deref().map(Fingerprint::parse).transpose()?)
    }

    /// PowerShell executable to host sessions with
    pub fn host_program(&self) -> HostProgram {
        self.connection
            .host_program
            .as_deref()
            .map(HostProgram::new)
            .unwrap_or_default()
    }

    /// Connection parameters with the account resolved
    pub fn connection_parameters(&self, secrets: &dyn SecretResolver) -> Result<ConnectionParameters> {
        let connection = &self.connection;
        let mut params = ConnectionParameters::new(connection.transport)
            .with_ssl(connection.use_ssl)
            .with_port_in_spn(connection.include_port_in_spn);
        if let Some(port) = connection.port {
            params = params.with_port(port);
        }
        if let Some(username) = &connection.username {
            let username = secrets.resolve(username)?;
            let password = match &connection.password {
                Some(reference) => secrets.resolve(reference)?,
                None => String::new(),
            };
            debug!(username = %username, "resolved connection account");
            params = params.with_credential(Credential::new(username, password));
        }
        if let Some(key_file) = &connection.key_file {
            params = params.with_key_file(self.resolve_path(key_file));
        }
        Ok(params)
    }

    /// Load the certificate bundle with its password resolved
    pub fn credential_material(&self, secrets: &dyn SecretResolver) -> Result<CredentialMaterial> {
        let password = secrets.resolve(&self.certificate.password)?;
        let path = self.resolve_path(&self.certificate.path);
        Ok(CredentialMaterial::load(path, password)?)
    }

    /// Full rotation request
    pub fn rotation_request(&self, secrets: &dyn SecretResolver) -> Result<RotationRequest> {
        let mut request = RotationRequest::new(self.node_identities()?, self.credential_material(secrets)?)
            .with_discovery(self.discover)
            .with_options(self.rotation_options());
        if let Some(fingerprint) = self.expected_fingerprint()? {
            request = request.with_fingerprint(fingerprint);
        }
        if let Some(renewal) = self.renewal_fingerprint()? {
            request = request.with_renewal(renewal);
        }
        if let Some(identity) = &self.service_identity {
            request = request.with_service_identity(identity.clone());
        }
        if let Some(service) = &self.restart_service {
            request = request.with_restart_service(service.clone());
        }
        Ok(request)
    }
}
