//! PowerShell remoting over SSH

use super::HostTarget;
use crate::connection::SSH_PORT;
use crate::host::HostInit;
use std::path::PathBuf;

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    identity_display: Option<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            identity_display: None,
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.identity_display = Some(path.to_string_lossy().into_owned());
        self.identity_file = Some(path);
        self
    }

    /// Identity file, if set
    pub fn identity_file(&self) -> Option<&PathBuf> {
        self.identity_file.as_ref()
    }

    /// Get the host string (user@host if user is specified)
    fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }
}

impl HostTarget for SshConfig {
    fn host_name(&self) -> &str {
        &self.host
    }

    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.host_string(), self.port.unwrap_or(SSH_PORT))
    }

    fn is_local(&self) -> bool {
        false
    }

    fn init<'a>(&'a self, library: &'a str) -> HostInit<'a> {
        HostInit {
            mode: "ssh",
            computer: Some(&self.host),
            port: Some(self.port.unwrap_or(SSH_PORT)),
            use_ssl: false,
            include_port_in_spn: false,
            username: self.user.as_deref(),
            password: None,
            key_file: self.identity_display.as_deref(),
            library,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_builder() {
        let config = SshConfig::new("lnx01")
            .with_user("deploy")
            .with_port(2222)
            .with_identity_file("/home/deploy/.ssh/id_ed25519");

        assert_eq!(config.host_string(), "deploy@lnx01");
        assert_eq!(config.describe(), "ssh://deploy@lnx01:2222");

        let init = serde_json::to_value(config.init("lib")).unwrap();
        assert_eq!(init["mode"], "ssh");
        assert_eq!(init["port"], 2222);
        assert_eq!(init["key_file"], "/home/deploy/.ssh/id_ed25519");
        assert!(init.get("password").is_none());
    }

    #[test]
    fn test_default_port() {
        let config = SshConfig::new("lnx01");
        assert_eq!(config.describe(), "ssh://lnx01:22");
    }
}
