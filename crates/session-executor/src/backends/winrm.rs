//! Windows Remote Management sessions

use super::HostTarget;
use crate::connection::{Credential, WINRM_HTTP_PORT, WINRM_HTTPS_PORT};
use crate::host::HostInit;

/// WinRM connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinRmConfig {
    host: String,
    port: Option<u16>,
    use_ssl: bool,
    include_port_in_spn: bool,
    credential: Option<Credential>,
}

impl WinRmConfig {
    /// Create a configuration for `host` using the ambient identity
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            use_ssl: false,
            include_port_in_spn: false,
            credential: None,
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use HTTPS
    pub fn with_ssl(mut self, enabled: bool) -> Self {
        self.use_ssl = enabled;
        self
    }

    /// Embed the port in the SPN
    pub fn with_port_in_spn(mut self, enabled: bool) -> Self {
        self.include_port_in_spn = enabled;
        self
    }

    /// Authenticate with an explicit account
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_ssl {
            WINRM_HTTPS_PORT
        } else {
            WINRM_HTTP_PORT
        })
    }
}

impl HostTarget for WinRmConfig {
    fn host_name(&self) -> &str {
        &self.host
    }

    fn describe(&self) -> String {
        let scheme = if self.use_ssl { "winrms" } else { "winrm" };
        format!("{}://{}:{}", scheme, self.host, self.port())
    }

    fn is_local(&self) -> bool {
        false
    }

    fn init<'a>(&'a self, library: &'a str) -> HostInit<'a> {
        HostInit {
            mode: "winrm",
            computer: Some(&self.host),
            port: Some(self.port()),
            use_ssl: self.use_ssl,
            include_port_in_spn: self.include_port_in_spn,
            username: self.credential.as_ref().map(|c| c.username.as_str()),
            password: self.credential.as_ref().map(|c| c.password.expose()),
            key_file: None,
            library,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(WinRmConfig::new("web01").port(), 5985);
        assert_eq!(WinRmConfig::new("web01").with_ssl(true).port(), 5986);
        assert_eq!(WinRmConfig::new("web01").with_port(8080).port(), 8080);
        assert_eq!(
            WinRmConfig::new("web01").with_ssl(true).describe(),
            "winrms://web01:5986"
        );
    }

    #[test]
    fn test_init_carries_credential() {
        let config = WinRmConfig::new("web01")
            .with_port_in_spn(true)
            .with_credential(Credential::new("CORP\\svc", "s3cret"));
        let init = serde_json::to_value(config.init("lib")).unwrap();

        assert_eq!(init["mode"], "winrm");
        assert_eq!(init["computer"], "web01");
        assert_eq!(init["port"], 5985);
        assert_eq!(init["include_port_in_spn"], true);
        assert_eq!(init["username"], "CORP\\svc");
        assert_eq!(init["password"], "s3cret");
        assert!(init.get("key_file").is_none());
    }

    #[test]
    fn test_debug_hides_password() {
        let config = WinRmConfig::new("web01").with_credential(Credential::new("svc", "s3cret"));
        assert!(!format!("{:?}", config).contains("s3cret"));
    }
}
