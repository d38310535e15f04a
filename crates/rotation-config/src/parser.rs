//! Job file parser and validation

use crate::resolver::validate_references;
use crate::{ConfigError, JobConfig, Result};
use cert_rotation::Fingerprint;
use session_executor::{NodeIdentity, TransportKind};
use std::path::Path;

/// Supported job file version
pub const CONFIG_VERSION: &str = "1.0";

/// Parse a YAML job file; relative paths in it resolve against its directory
pub fn parse_file(path: impl AsRef<Path>) -> Result<JobConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_str(&content)?;
    config.base_dir = path.parent().map(Path::to_path_buf);
    Ok(config)
}

/// Parse a YAML job from a string
pub fn parse_str(content: &str) -> Result<JobConfig> {
    let config: JobConfig = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate a job
pub fn validate_config(config: &JobConfig) -> Result<()> {
    // Check version
    if config.version != CONFIG_VERSION {
        return Err(invalid(format!(
            "Unsupported version: {}, expected {}",
            config.version, CONFIG_VERSION
        )));
    }

    match (&config.target, config.nodes.is_empty()) {
        (Some(_), false) => return Err(invalid("Set either 'nodes' or 'target', not both")),
        (None, true) => return Err(invalid("No nodes configured; set 'nodes' or 'target'")),
        _ => {}
    }
    for node in config.target.iter().chain(config.nodes.iter()) {
        NodeIdentity::parse(node).map_err(|e| invalid(format!("Node '{}': {}", node, e)))?;
    }

    if config.certificate.path.trim().is_empty() {
        return Err(invalid("certificate.path is empty"));
    }
    for (field, value) in [
        ("certificate.fingerprint", &config.certificate.fingerprint),
        ("renewal", &config.renewal),
    ] {
        if let Some(value) = value {
            Fingerprint::parse(value).map_err(|e| invalid(format!("{}: {}", field, e)))?;
        }
    }

    let connection = &config.connection;
    if connection.password.is_some() && connection.username.is_none() {
        return Err(invalid("connection.password requires connection.username"));
    }
    if connection.key_file.is_some() && connection.transport != TransportKind::Ssh {
        return Err(invalid("connection.key_file is only used with the ssh transport"));
    }
    if connection.use_ssl && connection.transport == TransportKind::Ssh {
        return Err(invalid("connection.use_ssl does not apply to the ssh transport"));
    }

    if config.options.max_parallel_nodes == 0 {
        return Err(invalid("options.max_parallel_nodes must be at least 1"));
    }
    if config.options.node_timeout_secs == 0 {
        return Err(invalid("options.node_timeout_secs must be at least 1"));
    }

    // Validate all secret references
    validate_references(config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: "1.0"
target: adfs01
certificate:
  path: sts.pfx
  password: ${PFX_PASSWORD}
"#;

    #[test]
    fn test_minimal_job_defaults() {
        let config = parse_str(MINIMAL).unwrap();
        assert_eq!(config.target.as_deref(), Some("adfs01"));
        assert!(config.discover);
        assert_eq!(config.connection.transport, TransportKind::WinRm);
        assert_eq!(config.options.node_timeout_secs, 300);
        assert_eq!(config.options.max_parallel_nodes, 1);
        assert!(config.options.cleanup_superseded);
        assert!(config.options.verify);
        assert!(config.base_dir.is_none());
    }

    #[test]
    fn test_nodes_and_target_are_exclusive() {
        let yaml = MINIMAL.replace("target: adfs01", "target: adfs01\nnodes: [adfs02]");
        let err = parse_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("not both"));

        let yaml = MINIMAL.replace("target: adfs01\n", "");
        assert!(parse_str(&yaml).is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            (MINIMAL.replace("\"1.0\"", "\"2.0\""), "Unsupported version"),
            (MINIMAL.replace("adfs01", "adfs01|carrier-pigeon"), "Node 'adfs01|carrier-pigeon'"),
            (format!("{}  fingerprint: nope\n", MINIMAL), "certificate.fingerprint"),
            (format!("{}options:\n  max_parallel_nodes: 0\n", MINIMAL), "max_parallel_nodes"),
            (format!("{}connection:\n  password: x\n", MINIMAL), "requires connection.username"),
        ];
        for (yaml, expected) in cases {
            let err = parse_str(&yaml).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "expected '{}' in '{}'",
                expected,
                err
            );
        }
    }
}
