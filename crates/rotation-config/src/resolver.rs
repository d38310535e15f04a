//! Secret reference resolution
//!
//! This module handles resolution of:
//! - Environment variables: `${VAR}` and `${VAR:-default}`
//! - Secret files: `file:<path>` (trailing newline stripped)
//!
//! Anything else is a literal and passes through unchanged.

use crate::{ConfigError, JobConfig, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

const FILE_PREFIX: &str = "file:";

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid"))
}

/// Turns a credential reference into plaintext
pub trait SecretResolver {
    /// Resolve one reference
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Resolves environment and file references
#[derive(Debug, Clone)]
pub struct EnvSecretResolver {
    /// Environment variables (can be overridden)
    pub env_vars: HashMap<String, String>,
    /// Directory relative `file:` paths are resolved against
    pub base_dir: Option<PathBuf>,
}

impl EnvSecretResolver {
    /// Create a resolver over the process environment
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
            base_dir: None,
        }
    }

    /// Create a resolver with no variables at all
    pub fn empty() -> Self {
        Self {
            env_vars: HashMap::new(),
            base_dir: None,
        }
    }

    /// Add or update an environment variable
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }

    /// Resolve relative `file:` paths against `dir`
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn secret_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Default for EnvSecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String> {
        if let Some(raw) = reference.strip_prefix(FILE_PREFIX) {
            let path = self.secret_path(&resolve_env_vars(raw.trim(), &self.env_vars)?);
            let content = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::SecretFile { path, source })?;
            return Ok(content.trim_end_matches(['\r', '\n']).to_string());
        }
        resolve_env_vars(reference, &self.env_vars)
    }
}

/// Resolve environment variables in a string
pub fn resolve_env_vars(input: &str, env_vars: &HashMap<String, String>) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in env_pattern().captures_iter(input) {
        let full_match = &cap[0];
        let (var_name, default_value) = split_default(&cap[1]);

        if let Some(value) = env_vars.get(var_name) {
            result = result.replace(full_match, value);
        } else if let Some(default) = default_value {
            result = result.replace(full_match, default);
        } else {
            errors.push(var_name.to_string());
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::EnvVarNotFound(errors.join(", ")));
    }

    Ok(result)
}

/// Split `VAR:-default`
fn split_default(expr: &str) -> (&str, Option<&str>) {
    match expr.find(":-") {
        Some(pos) => (&expr[..pos], Some(&expr[pos + 2..])),
        None => (expr, None),
    }
}

/// Credential fields of a job that go through a resolver
pub fn secret_fields(config: &JobConfig) -> Vec<(&'static str, &str)> {
    let mut fields = vec![("certificate.password", config.certificate.password.as_str())];
    if let Some(username) = &config.connection.username {
        fields.push(("connection.username", username.as_str()));
    }
    if let Some(password) = &config.connection.password {
        fields.push(("connection.password", password.as_str()));
    }
    fields
}

/// Environment variables referenced without a default
pub fn find_required_vars(config: &JobConfig) -> HashSet<String> {
    let mut vars = HashSet::new();
    for (_, value) in secret_fields(config) {
        for cap in env_pattern().captures_iter(value) {
            if let (name, None) = split_default(&cap[1]) {
                vars.insert(name.to_string());
            }
        }
    }
    vars
}

/// Check references are well formed, warning about unset variables
pub fn validate_references(config: &JobConfig) -> Result<()> {
    for (field, value) in secret_fields(config) {
        for cap in env_pattern().captures_iter(value) {
            let (name, _) = split_default(&cap[1]);
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid variable reference '{}' in {}",
                    &cap[0], field
                )));
            }
        }
        if value.strip_prefix(FILE_PREFIX).is_some_and(|p| p.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "Empty file reference in {}",
                field
            )));
        }
    }

    // Variables might be set by the time the job runs
    let mut missing: Vec<String> = find_required_vars(config)
        .into_iter()
        .filter(|var| std::env::var(var).is_err())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        warn!(
            "The following environment variables are not set: {}",
            missing.join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_env_vars() {
        let mut env_vars = HashMap::new();
        env_vars.insert("ROTATE_PW".to_string(), "s3cret".to_string());

        assert_eq!(resolve_env_vars("${ROTATE_PW}", &env_vars).unwrap(), "s3cret");
        assert_eq!(resolve_env_vars("${MISSING:-fallback}", &env_vars).unwrap(), "fallback");
        assert_eq!(resolve_env_vars("${ROTATE_PW:-ignored}", &env_vars).unwrap(), "s3cret");
        assert_eq!(resolve_env_vars("plain-literal", &env_vars).unwrap(), "plain-literal");

        let err = resolve_env_vars("${A}-${B}", &env_vars).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound(ref v) if v == "A, B"));
    }

    #[test]
    fn test_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("pfx.pw")).unwrap();
        writeln!(file, "from-file").unwrap();

        let mut resolver = EnvSecretResolver::empty().with_base_dir(dir.path());
        assert_eq!(resolver.resolve("file:pfx.pw").unwrap(), "from-file");

        resolver.set_env("SECRETS", dir.path().display().to_string());
        assert_eq!(resolver.resolve("file:${SECRETS}/pfx.pw").unwrap(), "from-file");

        let err = resolver.resolve("file:missing.pw").unwrap_err();
        assert!(matches!(err, ConfigError::SecretFile { .. }));
    }
}
