pub mod bindings;
pub mod discover;
pub mod rotate;
pub mod validate;

use anyhow::{Context, Result};
use cert_rotation::operations::bundled_library;
use cert_rotation::{HostSessionFactory, MultiNodeRotationOrchestrator, RotationContext};
use rotation_config::resolver::EnvSecretResolver;
use rotation_config::{JobConfig, parser};
use serde::Serialize;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

/// A parsed job with logging installed
pub struct Job {
    pub config: JobConfig,
    pub secrets: EnvSecretResolver,
    _guard: Option<WorkerGuard>,
}

impl Job {
    pub fn load(config_path: &Path, log_level: Option<&str>, log_file: Option<&Path>) -> Result<Self> {
        let config = parser::parse_file(config_path)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        let guard = crate::logging::init(log_level, log_file, &config)?;
        let mut secrets = EnvSecretResolver::new();
        if let Some(dir) = &config.base_dir {
            secrets = secrets.with_base_dir(dir);
        }
        Ok(Self {
            config,
            secrets,
            _guard: guard,
        })
    }

    pub fn orchestrator(&self) -> Result<MultiNodeRotationOrchestrator> {
        let params = self
            .config
            .connection_parameters(&self.secrets)
            .context("Failed to resolve connection settings")?;
        let library = bundled_library().context("Failed to load operation library")?;
        let factory = HostSessionFactory::new(params, self.config.host_program(), library);
        Ok(MultiNodeRotationOrchestrator::new(RotationContext::new(factory)))
    }
}

pub fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
