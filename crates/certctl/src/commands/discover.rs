use super::{Job, print_json};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;

pub async fn run(config_path: &Path, log_level: Option<&str>, log_file: Option<&Path>) -> Result<ExitCode> {
    let job = Job::load(config_path, log_level, log_file)?;
    let nodes = job.config.node_identities()?;

    let topology = job
        .orchestrator()?
        .discover(&nodes)
        .await
        .context("Discovery failed")?;
    print_json(&topology)?;
    Ok(ExitCode::SUCCESS)
}
