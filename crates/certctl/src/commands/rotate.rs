use super::{Job, print_json};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::info;

pub async fn run(config_path: &Path, log_level: Option<&str>, log_file: Option<&Path>) -> Result<ExitCode> {
    let job = Job::load(config_path, log_level, log_file)?;

    // Every secret is resolved before the first session opens
    let request = job
        .config
        .rotation_request(&job.secrets)
        .context("Failed to prepare rotation")?;
    let orchestrator = job.orchestrator()?;

    info!(
        job = job.config.name.as_deref().unwrap_or("<unnamed>"),
        nodes = request.nodes.len(),
        discover = request.discover,
        "rotating certificate"
    );
    let outcome = orchestrator.rotate(&request).await;
    print_json(&outcome)?;

    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
