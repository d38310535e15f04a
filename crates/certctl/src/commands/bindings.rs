use super::{Job, print_json};
use anyhow::{Context, Result, bail};
use cert_rotation::{Fingerprint, ReconcileStatus};
use std::path::Path;
use std::process::ExitCode;

pub async fn run(
    config_path: &Path,
    log_level: Option<&str>,
    log_file: Option<&Path>,
    node: &str,
    fingerprint: Option<&str>,
) -> Result<ExitCode> {
    let job = Job::load(config_path, log_level, log_file)?;

    let Some(renewal) = job.config.renewal_fingerprint()? else {
        bail!("No 'renewal' fingerprint configured; nothing to rebind from");
    };
    let replacement = match fingerprint {
        Some(raw) => Fingerprint::parse(raw)?,
        None => job
            .config
            .expected_fingerprint()?
            .context("Pass --fingerprint or set certificate.fingerprint")?,
    };
    let node = job.config.node(node)?;

    let report = job
        .orchestrator()?
        .reconcile_node(&node, &renewal, &replacement)
        .await
        .with_context(|| format!("Failed to reconcile bindings on {}", node))?;
    print_json(&report)?;

    Ok(match report.status {
        ReconcileStatus::NothingToDo | ReconcileStatus::Reconciled => ExitCode::SUCCESS,
        ReconcileStatus::PartiallyReconciled | ReconcileStatus::Failed => ExitCode::FAILURE,
    })
}
