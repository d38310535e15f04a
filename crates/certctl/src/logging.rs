//! Subscriber setup

use anyhow::{Context, Result};
use rotation_config::JobConfig;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LEVEL: &str = "info";

/// Filter from the CLI flag, then the job file, then `RUST_LOG`
fn filter(cli_level: Option<&str>, config: &JobConfig) -> Result<EnvFilter> {
    let directive = cli_level.or(config.settings.log_level.as_deref());
    match directive {
        Some(directive) => EnvFilter::try_new(directive).context("Invalid log level"),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))),
    }
}

/// Where file logs go; relative job-file paths land in the local data directory
fn log_file(cli_file: Option<&Path>, config: &JobConfig) -> Option<PathBuf> {
    if let Some(path) = cli_file {
        return Some(path.to_path_buf());
    }
    let path = PathBuf::from(config.settings.log_file.as_deref()?);
    if path.is_absolute() {
        return Some(path);
    }
    let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Some(data_dir.join("certctl").join(path))
}

/// Install the global subscriber; keep the guard alive until exit
pub fn init(
    cli_level: Option<&str>,
    cli_file: Option<&Path>,
    config: &JobConfig,
) -> Result<Option<WorkerGuard>> {
    let filter = filter(cli_level, config)?;
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file(cli_file, config) {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let name = path.file_name().context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(log_level: Option<&str>, log_file: Option<&str>) -> JobConfig {
        let mut config = rotation_config::parser::parse_str(
            "version: \"1.0\"\ntarget: adfs01\ncertificate:\n  path: a.pfx\n  password: x\n",
        )
        .unwrap();
        config.settings.log_level = log_level.map(str::to_string);
        config.settings.log_file = log_file.map(str::to_string);
        config
    }

    #[test]
    fn test_cli_level_wins() {
        let job = config(Some("warn"), None);
        assert_eq!(filter(Some("debug"), &job).unwrap().to_string(), "debug");
        assert_eq!(filter(None, &job).unwrap().to_string(), "warn");
        assert!(filter(Some("certctl=loud"), &job).is_err());
    }

    #[test]
    fn test_log_file_locations() {
        assert_eq!(log_file(None, &config(None, None)), None);
        assert_eq!(
            log_file(Some(Path::new("/tmp/run.log")), &config(None, Some("ignored.log"))),
            Some(PathBuf::from("/tmp/run.log"))
        );
        assert_eq!(
            log_file(None, &config(None, Some("/var/log/certctl.log"))),
            Some(PathBuf::from("/var/log/certctl.log"))
        );
        let relative = log_file(None, &config(None, Some("rotation.log"))).unwrap();
        assert!(relative.ends_with("certctl/rotation.log"));
    }
}
