//! Command-line entry point for fleet certificate rotation

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "certctl")]
#[command(about = "Rotate a certificate across a server fleet")]
#[command(version)]
struct Cli {
    /// Job file path
    #[arg(short, long, global = true, default_value = "rotation.yaml")]
    config: PathBuf,

    /// Log level or filter directive (overrides the job file and RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the job file
    Validate {
        /// Strict mode - also resolve secrets and load the certificate bundle
        #[arg(short, long)]
        strict: bool,
    },

    /// Rotate the certificate across the fleet
    Rotate,

    /// Rebind one node's endpoints from the renewal certificate to the new one
    Bindings {
        /// Node to reconcile
        #[arg(short, long)]
        node: String,

        /// New certificate thumbprint (defaults to certificate.fingerprint)
        #[arg(short, long)]
        fingerprint: Option<String>,
    },

    /// Show the fleet topology
    Discover,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    smol::block_on(async {
        match cli.command {
            Commands::Validate { strict } => commands::validate::run(&cli.config, strict),
            Commands::Rotate => {
                commands::rotate::run(&cli.config, cli.log_level.as_deref(), cli.log_file.as_deref())
                    .await
            }
            Commands::Bindings { node, fingerprint } => {
                commands::bindings::run(
                    &cli.config,
                    cli.log_level.as_deref(),
                    cli.log_file.as_deref(),
                    &node,
                    fingerprint.as_deref(),
                )
                .await
            }
            Commands::Discover => {
                commands::discover::run(&cli.config, cli.log_level.as_deref(), cli.log_file.as_deref())
                    .await
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_requires_node() {
        assert!(Cli::try_parse_from(["certctl", "bindings"]).is_err());

        let cli = Cli::try_parse_from(["certctl", "bindings", "--node", "adfs02", "-c", "job.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("job.yaml"));
        match cli.command {
            Commands::Bindings { node, fingerprint } => {
                assert_eq!(node, "adfs02");
                assert!(fingerprint.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["certctl", "rotate", "--log-level", "debug", "--log-file", "run.log"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("rotation.yaml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_file, Some(PathBuf::from("run.log")));
        assert!(matches!(cli.command, Commands::Rotate));
    }
}
