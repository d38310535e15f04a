use anyhow::{Context, Result};
use rotation_config::parser;
use rotation_config::resolver::{EnvSecretResolver, find_required_vars};
use std::path::Path;
use std::process::ExitCode;

pub fn run(config_path: &Path, strict: bool) -> Result<ExitCode> {
    println!("Validating {}...", config_path.display());

    // Try to parse the configuration
    let config = parser::parse_file(config_path).context("Failed to parse configuration")?;

    println!("✓ Configuration valid");
    println!("  Version: {}", config.version);
    if let Some(name) = &config.name {
        println!("  Name: {}", name);
    }
    let nodes = config.node_identities()?;
    println!(
        "  Nodes: {}{}",
        nodes.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        if config.discover { " (discovery on)" } else { "" }
    );
    println!("  Transport: {:?}", config.connection.transport);
    println!("  Certificate: {}", config.resolve_path(&config.certificate.path).display());

    let mut missing: Vec<String> = find_required_vars(&config)
        .into_iter()
        .filter(|var| std::env::var(var).is_err())
        .collect();
    missing.sort();
    if !missing.is_empty() {
        println!("  Unset variables: {}", missing.join(", "));
    }

    if strict {
        let mut secrets = EnvSecretResolver::new();
        if let Some(dir) = &config.base_dir {
            secrets = secrets.with_base_dir(dir);
        }
        config
            .connection_parameters(&secrets)
            .context("Failed to resolve connection settings")?;
        config
            .rotation_request(&secrets)
            .context("Failed to load certificate material")?;
        println!("✓ Secrets resolved and certificate bundle readable");
    }

    Ok(ExitCode::SUCCESS)
}
