//! liftoff CLI entry point.
//!
//! Runs the startup sequence and serves until SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use liftoff_common::{CONFIG_FILE_ENV, ConfigLoader, MODE_ENV, Profile};
use liftoff_server::Bootstrapper;

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "liftoff", version, about)]
struct Cli {
    /// Configuration profile: dev, prod or test.
    #[arg(long, env = MODE_ENV, default_value = "dev")]
    mode: String,

    /// TOML file layered over the profile.
    #[arg(long, env = CONFIG_FILE_ENV)]
    config: Option<PathBuf>,

    /// Set an option, e.g. `--set server.bind_addr=127.0.0.1:9000`.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err("option name must not be empty".to_string());
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        let profile: Profile = cli.mode.parse()?;
        let mut loader = ConfigLoader::new(profile);
        if let Some(path) = &cli.config {
            loader = loader.with_file(path);
        }
        for (key, value) in &cli.overrides {
            loader = loader.with_override(key, value);
        }
        let store = loader.load()?;
        print!("{}", store.settings().to_toml()?);
        return Ok(());
    }

    let mut bootstrapper = Bootstrapper::with_mode(&cli.mode);
    if let Some(path) = &cli.config {
        bootstrapper = bootstrapper.with_config_file(path);
    }
    for (key, value) in cli.overrides {
        bootstrapper = bootstrapper.with_override(key, value);
    }

    let app = bootstrapper
        .initialize()
        .await
        .context("Startup failed")?;

    info!(bind_addr = %app.settings().server.bind_addr, "Available endpoints:");
    for route in app.state().routes() {
        for binding in &route.descriptor.bindings {
            info!("  {:<5} {}{}", binding.method, route.descriptor.prefix, binding.path);
        }
    }

    app.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("tasks.workers=4").unwrap(),
            ("tasks.workers".to_string(), "4".to_string())
        );
        assert_eq!(
            parse_override("app_name=a=b").unwrap(),
            ("app_name".to_string(), "a=b".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "liftoff",
            "--mode",
            "test",
            "--set",
            "tasks.workers=3",
            "--print-config",
        ])
        .unwrap();
        assert_eq!(cli.mode, "test");
        assert!(cli.print_config);
        assert_eq!(cli.overrides.len(), 1);
    }
}
