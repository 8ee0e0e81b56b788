//! Fleet orchestration CLI.
//!
//! Offline commands over a state snapshot (`fleet.json`) and the fleet
//! config (`fleet.toml`). The daemon itself is embedded as a library; these
//! commands inspect what it would see.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use fleet::exit_codes;
use fleet::inspect::{budget_report, score_report, stuck_report, validate_snapshot};
use fleet::io::config::{DEFAULT_CONFIG_PATH, FleetConfig, load_config, write_config};
use fleet::io::snapshot::load_snapshot;
use fleet::logging;

#[derive(Parser)]
#[command(
    name = "fleet",
    version,
    about = "Autonomous worker fleet orchestration engine"
)]
struct Cli {
    /// Path to the fleet config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config.
    InitConfig {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check goals and work items against the invariants.
    Validate {
        #[arg(long)]
        state: PathBuf,
    },
    /// Print complexity scores and selected models.
    Score {
        #[arg(long)]
        state: PathBuf,
    },
    /// Print per-goal budget status and violations.
    Budget {
        #[arg(long)]
        state: PathBuf,
    },
    /// Print stuck work items.
    Stuck {
        #[arg(long)]
        state: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::Validate { state } => cmd_validate(&state),
        Command::Score { state } => {
            let config = load_config(&cli.config)?;
            print_json(&score_report(&load_snapshot(&state)?, &config))?;
            Ok(exit_codes::OK)
        }
        Command::Budget { state } => {
            let config = load_config(&cli.config)?;
            print_json(&budget_report(&load_snapshot(&state)?, &config))?;
            Ok(exit_codes::OK)
        }
        Command::Stuck { state } => cmd_stuck(&cli.config, &state),
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &FleetConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(state: &Path) -> Result<i32> {
    let violations = validate_snapshot(&load_snapshot(state)?);
    if violations.is_empty() {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    for violation in &violations {
        println!("- {violation}");
    }
    Ok(exit_codes::INVALID)
}

fn cmd_stuck(config: &Path, state: &Path) -> Result<i32> {
    let config = load_config(config)?;
    let detections = stuck_report(&load_snapshot(state)?, &config, Utc::now());
    print_json(&detections)?;
    Ok(if detections.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::STUCK
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_config() {
        let cli = Cli::parse_from(["fleet", "init-config"]);
        assert!(matches!(cli.command, Command::InitConfig { force: false }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["fleet", "stuck", "--state", "s.json", "--config", "c.toml"]);
        assert_eq!(cli.config, PathBuf::from("c.toml"));
        assert!(matches!(cli.command, Command::Stuck { ref state } if state == Path::new("s.json")));
    }

    #[test]
    fn init_config_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fleet.toml");
        assert_eq!(cmd_init_config(&path, false).expect("init"), exit_codes::OK);
        assert!(cmd_init_config(&path, false).is_err());
        assert_eq!(cmd_init_config(&path, true).expect("force"), exit_codes::OK);
        assert_eq!(load_config(&path).expect("load"), FleetConfig::default());
    }
}
