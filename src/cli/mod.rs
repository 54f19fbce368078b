//! CLI entrypoints and command routing.

mod apps;
mod builds;
pub mod deploy;
mod domains;
mod hosts;
mod logs;
mod settings;
mod vars;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::crypto::ProcessKeyCipher;
use crate::db::Repository;

#[derive(Parser, Debug)]
#[command(name = "shipyard", version, about = "Blue/green deployment controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
/// Database and key-file options.
struct DbArgs {
    #[arg(short = 'd', long, help = "SQLite database path (default: ~/.shipyard/shipyard.db)")]
    db: Option<PathBuf>,
    #[arg(short = 'k', long, help = "Process key file (default: ~/.shipyard/secret.key)")]
    key_file: Option<PathBuf>,
}

impl DbArgs {
    fn data_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".shipyard"))
    }

    fn open(&self) -> Result<Repository> {
        let data_dir = Self::data_dir()?;
        let db_path = match &self.db {
            Some(path) => path.clone(),
            None => {
                std::fs::create_dir_all(&data_dir)?;
                data_dir.join("shipyard.db")
            }
        };
        let key_path = self
            .key_file
            .clone()
            .unwrap_or_else(|| data_dir.join("secret.key"));
        let cipher = Arc::new(ProcessKeyCipher::load_or_create(&key_path)?);
        Ok(Repository::open(&db_path, cipher)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy a new release
    #[command(alias = "d")]
    Deploy {
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        args: deploy::DeployArgs,
    },
    /// Register the app on a host and run a first deployment
    Launch {
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        args: deploy::DeployArgs,
    },
    /// Switch traffic back to the standby run
    #[command(alias = "rb")]
    Rollback {
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        args: deploy::RollbackArgs,
    },
    /// Stream logs for the active run
    #[command(alias = "l")]
    Logs {
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        args: logs::LogsArgs,
    },
    /// Show instance state and recent deployments
    #[command(alias = "st")]
    Status {
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        args: apps::StatusArgs,
    },
    /// Instance lifecycle commands
    #[command(alias = "a")]
    App {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: apps::AppCommand,
    },
    /// Manage secrets for an app
    #[command(alias = "v")]
    Vars {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: vars::VarsCommand,
    },
    /// Inspect the build-artifact cache
    #[command(alias = "b")]
    Build {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: builds::BuildCommand,
    },
    /// Manage and check domains
    #[command(alias = "dom")]
    Domain {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: domains::DomainCommand,
    },
    /// Manage deployment targets
    #[command(alias = "h")]
    Host {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: hosts::HostCommand,
    },
    /// Untyped system settings
    Settings {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: settings::SettingsCommand,
    },
}

/// Entry point for the CLI.
pub fn run(cancel: CancelToken) -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Deploy { db, args } => {
            let mut repo = db.open()?;
            deploy::handle_deploy(&mut repo, args, false, &cancel)
        }
        Command::Launch { db, args } => {
            let mut repo = db.open()?;
            deploy::handle_deploy(&mut repo, args, true, &cancel)
        }
        Command::Rollback { db, args } => {
            let mut repo = db.open()?;
            deploy::handle_rollback(&mut repo, args, &cancel)
        }
        Command::Logs { db, args } => {
            let repo = db.open()?;
            logs::handle(&repo, args, &cancel)
        }
        Command::Status { db, args } => {
            let repo = db.open()?;
            apps::handle_status(&repo, args, &cancel)
        }
        Command::App { db, command } => {
            let repo = db.open()?;
            apps::handle(&repo, command, &cancel)
        }
        Command::Vars { db, command } => {
            let repo = db.open()?;
            vars::handle(&repo, command)
        }
        Command::Build { db, command } => {
            let repo = db.open()?;
            builds::handle(&repo, command)
        }
        Command::Domain { db, command } => {
            let mut repo = db.open()?;
            domains::handle(&mut repo, command)
        }
        Command::Host { db, command } => {
            let repo = db.open()?;
            hosts::handle(&repo, command, &cancel)
        }
        Command::Settings { db, command } => {
            let repo = db.open()?;
            settings::handle(&repo, command)
        }
    }
}
