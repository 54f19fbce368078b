use anyhow::Result;
use clap::{Args, Subcommand};

use crate::cancel::CancelToken;
use crate::db::Repository;
use crate::supervise;

#[derive(Subcommand, Debug)]
/// Instance lifecycle commands.
pub enum AppCommand {
    /// Start the active run and restore its route
    Start {
        #[arg(help = "App name")]
        app: String,
        #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
        host: String,
    },
    /// Stop the active run and retract its route
    Stop {
        #[arg(help = "App name")]
        app: String,
        #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
        host: String,
    },
    /// Restart the active run in place
    Restart {
        #[arg(help = "App name")]
        app: String,
        #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
        host: String,
    },
    /// Show the unit state for the active run
    Status {
        #[arg(help = "App name")]
        app: String,
        #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
        host: String,
    },
    /// List registered applications
    #[command(alias = "ls")]
    List,
}

#[derive(Args, Debug)]
#[command(about = "Show instance state and recent deployments")]
/// Status argument set.
pub struct StatusArgs {
    #[arg(help = "App name")]
    pub app: String,
    #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
    pub host: String,
    #[arg(short = 'n', long, default_value_t = 5, help = "History entries to show")]
    pub limit: u32,
}

/// Handle app lifecycle subcommands.
pub fn handle(repo: &Repository, command: AppCommand, cancel: &CancelToken) -> Result<()> {
    match command {
        AppCommand::Start { app, host } => {
            let target = supervise::resolve(repo, &app, &host)?;
            supervise::start(repo, &target, cancel, None)?;
            println!("started {}", target.unit);
            Ok(())
        }
        AppCommand::Stop { app, host } => {
            let target = supervise::resolve(repo, &app, &host)?;
            supervise::stop(repo, &target, cancel, None)?;
            println!("stopped {}", target.unit);
            Ok(())
        }
        AppCommand::Restart { app, host } => {
            let target = supervise::resolve(repo, &app, &host)?;
            supervise::restart(repo, &target, cancel)?;
            println!("restarted {}", target.unit);
            Ok(())
        }
        AppCommand::Status { app, host } => {
            let target = supervise::resolve(repo, &app, &host)?;
            let state = supervise::unit_state(&target, cancel)?;
            println!("{}  {}", target.unit, state);
            Ok(())
        }
        AppCommand::List => {
            for app in repo.list_apps()? {
                println!("{}  {}", app.name, app.id);
            }
            Ok(())
        }
    }
}

/// Print instance state, ports, and recent deployment history.
pub fn handle_status(repo: &Repository, args: StatusArgs, _cancel: &CancelToken) -> Result<()> {
    let app = repo.get_app_by_name(&args.app)?;
    let host = repo.get_host_by_name(&args.host)?;
    let instance = repo.get_instance(&app, &host)?;
    println!(
        "{} on {}: {} (active port {}, previous {})",
        app.name, host.name, instance.status, instance.active_port, instance.previous_active_port
    );
    for run in repo.list_runs(&instance.id)? {
        println!("run  {}  port {}  {}  {}", run.status, run.port, run.version, run.release_path);
    }
    for entry in repo.list_history(&instance.id, args.limit)? {
        println!(
            "dpl  {}  {}  {}  {}",
            entry.status,
            entry.version,
            entry.git_commit_sha.as_deref().unwrap_or("-"),
            entry.created_at
        );
    }
    Ok(())
}
