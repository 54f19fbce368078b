use anyhow::Result;
use clap::Subcommand;
use std::path::Path;

use crate::cache;
use crate::db::Repository;

#[derive(Subcommand, Debug)]
/// Build-artifact cache commands.
pub enum BuildCommand {
    /// List cached artifacts for an app
    #[command(alias = "ls")]
    List {
        #[arg(help = "App name")]
        app: String,
    },
}

/// Handle build subcommands.
pub fn handle(repo: &Repository, command: BuildCommand) -> Result<()> {
    match command {
        BuildCommand::List { app } => {
            let app = repo.get_app_by_name(&app)?;
            let artifacts = repo.list_artifacts(&app.id)?;
            if artifacts.is_empty() {
                println!("no cached builds for {}", app.name);
                return Ok(());
            }
            for artifact in artifacts {
                let validity = match cache::md5_of_file(Path::new(&artifact.local_path)) {
                    Ok(md5) if md5 == artifact.md5_hash => "ok",
                    Ok(_) => "corrupt",
                    Err(_) => "missing",
                };
                println!(
                    "{}  {}  {}  {}  {}",
                    &artifact.md5_hash[..12],
                    artifact.version,
                    artifact.git_commit_sha.as_deref().unwrap_or("-"),
                    validity,
                    artifact.created_at
                );
            }
            Ok(())
        }
    }
}
