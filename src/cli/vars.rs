use anyhow::Result;
use clap::Subcommand;

use crate::db::Repository;

#[derive(Subcommand, Debug)]
/// Secret management commands. Values are encrypted at rest; `list` shows
/// keys only.
pub enum VarsCommand {
    /// List secret keys for an app
    #[command(alias = "ls")]
    List {
        #[arg(help = "App name")]
        app: String,
    },
    /// Set (or overwrite) a secret
    Set {
        #[arg(help = "App name")]
        app: String,
        #[arg(help = "KEY=VALUE pairs", required = true)]
        pairs: Vec<String>,
    },
    /// Remove a secret
    Unset {
        #[arg(help = "App name")]
        app: String,
        #[arg(help = "Keys to remove", required = true)]
        keys: Vec<String>,
    },
}

/// Handle vars subcommands.
pub fn handle(repo: &Repository, command: VarsCommand) -> Result<()> {
    match command {
        VarsCommand::List { app } => {
            let app = repo.get_app_by_name(&app)?;
            for key in repo.list_secret_keys(&app.id)? {
                println!("{}", key);
            }
            Ok(())
        }
        VarsCommand::Set { app, pairs } => {
            let app = repo.get_app_by_name(&app)?;
            for pair in pairs {
                let Some((key, value)) = pair.split_once('=') else {
                    anyhow::bail!("expected KEY=VALUE, got {}", pair);
                };
                repo.set_secret(&app.id, key, value)?;
                println!("set {}", key);
            }
            Ok(())
        }
        VarsCommand::Unset { app, keys } => {
            let app = repo.get_app_by_name(&app)?;
            for key in keys {
                repo.unset_secret(&app.id, &key)?;
                println!("unset {}", key);
            }
            Ok(())
        }
    }
}
