use anyhow::Result;
use clap::Subcommand;

use crate::db::Repository;

#[derive(Subcommand, Debug)]
/// Untyped system settings (e.g. the admin UI's public hostname).
pub enum SettingsCommand {
    /// Read a setting
    Get {
        #[arg(help = "Setting key")]
        key: String,
    },
    /// Write a setting
    Set {
        #[arg(help = "Setting key")]
        key: String,
        #[arg(help = "Setting value")]
        value: String,
    },
}

/// Handle settings subcommands.
pub fn handle(repo: &Repository, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Get { key } => {
            match repo.get_setting(&key)? {
                Some(value) => println!("{}", value),
                None => println!("(unset)"),
            }
            Ok(())
        }
        SettingsCommand::Set { key, value } => {
            repo.set_setting(&key, &value)?;
            Ok(())
        }
    }
}
