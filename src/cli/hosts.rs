use anyhow::{Context, Result, bail};
use clap::Subcommand;
use std::path::PathBuf;

use crate::cancel::CancelToken;
use crate::db::Repository;
use crate::hostprep;

#[derive(Subcommand, Debug)]
/// Deployment target management.
pub enum HostCommand {
    /// Register a host with password or private-key credentials
    Add {
        #[arg(help = "Host name")]
        name: String,
        #[arg(help = "Address (IP or DNS name)")]
        address: String,
        #[arg(short = 'p', long, default_value_t = 22, help = "SSH port")]
        port: u16,
        #[arg(short = 'U', long, default_value = "root", help = "SSH user")]
        user: String,
        #[arg(short = 'w', long, help = "Password (stored encrypted)")]
        password: Option<String>,
        #[arg(short = 'i', long, help = "Private key file (stored encrypted)")]
        key_file: Option<PathBuf>,
    },
    /// Rotate a host's stored credentials
    Rotate {
        #[arg(help = "Host name")]
        name: String,
        #[arg(short = 'w', long, help = "New password")]
        password: Option<String>,
        #[arg(short = 'i', long, help = "New private key file")]
        key_file: Option<PathBuf>,
        #[arg(long, help = "Clear the pinned host key (deliberate re-key)")]
        rotate_key: bool,
    },
    /// Run the one-time runtime prep on a host
    Init {
        #[arg(help = "Host name")]
        name: String,
    },
    /// List registered hosts
    #[command(alias = "ls")]
    List,
}

/// Handle host subcommands.
pub fn handle(repo: &Repository, command: HostCommand, cancel: &CancelToken) -> Result<()> {
    match command {
        HostCommand::Add {
            name,
            address,
            port,
            user,
            password,
            key_file,
        } => {
            let private_key = read_key_file(key_file.as_deref())?;
            if password.is_none() && private_key.is_none() {
                bail!("provide --password or --key-file so the host can be dialed");
            }
            let host = repo.create_host(
                &name,
                &address,
                port,
                &user,
                password.as_deref(),
                private_key.as_deref(),
            )?;
            println!("registered {} ({}@{}:{})", host.name, host.username, host.address, host.port);
            Ok(())
        }
        HostCommand::Rotate {
            name,
            password,
            key_file,
            rotate_key,
        } => {
            let host = repo.get_host_by_name(&name)?;
            let private_key = read_key_file(key_file.as_deref())?;
            if password.is_some() || private_key.is_some() {
                repo.update_host_credentials(&host.id, password.as_deref(), private_key.as_deref())?;
                println!("rotated credentials for {}", name);
            }
            if rotate_key {
                repo.clear_host_key(&host.id)?;
                println!("cleared pinned host key for {}; it re-pins on next connect", name);
            }
            Ok(())
        }
        HostCommand::Init { name } => {
            let host = repo.get_host_by_name(&name)?;
            hostprep::initialize_host(repo, &host, cancel)?;
            println!("host {} initialized", name);
            Ok(())
        }
        HostCommand::List => {
            for host in repo.list_hosts()? {
                println!(
                    "{}  {}@{}:{}  {}  {}",
                    host.name,
                    host.username,
                    host.address,
                    host.port,
                    host.status,
                    host.initialized_at.as_deref().unwrap_or("uninitialized")
                );
            }
            Ok(())
        }
    }
}

fn read_key_file(path: Option<&std::path::Path>) -> Result<Option<String>> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(Some(pem))
        }
        None => Ok(None),
    }
}
