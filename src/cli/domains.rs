use anyhow::Result;
use clap::Subcommand;
use std::net::ToSocketAddrs;

use crate::db::Repository;

#[derive(Subcommand, Debug)]
/// Domain management commands.
pub enum DomainCommand {
    /// Verify a hostname resolves to its instance's host address
    Check {
        #[arg(help = "Hostname to check")]
        hostname: String,
    },
    /// Bind a hostname to an app's instance
    Add {
        #[arg(help = "App name")]
        app: String,
        #[arg(help = "Hostname")]
        hostname: String,
        #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
        host: String,
        #[arg(short = 'P', long, help = "Make this the primary domain")]
        primary: bool,
    },
    /// Mark a bound hostname as the primary domain
    SetPrimary {
        #[arg(help = "Hostname")]
        hostname: String,
    },
    /// Remove a hostname binding
    Remove {
        #[arg(help = "Hostname")]
        hostname: String,
    },
}

/// Handle domain subcommands.
pub fn handle(repo: &mut Repository, command: DomainCommand) -> Result<()> {
    match command {
        DomainCommand::Check { hostname } => {
            let domain = repo.get_domain_by_hostname(&hostname)?;
            let instance = repo.get_instance_by_id(&domain.instance_id)?;
            let host = repo.get_host(&instance.host_id)?;
            let resolved: Vec<String> = format!("{}:80", hostname)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|addr| addr.ip().to_string()).collect())
                .unwrap_or_default();
            if resolved.is_empty() {
                println!("{}: does not resolve", hostname);
            } else if resolved.iter().any(|ip| *ip == host.address) {
                println!("{}: ok, resolves to {} ({})", hostname, host.address, host.name);
            } else {
                println!(
                    "{}: resolves to {} but host {} is {}",
                    hostname,
                    resolved.join(", "),
                    host.name,
                    host.address
                );
            }
            Ok(())
        }
        DomainCommand::Add {
            app,
            hostname,
            host,
            primary,
        } => {
            let app = repo.get_app_by_name(&app)?;
            let host = repo.get_host_by_name(&host)?;
            let instance = repo.get_instance(&app, &host)?;
            let existing = repo.list_domains(&instance.id)?;
            let domain = repo.add_domain(&instance.id, &hostname, primary || existing.is_empty())?;
            if primary && !existing.is_empty() {
                repo.set_primary_domain(&domain.id)?;
            }
            println!("bound {} to {} on {}", hostname, app.name, host.name);
            Ok(())
        }
        DomainCommand::SetPrimary { hostname } => {
            let domain = repo.get_domain_by_hostname(&hostname)?;
            repo.set_primary_domain(&domain.id)?;
            println!("{} is now primary", hostname);
            Ok(())
        }
        DomainCommand::Remove { hostname } => {
            let domain = repo.get_domain_by_hostname(&hostname)?;
            repo.remove_domain(&domain.id)?;
            println!("removed {}", hostname);
            Ok(())
        }
    }
}
