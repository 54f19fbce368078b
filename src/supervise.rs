//! Instance supervisor: lifecycle commands for an already-deployed port.
//!
//! These operate on `{app}@{active_port}` and never change which port is
//! active; stop and start additionally retract or restore the Caddy route.

use std::io::Write;
use tracing::info;

use crate::caddy::{CaddyAdmin, Proxy};
use crate::cancel::CancelToken;
use crate::db::{AppRow, HostRow, InstanceRow, Repository};
use crate::error::{Error, Result};
use crate::transport::{self, Transport};

/// Resolved (app, host, instance) triple plus the unit for the active port.
pub struct Target {
    pub app: AppRow,
    pub host: HostRow,
    pub instance: InstanceRow,
    pub unit: String,
}

/// Resolve an instance and require that it has been deployed at least once.
pub fn resolve(repo: &Repository, app_name: &str, host_name: &str) -> Result<Target> {
    let app = repo.get_app_by_name(app_name)?;
    let host = repo.get_host_by_name(host_name)?;
    let instance = repo.get_instance(&app, &host)?;
    if instance.active_port == 0 {
        return Err(Error::InstanceNotFound {
            app: app.name,
            host: host.name,
        });
    }
    let unit = format!("{}@{}", app.name, instance.active_port);
    Ok(Target {
        app,
        host,
        instance,
        unit,
    })
}

fn open_proxy(transport: &mut dyn Transport) -> Result<CaddyAdmin> {
    let tunnel = transport.tunnel(2019)?;
    CaddyAdmin::new(format!("http://{}", tunnel.addr()))
}

/// Start the active port's unit and restore its route.
pub fn start(
    repo: &Repository,
    target: &Target,
    cancel: &CancelToken,
    proxy_override: Option<&mut dyn Proxy>,
) -> Result<()> {
    let mut connected = transport::connect(&target.host, cancel)?;
    let transport = connected.transport.as_mut();
    run_checked(transport, &format!("sudo systemctl start {}", target.unit))?;
    let domains = repo.list_domains(&target.instance.id)?;
    let hostnames: Vec<String> = domains.iter().map(|d| d.hostname.clone()).collect();
    if !hostnames.is_empty() {
        match proxy_override {
            Some(proxy) => proxy.upsert(&hostnames, target.instance.active_port)?,
            None => {
                let mut caddy = open_proxy(transport)?;
                caddy.upsert(&hostnames, target.instance.active_port)?;
            }
        }
    }
    repo.set_instance_status(&target.instance.id, "running")?;
    info!(unit = %target.unit, "instance started");
    Ok(())
}

/// Stop the active port's unit and retract its route.
pub fn stop(
    repo: &Repository,
    target: &Target,
    cancel: &CancelToken,
    proxy_override: Option<&mut dyn Proxy>,
) -> Result<()> {
    let mut connected = transport::connect(&target.host, cancel)?;
    let transport = connected.transport.as_mut();
    let domains = repo.list_domains(&target.instance.id)?;
    if let Some(primary) = domains.iter().find(|d| d.is_primary).or(domains.first()) {
        match proxy_override {
            Some(proxy) => proxy.delete(&primary.hostname)?,
            None => {
                let mut caddy = open_proxy(transport)?;
                caddy.delete(&primary.hostname)?;
            }
        }
    }
    run_checked(transport, &format!("sudo systemctl stop {}", target.unit))?;
    repo.set_instance_status(&target.instance.id, "stopped")?;
    info!(unit = %target.unit, "instance stopped");
    Ok(())
}

/// Restart the active port's unit in place; the route is untouched.
pub fn restart(repo: &Repository, target: &Target, cancel: &CancelToken) -> Result<()> {
    let mut connected = transport::connect(&target.host, cancel)?;
    let transport = connected.transport.as_mut();
    run_checked(transport, &format!("sudo systemctl restart {}", target.unit))?;
    repo.set_instance_status(&target.instance.id, "running")?;
    Ok(())
}

/// Unit state as systemd reports it.
pub fn unit_state(target: &Target, cancel: &CancelToken) -> Result<String> {
    let mut connected = transport::connect(&target.host, cancel)?;
    let transport = connected.transport.as_mut();
    let result = transport.exec(&format!("sudo systemctl is-active {}", target.unit))?;
    Ok(result.output.trim().to_string())
}

/// Stream journal output for the active port into `sink`.
pub fn logs(
    target: &Target,
    lines_back: u32,
    follow: bool,
    cancel: &CancelToken,
    sink: &mut dyn Write,
) -> Result<()> {
    let mut connected = transport::connect(&target.host, cancel)?;
    connected
        .transport
        .stream_logs(&target.unit, lines_back, follow, cancel, sink)
}

fn run_checked(transport: &mut dyn Transport, command: &str) -> Result<()> {
    let result = transport.exec(command)?;
    if result.success() {
        return Ok(());
    }
    Err(Error::Transport(format!(
        "`{}` exited {}: {}",
        command,
        result.exit_status,
        result.output.trim()
    )))
}
