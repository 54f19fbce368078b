//! One-time host preparation and per-app systemd unit installation.

use tracing::info;

use crate::cancel::CancelToken;
use crate::db::{HostRow, Repository};
use crate::error::{Error, Result};
use crate::caddy::Proxy;
use crate::transport::{self, Transport, sh_quote};

const HOST_INIT_SCRIPT: &str = include_str!("../templates/host_init.sh");
const APP_UNIT_TEMPLATE: &str = include_str!("../templates/app.service");

/// Run the runtime-prep script on a host: service user, directory skeleton,
/// Caddy install, admin API check. Sets `initialized_at` on success.
pub fn initialize_host(repo: &Repository, host: &HostRow, cancel: &CancelToken) -> Result<()> {
    let connected = transport::connect(host, cancel)?;
    let mut transport = connected.transport;
    if let Some(key) = connected.captured_host_key {
        repo.update_host_key(&host.id, &key)?;
    }

    let result = transport.exec_with_input("sudo bash -s", HOST_INIT_SCRIPT.as_bytes())?;
    if !result.success() {
        return Err(Error::Transport(format!(
            "host init script failed on {}: {}",
            host.name,
            result.output.trim()
        )));
    }

    // The prep is not done until the admin API answers.
    let tunnel = transport.tunnel(2019)?;
    let mut caddy = crate::caddy::CaddyAdmin::new(format!("http://{}", tunnel.addr()))?;
    caddy.check_availability()?;

    let arch = transport.exec("uname -m")?;
    let arch = arch.success().then(|| arch.output.trim().to_string());
    repo.set_host_initialized(&host.id, arch.as_deref())?;
    info!(host = %host.name, "host initialized");
    Ok(())
}

/// Install (or refresh) the `{app}@.service` template unit so
/// `systemctl start {app}@{port}` works. Idempotent.
pub fn ensure_app_unit(transport: &mut dyn Transport, app_name: &str) -> Result<()> {
    let unit = APP_UNIT_TEMPLATE.replace("{{app}}", app_name);
    let path = format!("/etc/systemd/system/{}@.service", app_name);
    let command = format!(
        "sudo tee {} >/dev/null && sudo systemctl daemon-reload",
        sh_quote(&path)
    );
    let result = transport.exec_with_input(&command, unit.as_bytes())?;
    if !result.success() {
        return Err(Error::Transport(format!(
            "installing {} failed: {}",
            path,
            result.output.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_template_is_fully_rendered() {
        let unit = APP_UNIT_TEMPLATE.replace("{{app}}", "chat");
        assert!(unit.contains("EnvironmentFile=/etc/chat/env"));
        assert!(unit.contains("/var/www/chat/instances/%i"));
        assert!(unit.contains("User=phoenix"));
        assert!(!unit.contains("{{app}}"));
    }
}
