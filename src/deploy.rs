//! Deployment orchestrator: the blue/green state machine.
//!
//! One deployment runs sequentially on one thread: resolve state, pick or
//! build an artifact, stage it on the target, bring the new port up, probe
//! it, re-point Caddy, commit the cutover, then retire the old port. Every
//! failure before the cutover compensates by stopping the new port and
//! leaving the serving one untouched.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::builder::{self, Runtime};
use crate::cache::ArtifactCache;
use crate::caddy::{CaddyAdmin, Proxy};
use crate::cancel::CancelToken;
use crate::config::ProjectConfig;
use crate::db::{AppRow, ArtifactRow, HistoryRow, HostRow, InstanceRow, Repository};
use crate::envfile;
use crate::error::{Error, HookStage, Result};
use crate::hooks::{self, HookContext};
use crate::locks;
use crate::transport::{self, Transport};

/// Timing and retry knobs; tests compress these without touching the
/// machine itself.
#[derive(Debug, Clone)]
pub struct DeployTuning {
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub retire_grace: Duration,
    pub port_range: (u16, u16),
    pub port_attempts: u32,
    pub lock_timeout: Duration,
}

impl Default for DeployTuning {
    fn default() -> Self {
        Self {
            probe_attempts: 10,
            probe_interval: Duration::from_secs(2),
            retire_grace: Duration::from_secs(5),
            port_range: (10000, 20000),
            port_attempts: 100,
            lock_timeout: locks::ACQUIRE_TIMEOUT,
        }
    }
}

/// One deployment request.
pub struct DeployRequest<'a> {
    pub app_name: &'a str,
    pub host_name: &'a str,
    pub project_dir: &'a Path,
    pub config: &'a ProjectConfig,
    /// Artifact identifier (md5 prefix or git sha) that skips the builder.
    pub use_build: Option<&'a str>,
    /// Create the application and instance slot if they do not exist yet.
    pub launch: bool,
}

/// What a successful deployment left behind.
#[derive(Debug, Clone)]
pub struct DeploySummary {
    pub history_id: String,
    pub version: String,
    pub port: u16,
    pub old_port: u16,
}

/// Orchestrator context for the duration of one deployment attempt.
pub struct Deployer<'a> {
    pub repo: &'a mut Repository,
    pub cache: &'a ArtifactCache,
    pub tuning: DeployTuning,
    pub cancel: CancelToken,
}

impl Deployer<'_> {
    /// Run the full pipeline. `proxy_override` substitutes the Caddy
    /// controller (tests record calls through it); `None` targets the admin
    /// API through the transport's tunnel.
    pub fn deploy(
        &mut self,
        request: &DeployRequest<'_>,
        proxy_override: Option<&mut dyn Proxy>,
    ) -> Result<DeploySummary> {
        // FETCH_CONFIG
        self.cancel.check()?;
        let (app, host, instance) = self.resolve_target(request)?;
        let lock_table = locks::instance_locks();
        let _lock = lock_table.acquire(&instance.id, self.tuning.lock_timeout)?;
        // Re-read under the lock; a serialized predecessor may have moved the ports.
        let instance = self.repo.get_instance_by_id(&instance.id)?;
        if !host.is_local() && host.initialized_at.is_none() {
            return Err(Error::HostNotInitialized(host.name.clone()));
        }
        let secrets = self.repo.get_secrets_map(&app.id)?;
        let domains = self.repo.list_domains(&instance.id)?;
        let runtime = match request.config.build.runtime.as_deref() {
            Some(name) => Runtime::from_name(name)?,
            None => builder::detect_runtime(request.project_dir),
        };

        // ACQUIRE_ARTIFACT
        self.cancel.check()?;
        let artifact = self.acquire_artifact(request, &app, runtime)?;
        info!(
            app = %app.name,
            host = %host.name,
            version = %artifact.version,
            md5 = %artifact.md5_hash,
            "artifact ready"
        );

        // CONNECT_REMOTE
        self.cancel.check()?;
        let connected = transport::connect(&host, &self.cancel)?;
        let mut transport = connected.transport;
        if let Some(key) = connected.captured_host_key {
            info!(host = %host.name, "pinning host key captured on first connect");
            self.repo.update_host_key(&host.id, &key)?;
        }

        // CREATE_HISTORY
        let history = self.repo.create_history(
            &instance.id,
            &artifact.version,
            artifact.git_commit_sha.as_deref(),
        )?;
        self.log(&history, &format!("deploying {} {} to {}", app.name, artifact.version, host.name));

        let outcome = self.run_release(
            request,
            &app,
            &instance,
            &domains,
            &secrets,
            runtime,
            &artifact,
            &history,
            transport.as_mut(),
            proxy_override,
        );
        match outcome {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.log(&history, &format!("deployment failed: {}", err));
                if err.aborts_before_cutover() {
                    self.repo.set_history_status(&history.id, "failed")?;
                }
                Err(err)
            }
        }
    }

    fn resolve_target(
        &mut self,
        request: &DeployRequest<'_>,
    ) -> Result<(AppRow, HostRow, InstanceRow)> {
        if crate::db::LOCALHOST_NAMES.contains(&request.host_name) {
            let instance = self.repo.ensure_localhost_instance(request.app_name)?;
            let app = self.repo.get_app_by_name(request.app_name)?;
            let host = self.repo.get_host_by_name("localhost")?;
            return Ok((app, host, instance));
        }
        let host = self.repo.get_host_by_name(request.host_name)?;
        if request.launch {
            let app = self.repo.ensure_app(request.app_name)?;
            let instance = self.repo.link_instance(&app, &host)?;
            return Ok((app, host, instance));
        }
        let app = self.repo.get_app_by_name(request.app_name)?;
        let instance = self.repo.get_instance(&app, &host)?;
        Ok((app, host, instance))
    }

    /// Artifact priority: explicit identifier, clean git sha, fresh build.
    fn acquire_artifact(
        &mut self,
        request: &DeployRequest<'_>,
        app: &AppRow,
        runtime: Runtime,
    ) -> Result<ArtifactRow> {
        if let Some(identifier) = request.use_build {
            return self.cache.lookup_identifier(self.repo, app, identifier);
        }
        let sha = builder::git_commit(request.project_dir);
        if builder::is_reusable_sha(&sha) {
            if let Some(row) = self.cache.lookup_git_sha(self.repo, app, &sha) {
                info!(sha = %sha, "reusing cached artifact");
                return Ok(row);
            }
        }
        let outcome = builder::build(
            request.project_dir,
            &app.name,
            runtime,
            request.config.build.dockerfile.as_deref(),
            self.cache.dir(),
        )?;
        self.cache.put(self.repo, app, outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_release(
        &mut self,
        request: &DeployRequest<'_>,
        app: &AppRow,
        instance: &InstanceRow,
        domains: &[crate::db::DomainRow],
        secrets: &std::collections::BTreeMap<String, String>,
        runtime: Runtime,
        artifact: &ArtifactRow,
        history: &HistoryRow,
        transport: &mut dyn Transport,
        proxy_override: Option<&mut dyn Proxy>,
    ) -> Result<DeploySummary> {
        // STAGE_RELEASE
        self.cancel.check()?;
        let release_path = format!(
            "/var/www/{}/releases/{}-{}",
            app.name,
            artifact.version,
            OffsetDateTime::now_utc().unix_timestamp()
        );
        let mut tarball = std::fs::File::open(&artifact.local_path)?;
        let transferred = transport.upload_and_extract(&mut tarball, &release_path)?;
        self.log(history, &format!("staged release at {} ({} bytes)", release_path, transferred));
        if runtime != Runtime::Static {
            let chmod = format!(
                "sudo bash -c 'chmod +x {rp}/bin/* {rp}/erts-*/bin/* 2>/dev/null; \
                 find {rp}/releases -name elixir -exec chmod +x {{}} + 2>/dev/null; true'",
                rp = release_path
            );
            run_checked(transport, &chmod)?;
        }

        // INJECT_ENV
        self.cancel.check()?;
        let mut env = envfile::merge_env(&request.config.env, domains, secrets);
        if envfile::ensure_secret_key_base(&mut env, runtime, self.repo, app)? {
            self.log(history, "generated SECRET_KEY_BASE");
        }
        let rendered = envfile::render(&env);
        let install = transport.exec_with_input(
            &envfile::install_env_command(&app.name),
            rendered.as_bytes(),
        )?;
        if !install.success() {
            return Err(Error::Transport(format!(
                "env file install failed: {}",
                install.output.trim()
            )));
        }
        for command in envfile::path_guard_commands(&env) {
            run_checked(transport, &command)?;
        }
        self.log(history, &format!("installed /etc/{}/env ({} keys)", app.name, env.len()));

        // Hooks before the new run starts.
        let hook_ctx = HookContext {
            app_name: app.name.clone(),
            release_path: release_path.clone(),
            version: artifact.version.clone(),
            commit_sha: artifact.git_commit_sha.clone().unwrap_or_else(|| "unknown".to_string()),
        };
        self.cancel.check()?;
        for (stage, list) in [
            (HookStage::PreDeploy, &request.config.hooks.pre_deploy),
            (HookStage::Migrate, &request.config.hooks.migrate),
        ] {
            let lines = hooks::run_hooks(transport, list, stage, &hook_ctx)?;
            for line in lines {
                self.log(history, &line);
            }
        }

        // START_NEW_RUN
        self.cancel.check()?;
        let port = self.select_free_port(transport)?;
        let unit = format!("{}@{}", app.name, port);
        let link = format!("/var/www/{}/instances/{}", app.name, port);
        run_checked(
            transport,
            &format!(
                "sudo mkdir -p /var/www/{app}/instances && sudo ln -sfn {rp} {link}",
                app = app.name,
                rp = release_path,
                link = link
            ),
        )?;
        run_checked(
            transport,
            &format!("sudo chown -Rh phoenix:phoenix {} {}", release_path, link),
        )?;
        let started = transport.exec(&format!("sudo systemctl start {}", unit))?;
        if !started.success() {
            self.stop_green(transport, &app.name, port);
            return Err(Error::HealthCheckFailed {
                unit,
                detail: format!("unit failed to start: {}", started.output.trim()),
            });
        }
        self.log(history, &format!("started {} on port {}", unit, port));

        // HEALTH_PROBE. Cancellation here compensates the same way.
        let probe = self.probe_health(transport, &unit);
        if let Err(err) = probe.and(self.cancel.check()) {
            let status = transport
                .exec(&format!("sudo systemctl status {} --no-pager", unit))
                .map(|out| out.output)
                .unwrap_or_else(|probe_err| probe_err.to_string());
            self.log(history, &status);
            self.stop_green(transport, &app.name, port);
            return Err(err);
        }

        // CUT_OVER
        let hostnames: Vec<String> = domains.iter().map(|d| d.hostname.clone()).collect();
        let cutover = self.cut_over(transport, proxy_override, &hostnames, port, &unit);
        if let Err(err) = cutover {
            self.stop_green(transport, &app.name, port);
            return Err(err);
        }
        self.log(history, &format!("traffic switched to port {}", port));

        // ATOMIC RECORD_SUCCESS. The switch is irrevocable from here on.
        let cutover = self.repo.record_successful_deployment(
            &history.id,
            port,
            &release_path,
            artifact.git_commit_sha.as_deref(),
        )?;

        // POST_DEPLOY hooks are best-effort.
        match hooks::run_hooks(transport, &request.config.hooks.post_deploy, HookStage::PostDeploy, &hook_ctx)
        {
            Ok(lines) => {
                for line in lines {
                    self.log(history, &line);
                }
            }
            Err(err) => {
                warn!(error = %err, "post-deploy hook failed; deployment stays successful");
                self.log(history, &format!("post_deploy hook failed (non-fatal): {}", err));
            }
        }

        // RETIRE_OLD_RUN. The grace period lets in-flight requests drain.
        if cutover.old_port > 0 {
            std::thread::sleep(self.tuning.retire_grace);
            let old_unit = format!("{}@{}", app.name, cutover.old_port);
            if let Err(err) = run_checked(transport, &format!("sudo systemctl disable {}", old_unit))
                .and_then(|_| run_checked(transport, &format!("sudo systemctl stop {}", old_unit)))
            {
                warn!(error = %err, unit = %old_unit, "retiring the old run failed");
                self.log(history, &format!("retire of {} failed: {}", old_unit, err));
            } else {
                self.log(history, &format!("retired previous run on port {}", cutover.old_port));
            }
        }

        // CLEANUP_STALE
        if let Err(err) = self.cleanup_stale(transport, &app.name, instance) {
            warn!(error = %err, "stale run cleanup failed");
            self.log(history, &format!("stale cleanup failed: {}", err));
        }

        info!(app = %app.name, port, old_port = cutover.old_port, "deployment complete");
        Ok(DeploySummary {
            history_id: history.id.clone(),
            version: artifact.version.clone(),
            port,
            old_port: cutover.old_port,
        })
    }

    fn cut_over(
        &mut self,
        transport: &mut dyn Transport,
        proxy_override: Option<&mut dyn Proxy>,
        hostnames: &[String],
        port: u16,
        unit: &str,
    ) -> Result<()> {
        if hostnames.is_empty() {
            info!("no domains bound; skipping proxy route update");
        } else {
            match proxy_override {
                Some(proxy) => proxy.upsert(hostnames, port)?,
                None => {
                    let tunnel = transport.tunnel(2019)?;
                    let mut caddy = CaddyAdmin::new(format!("http://{}", tunnel.addr()))?;
                    caddy.upsert(hostnames, port)?;
                }
            }
        }
        run_checked(transport, &format!("sudo systemctl enable {}", unit))?;
        Ok(())
    }

    /// Probe `systemctl is-active` until it succeeds or attempts run out.
    fn probe_health(&self, transport: &mut dyn Transport, unit: &str) -> Result<()> {
        let attempts = self.tuning.probe_attempts.max(1);
        for attempt in 0..attempts {
            self.cancel.check()?;
            let result = transport.exec(&format!("sudo systemctl is-active --quiet {}", unit))?;
            if result.success() {
                return Ok(());
            }
            if attempt + 1 < attempts {
                std::thread::sleep(self.tuning.probe_interval);
            }
        }
        Err(Error::HealthCheckFailed {
            unit: unit.to_string(),
            detail: format!("not active after {} probes", attempts),
        })
    }

    /// Compensation: stop and disable the new unit and drop its symlink.
    /// The previously serving port is untouched.
    fn stop_green(&self, transport: &mut dyn Transport, app_name: &str, port: u16) {
        let unit = format!("{}@{}", app_name, port);
        let _ = transport.exec(&format!("sudo systemctl stop {}", unit));
        let _ = transport.exec(&format!("sudo systemctl disable {}", unit));
        let _ = transport.exec(&format!(
            "sudo rm -f /var/www/{}/instances/{}",
            app_name, port
        ));
    }

    fn select_free_port(&self, transport: &mut dyn Transport) -> Result<u16> {
        let (low, high) = self.tuning.port_range;
        let mut rng = rand::thread_rng();
        for _ in 0..self.tuning.port_attempts {
            self.cancel.check()?;
            let candidate = rng.gen_range(low..high);
            let probe = transport.exec(&format!("ss -lntu | grep :{}", candidate))?;
            if !probe.success() {
                return Ok(candidate);
            }
        }
        Err(Error::Transport(format!(
            "no free port found in [{}, {}) after {} attempts",
            low, high, self.tuning.port_attempts
        )))
    }

    /// Stop anything whose port is neither active nor previous; release
    /// directories stay on disk.
    fn cleanup_stale(
        &mut self,
        transport: &mut dyn Transport,
        app_name: &str,
        instance: &InstanceRow,
    ) -> Result<()> {
        for run in self.repo.list_stale_runs(&instance.id)? {
            let unit = format!("{}@{}", app_name, run.port);
            let _ = transport.exec(&format!("sudo systemctl stop {}", unit));
            let _ = transport.exec(&format!("sudo systemctl disable {}", unit));
            let _ = transport.exec(&format!(
                "sudo rm -f /var/www/{}/instances/{}",
                app_name, run.port
            ));
            self.repo.update_run_status(&run.id, "stopped")?;
            info!(unit = %unit, "cleaned up stale run");
        }
        Ok(())
    }

    fn log(&self, history: &HistoryRow, line: &str) {
        if let Err(err) = self.repo.append_history_log(&history.id, line) {
            warn!(error = %err, "failed to append deployment log");
        }
    }
}

/// Manual rollback: bring the standby port back up, switch traffic to it,
/// and swap the port columns. The formerly active run becomes the standby.
pub fn rollback(
    repo: &mut Repository,
    app_name: &str,
    host_name: &str,
    tuning: &DeployTuning,
    cancel: &CancelToken,
    proxy_override: Option<&mut dyn Proxy>,
) -> Result<u16> {
    let app = repo.get_app_by_name(app_name)?;
    let host = repo.get_host_by_name(host_name)?;
    let instance = repo.get_instance(&app, &host)?;
    let lock_table = locks::instance_locks();
    let _lock = lock_table.acquire(&instance.id, tuning.lock_timeout)?;
    let instance = repo.get_instance_by_id(&instance.id)?;
    if instance.previous_active_port == 0 {
        return Err(Error::ArtifactNotFound(format!(
            "{} on {} has no standby run to roll back to",
            app_name, host_name
        )));
    }
    let standby = repo
        .get_run_by_port(&instance.id, instance.previous_active_port)?
        .ok_or_else(|| {
            Error::ArtifactNotFound(format!(
                "no run recorded for standby port {}",
                instance.previous_active_port
            ))
        })?;

    let mut connected = transport::connect(&host, cancel)?;
    let transport = connected.transport.as_mut();
    let unit = format!("{}@{}", app.name, standby.port);
    run_checked(transport, &format!("sudo systemctl start {}", unit))?;
    for attempt in 0..tuning.probe_attempts.max(1) {
        let probe = transport.exec(&format!("sudo systemctl is-active --quiet {}", unit))?;
        if probe.success() {
            break;
        }
        if attempt + 1 == tuning.probe_attempts.max(1) {
            let _ = transport.exec(&format!("sudo systemctl stop {}", unit));
            return Err(Error::HealthCheckFailed {
                unit,
                detail: "standby run never became active".to_string(),
            });
        }
        std::thread::sleep(tuning.probe_interval);
    }

    let domains = repo.list_domains(&instance.id)?;
    let hostnames: Vec<String> = domains.iter().map(|d| d.hostname.clone()).collect();
    if !hostnames.is_empty() {
        match proxy_override {
            Some(proxy) => proxy.upsert(&hostnames, standby.port)?,
            None => {
                let tunnel = transport.tunnel(2019)?;
                let mut caddy = CaddyAdmin::new(format!("http://{}", tunnel.addr()))?;
                caddy.upsert(&hostnames, standby.port)?;
            }
        }
    }
    run_checked(transport, &format!("sudo systemctl enable {}", unit))?;

    let result = repo.record_rollback(&instance.id)?;
    if result.old_port > 0 {
        std::thread::sleep(tuning.retire_grace);
        let old_unit = format!("{}@{}", app.name, result.old_port);
        let _ = transport.exec(&format!("sudo systemctl disable {}", old_unit));
        let _ = transport.exec(&format!("sudo systemctl stop {}", old_unit));
    }
    info!(app = %app.name, port = result.new_port, "rolled back");
    Ok(result.new_port)
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
