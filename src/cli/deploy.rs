use anyhow::{Context, Result, bail};
use clap::Args;
use std::io::IsTerminal;
use std::path::PathBuf;

use crate::cache::ArtifactCache;
use crate::cancel::CancelToken;
use crate::config::{ProjectConfig, load_project_config, resolve_config_path};
use crate::db::Repository;
use crate::deploy::{DeployRequest, DeployTuning, Deployer, rollback};
use crate::error::Error;
use crate::hostprep;
use crate::transport;

#[derive(Args, Debug)]
#[command(about = "Deploy a new release for an app")]
/// Deploy argument set.
pub struct DeployArgs {
    #[arg(help = "App name (defaults to [app].name in shipyard.toml)")]
    pub app: Option<String>,
    #[arg(short = 's', long, help = "Target host name (defaults to [app].host)")]
    pub host: Option<String>,
    #[arg(short = 'u', long, help = "Reuse a cached artifact (md5 prefix or git sha)")]
    pub use_build: Option<String>,
    #[arg(short = 'p', long, default_value = ".", help = "Project directory")]
    pub project_dir: PathBuf,
    #[arg(short = 'c', long, help = "Path to shipyard.toml")]
    pub config: Option<PathBuf>,
    #[arg(short = 'y', long, help = "Initialize the host without prompting")]
    pub init: bool,
}

#[derive(Args, Debug)]
#[command(about = "Switch traffic back to the standby run")]
/// Rollback argument set.
pub struct RollbackArgs {
    #[arg(help = "App name")]
    pub app: String,
    #[arg(short = 's', long, help = "Target host name", default_value = "localhost")]
    pub host: String,
}

fn load_config(args: &DeployArgs) -> Result<ProjectConfig> {
    let path = resolve_config_path(args.config.as_deref(), &args.project_dir)?;
    Ok(load_project_config(&path)?)
}

/// Deploy (or launch) from the current project checkout.
pub fn handle_deploy(
    repo: &mut Repository,
    args: DeployArgs,
    launch: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let config = load_config(&args)?;
    let app_name = args.app.clone().unwrap_or_else(|| config.app.name.clone());
    let host_name = args
        .host
        .clone()
        .or_else(|| config.app.host.clone())
        .unwrap_or_else(|| "localhost".to_string());

    if launch {
        prepare_launch(repo, &config, &app_name, &host_name, cancel)?;
    }

    let cache = ArtifactCache::open_default()?;
    let request = DeployRequest {
        app_name: &app_name,
        host_name: &host_name,
        project_dir: &args.project_dir,
        config: &config,
        use_build: args.use_build.as_deref(),
        launch,
    };

    let mut deployer = Deployer {
        repo: &mut *repo,
        cache: &cache,
        tuning: DeployTuning::default(),
        cancel: cancel.clone(),
    };
    let result = deployer.deploy(&request, None);

    let summary = match result {
        Err(Error::HostNotInitialized(name)) => {
            if !confirm_host_init(&name, args.init)? {
                bail!("host {} is not initialized; run `shipyard host init {}`", name, name);
            }
            let host = repo.get_host_by_name(&name)?;
            hostprep::initialize_host(repo, &host, cancel)?;
            let mut deployer = Deployer {
                repo: &mut *repo,
                cache: &cache,
                tuning: DeployTuning::default(),
                cancel: cancel.clone(),
            };
            deployer.deploy(&request, None)?
        }
        other => other?,
    };

    println!(
        "deployed {} {} on port {} (previous {})",
        app_name, summary.version, summary.port, summary.old_port
    );
    Ok(())
}

/// First-time wiring for an instance: app unit on the host, domains from
/// the project config.
fn prepare_launch(
    repo: &mut Repository,
    config: &ProjectConfig,
    app_name: &str,
    host_name: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let app = repo.ensure_app(app_name)?;
    let instance = if crate::db::LOCALHOST_NAMES.contains(&host_name) {
        repo.ensure_localhost_instance(app_name)?
    } else {
        let host = repo.get_host_by_name(host_name)?;
        repo.link_instance(&app, &host)?
    };
    for (index, hostname) in config.app.domains.iter().enumerate() {
        if repo.get_domain_by_hostname(hostname).is_err() {
            repo.add_domain(&instance.id, hostname, index == 0)?;
        }
    }
    let host = repo.get_host(&instance.host_id)?;
    if host.is_local() || host.initialized_at.is_some() {
        let connected = transport::connect(&host, cancel)?;
        let mut transport = connected.transport;
        hostprep::ensure_app_unit(transport.as_mut(), app_name)
            .with_context(|| format!("installing the {}@.service unit", app_name))?;
    }
    Ok(())
}

fn confirm_host_init(host_name: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    eprint!(
        "host {} has not been initialized; run the one-time setup now? [y/N] ",
        host_name
    );
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// Roll traffic back to the standby run.
pub fn handle_rollback(repo: &mut Repository, args: RollbackArgs, cancel: &CancelToken) -> Result<()> {
    let port = rollback(
        repo,
        &args.app,
        &args.host,
        &DeployTuning::default(),
        cancel,
        None,
    )?;
    println!("rolled {} back to port {}", args.app, port);
    Ok(())
}
