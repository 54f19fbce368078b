use anyhow::Result;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shipyard::caddy::Proxy;
use shipyard::cancel::CancelToken;
use shipyard::config::ProjectConfig;
use shipyard::crypto::ProcessKeyCipher;
use shipyard::db::Repository;
use shipyard::deploy::{DeployRequest, DeployTuning, Deployer};
use shipyard::error::Error;
use shipyard::locks;
use shipyard::runner::{Runner, set_runner_for_tests};

/// Runner fake that behaves like a real host for port probing: a port shows
/// up as busy in `ss` output once its unit has been started.
#[derive(Default)]
struct PortAwareRunner {
    started: Mutex<HashSet<u16>>,
}

impl PortAwareRunner {
    fn respond(&self, cmdline: &str) -> Output {
        if let Some(rest) = cmdline.split("systemctl start ").nth(1) {
            if let Some(port) = rest.trim().rsplit('@').next().and_then(|p| p.parse().ok()) {
                self.started.lock().expect("ports lock").insert(port);
            }
        }
        if let Some(rest) = cmdline.split("ss -lntu | grep :").nth(1) {
            let port: u16 = rest.trim().parse().unwrap_or(0);
            let busy = self.started.lock().expect("ports lock").contains(&port);
            return Output {
                status: exit_status(if busy { 0 } else { 1 }),
                stdout: Vec::new(),
                stderr: Vec::new(),
            };
        }
        Output {
            status: exit_status(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

impl Runner for PortAwareRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
        Ok(self.respond(&format!("{} {}", program, args.join(" "))))
    }

    fn output_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &mut dyn Read,
    ) -> Result<Output> {
        let mut sink = Vec::new();
        input.read_to_end(&mut sink)?;
        Ok(self.respond(&format!("{} {}", program, args.join(" "))))
    }
}

#[cfg(unix)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[derive(Clone, Default)]
struct RecordingProxy {
    upserts: Arc<Mutex<Vec<(Vec<String>, u16)>>>,
}

impl Proxy for RecordingProxy {
    fn upsert(&mut self, domains: &[String], port: u16) -> shipyard::error::Result<()> {
        self.upserts
            .lock()
            .expect("upserts lock")
            .push((domains.to_vec(), port));
        Ok(())
    }

    fn delete(&mut self, _hostname: &str) -> shipyard::error::Result<()> {
        Ok(())
    }

    fn check_availability(&mut self) -> shipyard::error::Result<()> {
        Ok(())
    }
}

fn cipher() -> Arc<ProcessKeyCipher> {
    Arc::new(ProcessKeyCipher::new(&[8u8; 32]))
}

fn seed_artifact(
    repo: &Repository,
    cache: &shipyard::cache::ArtifactCache,
    app: &shipyard::db::AppRow,
) -> Result<shipyard::db::ArtifactRow> {
    let release = tempfile::TempDir::new()?;
    std::fs::write(release.path().join("run"), "exec sleep inf")?;
    let (tarball, md5) = shipyard::builder::pack_release(release.path(), cache.dir())?;
    let outcome = shipyard::builder::BuildOutcome {
        version: "1.0.0".to_string(),
        git_sha: "feedc0ffee1".to_string(),
        md5,
        tarball,
    };
    Ok(cache.put(repo, app, outcome)?)
}

fn tuning(lock_timeout: Duration) -> DeployTuning {
    DeployTuning {
        probe_attempts: 3,
        probe_interval: Duration::from_millis(20),
        retire_grace: Duration::from_millis(1),
        lock_timeout,
        ..DeployTuning::default()
    }
}

fn deploy_use_build(
    db_path: &Path,
    cache_dir: &Path,
    project: &Path,
    app: &str,
    identifier: &str,
    lock_timeout: Duration,
    proxy: &mut RecordingProxy,
) -> shipyard::error::Result<shipyard::deploy::DeploySummary> {
    let mut repo = Repository::open(db_path, cipher())?;
    let cache = shipyard::cache::ArtifactCache::new(cache_dir)?;
    let config: ProjectConfig =
        toml::from_str(&format!("[app]\nname = \"{}\"\n", app)).expect("config parses");
    let request = DeployRequest {
        app_name: app,
        host_name: "localhost",
        project_dir: project,
        config: &config,
        use_build: Some(identifier),
        launch: false,
    };
    let mut deployer = Deployer {
        repo: &mut repo,
        cache: &cache,
        tuning: tuning(lock_timeout),
        cancel: CancelToken::new(),
    };
    deployer.deploy(&request, Some(proxy))
}

#[test]
fn concurrent_deploys_to_one_instance_serialize_and_keep_invariants() -> Result<()> {
    let runner = Arc::new(PortAwareRunner::default());
    let _guard = set_runner_for_tests(runner);

    let dir = tempfile::TempDir::new()?;
    let db_path = dir.path().join("shipyard.db");
    let cache_dir = dir.path().join("cache");
    let project = tempfile::TempDir::new()?;

    let mut repo = Repository::open(&db_path, cipher())?;
    let instance = repo.ensure_localhost_instance("cw")?;
    repo.add_domain(&instance.id, "cw.example.com", true)?;
    let app = repo.get_app_by_name("cw")?;
    let cache = shipyard::cache::ArtifactCache::new(&cache_dir)?;
    let artifact = seed_artifact(&repo, &cache, &app)?;

    let proxy = RecordingProxy::default();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let db_path = db_path.clone();
        let cache_dir = cache_dir.clone();
        let project_path = project.path().to_path_buf();
        let identifier = artifact.md5_hash.clone();
        let mut proxy = proxy.clone();
        handles.push(std::thread::spawn(move || {
            deploy_use_build(
                &db_path,
                &cache_dir,
                &project_path,
                "cw",
                &identifier,
                Duration::from_secs(30),
                &mut proxy,
            )
        }));
        std::thread::sleep(Duration::from_millis(10));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let successes: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(successes.len(), 2, "both serialized deployments succeed: {:?}", results);

    let repo = Repository::open(&db_path, cipher())?;
    let instance = repo.get_instance_by_id(&instance.id)?;
    let runs = repo.list_runs(&instance.id)?;
    let active: Vec<_> = runs.iter().filter(|run| run.status == "active").collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].port, instance.active_port);
    assert_ne!(instance.active_port, instance.previous_active_port);
    let standby = repo
        .get_run_by_port(&instance.id, instance.previous_active_port)?
        .expect("standby run behind previous port");
    assert_eq!(standby.status, "standby");

    // The last route written points at the port that ended up active.
    let upserts = proxy.upserts.lock().unwrap();
    assert_eq!(upserts.len(), 2);
    assert_eq!(upserts.last().map(|(_, port)| *port), Some(instance.active_port));
    Ok(())
}

#[test]
fn deploy_fails_busy_when_the_lock_is_not_released_in_time() -> Result<()> {
    let runner = Arc::new(PortAwareRunner::default());
    let _guard = set_runner_for_tests(runner);

    let dir = tempfile::TempDir::new()?;
    let db_path = dir.path().join("shipyard.db");
    let cache_dir = dir.path().join("cache");
    let project = tempfile::TempDir::new()?;

    let mut repo = Repository::open(&db_path, cipher())?;
    let instance = repo.ensure_localhost_instance("bz")?;
    let app = repo.get_app_by_name("bz")?;
    let cache = shipyard::cache::ArtifactCache::new(&cache_dir)?;
    let artifact = seed_artifact(&repo, &cache, &app)?;

    // Another deployment holds the instance lock the whole time.
    let held = locks::instance_locks().acquire(&instance.id, Duration::from_secs(1))?;

    let mut proxy = RecordingProxy::default();
    let result = deploy_use_build(
        &db_path,
        &cache_dir,
        project.path(),
        "bz",
        &artifact.md5_hash,
        Duration::from_millis(100),
        &mut proxy,
    );
    assert!(matches!(result, Err(Error::InstanceBusy(_))));
    assert!(proxy.upserts.lock().unwrap().is_empty());
    drop(held);
    Ok(())
}
