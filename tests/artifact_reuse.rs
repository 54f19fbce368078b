use anyhow::Result;
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
use shipyard::runner::{Runner, set_runner_for_tests};

#[derive(Default)]
struct TestRunner {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct Rule {
    contains: Vec<String>,
    status: i32,
    stdout: String,
    stderr: String,
}

impl Rule {
    fn matches(&self, cmd: &str) -> bool {
        self.contains.iter().all(|needle| cmd.contains(needle))
    }
}

impl TestRunner {
    fn add_rule(&self, contains: &[&str], status: i32, stdout: &str, stderr: &str) {
        self.rules.lock().expect("rules lock").push(Rule {
            contains: contains.iter().map(|s| s.to_string()).collect(),
            status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    fn respond(&self, cmdline: String) -> Output {
        self.commands.lock().expect("commands lock").push(cmdline.clone());
        if let Some(rule) = self
            .rules
            .lock()
            .expect("rules lock")
            .iter()
            .find(|rule| rule.matches(&cmdline))
            .cloned()
        {
            return Output {
                status: exit_status(rule.status),
                stdout: rule.stdout.into_bytes(),
                stderr: rule.stderr.into_bytes(),
            };
        }
        Output {
            status: exit_status(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

impl Runner for TestRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
        let cmdline = format!("{} {}", program, args.join(" "));
        Ok(self.respond(cmdline))
    }

    fn output_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &mut dyn Read,
    ) -> Result<Output> {
        let mut sink = Vec::new();
        input.read_to_end(&mut sink)?;
        let cmdline = format!("{} {} <{} bytes>", program, args.join(" "), sink.len());
        Ok(self.respond(cmdline))
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

/// Create a project that is a clean git checkout and return its short sha.
fn git_project(app: &str) -> Result<(tempfile::TempDir, String)> {
    let dir = tempfile::TempDir::new()?;
    std::fs::write(
        dir.path().join("mix.exs"),
        format!(
            "def project do\n  [app: :{}, version: \"3.1.0\", deps: [{{:phoenix, \"~> 1.7\"}}]]\nend\n",
            app
        ),
    )?;
    let repo = git2::Repository::init(dir.path())?;
    let mut index = repo.index()?;
    index.add_path(Path::new("mix.exs"))?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let short = {
        let tree = repo.find_tree(tree_id)?;
        let sig = git2::Signature::now("test", "test@example.com")?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])?;
        let commit = repo.find_object(commit_id, None)?;
        commit.short_id()?.as_str().unwrap_or_default().to_string()
    };
    Ok((dir, short))
}

fn fast_tuning() -> DeployTuning {
    DeployTuning {
        probe_attempts: 2,
        probe_interval: Duration::from_millis(1),
        retire_grace: Duration::from_millis(1),
        lock_timeout: Duration::from_secs(5),
        ..DeployTuning::default()
    }
}

fn run_deploy(
    repo: &mut Repository,
    cache: &shipyard::cache::ArtifactCache,
    project: &Path,
    app: &str,
    use_build: Option<&str>,
    proxy: &mut RecordingProxy,
) -> shipyard::error::Result<shipyard::deploy::DeploySummary> {
    let config: ProjectConfig =
        toml::from_str(&format!("[app]\nname = \"{}\"\n", app)).expect("config parses");
    let request = DeployRequest {
        app_name: app,
        host_name: "localhost",
        project_dir: project,
        config: &config,
        use_build,
        launch: false,
    };
    let mut deployer = Deployer {
        repo,
        cache,
        tuning: fast_tuning(),
        cancel: CancelToken::new(),
    };
    deployer.deploy(&request, Some(proxy))
}

fn seed_artifact(
    repo: &Repository,
    cache: &shipyard::cache::ArtifactCache,
    app: &shipyard::db::AppRow,
    git_sha: &str,
) -> Result<shipyard::db::ArtifactRow> {
    let release = tempfile::TempDir::new()?;
    std::fs::create_dir_all(release.path().join("bin"))?;
    std::fs::write(release.path().join("bin").join(&app.name), "#!/bin/sh\nexec sleep inf\n")?;
    let (tarball, md5) = shipyard::builder::pack_release(release.path(), cache.dir())?;
    let outcome = shipyard::builder::BuildOutcome {
        version: "3.1.0".to_string(),
        git_sha: git_sha.to_string(),
        md5,
        tarball,
    };
    Ok(cache.put(repo, app, outcome)?)
}

#[test]
fn clean_checkout_reuses_the_cached_artifact_and_skips_the_builder() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    let _guard = set_runner_for_tests(runner.clone());

    let (project, sha) = git_project("ch")?;
    let mut repo = Repository::open_in_memory(Arc::new(ProcessKeyCipher::new(&[4u8; 32])))?;
    repo.ensure_localhost_instance("ch")?;
    let app = repo.get_app_by_name("ch")?;

    let cache_dir = tempfile::TempDir::new()?;
    let cache = shipyard::cache::ArtifactCache::new(cache_dir.path())?;
    let seeded = seed_artifact(&repo, &cache, &app, &sha)?;
    let tarball_len = std::fs::metadata(&seeded.local_path)?.len();

    let mut proxy = RecordingProxy::default();
    run_deploy(&mut repo, &cache, project.path(), "ch", None, &mut proxy)?;

    let commands = runner.commands();
    // The builder never ran; the seeded tarball was streamed to the target.
    assert!(!commands.iter().any(|cmd| cmd.starts_with("docker ")));
    assert!(!commands.iter().any(|cmd| cmd.starts_with("podman ")));
    assert!(commands.iter().any(|cmd| {
        cmd.contains("tar -xzf -") && cmd.contains(&format!("<{} bytes>", tarball_len))
    }));
    assert_eq!(repo.list_artifacts(&app.id)?.len(), 1);
    Ok(())
}

#[test]
fn corrupt_cache_entry_falls_through_to_a_fresh_build() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    let _guard = set_runner_for_tests(runner.clone());

    let (project, sha) = git_project("cc")?;
    let mut repo = Repository::open_in_memory(Arc::new(ProcessKeyCipher::new(&[5u8; 32])))?;
    repo.ensure_localhost_instance("cc")?;
    let app = repo.get_app_by_name("cc")?;

    let cache_dir = tempfile::TempDir::new()?;
    let cache = shipyard::cache::ArtifactCache::new(cache_dir.path())?;
    let seeded = seed_artifact(&repo, &cache, &app, &sha)?;
    std::fs::write(&seeded.local_path, b"truncated")?;

    let mut proxy = RecordingProxy::default();
    let summary = run_deploy(&mut repo, &cache, project.path(), "cc", None, &mut proxy)?;
    assert!(summary.port > 0);

    let commands = runner.commands();
    // The corrupt entry forced a rebuild; a second artifact row appears and
    // the corrupt row survives untouched.
    assert!(commands.iter().any(|cmd| cmd.contains(" build ")));
    let artifacts = repo.list_artifacts(&app.id)?;
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().any(|artifact| artifact.id == seeded.id));
    Ok(())
}

#[test]
fn explicit_use_build_skips_the_builder_by_md5_prefix() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    let _guard = set_runner_for_tests(runner.clone());

    // Dirty checkout: an untracked file on top of the commit.
    let (project, sha) = git_project("ub")?;
    std::fs::write(project.path().join("scratch.txt"), "wip")?;

    let mut repo = Repository::open_in_memory(Arc::new(ProcessKeyCipher::new(&[6u8; 32])))?;
    repo.ensure_localhost_instance("ub")?;
    let app = repo.get_app_by_name("ub")?;

    let cache_dir = tempfile::TempDir::new()?;
    let cache = shipyard::cache::ArtifactCache::new(cache_dir.path())?;
    let seeded = seed_artifact(&repo, &cache, &app, &sha)?;

    let mut proxy = RecordingProxy::default();
    let prefix = seeded.md5_hash[..12].to_string();
    run_deploy(&mut repo, &cache, project.path(), "ub", Some(&prefix), &mut proxy)?;

    let commands = runner.commands();
    assert!(!commands.iter().any(|cmd| cmd.starts_with("docker ")));
    assert_eq!(repo.list_artifacts(&app.id)?.len(), 1);
    Ok(())
}
