use anyhow::Result;
use std::io::Read;
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
    fail_upsert: bool,
}

impl Proxy for RecordingProxy {
    fn upsert(&mut self, domains: &[String], port: u16) -> shipyard::error::Result<()> {
        if self.fail_upsert {
            return Err(Error::CaddyUpdate {
                status: 500,
                body: "route rejected".to_string(),
            });
        }
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

fn fast_tuning() -> DeployTuning {
    DeployTuning {
        probe_attempts: 3,
        probe_interval: Duration::from_millis(1),
        retire_grace: Duration::from_millis(1),
        lock_timeout: Duration::from_secs(5),
        ..DeployTuning::default()
    }
}

fn setup(app: &str) -> Result<(Repository, tempfile::TempDir, tempfile::TempDir)> {
    let mut repo =
        Repository::open_in_memory(Arc::new(ProcessKeyCipher::new(&[9u8; 32])))?;
    let instance = repo.ensure_localhost_instance(app)?;
    repo.add_domain(&instance.id, &format!("{}.example.com", app), true)?;
    let project = tempfile::TempDir::new()?;
    std::fs::write(
        project.path().join("mix.exs"),
        format!(
            "def project do\n  [app: :{}, version: \"2.0.0\", deps: [{{:phoenix, \"~> 1.7\"}}]]\nend\n",
            app
        ),
    )?;
    let cache_dir = tempfile::TempDir::new()?;
    Ok((repo, project, cache_dir))
}

fn run_deploy(
    repo: &mut Repository,
    cache_dir: &std::path::Path,
    project: &std::path::Path,
    config: &ProjectConfig,
    app: &str,
    proxy: &mut RecordingProxy,
) -> shipyard::error::Result<shipyard::deploy::DeploySummary> {
    let cache = shipyard::cache::ArtifactCache::new(cache_dir)?;
    let request = DeployRequest {
        app_name: app,
        host_name: "localhost",
        project_dir: project,
        config,
        use_build: None,
        launch: false,
    };
    let mut deployer = Deployer {
        repo,
        cache: &cache,
        tuning: fast_tuning(),
        cancel: CancelToken::new(),
    };
    deployer.deploy(&request, Some(proxy))
}

#[test]
fn health_check_failure_stops_green_and_leaves_instance_untouched() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    runner.add_rule(&["systemctl is-active --quiet hc@"], 1, "", "");
    runner.add_rule(
        &["systemctl status hc@"],
        0,
        "hc@10001.service: Main process exited, code=exited, status=1",
        "",
    );
    let _guard = set_runner_for_tests(runner.clone());

    let (mut repo, project, cache_dir) = setup("hc")?;
    let config: ProjectConfig = toml::from_str("[app]\nname = \"hc\"\n").unwrap();
    let mut proxy = RecordingProxy::default();

    let result = run_deploy(&mut repo, cache_dir.path(), project.path(), &config, "hc", &mut proxy);
    assert!(matches!(result, Err(Error::HealthCheckFailed { .. })));

    // Compensation: green stopped, disabled, symlink removed; no route change.
    let commands = runner.commands();
    assert!(commands.iter().any(|cmd| cmd.contains("systemctl stop hc@")));
    assert!(commands.iter().any(|cmd| cmd.contains("systemctl disable hc@")));
    assert!(commands.iter().any(|cmd| cmd.contains("rm -f /var/www/hc/instances/")));
    assert!(proxy.upserts.lock().unwrap().is_empty());

    // The instance never advanced and the history captured the unit status.
    let app = repo.get_app_by_name("hc")?;
    let host = repo.get_host_by_name("localhost")?;
    let instance = repo.get_instance(&app, &host)?;
    assert_eq!(instance.active_port, 0);
    let history = &repo.list_history(&instance.id, 1)?[0];
    assert_eq!(history.status, "failed");
    assert!(history.log_output.contains("Main process exited"));
    Ok(())
}

#[test]
fn caddy_rejection_stops_green_and_keeps_the_old_run_serving() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    let _guard = set_runner_for_tests(runner.clone());

    let (mut repo, project, cache_dir) = setup("cd")?;
    let config: ProjectConfig = toml::from_str("[app]\nname = \"cd\"\n").unwrap();

    // First deployment succeeds and becomes the serving run.
    let mut ok_proxy = RecordingProxy::default();
    let first = run_deploy(&mut repo, cache_dir.path(), project.path(), &config, "cd", &mut ok_proxy)?;

    // Second deployment reaches the cutover and Caddy rejects it.
    let mut failing = RecordingProxy {
        fail_upsert: true,
        ..RecordingProxy::default()
    };
    runner.add_rule(&[&format!("ss -lntu | grep :{}", first.port)], 0, "LISTEN", "");
    let result = run_deploy(&mut repo, cache_dir.path(), project.path(), &config, "cd", &mut failing);
    assert!(matches!(result, Err(Error::CaddyUpdate { .. })));

    let app = repo.get_app_by_name("cd")?;
    let host = repo.get_host_by_name("localhost")?;
    let instance = repo.get_instance(&app, &host)?;
    assert_eq!(instance.active_port, first.port);

    // The old unit was never stopped by the failed attempt.
    let commands = runner.commands();
    assert!(!commands.iter().any(|cmd| {
        cmd.contains(&format!("systemctl stop cd@{}", first.port))
    }));
    let history = &repo.list_history(&instance.id, 1)?[0];
    assert_eq!(history.status, "failed");
    Ok(())
}

#[test]
fn migrate_hook_failure_aborts_before_the_new_run_starts() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    runner.add_rule(&["bin/migrate"], 1, "", "migration exploded");
    let _guard = set_runner_for_tests(runner.clone());

    let (mut repo, project, cache_dir) = setup("mh")?;
    let config: ProjectConfig = toml::from_str(
        "[app]\nname = \"mh\"\n\n[[hooks.migrate]]\nkind = \"shell\"\ncommand = \"bin/migrate\"\n",
    )
    .unwrap();
    let mut proxy = RecordingProxy::default();

    let result = run_deploy(&mut repo, cache_dir.path(), project.path(), &config, "mh", &mut proxy);
    assert!(matches!(result, Err(Error::HookFailed { .. })));

    let commands = runner.commands();
    assert!(!commands.iter().any(|cmd| cmd.contains("systemctl start mh@")));
    assert!(proxy.upserts.lock().unwrap().is_empty());

    let app = repo.get_app_by_name("mh")?;
    let host = repo.get_host_by_name("localhost")?;
    let instance = repo.get_instance(&app, &host)?;
    let history = &repo.list_history(&instance.id, 1)?[0];
    assert_eq!(history.status, "failed");
    Ok(())
}

#[test]
fn post_deploy_hook_failure_is_logged_but_not_fatal() -> Result<()> {
    let runner = Arc::new(TestRunner::default());
    runner.add_rule(&["ss -lntu"], 1, "", "");
    runner.add_rule(&["notify-deploy"], 1, "", "webhook down");
    let _guard = set_runner_for_tests(runner);

    let (mut repo, project, cache_dir) = setup("pd")?;
    let config: ProjectConfig = toml::from_str(
        "[app]\nname = \"pd\"\n\n[[hooks.post_deploy]]\nkind = \"shell\"\ncommand = \"notify-deploy\"\n",
    )
    .unwrap();
    let mut proxy = RecordingProxy::default();

    let summary = run_deploy(&mut repo, cache_dir.path(), project.path(), &config, "pd", &mut proxy)?;

    let history = repo.get_history(&summary.history_id)?;
    assert_eq!(history.status, "success");
    assert!(history.log_output.contains("post_deploy hook failed"));
    let app = repo.get_app_by_name("pd")?;
    let host = repo.get_host_by_name("localhost")?;
    let instance = repo.get_instance(&app, &host)?;
    assert_eq!(instance.active_port, summary.port);
    Ok(())
}
