//! Command runner abstraction for shelling out on the local machine.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Runner interface for invoking external commands.
pub trait Runner: Send + Sync {
    /// Execute a command and return its captured output.
    fn output(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Execute a command, feeding `input` to its stdin.
    fn output_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &mut dyn Read,
    ) -> Result<Output>;
}

struct RealRunner;

impl Runner for RealRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
        std::process::Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run {} {:?}", program, args))
    }

    fn output_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &mut dyn Read,
    ) -> Result<Output> {
        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} {:?}", program, args))?;
        {
            let mut stdin = child.stdin.take().context("child stdin unavailable")?;
            std::io::copy(input, &mut stdin).context("failed to write child stdin")?;
            stdin.flush().ok();
        }
        child
            .wait_with_output()
            .with_context(|| format!("failed to wait for {} {:?}", program, args))
    }
}

static RUNNER: OnceLock<RwLock<Arc<dyn Runner>>> = OnceLock::new();
static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn runner_lock() -> &'static RwLock<Arc<dyn Runner>> {
    RUNNER.get_or_init(|| RwLock::new(Arc::new(RealRunner)))
}

/// Run a command and capture its output.
pub fn run_output(program: &str, args: &[&str]) -> Result<Output> {
    let runner = runner_lock().read().expect("runner lock poisoned");
    runner.output(program, args)
}

/// Run a command with bytes on stdin and capture its output.
pub fn run_output_with_input(program: &str, args: &[&str], input: &mut dyn Read) -> Result<Output> {
    let runner = runner_lock().read().expect("runner lock poisoned");
    runner.output_with_input(program, args, input)
}

/// Run a shell command line through `bash -c`.
pub fn run_shell(command: &str) -> Result<Output> {
    run_output("bash", &["-c", command])
}

/// Run a shell command line with bytes on stdin.
pub fn run_shell_with_input(command: &str, input: &mut dyn Read) -> Result<Output> {
    run_output_with_input("bash", &["-c", command], input)
}

/// Run a command and return its exit status.
pub fn run_status(program: &str, args: &[&str]) -> Result<ExitStatus> {
    Ok(run_output(program, args)?.status)
}

/// Check if a command is present on PATH.
pub fn command_exists(command: &str) -> bool {
    let probe = format!("command -v {}", command);
    run_status("bash", &["-c", &probe])
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Guard that restores the previous runner when dropped.
pub struct RunnerGuard {
    previous: Arc<dyn Runner>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        let mut runner = runner_lock().write().expect("runner lock poisoned");
        *runner = self.previous.clone();
    }
}

/// Override the runner for tests; restores on guard drop.
pub fn set_runner_for_tests(runner: Arc<dyn Runner>) -> RunnerGuard {
    let lock = TEST_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().expect("runner test lock poisoned");
    let previous = {
        let mut slot = runner_lock().write().expect("runner lock poisoned");
        let previous = slot.clone();
        *slot = runner;
        previous
    };
    RunnerGuard {
        previous,
        _lock: guard,
    }
}
