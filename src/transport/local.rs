//! Local transport: same-machine deployments through the runner.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::runner;
use crate::transport::{
    ExecOutput, ProgressReader, Transport, Tunnel, extract_command, upload_command,
};

const FOLLOW_WATCHDOG: Duration = Duration::from_secs(3600);

/// Executes every command through `bash -c` on this machine.
pub struct LocalTransport {
    cancel: CancelToken,
}

impl LocalTransport {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    fn run(&self, command: &str, input: Option<&mut dyn Read>) -> Result<ExecOutput> {
        self.cancel.check()?;
        let output = match input {
            Some(reader) => runner::run_shell_with_input(command, reader),
            None => runner::run_shell(command),
        }
        .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(merge_output(&output))
    }
}

fn merge_output(output: &std::process::Output) -> ExecOutput {
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    ExecOutput {
        output: text,
        exit_status: output.status.code().unwrap_or(-1),
    }
}

impl Transport for LocalTransport {
    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        self.run(command, None)
    }

    fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput> {
        let mut reader: &[u8] = input;
        self.run(command, Some(&mut reader))
    }

    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<u64> {
        let mut file = std::fs::File::open(local)?;
        let total = file.metadata()?.len();
        let mut reader = ProgressReader::new(&mut file, remote_path, total);
        let result = self.run_reader(&upload_command(remote_path), &mut reader)?;
        if !result.success() {
            return Err(Error::Transport(format!(
                "upload to {} failed: {}",
                remote_path, result.output
            )));
        }
        Ok(reader.transferred())
    }

    fn upload_and_extract(&mut self, archive: &mut dyn Read, remote_dir: &str) -> Result<u64> {
        let mut reader = ProgressReader::new(archive, remote_dir, 0);
        let result = self.run_reader(&extract_command(remote_dir), &mut reader)?;
        if !result.success() {
            return Err(Error::Transport(format!(
                "extract into {} failed: {}",
                remote_dir, result.output
            )));
        }
        Ok(reader.transferred())
    }

    fn stream_logs(
        &mut self,
        unit: &str,
        lines_back: u32,
        follow: bool,
        cancel: &CancelToken,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let command = journalctl_command(unit, lines_back, follow);
        if !follow {
            let result = self.run(&command, None)?;
            sink.write_all(result.output.as_bytes())?;
            return Ok(());
        }
        let mut child = std::process::Command::new("bash")
            .args(["-c", &command])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::Transport(err.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("journalctl stdout unavailable".to_string()))?;
        let started = Instant::now();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            if cancel.is_cancelled() || started.elapsed() > FOLLOW_WATCHDOG {
                break;
            }
            match lines.next() {
                Some(Ok(line)) => {
                    sink.write_all(line.as_bytes())?;
                    sink.write_all(b"\n")?;
                }
                Some(Err(err)) => return Err(Error::Transport(err.to_string())),
                None => break,
            }
        }
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }

    fn tunnel(&mut self, remote_port: u16) -> Result<Tunnel> {
        // The admin API is already on this machine's loopback.
        Ok(Tunnel::direct(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_port,
        )))
    }

    fn close(&mut self) {}
}

impl LocalTransport {
    fn run_reader(&self, command: &str, reader: &mut dyn Read) -> Result<ExecOutput> {
        self.run(command, Some(reader))
    }
}

/// Journal command shared with the SSH transport.
pub fn journalctl_command(unit: &str, lines_back: u32, follow: bool) -> String {
    let mut command = format!(
        "sudo journalctl -u {} -n {} --no-pager",
        super::sh_quote(unit),
        lines_back
    );
    if follow {
        command.push_str(" -f");
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journalctl_command_shape() {
        assert_eq!(
            journalctl_command("chat@10001", 100, false),
            "sudo journalctl -u 'chat@10001' -n 100 --no-pager"
        );
        assert!(journalctl_command("chat@10001", 50, true).ends_with(" -f"));
    }

    #[test]
    fn exec_merges_streams_and_reports_status() -> Result<()> {
        let mut transport = LocalTransport::new(CancelToken::new());
        let ok = transport.exec("echo hello")?;
        assert!(ok.success());
        assert!(ok.output.contains("hello"));
        let fail = transport.exec("exit 3")?;
        assert_eq!(fail.exit_status, 3);
        Ok(())
    }

    #[test]
    fn exec_refuses_after_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut transport = LocalTransport::new(cancel);
        assert!(matches!(transport.exec("true"), Err(Error::Cancelled)));
    }
}
