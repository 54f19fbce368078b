//! Uniform command/file capability over a deployment target.
//!
//! Two implementations exist: [`local::LocalTransport`] shells through the
//! runner on this machine, and [`ssh::SshTransport`] drives an SSH session.
//! The orchestrator picks one per deployment and never shares it across
//! threads.

pub mod local;
pub mod ssh;

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::db::HostRow;
use crate::error::Result;

/// Merged output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub output: String,
    pub exit_status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// A local endpoint forwarding to a loopback port on the target.
pub struct Tunnel {
    addr: SocketAddr,
    stop: Option<Arc<AtomicBool>>,
}

impl Tunnel {
    pub fn direct(addr: SocketAddr) -> Self {
        Self { addr, stop: None }
    }

    pub fn forwarded(addr: SocketAddr, stop: Arc<AtomicBool>) -> Self {
        Self {
            addr,
            stop: Some(stop),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Capability set over a deployment target.
pub trait Transport {
    /// Run a command and capture combined stdout/stderr plus exit status.
    fn exec(&mut self, command: &str) -> Result<ExecOutput>;

    /// Run a command with bytes piped to its stdin.
    fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput>;

    /// Upload a single file to an absolute remote path.
    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<u64>;

    /// Pipe a gzip stream into `tar -xzf -` under `remote_dir` in one round
    /// trip; returns the bytes transferred.
    fn upload_and_extract(&mut self, archive: &mut dyn Read, remote_dir: &str) -> Result<u64>;

    /// Stream journal output for a unit into `sink` until exhaustion,
    /// cancellation, or the one-hour watchdog.
    fn stream_logs(
        &mut self,
        unit: &str,
        lines_back: u32,
        follow: bool,
        cancel: &CancelToken,
        sink: &mut dyn Write,
    ) -> Result<()>;

    /// Open a local endpoint that reaches `127.0.0.1:{remote_port}` on the
    /// target (used for the Caddy admin API).
    fn tunnel(&mut self, remote_port: u16) -> Result<Tunnel>;

    /// Tear down the connection. Transports are cheap to reopen.
    fn close(&mut self);
}

/// A dialed transport plus the host key captured on a first connect.
pub struct Connected {
    pub transport: Box<dyn Transport>,
    pub captured_host_key: Option<String>,
}

/// Select and dial the transport for a host: local iff the host is the
/// pseudo-host, SSH otherwise.
pub fn connect(host: &HostRow, cancel: &CancelToken) -> Result<Connected> {
    if host.is_local() {
        return Ok(Connected {
            transport: Box::new(local::LocalTransport::new(cancel.clone())),
            captured_host_key: None,
        });
    }
    let (transport, captured_host_key) = ssh::SshTransport::dial(host, cancel.clone())?;
    Ok(Connected {
        transport: Box::new(transport),
        captured_host_key,
    })
}

/// Single-quote a string for embedding in a shell command line.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The remote side of a streamed upload: create the directory, then unpack
/// stdin under it. Shared verbatim by both transports so behavior cannot
/// drift.
pub fn extract_command(remote_dir: &str) -> String {
    format!(
        "sudo mkdir -p {dir} && sudo tar -xzf - -C {dir}",
        dir = sh_quote(remote_dir)
    )
}

/// The remote side of a single-file upload.
pub fn upload_command(remote_path: &str) -> String {
    let parent = match remote_path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        _ => "/",
    };
    format!(
        "sudo mkdir -p {parent} && sudo tee {path} >/dev/null",
        parent = sh_quote(parent),
        path = sh_quote(remote_path)
    )
}

const PROGRESS_STEP: u64 = 4 * 1024 * 1024;

/// Reader wrapper that counts transferred bytes and logs progress.
pub struct ProgressReader<'a> {
    inner: &'a mut dyn Read,
    label: String,
    total: u64,
    transferred: u64,
    next_mark: u64,
}

impl<'a> ProgressReader<'a> {
    pub fn new(inner: &'a mut dyn Read, label: &str, total: u64) -> Self {
        Self {
            inner,
            label: label.to_string(),
            total,
            transferred: 0,
            next_mark: PROGRESS_STEP,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl Read for ProgressReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.transferred += n as u64;
        if self.transferred >= self.next_mark {
            debug!(
                label = %self.label,
                transferred = self.transferred,
                total = self.total,
                "transfer progress"
            );
            self.next_mark += PROGRESS_STEP;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn extract_command_targets_directory() {
        let cmd = extract_command("/var/www/chat/releases/1.0.0-99");
        assert!(cmd.contains("mkdir -p '/var/www/chat/releases/1.0.0-99'"));
        assert!(cmd.contains("tar -xzf - -C '/var/www/chat/releases/1.0.0-99'"));
    }

    #[test]
    fn upload_command_creates_parent() {
        let cmd = upload_command("/etc/chat/env");
        assert!(cmd.contains("mkdir -p '/etc/chat'"));
        assert!(cmd.contains("tee '/etc/chat/env'"));
    }

    #[test]
    fn progress_reader_counts_bytes() {
        let data = vec![0u8; 1024];
        let mut src: &[u8] = &data;
        let mut reader = ProgressReader::new(&mut src, "test", 1024);
        let mut out = Vec::new();
        std::io::copy(&mut reader, &mut out).unwrap();
        assert_eq!(reader.transferred(), 1024);
        assert_eq!(out.len(), 1024);
    }
}
