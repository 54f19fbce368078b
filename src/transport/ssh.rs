//! SSH transport over russh, exposed behind a blocking facade.
//!
//! The async runtime is private to the transport; the rest of the crate
//! stays synchronous. Host keys are trust-on-first-use: the key presented on
//! the first connect is captured for pinning, and any later mismatch fails
//! closed.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use russh::ChannelMsg;
use russh::client::{self, AuthResult};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey, decode_secret_key};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::db::HostRow;
use crate::error::{Error, Result};
use crate::transport::{
    ExecOutput, ProgressReader, Transport, Tunnel, extract_command, upload_command,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FOLLOW_WATCHDOG: Duration = Duration::from_secs(3600);
const CHUNK: usize = 64 * 1024;

struct HostKeyPolicy {
    pinned: Option<String>,
    seen: Arc<Mutex<Option<String>>>,
    mismatch: Arc<AtomicBool>,
}

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let presented = server_public_key
            .to_openssh()
            .map_err(|_| russh::Error::UnknownKey)?;
        *self.seen.lock().expect("host key slot poisoned") = Some(presented.clone());
        match &self.pinned {
            None => Ok(true),
            Some(pinned) if *pinned == presented => Ok(true),
            Some(_) => {
                self.mismatch.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// Blocking SSH transport bound to one host for one deployment.
pub struct SshTransport {
    runtime: tokio::runtime::Runtime,
    handle: Option<client::Handle<HostKeyPolicy>>,
    host_name: String,
    cancel: CancelToken,
}

impl SshTransport {
    /// Dial a host within the connect budget. Returns the transport and, on
    /// a first connect, the captured host key for pinning.
    pub fn dial(host: &HostRow, cancel: CancelToken) -> Result<(Self, Option<String>)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|err| Error::Transport(err.to_string()))?;

        let seen = Arc::new(Mutex::new(None));
        let mismatch = Arc::new(AtomicBool::new(false));
        let policy = HostKeyPolicy {
            pinned: host.host_public_key.clone(),
            seen: seen.clone(),
            mismatch: mismatch.clone(),
        };

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(900)),
            ..Default::default()
        });

        let address = host.address.clone();
        let port = host.port;
        let dialed = runtime.block_on(async {
            tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, (address.as_str(), port), policy)).await
        });
        let mut handle = match dialed {
            Err(_) => {
                return Err(Error::Transport(format!(
                    "connection to {} timed out after {:?}",
                    host.name, CONNECT_TIMEOUT
                )));
            }
            Ok(Err(err)) => {
                if mismatch.load(Ordering::SeqCst) {
                    return Err(Error::HostKeyMismatch {
                        host: host.name.clone(),
                    });
                }
                return Err(Error::Transport(format!(
                    "connection to {} failed: {}",
                    host.name, err
                )));
            }
            Ok(Ok(handle)) => handle,
        };

        runtime.block_on(authenticate(&mut handle, host))?;

        let captured = if host.host_public_key.is_none() {
            seen.lock().expect("host key slot poisoned").clone()
        } else {
            None
        };
        Ok((
            Self {
                runtime,
                handle: Some(handle),
                host_name: host.name.clone(),
                cancel,
            },
            captured,
        ))
    }

    fn handle(&self) -> Result<&client::Handle<HostKeyPolicy>> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("connection to {} is closed", self.host_name)))
    }

    fn run(&mut self, command: &str, mut input: Option<&mut dyn Read>) -> Result<ExecOutput> {
        self.cancel.check()?;
        let handle = self.handle()?;
        let cancel = self.cancel.clone();
        let result: Result<(Vec<u8>, i32, u64)> = self.runtime.block_on(async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|err| Error::Transport(err.to_string()))?;
            channel
                .exec(true, command)
                .await
                .map_err(|err| Error::Transport(err.to_string()))?;

            let mut sent: u64 = 0;
            if let Some(reader) = input.as_deref_mut() {
                let mut buf = vec![0u8; CHUNK];
                loop {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let n = reader.read(&mut buf).map_err(Error::Io)?;
                    if n == 0 {
                        break;
                    }
                    channel
                        .data(&buf[..n])
                        .await
                        .map_err(|err| Error::Transport(err.to_string()))?;
                    sent += n as u64;
                }
                channel
                    .eof()
                    .await
                    .map_err(|err| Error::Transport(err.to_string()))?;
            }

            let mut collected = Vec::new();
            let mut exit_status: i32 = -1;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => collected.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, .. } => collected.extend_from_slice(data),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = code as i32,
                    _ => {}
                }
            }
            Ok((collected, exit_status, sent))
        });
        let (collected, exit_status, _sent) = result?;
        Ok(ExecOutput {
            output: String::from_utf8_lossy(&collected).to_string(),
            exit_status,
        })
    }
}

async fn authenticate(
    handle: &mut client::Handle<HostKeyPolicy>,
    host: &HostRow,
) -> Result<()> {
    if let Some(pem) = &host.private_key {
        let key = decode_secret_key(pem, None)
            .map_err(|err| Error::Transport(format!("invalid private key: {}", err)))?;
        let hash: Option<HashAlg> = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?
            .flatten();
        let outcome = handle
            .authenticate_publickey(
                host.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        if matches!(outcome, AuthResult::Success) {
            return Ok(());
        }
        return Err(Error::Transport(format!(
            "public key auth rejected for {}@{}",
            host.username, host.name
        )));
    }
    if let Some(password) = &host.password {
        let outcome = handle
            .authenticate_password(host.username.clone(), password.clone())
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        if matches!(outcome, AuthResult::Success) {
            return Ok(());
        }
        return Err(Error::Transport(format!(
            "password auth rejected for {}@{}",
            host.username, host.name
        )));
    }
    Err(Error::Transport(format!(
        "host {} has no usable credentials",
        host.name
    )))
}

impl Transport for SshTransport {
    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        self.run(command, None)
    }

    fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<ExecOutput> {
        let mut reader: &[u8] = input;
        self.run(command, Some(&mut reader))
    }

    fn upload(&mut self, local: &std::path::Path, remote_path: &str) -> Result<u64> {
        let mut file = std::fs::File::open(local)?;
        let total = file.metadata()?.len();
        let mut reader = ProgressReader::new(&mut file, remote_path, total);
        let result = self.run(&upload_command(remote_path), Some(&mut reader))?;
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
        let result = self.run(&extract_command(remote_dir), Some(&mut reader))?;
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
        let command = super::local::journalctl_command(unit, lines_back, follow);
        let handle = self.handle()?;
        let started = Instant::now();
        let outcome: Result<()> = self.runtime.block_on(async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|err| Error::Transport(err.to_string()))?;
            channel
                .exec(true, command.as_str())
                .await
                .map_err(|err| Error::Transport(err.to_string()))?;
            loop {
                if cancel.is_cancelled() || started.elapsed() > FOLLOW_WATCHDOG {
                    let _ = channel.close().await;
                    return Ok(());
                }
                let msg = tokio::time::timeout(Duration::from_millis(500), channel.wait()).await;
                match msg {
                    Err(_) => continue,
                    Ok(None) => return Ok(()),
                    Ok(Some(ChannelMsg::Data { ref data })) => {
                        sink.write_all(data).map_err(Error::Io)?;
                    }
                    Ok(Some(ChannelMsg::ExtendedData { ref data, .. })) => {
                        sink.write_all(data).map_err(Error::Io)?;
                    }
                    Ok(Some(_)) => {}
                }
            }
        });
        outcome
    }

    fn tunnel(&mut self, remote_port: u16) -> Result<Tunnel> {
        let handle = self.handle()?.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_task = stop.clone();
        let listener = self
            .runtime
            .block_on(tokio::net::TcpListener::bind(("127.0.0.1", 0)))
            .map_err(|err| Error::Transport(err.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|err| Error::Transport(err.to_string()))?;
        let rt_handle = self.runtime.handle().clone();
        rt_handle.spawn(async move {
            loop {
                if stop_task.load(Ordering::SeqCst) {
                    break;
                }
                let accepted =
                    tokio::time::timeout(Duration::from_millis(250), listener.accept()).await;
                let (mut socket, peer) = match accepted {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        warn!(error = %err, "tunnel accept failed");
                        break;
                    }
                    Ok(Ok(pair)) => pair,
                };
                debug!(%peer, remote_port, "tunnel connection");
                let opened = handle
                    .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
                    .await;
                match opened {
                    Ok(channel) => {
                        tokio::spawn(async move {
                            let mut stream = channel.into_stream();
                            let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
                            let _ = socket.shutdown().await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "tunnel channel open failed");
                    }
                }
            }
        });
        Ok(Tunnel::forwarded(addr, stop))
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.runtime.block_on(async {
                handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await
            });
        }
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.close();
    }
}
