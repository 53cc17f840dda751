//! ZFS send/receive pipelines.
//!
//! Streams `zfs send` through ssh into a remote `zfs receive` (and the
//! reverse direction for restores) with byte accounting for progress
//! reporting. Cancellation SIGTERMs the child process tree; a partially
//! sent snapshot is harmless because `zfs recv` commits atomically per
//! snapshot.

use std::process::Stdio;
use std::time::{Duration, Instant};
use sylve_common::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::ssh::{classify_ssh_error, SshEndpoint};

const COPY_BUF_SIZE: usize = 128 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_BYTES: u64 = 64 * 1024 * 1024;

/// Options for one send stream.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Full `dataset@snap` to send.
    pub snapshot: String,
    /// Full `dataset@snap` base for an incremental stream; `None` sends
    /// the whole snapshot.
    pub incremental_base: Option<String>,
    /// `-R`: replicate the dataset tree (children included).
    pub replicate: bool,
    /// `-I` (all intermediate snapshots) instead of `-i`.
    pub with_intermediates: bool,
}

/// Outcome of a completed pipe.
#[derive(Debug)]
pub struct PipeReport {
    pub moved_bytes: u64,
}

pub(crate) fn send_args(opts: &SendOptions) -> Vec<String> {
    let mut args = vec!["send".to_string()];
    if opts.replicate {
        args.push("-R".to_string());
    }
    if let Some(base) = &opts.incremental_base {
        args.push(if opts.with_intermediates { "-I" } else { "-i" }.to_string());
        args.push(base.clone());
    }
    args.push(opts.snapshot.clone());
    args
}

pub(crate) fn recv_command(dest_dataset: &str, force: bool) -> String {
    if force {
        format!("zfs receive -F {}", dest_dataset)
    } else {
        format!("zfs receive {}", dest_dataset)
    }
}

fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

/// Push a local snapshot into a remote dataset:
/// `zfs send … | ssh <endpoint> zfs receive [-F] <dest>`.
pub async fn send_to_endpoint(
    opts: &SendOptions,
    endpoint: &SshEndpoint,
    dest_dataset: &str,
    force: bool,
    progress: Option<mpsc::Sender<u64>>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<PipeReport> {
    info!(
        "Sending {} -> {}@{}:{}",
        opts.snapshot, endpoint.user, endpoint.host, dest_dataset
    );

    let mut send_child = Command::new("zfs")
        .args(send_args(opts))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Fatal(format!("Failed to start zfs send: {}", e)))?;

    let mut recv_child = endpoint
        .command(&recv_command(dest_dataset, force))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Fatal(format!("Failed to start ssh receive: {}", e)))?;

    let source = send_child
        .stdout
        .take()
        .ok_or_else(|| Error::Fatal("Failed to capture send stdout".to_string()))?;
    let sink = recv_child
        .stdin
        .take()
        .ok_or_else(|| Error::Fatal("Failed to capture ssh stdin".to_string()))?;

    let copy_result = pump(source, sink, progress, cancel).await;

    let moved = match copy_result {
        Ok(moved) => moved,
        Err(e) => {
            terminate(&send_child);
            terminate(&recv_child);
            let _ = send_child.wait().await;
            let _ = recv_child.wait().await;
            return Err(e);
        }
    };

    let send_stderr = read_stderr(&mut send_child).await;
    let recv_stderr = read_stderr(&mut recv_child).await;

    let send_status = send_child
        .wait()
        .await
        .map_err(|e| Error::Fatal(format!("Failed to wait for zfs send: {}", e)))?;
    let recv_status = recv_child
        .wait()
        .await
        .map_err(|e| Error::Fatal(format!("Failed to wait for ssh receive: {}", e)))?;

    if !send_status.success() {
        return Err(Error::Fatal(format!(
            "zfs send failed: {}",
            send_stderr.trim()
        )));
    }
    if !recv_status.success() {
        return Err(classify_ssh_error(recv_stderr.trim()));
    }

    Ok(PipeReport { moved_bytes: moved })
}

/// Pull a remote snapshot into a local dataset:
/// `ssh <endpoint> zfs send … | zfs receive [-F] <dest>`.
pub async fn recv_from_endpoint(
    endpoint: &SshEndpoint,
    opts: &SendOptions,
    local_dest: &str,
    force: bool,
    progress: Option<mpsc::Sender<u64>>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<PipeReport> {
    info!(
        "Receiving {}@{}:{} -> {}",
        endpoint.user, endpoint.host, opts.snapshot, local_dest
    );

    let remote_send = format!("zfs {}", send_args(opts).join(" "));
    let mut send_child = endpoint
        .command(&remote_send)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Fatal(format!("Failed to start ssh send: {}", e)))?;

    let mut recv_args = vec!["receive"];
    if force {
        recv_args.push("-F");
    }
    recv_args.push(local_dest);
    let mut recv_child = Command::new("zfs")
        .args(&recv_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Fatal(format!("Failed to start zfs receive: {}", e)))?;

    let source = send_child
        .stdout
        .take()
        .ok_or_else(|| Error::Fatal("Failed to capture ssh stdout".to_string()))?;
    let sink = recv_child
        .stdin
        .take()
        .ok_or_else(|| Error::Fatal("Failed to capture receive stdin".to_string()))?;

    let copy_result = pump(source, sink, progress, cancel).await;

    let moved = match copy_result {
        Ok(moved) => moved,
        Err(e) => {
            terminate(&send_child);
            terminate(&recv_child);
            let _ = send_child.wait().await;
            let _ = recv_child.wait().await;
            return Err(e);
        }
    };

    let send_stderr = read_stderr(&mut send_child).await;
    let recv_stderr = read_stderr(&mut recv_child).await;

    let send_status = send_child
        .wait()
        .await
        .map_err(|e| Error::Fatal(format!("Failed to wait for ssh send: {}", e)))?;
    let recv_status = recv_child
        .wait()
        .await
        .map_err(|e| Error::Fatal(format!("Failed to wait for zfs receive: {}", e)))?;

    if !send_status.success() {
        return Err(classify_ssh_error(send_stderr.trim()));
    }
    if !recv_status.success() {
        return Err(Error::Fatal(format!(
            "zfs receive failed: {}",
            recv_stderr.trim()
        )));
    }

    Ok(PipeReport { moved_bytes: moved })
}

/// Byte-accounting copy loop. Progress reports are throttled (every
/// [`PROGRESS_INTERVAL`] or [`PROGRESS_BYTES`], whichever first) and sent
/// best-effort; a full channel just drops the sample.
async fn pump(
    mut source: impl tokio::io::AsyncRead + Unpin,
    mut sink: impl tokio::io::AsyncWrite + Unpin,
    progress: Option<mpsc::Sender<u64>>,
    mut cancel: Option<watch::Receiver<bool>>,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut moved: u64 = 0;
    let mut last_report = Instant::now();
    let mut last_reported_bytes: u64 = 0;

    loop {
        let mut watch_gone = false;
        let n = if let Some(rx) = cancel.as_mut() {
            tokio::select! {
                read = source.read(&mut buf) => read?,
                changed = rx.changed() => {
                    if changed.is_ok() {
                        if *rx.borrow() {
                            warn!("Send pipeline canceled after {} bytes", moved);
                            return Err(Error::Fatal("run canceled".to_string()));
                        }
                        continue;
                    }
                    // Cancel handle dropped; stop watching it.
                    watch_gone = true;
                    0
                }
            }
        } else {
            source.read(&mut buf).await?
        };

        if watch_gone {
            cancel = None;
            continue;
        }

        if n == 0 {
            break;
        }

        sink.write_all(&buf[..n]).await?;
        moved += n as u64;

        if let Some(tx) = &progress {
            if last_report.elapsed() >= PROGRESS_INTERVAL
                || moved - last_reported_bytes >= PROGRESS_BYTES
            {
                let _ = tx.try_send(moved);
                last_report = Instant::now();
                last_reported_bytes = moved;
            }
        }
    }

    sink.shutdown().await?;

    if let Some(tx) = &progress {
        let _ = tx.try_send(moved);
    }

    Ok(moved)
}
