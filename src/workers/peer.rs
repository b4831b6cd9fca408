//! Peer workers: `send` dials and streams a batch, `receive` waits for
//! batches and saves them.

use super::args::{ClientArgs, ReceiveArgs, SendArgs};
use anyhow::{bail, Context, Result};
use rtcportal::core::connection::signaling;
use rtcportal::core::connection::webrtc::WebRtcFactory;
use rtcportal::core::pipeline::batch::{CompletedBatch, FileRef, FileSelection};
use rtcportal::core::pipeline::TransferEvent;
use rtcportal::core::session::{
    PeerSession, SessionConfig, SessionEvent, SessionHandle, SessionStatus,
};
use rtcportal::utils::formatters::{format_file_size, short_peer_id};
use rtcportal::utils::sos::SignalOfStop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long the sender keeps the session open after its last chunk so the
/// receiver can drain the channel and hang up first.
const LINGER: Duration = Duration::from_secs(5);

/// Upper bound on waiting for the session task to wind down.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

struct Running {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl Running {
    async fn start(client: &ClientArgs, config: SessionConfig) -> Result<Self> {
        let link = signaling::connect(client.relay_url()).await?;
        let factory =
            Arc::new(WebRtcFactory::new(client.ice_servers()).with_loopback(client.loopback));
        let (tx, events) = mpsc::unbounded_channel();
        let (session, handle) = PeerSession::new(config, factory, link, tx);
        let task = tokio::spawn(session.run());
        Ok(Self {
            handle,
            events,
            task,
        })
    }

    async fn finish(self) {
        self.handle.end();
        self.handle.shutdown();
        if tokio::time::timeout(SHUTDOWN_WAIT, self.task).await.is_err() {
            warn!("session did not stop in time");
        }
    }
}

// ── Send ─────────────────────────────────────────────────────────────────────

pub async fn send(args: SendArgs, config: SessionConfig, sos: SignalOfStop) -> Result<()> {
    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = FileRef::from_path(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        files.push(file);
    }
    let selection = FileSelection::new(files);
    for (name, reason) in &selection.skipped {
        warn!(file = %name, ?reason, "File skipped");
    }
    if selection.accepted.is_empty() {
        bail!("nothing to send");
    }
    info!(
        files = selection.accepted.len(),
        total = %format_file_size(selection.total_bytes()),
        "Batch ready"
    );

    let mut running = Running::start(&args.client, config).await?;
    let result = drive_send(&mut running, &args.peer, selection.accepted, &sos).await;
    running.finish().await;
    result
}

async fn drive_send(
    running: &mut Running,
    peer: &str,
    files: Vec<FileRef>,
    sos: &SignalOfStop,
) -> Result<()> {
    let mut pending = Some(files);
    let mut dialed = false;

    loop {
        let event = tokio::select! {
            _ = sos.wait() => {
                info!("Interrupted, stopping transfer");
                running.handle.stop_transfer();
                return Ok(());
            }
            ev = running.events.recv() => ev,
        };
        let Some(event) = event else { bail!("session ended unexpectedly") };

        match event {
            SessionEvent::Status(SessionStatus::Ready { local_id }) => {
                info!(local_id = %local_id, "Registered with relay");
                if !dialed {
                    dialed = true;
                    running.handle.dial(peer);
                }
            }
            SessionEvent::Status(SessionStatus::Waiting { remote }) => {
                info!(remote = %short_peer_id(&remote), "Waiting for peer");
            }
            SessionEvent::Status(SessionStatus::Connected { remote }) => {
                info!(remote = %short_peer_id(&remote), "Connected");
                if let Some(files) = pending.take() {
                    running.handle.send_files(files);
                }
            }
            SessionEvent::Status(SessionStatus::Error(alert)) => {
                bail!("{}", alert.error);
            }
            SessionEvent::Status(SessionStatus::Idle) if pending.is_none() => {
                bail!("peer disconnected before the batch finished");
            }
            SessionEvent::Transfer(ev) => match ev {
                TransferEvent::Progress(p) => info!("{p}"),
                TransferEvent::FileSent {
                    name, index, total, ..
                } => info!(file = %name, "Sent {index}/{total}"),
                TransferEvent::SendCompleted { files, bytes } => {
                    info!(files, total = %format_file_size(bytes), "Transfer complete");
                    linger(running).await;
                    return Ok(());
                }
                TransferEvent::SendStopped { files_sent } => {
                    warn!(files_sent, "Transfer stopped");
                    return Ok(());
                }
                TransferEvent::SendFailed(e) => bail!("transfer failed: {e}"),
                _ => {}
            },
            _ => {}
        }
    }
}

/// Wait for the receiver to hang up, at most [`LINGER`].
async fn linger(running: &mut Running) {
    let wait = async {
        while let Some(ev) = running.events.recv().await {
            if let SessionEvent::Status(SessionStatus::Idle) = ev {
                return;
            }
        }
    };
    let _ = tokio::time::timeout(LINGER, wait).await;
}

// ── Receive ──────────────────────────────────────────────────────────────────

pub async fn receive(args: ReceiveArgs, config: SessionConfig, sos: SignalOfStop) -> Result<()> {
    let out_dir = args.out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let mut running = Running::start(&args.client, config).await?;
    let result = drive_receive(&mut running, &out_dir, args.once, &sos).await;
    running.finish().await;
    result
}

async fn drive_receive(
    running: &mut Running,
    out_dir: &Path,
    once: bool,
    sos: &SignalOfStop,
) -> Result<()> {
    let mut batches = 0usize;
    loop {
        let event = tokio::select! {
            _ = sos.wait() => return Ok(()),
            ev = running.events.recv() => ev,
        };
        let Some(event) = event else { bail!("session ended unexpectedly") };

        match event {
            SessionEvent::Status(SessionStatus::Ready { local_id }) => {
                println!("Your peer id: {local_id}");
                info!(local_id = %local_id, "Waiting for a sender");
            }
            SessionEvent::Status(SessionStatus::Connected { remote }) => {
                info!(remote = %short_peer_id(&remote), "Connected");
            }
            SessionEvent::Status(SessionStatus::Idle) => info!("Peer left"),
            SessionEvent::Status(SessionStatus::Error(alert)) => warn!("{}", alert.error),
            SessionEvent::Status(_) => {}
            SessionEvent::Chat { from, text } => info!(from = %short_peer_id(&from), "{text}"),
            SessionEvent::Transfer(ev) => match ev {
                TransferEvent::Progress(p) => info!("{p}"),
                TransferEvent::FileReceived {
                    name, index, total, ..
                } => info!(file = %name, "Received {index}/{total}"),
                TransferEvent::ReceiveCompleted(batch) | TransferEvent::ReceiveCancelled(batch) => {
                    if batch.cancelled {
                        warn!(kept = batch.files.len(), "Sender cancelled the transfer");
                    }
                    batches += 1;
                    save_batch(out_dir, &batch, batches).await?;
                    if once {
                        return Ok(());
                    }
                }
                _ => {}
            },
        }
    }
}

async fn save_batch(dir: &Path, batch: &CompletedBatch, number: usize) -> Result<()> {
    for file in &batch.files {
        let path = unique_path(dir, &safe_file_name(&file.name));
        tokio::fs::write(&path, &file.data)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(
            event = "file_saved",
            path = %path.display(),
            size = %format_file_size(file.size())
        );
    }
    if let Some(archive) = batch.combined_archive()? {
        let path = unique_path(dir, &format!("rtcportal-batch-{number}.zip"));
        tokio::fs::write(&path, archive)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(event = "archive_saved", path = %path.display());
    }
    Ok(())
}

/// Last path component only; remote names never escape `dir`.
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_names_are_flattened() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("a/b/c.txt"), "c.txt");
        assert_eq!(safe_file_name(".."), "file");
        assert_eq!(safe_file_name(""), "file");
    }

    #[test]
    fn unique_path_appends_counter() {
        let dir = std::env::temp_dir().join("rtcportal_test").join("unique_path");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), b"x").unwrap();

        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a (1).txt"));
        assert_eq!(unique_path(&dir, "b.txt"), dir.join("b.txt"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
