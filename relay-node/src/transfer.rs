//! Transfer engine: direct data channels between clients, correlated by a one-time token.
//!
//! The sender announces over its relay session and keeps a listener on the session's local
//! endpoint. The receiver dials the announced endpoints, presents the token in the clear and
//! then reads raw bytes (a file) or entry headers each followed by raw bytes (a directory).
//! Each side's pump task owns its `TransferDescriptor`; observers hold a `TransferHandle`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_core::transfer::safe_entry_path;
use relay_core::{
    paths, wire, EntryHeader, Identity, PendingTransfers, TransferAnnouncement,
    TransferDescriptor, TransferProgress, TransferStatus, TransferToken, DEFAULT_CHUNK_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::transport::{listen_reusable, read_message, write_message};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What a sender offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    File(PathBuf),
    Directory(PathBuf),
}

impl TransferSource {
    fn path(&self) -> &Path {
        match self {
            TransferSource::File(p) | TransferSource::Directory(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Per-endpoint bound when the receiver dials the sender.
    pub connect_timeout: Duration,
    /// Announced transfers not claimed within this window are interrupted.
    pub pending_timeout: Duration,
    /// Bound on reading the token from a fresh data stream.
    pub token_timeout: Duration,
    pub chunk_size: u64,
}

impl From<&Config> for TransferOptions {
    fn from(c: &Config) -> Self {
        Self {
            connect_timeout: c.connect_timeout(),
            pending_timeout: c.transfer_pending_timeout(),
            token_timeout: c.handshake_timeout(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Observer side of one transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    token: TransferToken,
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub fn token(&self) -> TransferToken {
        self.token
    }

    pub fn progress(&self) -> TransferProgress {
        *self.progress.borrow()
    }

    /// Request cancellation. Takes effect between chunks, or at the next sweep while pending.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for a terminal status.
    pub async fn finished(&self) -> TransferProgress {
        let mut rx = self.progress.clone();
        let _ = rx.wait_for(|p| p.status.is_terminal()).await;
        let last = *rx.borrow();
        last
    }
}

/// Announced, not yet claimed.
struct PendingSend {
    source: TransferSource,
    pump: Pump,
}

/// Sender half of the transfer engine for one client.
pub struct TransferEngine {
    pending: Mutex<PendingTransfers<PendingSend>>,
    local_endpoint: SocketAddr,
    options: TransferOptions,
    shutdown: CancellationToken,
}

impl TransferEngine {
    /// Listen on the client's relay-session endpoint so its observed address also reaches us.
    pub fn for_client(client: &Client, options: TransferOptions) -> std::io::Result<Arc<Self>> {
        Self::bind(client.local_endpoint(), options)
    }

    /// Listen on `local`, falling back to an ephemeral port on the same address.
    /// Spawns the accept loop and the pending sweep; call `shutdown` to stop them.
    pub fn bind(local: SocketAddr, options: TransferOptions) -> std::io::Result<Arc<Self>> {
        let listener = match listen_reusable(local) {
            Ok(l) => l,
            Err(e) => {
                warn!(%local, error = %e, "cannot share session endpoint; using an ephemeral port");
                listen_reusable(SocketAddr::new(local.ip(), 0))?
            }
        };
        let engine = Arc::new(Self {
            pending: Mutex::new(PendingTransfers::new()),
            local_endpoint: listener.local_addr()?,
            options,
            shutdown: CancellationToken::new(),
        });
        info!(endpoint = %engine.local_endpoint, "transfer engine listening");
        tokio::spawn(engine.clone().accept_loop(listener));
        tokio::spawn(engine.clone().sweep_loop());
        Ok(engine)
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Offer `source` to `target` over `client`'s session. The token is registered before the
    /// announcement is sent.
    pub async fn announce(
        &self,
        client: &Client,
        target: Identity,
        source: TransferSource,
    ) -> Result<TransferHandle> {
        if self.shutdown.is_cancelled() {
            return Err(NodeError::Closed);
        }
        let meta = tokio::fs::metadata(source.path()).await?;
        let length = match &source {
            TransferSource::File(_) if meta.is_file() => Some(meta.len()),
            TransferSource::Directory(_) if meta.is_dir() => None,
            _ => {
                return Err(NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} does not match its source kind", source.path().display()),
                )))
            }
        };
        let name = entry_name(source.path())?;
        let token = TransferToken::generate();
        let mut descriptor = TransferDescriptor::new(token, name.clone(), length);
        descriptor.listening()?;

        let mut endpoints = vec![self.local_endpoint];
        if !endpoints.contains(&client.observed_endpoint()) {
            endpoints.push(client.observed_endpoint());
        }
        let announcement = TransferAnnouncement {
            name,
            length,
            token,
            endpoints,
        };
        let payload = wire::encode_payload(&announcement)?;

        let (pump, handle) = Pump::new(descriptor, self.shutdown.child_token(), self.options.chunk_size);
        {
            // `shutdown` cancels before it drains, so a check under the lock cannot miss the drain.
            let mut pending = self.pending.lock();
            if self.shutdown.is_cancelled() {
                drop(pending);
                pump.conclude(Ok(Copied::Canceled));
                return Err(NodeError::Closed);
            }
            pending.insert(token, PendingSend { source, pump });
        }
        if let Err(e) = client.send(target, paths::TRANSFER_ANNOUNCE, payload) {
            let reclaimed = self.pending.lock().claim(&token);
            if let Some(send) = reclaimed {
                send.pump.conclude(Err(NodeError::Closed));
            }
            return Err(e);
        }
        info!(%token, %target, length = ?length, "transfer announced");
        Ok(handle)
    }

    /// Stop listening and cancel every transfer still waiting for its receiver.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained = self.pending.lock().remove_where(|_| true);
        for (_, send) in drained {
            send.pump.conclude(Ok(Copied::Canceled));
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "transfer accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            tokio::spawn(self.clone().serve_data(stream, peer));
        }
        debug!(endpoint = %self.local_endpoint, "transfer accept loop stopped");
    }

    async fn serve_data(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let token: TransferToken =
            match timeout(self.options.token_timeout, read_message(&mut stream)).await {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "bad transfer token frame");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "no transfer token before timeout");
                    return;
                }
            };
        let claimed = self.pending.lock().claim(&token);
        let Some(PendingSend { source, mut pump }) = claimed else {
            debug!(%peer, %token, "unknown transfer token; closing");
            return;
        };
        info!(%peer, %token, "transfer claimed");
        let outcome = pump.send(&mut stream, &source).await;
        pump.conclude(outcome);
        let _ = stream.shutdown().await;
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let (expired, canceled) = {
                let mut pending = self.pending.lock();
                let expired = pending.expire(Instant::now(), self.options.pending_timeout);
                let canceled = pending.remove_where(|s| s.pump.cancel.is_cancelled());
                (expired, canceled)
            };
            for (token, send) in expired {
                warn!(%token, "transfer never claimed; expiring");
                send.pump.conclude(Err(NodeError::timeout("transfer claim")));
            }
            for (_, send) in canceled {
                send.pump.conclude(Ok(Copied::Canceled));
            }
        }
    }
}

/// Receive an announced transfer into `dest_dir`. Runs on its own task.
pub fn receive(
    announcement: TransferAnnouncement,
    dest_dir: PathBuf,
    options: &TransferOptions,
) -> TransferHandle {
    let descriptor = TransferDescriptor::new(
        announcement.token,
        announcement.name.clone(),
        announcement.length,
    );
    let (mut pump, handle) = Pump::new(descriptor, CancellationToken::new(), options.chunk_size);
    let options = *options;
    tokio::spawn(async move {
        let outcome = pump.receive(&announcement, &dest_dir, &options).await;
        pump.conclude(outcome);
    });
    handle
}

/// How a pump stopped without a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Copied {
    Done,
    Canceled,
}

/// Owns the descriptor for one side of a transfer and publishes its progress.
struct Pump {
    descriptor: TransferDescriptor,
    progress: watch::Sender<TransferProgress>,
    cancel: CancellationToken,
    buf: Vec<u8>,
}

impl Pump {
    fn new(
        descriptor: TransferDescriptor,
        cancel: CancellationToken,
        chunk_size: u64,
    ) -> (Pump, TransferHandle) {
        let (tx, rx) = watch::channel(descriptor.progress());
        let chunk = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let handle = TransferHandle {
            token: descriptor.token,
            progress: rx,
            cancel: cancel.clone(),
        };
        let pump = Pump {
            descriptor,
            progress: tx,
            cancel,
            buf: vec![0u8; chunk as usize],
        };
        (pump, handle)
    }

    fn publish(&self) {
        self.progress.send_replace(self.descriptor.progress());
    }

    /// Settle the final status and publish it.
    fn conclude(mut self, outcome: Result<Copied>) -> TransferStatus {
        let token = self.descriptor.token;
        let status = match outcome {
            Ok(Copied::Done) => self.descriptor.finish(),
            Ok(Copied::Canceled) => self.descriptor.cancel(),
            Err(e) => {
                warn!(%token, error = %e, "transfer failed");
                self.descriptor.interrupt()
            }
        };
        self.publish();
        info!(
            %token,
            status = ?status,
            position = self.descriptor.position(),
            "transfer finished"
        );
        status
    }

    async fn send(&mut self, stream: &mut TcpStream, source: &TransferSource) -> Result<Copied> {
        self.descriptor.running()?;
        self.publish();
        match source {
            TransferSource::File(path) => {
                let length = self.descriptor.length().unwrap_or(0);
                let mut file = tokio::fs::File::open(path).await?;
                self.copy(&mut file, stream, length).await
            }
            TransferSource::Directory(root) => {
                for (rel, path, length) in collect_entries(root).await? {
                    trace!(token = %self.descriptor.token, path = %rel, length, "sending entry");
                    write_message(stream, &EntryHeader::File { path: rel, length }).await?;
                    let mut file = tokio::fs::File::open(&path).await?;
                    if self.copy(&mut file, stream, length).await? == Copied::Canceled {
                        return Ok(Copied::Canceled);
                    }
                }
                write_message(stream, &EntryHeader::End).await?;
                Ok(Copied::Done)
            }
        }
    }

    async fn receive(
        &mut self,
        announcement: &TransferAnnouncement,
        dest_dir: &Path,
        options: &TransferOptions,
    ) -> Result<Copied> {
        self.descriptor.connecting()?;
        self.publish();
        let target = dest_dir.join(safe_entry_path(&announcement.name)?);
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Copied::Canceled),
            s = connect_any(&announcement.endpoints, options.connect_timeout) => s,
        };
        let mut stream = connected?;
        self.descriptor.running()?;
        self.publish();
        write_message(&mut stream, &announcement.token).await?;

        match announcement.length {
            Some(length) => {
                let mut file = tokio::fs::File::create(&target).await?;
                let copied = self.copy(&mut stream, &mut file, length).await?;
                file.flush().await?;
                Ok(copied)
            }
            None => {
                tokio::fs::create_dir_all(&target).await?;
                loop {
                    let header: EntryHeader = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(Copied::Canceled),
                        h = read_message(&mut stream) => h?,
                    };
                    let (path, length) = match header {
                        EntryHeader::End => return Ok(Copied::Done),
                        EntryHeader::File { path, length } => (path, length),
                    };
                    let full = target.join(safe_entry_path(&path)?);
                    if let Some(parent) = full.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let mut file = tokio::fs::File::create(&full).await?;
                    let copied = self.copy(&mut stream, &mut file, length).await?;
                    file.flush().await?;
                    if copied == Copied::Canceled {
                        return Ok(Copied::Canceled);
                    }
                }
            }
        }
    }

    /// Move exactly `length` bytes in chunks, publishing after each one.
    async fn copy<R, W>(&mut self, reader: &mut R, writer: &mut W, length: u64) -> Result<Copied>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut left = length;
        while left > 0 {
            let n = left.min(self.buf.len() as u64) as usize;
            let chunk = &mut self.buf[..n];
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Copied::Canceled),
                r = reader.read_exact(chunk) => { r?; }
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Copied::Canceled),
                r = writer.write_all(&self.buf[..n]) => r?,
            }
            left -= n as u64;
            self.descriptor.advance(n as u64)?;
            self.publish();
        }
        Ok(Copied::Done)
    }
}

/// Dial each endpoint in order; the first that accepts wins.
async fn connect_any(endpoints: &[SocketAddr], per_attempt: Duration) -> Result<TcpStream> {
    for endpoint in endpoints {
        match timeout(per_attempt, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                debug!(%endpoint, "transfer channel connected");
                return Ok(stream);
            }
            Ok(Err(e)) => debug!(%endpoint, error = %e, "transfer endpoint refused"),
            Err(_) => debug!(%endpoint, "transfer endpoint timed out"),
        }
    }
    Err(NodeError::Unreachable {
        attempted: endpoints.len(),
    })
}

fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            NodeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            ))
        })
}

/// Regular files under `root` as (relative path with `/` separators, absolute path, length),
/// sorted by relative path.
async fn collect_entries(root: &Path) -> Result<Vec<(String, PathBuf, u64)>> {
    let mut out = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                let length = entry.metadata().await?.len();
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((rel, path, length));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
