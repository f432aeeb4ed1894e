//! Session: one authenticated, encrypted duplex stream.
//!
//! A session owns a send task (drains the outgoing queue, encrypts one frame at a time) and a
//! receive task (reads a frame, decrypts, decodes the envelope, hands it to the sink). Whichever
//! side fails first records the close reason and cancels the other; the receive task reports the
//! close to the sink exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{wire, Envelope, Identity, Opener, ResultCode, Role, Sealer, SessionKey};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{NodeError, Result};
use crate::transport::{read_block, write_block};

/// Receives what a session produces. The relay routes envelopes; a client dispatches them locally.
pub trait SessionSink: Send + Sync + 'static {
    fn on_envelope(&self, session: &SessionHandle, envelope: Envelope);
    fn on_closed(&self, session: &SessionHandle, reason: &CloseReason);
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Shutdown,
    /// The peer closed the stream.
    PeerClosed,
    /// Outgoing backlog exceeded its cap.
    Overflow,
    /// Stream, crypto or decode failure.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Overflow => f.write_str("backlog overflow"),
            CloseReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

struct Shared {
    identity: Identity,
    queue: mpsc::UnboundedSender<Vec<u8>>,
    backlog: AtomicUsize,
    max_backlog: usize,
    started: AtomicBool,
    shutdown: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl Shared {
    /// Record the first close reason and stop both loops.
    fn close_with(&self, reason: CloseReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.shutdown.cancel();
    }
}

/// Cloneable handle to a running session. Enqueueing never blocks.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.shared.identity)
            .field("backlog", &self.backlog())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    /// Unsent bytes currently queued.
    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.lock().clone()
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Queue an envelope for sending.
    pub fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        let blob = wire::encode_payload(envelope)?;
        self.enqueue_encoded(blob)
    }

    /// Queue an already-encoded envelope. Exceeding the backlog cap closes the session with
    /// `Overflow` instead of waiting for the queue to drain.
    pub fn enqueue_encoded(&self, blob: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        let len = blob.len();
        let pending = self.shared.backlog.fetch_add(len, Ordering::AcqRel) + len;
        if pending > self.shared.max_backlog {
            self.shared.backlog.fetch_sub(len, Ordering::AcqRel);
            warn!(
                identity = %self.shared.identity,
                pending,
                cap = self.shared.max_backlog,
                "outgoing backlog exceeded; closing session"
            );
            self.shared.close_with(CloseReason::Overflow);
            return Err(NodeError::Rejected(ResultCode::Overflow));
        }
        self.shared.queue.send(blob).map_err(|_| {
            self.shared.backlog.fetch_sub(len, Ordering::AcqRel);
            NodeError::Closed
        })
    }

    /// Stop both loops. The sink is notified with `Shutdown` unless the session already failed.
    pub fn close(&self) {
        self.shared.close_with(CloseReason::Shutdown);
    }

    /// Wait until the session has stopped.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

/// A session whose loops have not been spawned yet. Lets the owner register the handle
/// (for example in the routing table) before any close can be reported.
pub struct PendingSession<R, W> {
    handle: SessionHandle,
    reader: R,
    writer: W,
    sealer: Sealer,
    opener: Opener,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Build a session over the two halves of an authenticated stream.
pub fn open<R, W>(
    reader: R,
    writer: W,
    identity: Identity,
    key: &SessionKey,
    role: Role,
    max_backlog: usize,
) -> PendingSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sealer, opener) = key.split(role);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        shared: Arc::new(Shared {
            identity,
            queue: tx,
            backlog: AtomicUsize::new(0),
            max_backlog,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reason: Mutex::new(None),
        }),
    };
    PendingSession {
        handle,
        reader,
        writer,
        sealer,
        opener,
        queue: rx,
    }
}

impl<R, W> PendingSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Spawn the send and receive loops.
    pub fn start(self, sink: Arc<dyn SessionSink>) -> SessionHandle {
        let PendingSession {
            handle,
            reader,
            writer,
            sealer,
            opener,
            queue,
        } = self;
        handle.shared.started.store(true, Ordering::Release);

        tokio::spawn(send_loop(writer, sealer, queue, handle.clone()));

        let recv_handle = handle.clone();
        tokio::spawn(async move {
            let shutdown = recv_handle.shared.shutdown.clone();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                reason = recv_loop(reader, opener, &recv_handle, sink.as_ref()) => {
                    recv_handle.shared.close_with(reason);
                }
            }
            let reason = recv_handle
                .close_reason()
                .unwrap_or(CloseReason::Shutdown);
            debug!(identity = %recv_handle.identity(), %reason, "session closed");
            sink.on_closed(&recv_handle, &reason);
        });
        handle
    }
}

async fn send_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut sealer: Sealer,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: SessionHandle,
) {
    let shutdown = handle.shared.shutdown.clone();
    loop {
        let blob = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            blob = queue.recv() => match blob {
                Some(b) => b,
                None => break,
            },
        };
        let len = blob.len();
        let sent = match sealer.seal(&blob) {
            Ok(cipher) => write_block(&mut writer, &cipher).await,
            Err(e) => Err(e.into()),
        };
        handle.shared.backlog.fetch_sub(len, Ordering::AcqRel);
        if let Err(e) = sent {
            handle.shared.close_with(CloseReason::Failed(e.to_string()));
            break;
        }
        trace!(identity = %handle.identity(), len, "frame sent");
    }
    let _ = writer.shutdown().await;
}

async fn recv_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut opener: Opener,
    handle: &SessionHandle,
    sink: &dyn SessionSink,
) -> CloseReason {
    loop {
        let block = match read_block(&mut reader).await {
            Ok(b) => b,
            Err(NodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return CloseReason::PeerClosed
            }
            Err(e) => return CloseReason::Failed(e.to_string()),
        };
        let plain = match opener.open(&block) {
            Ok(p) => p,
            Err(e) => return CloseReason::Failed(e.to_string()),
        };
        let envelope: Envelope = match wire::decode_payload(&plain) {
            Ok(env) => env,
            Err(e) => return CloseReason::Failed(e.to_string()),
        };
        trace!(
            identity = %handle.identity(),
            path = %envelope.path,
            target = %envelope.target,
            "frame received"
        );
        sink.on_envelope(handle, envelope);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    /// Forwards everything a session produces into channels.
    struct ChannelSink {
        envelopes: UnboundedSender<Envelope>,
        closed: UnboundedSender<CloseReason>,
    }

    impl SessionSink for ChannelSink {
        fn on_envelope(&self, _session: &SessionHandle, envelope: Envelope) {
            let _ = self.envelopes.send(envelope);
        }
        fn on_closed(&self, _session: &SessionHandle, reason: &CloseReason) {
            let _ = self.closed.send(reason.clone());
        }
    }

    struct Pair {
        relay: SessionHandle,
        client: SessionHandle,
        relay_rx: mpsc::UnboundedReceiver<Envelope>,
        client_rx: mpsc::UnboundedReceiver<Envelope>,
        relay_closed: mpsc::UnboundedReceiver<CloseReason>,
        client_closed: mpsc::UnboundedReceiver<CloseReason>,
    }

    fn pair(max_backlog: usize) -> Pair {
        let key = SessionKey::generate();
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (relay_ctx, relay_closed) = mpsc::unbounded_channel();
        let (client_ctx, client_closed) = mpsc::unbounded_channel();
        let relay = open(ar, aw, Identity(1), &key, Role::Relay, max_backlog).start(Arc::new(
            ChannelSink {
                envelopes: relay_tx,
                closed: relay_ctx,
            },
        ));
        let client = open(br, bw, Identity(1), &key, Role::Client, max_backlog).start(Arc::new(
            ChannelSink {
                envelopes: client_tx,
                closed: client_ctx,
            },
        ));
        Pair {
            relay,
            client,
            relay_rx,
            client_rx,
            relay_closed,
            client_closed,
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn envelopes_arrive_in_enqueue_order() {
        let mut p = pair(1 << 20);
        for i in 0..20u8 {
            p.client
                .enqueue(&Envelope::new(Identity(1), Identity(2), "seq", vec![i]))
                .unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(next(&mut p.relay_rx).await.payload, vec![i]);
        }
        p.relay
            .enqueue(&Envelope::new(Identity(2), Identity(1), "back", b"ok".to_vec()))
            .unwrap();
        let env = next(&mut p.client_rx).await;
        assert_eq!(env.path, "back");
        assert_eq!(env.source, Identity(2));
        assert!(p.client.is_started());
    }

    #[tokio::test]
    async fn close_notifies_both_sides() {
        let mut p = pair(1 << 20);
        p.client.close();
        assert_eq!(next(&mut p.client_closed).await, CloseReason::Shutdown);
        assert_eq!(next(&mut p.relay_closed).await, CloseReason::PeerClosed);
        assert!(p.relay.is_closed());
        assert!(matches!(
            p.client.enqueue(&Envelope::new(Identity(1), Identity(0), "x", vec![])),
            Err(NodeError::Closed)
        ));
    }

    #[tokio::test]
    async fn backlog_cap_fails_with_overflow() {
        let mut p = pair(64);
        let big = Envelope::new(Identity(1), Identity(2), "big", vec![0u8; 256]);
        assert!(matches!(
            p.client.enqueue(&big),
            Err(NodeError::Rejected(ResultCode::Overflow))
        ));
        assert_eq!(next(&mut p.client_closed).await, CloseReason::Overflow);
        assert_eq!(p.client.close_reason(), Some(CloseReason::Overflow));
        assert_eq!(next(&mut p.relay_closed).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn garbage_frame_fails_session() {
        let key = SessionKey::generate();
        let (a, mut b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (ctx, mut closed) = mpsc::unbounded_channel();
        let _relay = open(ar, aw, Identity(3), &key, Role::Relay, 1024)
            .start(Arc::new(ChannelSink { envelopes: tx, closed: ctx }));
        write_block(&mut b, b"not a sealed frame").await.unwrap();
        assert!(matches!(next(&mut closed).await, CloseReason::Failed(_)));
    }
}
