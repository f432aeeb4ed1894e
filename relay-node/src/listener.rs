//! Listener: accepts raw streams, runs the handshake, owns the routing table and routes envelopes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{
    paths, wire, DiscoveryRecord, Envelope, HandshakeRequest, HandshakeResponse, Identity,
    Dispatched, Registry, ResultCode, Role, RoutingTable, SessionKey, PROTOCOL_TAG,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::session::{self, CloseReason, SessionHandle, SessionSink};
use crate::transport::{read_message, set_keepalive, write_message};

/// The relay. Construct one per listening socket; tests run several side by side.
pub struct Listener {
    config: Config,
    routes: Mutex<RoutingTable<SessionHandle>>,
    registry: Registry<Listener>,
    port: AtomicU16,
}

impl Listener {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Registry::new().on(paths::GROUP_SUBSCRIBE, Listener::update_groups);
        Arc::new(Self {
            routes: Mutex::new(RoutingTable::new(config.max_clients, config.max_groups)),
            port: AtomicU16::new(config.listen_port),
            registry,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept loop. Each connection is handshaken on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        self.port.store(addr.port(), Ordering::Release);
        info!(%addr, max_clients = self.config.max_clients, "relay listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                match this.handshake(stream, peer).await {
                    Ok(identity) => info!(%identity, %peer, "session established"),
                    Err(NodeError::Rejected(ResultCode::AssertFailed)) => {
                        error!(%peer, "handshake aborted: routing invariant violated")
                    }
                    Err(NodeError::Rejected(code)) => info!(%peer, %code, "handshake rejected"),
                    Err(e) => warn!(%peer, error = %e, "handshake failed"),
                }
            });
        }
    }

    async fn handshake(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<Identity> {
        if let Err(e) = set_keepalive(&stream, self.config.keepalive()) {
            debug!(%peer, error = %e, "keepalive not set");
        }
        let limit = self.config.handshake_timeout();
        let (mut reader, mut writer) = stream.into_split();

        let request: HandshakeRequest = timeout(limit, read_message(&mut reader))
            .await
            .map_err(|_| NodeError::timeout("handshake request"))??;
        let identity = request.identity;
        trace!(%peer, %identity, protocol = %request.protocol, "handshake request");

        let reservation = match self.admit(&request) {
            Ok(r) => r,
            Err(code) => {
                let reply = HandshakeResponse::rejected(code, peer);
                let _ = timeout(limit, write_message(&mut writer, &reply)).await;
                return Err(code.into());
            }
        };

        let key = SessionKey::generate();
        let sealed = key.seal_for(&request.public_key)?;
        timeout(
            limit,
            write_message(&mut writer, &HandshakeResponse::accepted(sealed, peer)),
        )
        .await
        .map_err(|_| NodeError::timeout("handshake response"))??;

        let pending = session::open(
            reader,
            writer,
            identity,
            &key,
            Role::Relay,
            self.config.max_backlog_bytes,
        );
        reservation.commit(pending.handle().clone())?;
        pending.start(self.clone());
        self.broadcast_roster();
        Ok(identity)
    }

    /// Validate a handshake request and reserve its identity.
    fn admit(&self, request: &HandshakeRequest) -> std::result::Result<Reservation<'_>, ResultCode> {
        if request.protocol != PROTOCOL_TAG {
            return Err(ResultCode::ProtocolMismatch);
        }
        self.routes.lock().reserve(request.identity)?;
        Ok(Reservation {
            listener: self,
            identity: request.identity,
            committed: false,
        })
    }

    /// Deliver an envelope to its targets. Absent targets are dropped silently.
    pub fn route(&self, envelope: &Envelope) {
        let targets = self.routes.lock().targets(envelope.source, envelope.target);
        if targets.is_empty() {
            trace!(source = %envelope.source, target = %envelope.target, "no recipients");
            return;
        }
        let blob = match wire::encode_payload(envelope) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cannot encode envelope");
                return;
            }
        };
        for (identity, session) in targets {
            if let Err(e) = session.enqueue_encoded(blob.clone()) {
                debug!(%identity, error = %e, "delivery failed");
            }
        }
    }

    fn update_groups(&self, envelope: &Envelope) {
        let requested: Vec<Identity> = match wire::decode_payload(&envelope.payload) {
            Ok(groups) => groups,
            Err(e) => {
                warn!(source = %envelope.source, error = %e, "malformed group subscription");
                return;
            }
        };
        let result = self.routes.lock().set_groups(envelope.source, &requested);
        match result {
            Ok(update) if update.code() == ResultCode::GroupLimited => warn!(
                source = %envelope.source,
                applied = update.applied,
                dropped = update.dropped,
                code = %ResultCode::GroupLimited,
                "group subscriptions clamped"
            ),
            Ok(update) => debug!(source = %envelope.source, applied = update.applied, "groups updated"),
            Err(code) => error!(source = %envelope.source, %code, "group update for inactive identity"),
        }
    }

    /// Send the list of connected identities to every session.
    fn broadcast_roster(&self) {
        let roster = self.roster();
        match wire::encode_payload(&roster) {
            Ok(payload) => self.route(&Envelope::new(
                Identity::RELAY,
                Identity::RELAY,
                paths::ROSTER,
                payload,
            )),
            Err(e) => warn!(error = %e, "cannot encode roster"),
        }
    }

    pub fn roster(&self) -> Vec<Identity> {
        self.routes.lock().roster()
    }

    pub fn groups_of(&self, identity: Identity) -> Vec<Identity> {
        self.routes.lock().groups_of(identity)
    }

    pub fn session(&self, identity: Identity) -> Option<SessionHandle> {
        self.routes.lock().session(identity).cloned()
    }

    /// Snapshot answered to discovery queries.
    pub fn discovery_record(&self) -> DiscoveryRecord {
        let routes = self.routes.lock();
        DiscoveryRecord {
            protocol: PROTOCOL_TAG.to_string(),
            port: self.port.load(Ordering::Acquire),
            name: self.config.name.clone(),
            current: routes.active_count() as u32,
            max: routes.max_clients() as u32,
        }
    }

    /// Close every session. Routing state is cleaned up as each close is reported.
    pub fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = {
            let routes = self.routes.lock();
            routes
                .roster()
                .into_iter()
                .filter_map(|id| routes.session(id).cloned())
                .collect()
        };
        info!(sessions = sessions.len(), "closing all sessions");
        for s in sessions {
            s.close();
        }
    }
}

impl SessionSink for Listener {
    fn on_envelope(&self, session: &SessionHandle, mut envelope: Envelope) {
        envelope.source = session.identity();
        if self.registry.try_dispatch(self, &envelope) == Dispatched::Handled {
            return;
        }
        self.route(&envelope);
    }

    fn on_closed(&self, session: &SessionHandle, reason: &CloseReason) {
        let identity = session.identity();
        let removed = {
            let mut routes = self.routes.lock();
            let current = routes
                .session(identity)
                .map_or(false, |s| s.same_session(session));
            if current {
                routes.remove(identity)
            } else {
                None
            }
        };
        if removed.is_some() {
            info!(%identity, %reason, "session removed");
            self.broadcast_roster();
        }
    }
}

/// Identity held for an in-flight handshake. Released on drop unless committed.
struct Reservation<'a> {
    listener: &'a Listener,
    identity: Identity,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: SessionHandle) -> std::result::Result<(), ResultCode> {
        self.committed = true;
        self.listener.routes.lock().activate(self.identity, session)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(code) = self.listener.routes.lock().release(self.identity) {
            error!(identity = %self.identity, %code, "reservation missing on release");
        }
    }
}
