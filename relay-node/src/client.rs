//! Client side of a relay session: connect, handshake, send and subscribe.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{
    paths, wire, Envelope, HandshakeKeypair, HandshakeRequest, HandshakeResponse, Identity,
    Registry, ResultCode, Role, PROTOCOL_TAG,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{Config, Keepalive};
use crate::error::{NodeError, Result};
use crate::session::{self, CloseReason, SessionHandle, SessionSink};
use crate::transport::{connect_reusable, read_message, set_keepalive, write_message};

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Bound on each handshake step, including the TCP connect.
    pub handshake_timeout: Duration,
    pub max_backlog_bytes: usize,
    pub keepalive: Keepalive,
}

impl From<&Config> for ClientOptions {
    fn from(c: &Config) -> Self {
        Self {
            handshake_timeout: c.handshake_timeout(),
            max_backlog_bytes: c.max_backlog_bytes,
            keepalive: c.keepalive(),
        }
    }
}

struct ClientInner {
    identity: Identity,
    session: SessionHandle,
    relay_endpoint: SocketAddr,
    local_endpoint: SocketAddr,
    observed_endpoint: SocketAddr,
    roster: Mutex<Vec<Identity>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// A connected client. Clones share one session, which closes when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.inner.identity)
            .field("relay", &self.inner.relay_endpoint)
            .field("closed", &self.inner.session.is_closed())
            .finish()
    }
}

impl Client {
    /// Connect to `relay` as `identity`. Envelopes the relay delivers are dispatched through
    /// `registry` with this client as context.
    pub async fn connect(
        relay: SocketAddr,
        identity: Identity,
        options: &ClientOptions,
        registry: Registry<Client>,
    ) -> Result<Client> {
        let limit = options.handshake_timeout;
        let stream = timeout(limit, connect_reusable(relay))
            .await
            .map_err(|_| NodeError::timeout("relay connect"))??;
        if let Err(e) = set_keepalive(&stream, options.keepalive) {
            debug!(error = %e, "keepalive not set");
        }
        let local_endpoint = stream.local_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let keypair = HandshakeKeypair::generate();
        let request = HandshakeRequest {
            identity,
            protocol: PROTOCOL_TAG.to_string(),
            public_key: keypair.public_key().clone(),
        };
        timeout(limit, write_message(&mut writer, &request))
            .await
            .map_err(|_| NodeError::timeout("handshake request"))??;
        let response: HandshakeResponse = timeout(limit, read_message(&mut reader))
            .await
            .map_err(|_| NodeError::timeout("handshake response"))??;
        if !response.result.is_success() {
            return Err(NodeError::Rejected(response.result));
        }
        let sealed = response
            .sealed()
            .ok_or(NodeError::Rejected(ResultCode::AssertFailed))?;
        let key = keypair.open_session_key(&sealed)?;

        let pending = session::open(
            reader,
            writer,
            identity,
            &key,
            Role::Client,
            options.max_backlog_bytes,
        );
        let inner = Arc::new(ClientInner {
            identity,
            session: pending.handle().clone(),
            relay_endpoint: relay,
            local_endpoint,
            observed_endpoint: response.observed_endpoint,
            roster: Mutex::new(Vec::new()),
        });
        pending.start(Arc::new(ClientSink {
            client: Arc::downgrade(&inner),
            registry,
        }));
        info!(%identity, %relay, observed = %response.observed_endpoint, "connected to relay");
        Ok(Client { inner })
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    pub fn relay_endpoint(&self) -> SocketAddr {
        self.inner.relay_endpoint
    }

    /// Local address of the relay connection.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.inner.local_endpoint
    }

    /// Our address as the relay saw it.
    pub fn observed_endpoint(&self) -> SocketAddr {
        self.inner.observed_endpoint
    }

    /// Last roster the relay published.
    pub fn roster(&self) -> Vec<Identity> {
        self.inner.roster.lock().clone()
    }

    /// Send to a client, to every client (`Identity::RELAY`), or to a group (negative identity).
    pub fn send(&self, target: Identity, path: &str, payload: Vec<u8>) -> Result<()> {
        self.inner
            .session
            .enqueue(&Envelope::new(self.inner.identity, target, path, payload))
    }

    /// Replace this client's group subscriptions.
    pub fn subscribe(&self, groups: &[Identity]) -> Result<()> {
        let payload = wire::encode_payload(&groups)?;
        self.send(Identity::RELAY, paths::GROUP_SUBSCRIBE, payload)
    }

    pub fn close(&self) {
        self.inner.session.close();
    }

    pub async fn closed(&self) {
        self.inner.session.closed().await;
    }
}

struct ClientSink {
    client: Weak<ClientInner>,
    registry: Registry<Client>,
}

impl SessionSink for ClientSink {
    fn on_envelope(&self, _session: &SessionHandle, envelope: Envelope) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let client = Client { inner };
        if envelope.path == paths::ROSTER && envelope.source == Identity::RELAY {
            match wire::decode_payload::<Vec<Identity>>(&envelope.payload) {
                Ok(roster) => *client.inner.roster.lock() = roster,
                Err(e) => warn!(error = %e, "malformed roster"),
            }
            self.registry.try_dispatch(&client, &envelope);
            return;
        }
        self.registry.dispatch(&client, &envelope);
    }

    fn on_closed(&self, session: &SessionHandle, reason: &CloseReason) {
        info!(identity = %session.identity(), %reason, "relay session closed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::listener::Listener;

    async fn relay(config: Config) -> (Arc<Listener>, SocketAddr) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::new(config);
        tokio::spawn(listener.clone().serve(tcp));
        (listener, addr)
    }

    fn options() -> ClientOptions {
        ClientOptions::from(&Config::default())
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn endpoints_are_reported() {
        let (_relay, addr) = relay(Config::default()).await;
        let c = Client::connect(addr, Identity(1), &options(), Registry::new())
            .await
            .unwrap();
        assert_eq!(c.identity(), Identity(1));
        assert_eq!(c.relay_endpoint(), addr);
        assert_eq!(c.observed_endpoint(), c.local_endpoint());
    }

    #[tokio::test]
    async fn handlers_can_reply_through_their_client() {
        let (_relay, addr) = relay(Config::default()).await;
        let echo = Registry::new().on("ping", |c: &Client, env: &Envelope| {
            let _ = c.send(env.source, "pong", env.payload.clone());
        });
        let _echo = Client::connect(addr, Identity(2), &options(), echo)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let asker = Registry::new().on("pong", move |_: &Client, env: &Envelope| {
            let _ = tx.send(env.payload.clone());
        });
        let asker = Client::connect(addr, Identity(1), &options(), asker)
            .await
            .unwrap();
        asker.send(Identity(2), "ping", b"42".to_vec()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"42");
    }

    #[tokio::test]
    async fn roster_follows_joins() {
        let (_relay, addr) = relay(Config::default()).await;
        let a = Client::connect(addr, Identity(3), &options(), Registry::new())
            .await
            .unwrap();
        wait_for(|| a.roster() == vec![Identity(3)]).await;
        let _b = Client::connect(addr, Identity(1), &options(), Registry::new())
            .await
            .unwrap();
        wait_for(|| a.roster() == vec![Identity(1), Identity(3)]).await;
    }

    #[tokio::test]
    async fn forged_roster_is_ignored() {
        let (_relay, addr) = relay(Config::default()).await;
        let a = Client::connect(addr, Identity(1), &options(), Registry::new())
            .await
            .unwrap();
        let b = Client::connect(addr, Identity(2), &options(), Registry::new())
            .await
            .unwrap();
        wait_for(|| a.roster() == vec![Identity(1), Identity(2)]).await;
        let fake = wire::encode_payload(&vec![Identity(99)]).unwrap();
        b.send(Identity(1), paths::ROSTER, fake).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.roster(), vec![Identity(1), Identity(2)]);
    }

    #[tokio::test]
    async fn dropping_last_clone_closes_session() {
        let (relay, addr) = relay(Config::default()).await;
        let a = Client::connect(addr, Identity(4), &options(), Registry::new())
            .await
            .unwrap();
        let copy = a.clone();
        drop(a);
        assert!(!copy.session().is_closed());
        drop(copy);
        wait_for(|| relay.roster().is_empty()).await;
    }

    #[tokio::test]
    async fn missing_relay_is_an_io_error() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        drop(tcp);
        let err = Client::connect(addr, Identity(1), &options(), Registry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }

    #[tokio::test]
    async fn silent_relay_times_out_awaiting_response() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mute = tokio::spawn(async move {
            let (stream, _) = tcp.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });
        let options = ClientOptions {
            handshake_timeout: Duration::from_millis(200),
            ..options()
        };
        let err = Client::connect(addr, Identity(1), &options, Registry::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, NodeError::Timeout { phase: "handshake response" }),
            "unexpected error: {err}"
        );
        mute.abort();
    }
}
