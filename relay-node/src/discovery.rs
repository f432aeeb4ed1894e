//! LAN discovery: answer broadcast queries with the relay's record, and probe for relays.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{discovery, DiscoveryRecord};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::listener::Listener;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Bind the responder socket on all interfaces with address reuse and broadcast enabled.
pub fn bind_responder(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Answer every well-formed query with a fresh snapshot of the relay. Anything else is ignored.
pub async fn run_responder(socket: UdpSocket, listener: Arc<Listener>) -> std::io::Result<()> {
    info!(addr = %socket.local_addr()?, "discovery responder listening");
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(reply) = discovery::answer(&buf[..n], &listener.discovery_record()) else {
            trace!(%from, len = n, "ignored datagram");
            continue;
        };
        if let Err(e) = socket.send_to(&reply, from).await {
            debug!(%from, error = %e, "discovery reply failed");
        }
    }
}

/// Send one query to `target` (usually a broadcast address) and collect replies for `wait`.
/// Each result pairs the relay's session endpoint with its record.
pub async fn probe(target: SocketAddr, wait: Duration) -> std::io::Result<Vec<(SocketAddr, DiscoveryRecord)>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let query = discovery::query_datagram()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    socket.send_to(&query, target).await?;

    let deadline = Instant::now() + wait;
    let mut found: Vec<(SocketAddr, DiscoveryRecord)> = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (n, from) = match received {
            Err(_) => break,
            Ok(Err(e)) => {
                debug!(error = %e, "probe receive failed");
                continue;
            }
            Ok(Ok(r)) => r,
        };
        let Some(record) = discovery::parse_record(&buf[..n]) else {
            continue;
        };
        let relay = SocketAddr::new(from.ip(), record.port);
        if found.iter().all(|(addr, _)| *addr != relay) {
            debug!(%relay, name = %record.name, "relay found");
            found.push((relay, record));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions};
    use crate::config::Config;
    use relay_core::{Identity, Registry, PROTOCOL_TAG};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_finds_responder() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = tcp.local_addr().unwrap();
        let config = Config {
            name: "bench".to_string(),
            max_clients: 3,
            ..Config::default()
        };
        let listener = Listener::new(config.clone());
        tokio::spawn(listener.clone().serve(tcp));
        let _c = Client::connect(relay_addr, Identity(1), &ClientOptions::from(&config), Registry::new())
            .await
            .unwrap();

        let udp = bind_responder(0).unwrap();
        let port = udp.local_addr().unwrap().port();
        tokio::spawn(run_responder(udp, listener));

        let found = probe(
            SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        let (addr, record) = &found[0];
        assert_eq!(*addr, relay_addr);
        assert_eq!(record.protocol, PROTOCOL_TAG);
        assert_eq!(record.name, "bench");
        assert_eq!(record.current, 1);
        assert_eq!(record.max, 3);
    }

    #[tokio::test]
    async fn responder_ignores_garbage() {
        let listener = Listener::new(Config::default());
        let udp = bind_responder(0).unwrap();
        let port = udp.local_addr().unwrap().port();
        tokio::spawn(run_responder(udp, listener));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"hello?", ("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 512];
        let got = tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn probe_with_no_relay_is_empty() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let found = probe(silent.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
