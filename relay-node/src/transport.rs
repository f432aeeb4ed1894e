//! Stream transport: length-prefixed frames over async streams, socket options.

use std::net::SocketAddr;

use relay_core::wire::{self, LEN_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::Keepalive;
use crate::error::Result;

/// Read one length-prefixed block.
pub async fn read_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = wire::block_len(len_buf)?;
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await?;
    Ok(block)
}

/// Write one length-prefixed block and flush.
pub async fn write_block<W: AsyncWrite + Unpin>(writer: &mut W, block: &[u8]) -> Result<()> {
    let frame = wire::frame_block(block)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one unencrypted bincode frame (handshake, token, directory entry header).
pub async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(reader: &mut R) -> Result<T> {
    let block = read_block(reader).await?;
    Ok(wire::decode_payload(&block)?)
}

pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(writer: &mut W, msg: &T) -> Result<()> {
    let frame = wire::encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Enable TCP keepalive probes on an established stream.
pub fn set_keepalive(stream: &TcpStream, keepalive: Keepalive) -> std::io::Result<()> {
    let params = TcpKeepalive::new()
        .with_time(keepalive.time)
        .with_interval(keepalive.interval);
    SockRef::from(stream).set_tcp_keepalive(&params)
}

fn reusable_socket(addr: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Connect with address reuse enabled so a listener can later share the local endpoint.
pub async fn connect_reusable(remote: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = reusable_socket(remote)?;
    socket.connect(remote).await
}

/// Listen on `local`, which may already be the local endpoint of a reusable outbound stream.
pub fn listen_reusable(local: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = reusable_socket(local)?;
    socket.bind(local)?;
    socket.listen(128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Envelope, Identity};

    #[tokio::test]
    async fn blocks_cross_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_block(&mut a, b"first").await.unwrap();
            write_block(&mut a, &[]).await.unwrap();
            write_message(&mut a, &Envelope::new(Identity(1), Identity(2), "p", vec![9]))
                .await
                .unwrap();
        });
        assert_eq!(read_block(&mut b).await.unwrap(), b"first");
        assert!(read_block(&mut b).await.unwrap().is_empty());
        let env: Envelope = read_message(&mut b).await.unwrap();
        assert_eq!(env.payload, vec![9]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(read_block(&mut b).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn listener_shares_outbound_endpoint() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let outbound = connect_reusable(server_addr).await.unwrap();
        let local = outbound.local_addr().unwrap();
        let _accepted = server.accept().await.unwrap();

        let secondary = listen_reusable(local).unwrap();
        assert_eq!(secondary.local_addr().unwrap(), local);
        let dialer = tokio::spawn(async move { TcpStream::connect(local).await.is_ok() });
        let (_inbound, _) = secondary.accept().await.unwrap();
        assert!(dialer.await.unwrap());
    }
}
