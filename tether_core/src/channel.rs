//! Transport plumbing.
//!
//! Reliable channel: length-prefixed frames (`u32` little-endian byte count,
//! then the payload) over an ordered byte stream. Writes go through a single
//! writer task fed by a queue so each (length, payload) pair hits the stream
//! back to back; serialization happens before enqueueing and never stalls
//! other senders.
//!
//! Unreliable channel: one message per datagram. Client-originated datagrams
//! carry the sender's `NetworkId` as a `u16` little-endian prefix for
//! listener-side routing; server-originated datagrams are bare because the
//! receiver has exactly one peer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::NetworkId;

/// Upper bound on a single reliable frame; a larger prefix is stream
/// corruption, not a message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Receive buffer size for datagrams.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Upper bound on a handshake type name.
const MAX_NAME_LEN: usize = 4096;

/// Reads one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await
}

/// Single consumer of the outbound queue. Returns when the queue closes
/// (orderly teardown) or the stream fails.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut stream: W,
) -> io::Result<()> {
    while let Some(payload) = rx.recv().await {
        write_frame(&mut stream, &payload).await?;
    }
    Ok(())
}

pub async fn write_u16<W: AsyncWrite + Unpin>(stream: &mut W, value: u16) -> io::Result<()> {
    stream.write_all(&value.to_le_bytes()).await
}

pub async fn read_u16<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_le_bytes(buf))
}

/// Handshake type name: `u16` little-endian length, then UTF-8 bytes.
pub async fn write_name<W: AsyncWrite + Unpin>(stream: &mut W, name: &str) -> io::Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "type name too long",
        ));
    }
    write_u16(stream, name.len() as u16).await?;
    stream.write_all(name.as_bytes()).await
}

pub async fn read_name<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<String> {
    let len = read_u16(stream).await? as usize;
    if len > MAX_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "type name too long",
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "type name is not UTF-8"))
}

/// Outbound side of the unreliable channel.
#[derive(Debug, Clone)]
pub enum DatagramLink {
    /// Connecting side: socket connected to the peer, every frame prefixed
    /// with our network id so the listener can route it.
    Connected {
        socket: Arc<UdpSocket>,
        net_id: NetworkId,
    },
    /// Accepting side: listener-shared socket, bare frames sent to the
    /// peer's unreliable address.
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl DatagramLink {
    /// Largest payload this link can carry in one datagram; the connecting
    /// side spends two bytes on the routing prefix.
    pub fn max_payload(&self) -> usize {
        match self {
            DatagramLink::Connected { .. } => MAX_DATAGRAM_LEN - 2,
            DatagramLink::Shared { .. } => MAX_DATAGRAM_LEN,
        }
    }

    /// Fire-and-forget send. Callers opted out of delivery feedback, so
    /// transport errors are logged and dropped here.
    pub fn send(&self, payload: &[u8]) {
        if payload.len() > self.max_payload() {
            debug!(len = payload.len(), "dropping oversized datagram");
            return;
        }
        match self {
            DatagramLink::Connected { socket, net_id } => {
                let mut buf = BytesMut::with_capacity(2 + payload.len());
                buf.put_u16_le(net_id.0);
                buf.extend_from_slice(payload);
                if let Err(err) = socket.try_send(&buf) {
                    debug!(error = %err, "unreliable send dropped");
                }
            }
            DatagramLink::Shared { socket, peer } => {
                if let Err(err) = socket.try_send_to(payload, *peer) {
                    debug!(error = %err, %peer, "unreliable send dropped");
                }
            }
        }
    }
}

/// Maps a peer IP into the family of the local unreliable socket: a
/// dual-stack (IPv6) socket reaches IPv4 peers through mapped addresses,
/// while an IPv4 socket keeps the address as-is.
pub fn normalize_peer_ip(local: IpAddr, peer: IpAddr) -> IpAddr {
    match (local, peer) {
        (IpAddr::V6(_), IpAddr::V4(v4)) => IpAddr::V6(v4.to_ipv6_mapped()),
        _ => peer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        let first = read_frame(&mut b).await.unwrap();
        let second = read_frame(&mut b).await.unwrap();
        assert_eq!(&first[..], b"hello frame");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn oversized_prefix_is_invalid_data() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn handshake_fields_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_u16(&mut a, 513).await.unwrap();
        write_name(&mut a, "tether.tests.RootService").await.unwrap();
        assert_eq!(read_u16(&mut b).await.unwrap(), 513);
        assert_eq!(read_name(&mut b).await.unwrap(), "tether.tests.RootService");
    }

    #[tokio::test]
    async fn prefix_reserves_payload_room_only_on_the_connected_side() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let connected = DatagramLink::Connected {
            socket: socket.clone(),
            net_id: NetworkId(1),
        };
        let shared = DatagramLink::Shared {
            socket,
            peer: "127.0.0.1:9".parse().unwrap(),
        };
        assert_eq!(connected.max_payload(), MAX_DATAGRAM_LEN - 2);
        assert_eq!(shared.max_payload(), MAX_DATAGRAM_LEN);
    }

    #[test]
    fn v4_peer_maps_into_v6_socket_family() {
        let v6_local: IpAddr = "::".parse().unwrap();
        let v4_local: IpAddr = "0.0.0.0".parse().unwrap();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            normalize_peer_ip(v6_local, peer),
            "::ffff:127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(normalize_peer_ip(v4_local, peer), peer);
    }
}
