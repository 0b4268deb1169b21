//! Single-datagram UDP exchange

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use servprobe_common::{FingerprintError, FingerprintResult};

/// Outcome of sending one datagram and waiting for one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpReply {
    Data(Vec<u8>),
    /// Nothing came back before the timeout.
    Silent,
}

/// Send `payload` to `host:port` and wait for a single reply datagram.
///
/// An empty payload is rejected since UDP has nothing to listen for. Send
/// failures and ICMP port-unreachable come back as `Network`.
pub async fn udp_exchange(
    host: &str,
    port: u16,
    payload: &[u8],
    wait: Duration,
    budget: usize,
) -> FingerprintResult<UdpReply> {
    if payload.is_empty() {
        return Err(FingerprintError::Protocol("UDP cannot support null banner".into()));
    }

    let target = lookup_host((host, port))
        .await
        .map_err(|e| FingerprintError::Resolve(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| FingerprintError::Resolve(format!("{host}: no address")))?;

    let local: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0u8; 4], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket
        .connect(target)
        .await
        .map_err(|e| FingerprintError::Network(format!("udp connect {target}: {e}")))?;

    match timeout(wait, socket.send(payload)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(FingerprintError::Network(format!("udp send {target}: {e}"))),
        Err(_) => return Err(FingerprintError::Timeout(format!("udp send {target}"))),
    }
    trace!(%target, bytes = payload.len(), "datagram sent");

    let mut buf = vec![0u8; budget.max(1).min(u16::MAX as usize)];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            debug!(%target, bytes = n, "udp reply");
            Ok(UdpReply::Data(buf))
        }
        Ok(Err(e)) => Err(FingerprintError::Network(format!("udp recv {target}: {e}"))),
        Err(_) => Ok(UdpReply::Silent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_reply_is_returned() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"\x00\x06ping");
            server.send_to(b"\x00\x06\x81\x80pong", peer).await.unwrap();
        });

        let reply = udp_exchange("127.0.0.1", port, b"\x00\x06ping", Duration::from_secs(2), 1024)
            .await
            .unwrap();
        assert_eq!(reply, UdpReply::Data(b"\x00\x06\x81\x80pong".to_vec()));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let reply = udp_exchange("127.0.0.1", port, b"x", Duration::from_millis(200), 1024)
            .await
            .unwrap();
        assert_eq!(reply, UdpReply::Silent);
        drop(server);
    }

    #[tokio::test]
    async fn empty_payload_is_protocol_error() {
        let err = udp_exchange("127.0.0.1", 53, b"", Duration::from_millis(100), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, FingerprintError::Protocol(ref m) if m.contains("null banner")));
    }
}
