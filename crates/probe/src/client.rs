//! Probe client: one payload out, one banner back

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};

use servprobe_common::{FingerprintError, FingerprintResult};

use crate::banner::{BannerReader, DEFAULT_DATA_SIZE};
use crate::dial::{Dialer, ProxyEndpoint};
use crate::rdp::RDP_NEGOTIATION_REQUEST;
use crate::udp::{udp_exchange, UdpReply};

const MAX_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_READ_WINDOW: Duration = Duration::from_millis(100);

/// Sends probe payloads and collects stabilized banners.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    timeout: Duration,
    write_timeout: Duration,
    data_size: usize,
    poll_interval: Option<Duration>,
    proxies: Vec<ProxyEndpoint>,
}

impl ProbeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-probe timeout covering dial, write and banner read.
    /// The write deadline is the smaller of this and two seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.write_timeout = timeout.min(MAX_WRITE_TIMEOUT);
        self
    }

    #[must_use]
    pub fn with_data_size(mut self, size: usize) -> Self {
        self.data_size = size;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Vec<ProxyEndpoint>) -> Self {
        self.proxies = proxies;
        self
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn dialer(&self) -> Dialer {
        Dialer::new(self.timeout).with_proxies(self.proxies.clone())
    }

    fn reader(&self, timeout: Duration) -> BannerReader {
        let reader = BannerReader::new(timeout).with_budget(self.data_size);
        match self.poll_interval {
            Some(interval) => reader.with_poll_interval(interval),
            None => reader,
        }
    }

    /// Dial, send `payload` (if any) and read the banner, all within the
    /// probe timeout.
    ///
    /// Dial failures are `Network` errors. An empty result means the
    /// connection was made but the service stayed silent.
    #[instrument(level = "debug", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn exchange_tcp(&self, host: &str, port: u16, payload: &[u8]) -> FingerprintResult<Vec<u8>> {
        let started = Instant::now();
        let mut stream = self.dialer().connect(host, port).await?;

        if !payload.is_empty() {
            match timeout(self.write_timeout, stream.write_all(payload)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(FingerprintError::Io(e)),
                Err(_) => {
                    return Err(FingerprintError::Timeout(format!(
                        "write to {host}:{port} after {:?}",
                        self.write_timeout
                    )))
                }
            }
        }

        let remaining = self
            .timeout
            .saturating_sub(started.elapsed())
            .max(MIN_READ_WINDOW);
        let banner = self.reader(remaining).read(&mut stream).await?;
        debug!(bytes = banner.len(), "tcp banner");
        Ok(banner)
    }

    /// Send one datagram and wait for one reply.
    #[instrument(level = "debug", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn exchange_udp(&self, host: &str, port: u16, payload: &[u8]) -> FingerprintResult<UdpReply> {
        if !self.proxies.is_empty() {
            debug!("proxies only carry tcp, sending udp directly");
        }
        udp_exchange(host, port, payload, self.timeout, self.data_size).await
    }

    /// Run the RDP negotiation handshake and return the raw reply.
    pub async fn rdp_negotiate(&self, host: &str, port: u16) -> FingerprintResult<Vec<u8>> {
        self.exchange_tcp(host, port, &RDP_NEGOTIATION_REQUEST).await
    }
}

impl Default for ProbeClient {
    fn default() -> Self {
        let timeout = Duration::from_secs(5);
        Self {
            timeout,
            write_timeout: timeout.min(MAX_WRITE_TIMEOUT),
            data_size: DEFAULT_DATA_SIZE,
            poll_interval: None,
            proxies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client() -> ProbeClient {
        ProbeClient::new()
            .with_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn null_probe_reads_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH_7.6p1\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let banner = client().exchange_tcp("127.0.0.1", port, b"").await.unwrap();
        assert_eq!(banner, b"SSH-2.0-OpenSSH_7.6p1\r\n");
    }

    #[tokio::test]
    async fn payload_is_sent_before_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 18];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"GET / HTTP/1.0\r\n\r\n");
            sock.write_all(b"HTTP/1.0 200 OK\r\nServer: nginx/1.18.0\r\n\r\n")
                .await
                .unwrap();
        });

        let banner = client()
            .exchange_tcp("127.0.0.1", port, b"GET / HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        assert!(banner.starts_with(b"HTTP/1.0 200 OK"));
    }

    #[tokio::test]
    async fn silent_service_gives_empty_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let banner = ProbeClient::new()
            .with_timeout(Duration::from_millis(300))
            .exchange_tcp("127.0.0.1", port, b"")
            .await
            .unwrap();
        assert!(banner.is_empty());
    }

    #[tokio::test]
    async fn rdp_negotiation_request_is_written() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 19];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(req, RDP_NEGOTIATION_REQUEST);
            sock.write_all(&[0x03, 0x00, 0x00, 0x0b, 0x06, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00])
                .await
                .unwrap();
        });

        let reply = client().rdp_negotiate("127.0.0.1", port).await.unwrap();
        assert_eq!(reply.len(), 11);
    }
}
