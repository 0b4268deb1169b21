//! Stabilized banner reads and banner text conversion

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, trace};

use servprobe_common::{FingerprintError, FingerprintResult};

/// Default byte budget for a single banner.
pub const DEFAULT_DATA_SIZE: usize = 20 * 1024;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
const READ_CHUNK: usize = 4096;

/// Reads a banner until it stops growing.
///
/// The first byte may take up to the whole timeout to arrive. After that the
/// buffer is considered settled once a poll interval passes without new
/// data, the peer closes, or the byte budget is reached.
#[derive(Debug, Clone)]
pub struct BannerReader {
    timeout: Duration,
    poll_interval: Duration,
    budget: usize,
}

impl BannerReader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            budget: DEFAULT_DATA_SIZE,
        }
    }

    /// Upper bound on collected bytes; zero falls back to the default.
    #[must_use]
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = if budget == 0 { DEFAULT_DATA_SIZE } else { budget };
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[inline]
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Collect a banner from `reader`. An empty buffer means nothing arrived.
    ///
    /// A read error before any data is an error; after some data it just ends
    /// the read.
    #[instrument(level = "trace", skip(self, reader))]
    pub async fn read<R>(&self, reader: &mut R) -> FingerprintResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + self.timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK.min(self.budget));
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                trace!(bytes = buf.len(), "banner deadline reached");
                break;
            }
            let wait = if buf.is_empty() {
                remaining
            } else {
                self.poll_interval.min(remaining)
            };

            match timeout(wait, reader.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    trace!(bytes = buf.len(), "peer closed");
                    break;
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() >= self.budget {
                        buf.truncate(self.budget);
                        debug!(budget = self.budget, "banner budget reached");
                        break;
                    }
                }
                Ok(Err(e)) if buf.is_empty() => return Err(FingerprintError::Io(e)),
                Ok(Err(e)) => {
                    debug!(error = %e, bytes = buf.len(), "read error after data, keeping banner");
                    break;
                }
                Err(_) => {
                    trace!(bytes = buf.len(), "banner settled");
                    break;
                }
            }
        }
        Ok(buf)
    }
}

/// Printable form of a banner for display and storage.
///
/// UTF-8 is kept as is, otherwise GBK is tried, otherwise bytes are escaped.
/// Control characters other than CR, LF and TAB are always escaped.
#[must_use]
pub fn display_banner(banner: &[u8]) -> String {
    let decoded: String = match std::str::from_utf8(banner) {
        Ok(text) => text.to_string(),
        Err(_) => match encoding_rs::GBK.decode_without_bom_handling_and_without_replacement(banner)
        {
            Some(text) => text.into_owned(),
            None => return banner.escape_ascii().to_string(),
        },
    };

    let mut out = String::with_capacity(decoded.len());
    for ch in decoded.chars() {
        match ch {
            '\r' | '\n' | '\t' => out.push(ch),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_until_peer_closes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"SSH-2.0-OpenSSH_7.6p1\r\n").await.unwrap();
        });
        let banner = BannerReader::new(Duration::from_secs(2))
            .read(&mut client)
            .await
            .unwrap();
        assert_eq!(banner, b"SSH-2.0-OpenSSH_7.6p1\r\n");
    }

    #[tokio::test]
    async fn stops_when_input_settles() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"220 ready").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(b"\r\n").await.unwrap();
            // keep the pipe open well past the poll interval
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let started = std::time::Instant::now();
        let banner = BannerReader::new(Duration::from_secs(3))
            .with_poll_interval(Duration::from_millis(100))
            .read(&mut client)
            .await
            .unwrap();
        assert_eq!(banner, b"220 ready\r\n");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn truncates_at_budget() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server.write_all(&[b'A'; 512]).await.unwrap();
        });
        let banner = BannerReader::new(Duration::from_secs(2))
            .with_budget(100)
            .read(&mut client)
            .await
            .unwrap();
        assert_eq!(banner.len(), 100);
    }

    #[tokio::test]
    async fn silent_peer_yields_empty_banner() {
        let (mut client, _server) = tokio::io::duplex(64);
        let banner = BannerReader::new(Duration::from_millis(150))
            .read(&mut client)
            .await
            .unwrap();
        assert!(banner.is_empty());
    }

    #[test]
    fn display_forms() {
        assert_eq!(display_banner(b"220 ok\r\n"), "220 ok\r\n");
        assert_eq!(display_banner(b"a\x00b"), "a\\x00b");
        // "中文" in GBK
        assert_eq!(display_banner(&[0xd6, 0xd0, 0xce, 0xc4]), "中文");
        assert_eq!(display_banner(&[0xff, 0xff, 0x01]), "\\xff\\xff\\x01");
    }
}
