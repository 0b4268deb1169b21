//! Outbound TCP dialing, direct or through a proxy chain
//!
//! Supported hops are SOCKS5 (optionally with username/password) and HTTP
//! `CONNECT`. A chain `[a, b]` dials `a`, asks `a` for a tunnel to `b`, then
//! asks `b` for a tunnel to the target.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use servprobe_common::{FingerprintError, FingerprintResult};

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    HttpConnect,
}

/// One hop of a proxy chain, parsed from `socks5://[user:pass@]host:port`
/// or `http://host:port`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials.as_ref().map(|_| "***"))
            .finish()
    }
}

impl FromStr for ProxyEndpoint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| FingerprintError::Config(format!("proxy {s:?}: {why}"));

        let (scheme, rest) = s.trim().split_once("://").ok_or_else(|| bad("missing scheme"))?;
        let kind = match scheme.to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => ProxyKind::Socks5,
            "http" => ProxyKind::HttpConnect,
            _ => return Err(bad("unsupported scheme")),
        };
        let rest = rest.trim_end_matches('/');

        let (credentials, authority) = match rest.rsplit_once('@') {
            Some((userinfo, authority)) => {
                let (user, pass) = userinfo.split_once(':').unwrap_or((userinfo, ""));
                (Some((user.to_string(), pass.to_string())), authority)
            }
            None => (None, rest),
        };
        if credentials.is_some() && kind == ProxyKind::HttpConnect {
            return Err(bad("credentials are only supported for socks5"));
        }

        let (host, port) = split_host_port(authority).ok_or_else(|| bad("expected host:port"))?;
        Ok(Self {
            kind,
            host,
            port,
            credentials,
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::HttpConnect => "http",
        };
        write!(f, "{scheme}://{}", authority(&self.host, self.port))
    }
}

fn split_host_port(authority: &str) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host.to_string(), port.parse().ok()?));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Dials targets with a connect timeout, optionally via proxies.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    proxies: Vec<ProxyEndpoint>,
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            proxies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Vec<ProxyEndpoint>) -> Self {
        self.proxies = proxies;
        self
    }

    #[must_use]
    pub fn proxies(&self) -> &[ProxyEndpoint] {
        &self.proxies
    }

    /// Open a stream to `host:port`. The whole chain shares one timeout.
    ///
    /// Any failure is reported as `FingerprintError::Network`.
    #[instrument(level = "debug", skip(self), fields(hops = self.proxies.len()))]
    pub async fn connect(&self, host: &str, port: u16) -> FingerprintResult<TcpStream> {
        match timeout(self.connect_timeout, self.connect_inner(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(FingerprintError::Network(format!(
                "dial {} timed out after {:?}",
                authority(host, port),
                self.connect_timeout
            ))),
        }
    }

    async fn connect_inner(&self, host: &str, port: u16) -> FingerprintResult<TcpStream> {
        let Some(first) = self.proxies.first() else {
            return TcpStream::connect((host, port)).await.map_err(|e| {
                FingerprintError::Network(format!("dial {}: {e}", authority(host, port)))
            });
        };

        let mut stream = TcpStream::connect((first.host.as_str(), first.port))
            .await
            .map_err(|e| FingerprintError::Network(format!("dial proxy {first}: {e}")))?;

        for (idx, hop) in self.proxies.iter().enumerate() {
            let (next_host, next_port) = match self.proxies.get(idx + 1) {
                Some(next) => (next.host.as_str(), next.port),
                None => (host, port),
            };
            debug!(proxy = %hop, next = %authority(next_host, next_port), "opening tunnel");
            tunnel(&mut stream, hop, next_host, next_port).await?;
        }
        Ok(stream)
    }
}

/// Ask `hop` (already connected on `stream`) to tunnel to `host:port`.
pub async fn tunnel<S>(stream: &mut S, hop: &ProxyEndpoint, host: &str, port: u16) -> FingerprintResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match hop.kind {
        ProxyKind::Socks5 => socks5_connect(stream, hop.credentials.as_ref(), host, port).await,
        ProxyKind::HttpConnect => http_connect(stream, host, port).await,
    };
    result.map_err(|e| match e {
        FingerprintError::Io(io) => FingerprintError::Network(format!("proxy {hop}: {io}")),
        FingerprintError::Protocol(msg) => FingerprintError::Network(format!("proxy {hop}: {msg}")),
        other => other,
    })
}

async fn socks5_connect<S>(
    stream: &mut S,
    credentials: Option<&(String, String)>,
    host: &str,
    port: u16,
) -> FingerprintResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(FingerprintError::Protocol(format!("socks version {:#04x}", choice[0])));
    }
    match (choice[1], credentials) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => {
            let (user, pass) = (user.as_bytes(), pass.as_bytes());
            if user.len() > 255 || pass.len() > 255 {
                return Err(FingerprintError::Config("socks5 credentials too long".into()));
            }
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(FingerprintError::Protocol("socks5 authentication rejected".into()));
            }
        }
        (method, _) => {
            return Err(FingerprintError::Protocol(format!(
                "socks5 refused auth methods (got {method:#04x})"
            )))
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > 255 {
                return Err(FingerprintError::Config(format!("hostname too long: {host}")));
            }
            request.push(0x03);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(FingerprintError::Protocol(format!("socks5 connect failed, reply {:#04x}", head[1])));
    }
    let skip = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(FingerprintError::Protocol(format!("socks5 address type {other:#04x}")))
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn http_connect<S>(stream: &mut S, host: &str, port: u16) -> FingerprintResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(host, port);
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // byte-wise so nothing past the header is consumed
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(FingerprintError::Protocol("CONNECT response too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(FingerprintError::Protocol("proxy closed during CONNECT".into()));
        }
        response.push(byte[0]);
    }

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .map(|l| String::from_utf8_lossy(l).trim().to_string())
        .unwrap_or_default();
    let code = status_line.split_whitespace().nth(1).unwrap_or("");
    if code.starts_with('2') {
        Ok(())
    } else {
        Err(FingerprintError::Protocol(format!("CONNECT rejected: {status_line}")))
    }
}
