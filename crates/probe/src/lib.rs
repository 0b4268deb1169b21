//! Servprobe Probe - transport layer of the probing engine
//!
//! Opens connections (directly or through SOCKS5 / HTTP CONNECT chains),
//! writes probe payloads and reads banners until they settle. Knows nothing
//! about rules; the engine decides what to send and how to read the reply.

mod banner;
mod client;
mod dial;
mod rdp;
mod udp;

pub use banner::{display_banner, BannerReader, DEFAULT_DATA_SIZE};
pub use client::ProbeClient;
pub use dial::{tunnel, Dialer, ProxyEndpoint, ProxyKind};
pub use rdp::{lookup_rdp_signature, RdpSignature, RDP_NEGOTIATION_REQUEST};
pub use udp::{udp_exchange, UdpReply};
