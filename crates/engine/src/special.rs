//! Post-match corrections for banners the rules cannot settle alone

use tracing::debug;

use servprobe_common::FingerprintInfo;
use servprobe_probe::{lookup_rdp_signature, ProbeClient};

const RDP_SERVICES: [&str; 2] = ["ms-wbt-server", "rdp"];

/// Banner markers that reveal a proxy behind a generic http match.
const PROXY_MARKERS: [&str; 5] = [
    "Proxy-Agent:",
    "Proxy-Authenticate:",
    "Proxy-Connection:",
    " 407 Proxy Authentication Required",
    "Via: 1.1 squid",
];

/// Re-label an http match whose banner carries proxy headers.
pub fn correct_proxy_banner(info: &mut FingerprintInfo) -> bool {
    if info.service_name != "http" && !info.service_name.is_empty() {
        return false;
    }
    let banner = info.banner.as_str();
    if !banner.starts_with("HTTP/") {
        return false;
    }
    let lower = banner.to_ascii_lowercase();
    let hit = PROXY_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()));
    if hit {
        debug!(ip = %info.ip, port = info.port, "http banner carries proxy headers");
        info.service_name = "http-proxy".to_string();
    }
    hit
}

#[must_use]
pub fn is_rdp(info: &FingerprintInfo) -> bool {
    RDP_SERVICES.contains(&info.service_name.as_str())
}

/// Run the RDP negotiation handshake and fold a known signature into `info`.
pub async fn enrich_rdp(info: &mut FingerprintInfo, client: &ProbeClient) -> bool {
    let reply = match client.rdp_negotiate(&info.ip, info.port).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(ip = %info.ip, port = info.port, error = %e, "rdp negotiation failed");
            return false;
        }
    };
    let Some(sig) = lookup_rdp_signature(&reply) else {
        debug!(bytes = reply.len(), "unrecognised rdp negotiation reply");
        return false;
    };
    if info.operation_verbose.is_empty() || info.operation_verbose == "Windows" {
        info.operation_verbose = sig.operation_verbose.to_string();
    }
    for cpe in sig.cpes {
        if !info.cpes.iter().any(|c| c == cpe) {
            info.cpes.push((*cpe).to_string());
        }
    }
    true
}

/// Apply every correction that fits `info`.
pub async fn apply_special_cases(info: &mut FingerprintInfo, client: &ProbeClient) {
    correct_proxy_banner(info);
    if is_rdp(info) {
        enrich_rdp(info, client).await;
    }
}
