//! Per-block probing state machine
//!
//! One block goes from unresolved to exactly one of Open, Closed or Unknown:
//!
//! | transport | outcome of the exchange                 | state   |
//! |-----------|-----------------------------------------|---------|
//! | tcp       | dial failed                             | Closed  |
//! | tcp       | connected, empty payload                | Open    |
//! | tcp       | payload sent, banner received           | Open    |
//! | tcp       | payload sent, nothing came back         | Unknown |
//! | udp       | reply received                          | Open    |
//! | udp       | send failed / port unreachable          | Closed  |
//! | udp       | no reply, or empty payload              | Unknown |
//!
//! Any other failure (write error, timeout, cancelled before sending) is
//! Unknown and carries its error.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use servprobe_common::{FingerprintError, FingerprintInfo, PortState, Transport};
use servprobe_probe::{display_banner, ProbeClient, UdpReply};
use servprobe_rules::{to_match_text, Match};

use crate::config::Config;
use crate::selector::RuleBlock;

/// Slack on top of the probe timeout before an attempt is abandoned.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// Address of the service being probed; `ip` is what gets dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub ip: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

/// What one block produced.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub state: PortState,
    pub info: Option<FingerprintInfo>,
    pub error: Option<FingerprintError>,
}

impl ProbeOutcome {
    fn open(info: FingerprintInfo) -> Self {
        Self {
            state: PortState::Open,
            info: Some(info),
            error: None,
        }
    }

    fn unknown(error: Option<FingerprintError>) -> Self {
        Self {
            state: PortState::Unknown,
            info: None,
            error,
        }
    }

    pub(crate) fn failed(error: FingerprintError) -> Self {
        let state = if error.is_connect_failure() {
            PortState::Closed
        } else {
            PortState::Unknown
        };
        Self {
            state,
            info: None,
            error: Some(error),
        }
    }
}

/// First match in declaration order wins.
#[must_use]
pub fn match_banner(matches: &[Arc<Match>], banner: &[u8]) -> Option<(Arc<Match>, FingerprintInfo)> {
    if banner.is_empty() {
        return None;
    }
    let text = to_match_text(banner);
    matches.iter().find_map(|m| {
        let groups = m.find(&text)?;
        let fields = m.resolve(&groups);
        let info = FingerprintInfo {
            service_name: m.service_name.clone(),
            product_verbose: fields.product_verbose,
            version: fields.version,
            info: fields.info,
            hostname: fields.hostname,
            operation_verbose: fields.operation_verbose,
            device_type: fields.device_type,
            cpes: fields.cpes,
            raw: m.raw_line.clone(),
            ..Default::default()
        };
        Some((Arc::clone(m), info))
    })
}

fn fingerprint_banner(target: &ProbeTarget, block: &RuleBlock, banner: &[u8]) -> FingerprintInfo {
    let transport = block.probe.transport;
    let mut info = match match_banner(&block.matches, banner) {
        Some((rule, info)) => {
            debug!(probe = %block.probe.name, service = %rule.service_name, "rule matched");
            info
        }
        None => FingerprintInfo::default(),
    };
    info.ip = target.ip.clone();
    info.port = target.port;
    info.transport = Some(transport);
    info.banner = display_banner(banner);
    info
}

/// Send one block's probe and classify the result.
///
/// Never returns an error: failures are folded into the outcome. `cancel` is
/// only checked before the exchange starts; a probe already on the wire runs
/// until its deadline or until the peer closes.
pub async fn probe_block(
    target: &ProbeTarget,
    block: &RuleBlock,
    client: &ProbeClient,
    config: &Config,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let budget = config.probe_timeout + PROBE_GRACE;

    let outcome = if cancel.is_cancelled() {
        ProbeOutcome::unknown(Some(FingerprintError::Cancelled))
    } else {
        match timeout(budget, exchange(target, block, client)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::unknown(Some(FingerprintError::Timeout(format!(
                "probe {} on {}:{} exceeded {:?}",
                block.probe.name, target.ip, target.port, budget
            )))),
        }
    };

    if config.debug_log {
        debug!(probe = %block.probe.name, state = %outcome.state, error = ?outcome.error, "probe finished");
    } else {
        trace!(probe = %block.probe.name, state = %outcome.state, "probe finished");
    }
    outcome
}

async fn exchange(target: &ProbeTarget, block: &RuleBlock, client: &ProbeClient) -> ProbeOutcome {
    let probe = &block.probe;
    match probe.transport {
        Transport::TCP => match client.exchange_tcp(&target.ip, target.port, &probe.payload).await {
            Ok(banner) if !banner.is_empty() => ProbeOutcome::open(fingerprint_banner(target, block, &banner)),
            Ok(_) if probe.is_empty_payload() => {
                ProbeOutcome::open(FingerprintInfo::new(target.ip.clone(), target.port, Transport::TCP))
            }
            Ok(_) => ProbeOutcome::unknown(None),
            Err(e) => ProbeOutcome::failed(e),
        },
        Transport::UDP => match client.exchange_udp(&target.ip, target.port, &probe.payload).await {
            Ok(UdpReply::Data(reply)) => ProbeOutcome::open(fingerprint_banner(target, block, &reply)),
            Ok(UdpReply::Silent) => ProbeOutcome::unknown(None),
            Err(e) => ProbeOutcome::failed(e),
        },
    }
}
