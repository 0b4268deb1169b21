//! Core data types for the servprobe engine
//!
//! `FingerprintInfo` is created fresh for every probe attempt and folded into
//! a single `MatchResult` per (host, port) request. Fields stay `pub` so the
//! merge code in the engine can work on them directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Transport protocol a probe is sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    TCP,
    UDP,
}

impl Transport {
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Transport::TCP => "tcp",
            Transport::UDP => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::TCP),
            "udp" => Ok(Transport::UDP),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// Port state reported by a probe or a whole request.
///
/// Ordered by certainty: `Unknown < Closed < Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PortState {
    Unknown,
    Closed,
    Open,
}

impl Default for PortState {
    fn default() -> Self {
        PortState::Unknown
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Unknown => "unknown",
        };
        f.pad(s)
    }
}

/// One HTTP request/response pair collected by a web detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFlow {
    pub url: String,
    pub is_https: bool,
    pub status_code: u16,
    pub request: String,
    pub response: String,
}

/// Summary of a TLS handshake performed by an external inspector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInspectResult {
    pub version: String,
    pub cipher_suite: String,
    pub subject: String,
    pub issuer: String,
    pub description: String,
}

/// Resolved identification for one port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintInfo {
    pub ip: String,
    pub port: u16,
    pub transport: Option<Transport>,

    pub service_name: String,
    pub product_verbose: String,
    pub info: String,
    pub version: String,
    pub hostname: String,
    pub operation_verbose: String,
    pub device_type: String,
    pub cpes: Vec<String>,

    /// Printable form of the banner the match was made against.
    pub banner: String,
    /// Raw line of the rule that fired; empty when nothing matched.
    pub raw: String,

    pub http_flows: Vec<HttpFlow>,
    pub tls_inspect_results: Vec<TlsInspectResult>,
    pub cpe_from_urls: BTreeMap<String, Vec<String>>,
    pub checked_tls: bool,
}

impl FingerprintInfo {
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            ip: ip.into(),
            port,
            transport: Some(transport),
            ..Default::default()
        }
    }

    /// Whether a rule actually fired for this info.
    #[inline]
    #[must_use]
    pub fn has_match_evidence(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Same endpoint, regardless of which probe produced it.
    #[inline]
    #[must_use]
    pub fn same_endpoint(&self, other: &FingerprintInfo) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// Trim every text field and drop duplicate / empty CPEs.
    pub fn tidy(&mut self) {
        for field in [
            &mut self.service_name,
            &mut self.product_verbose,
            &mut self.info,
            &mut self.version,
            &mut self.hostname,
            &mut self.operation_verbose,
            &mut self.device_type,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        self.cpes = dedup_keep_order(self.cpes.drain(..).map(|c| c.trim().to_string()));
        for cpes in self.cpe_from_urls.values_mut() {
            *cpes = dedup_keep_order(cpes.drain(..));
        }
    }
}

/// Top-level outcome for one (host, port) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub target: String,
    pub port: u16,
    pub state: PortState,
    pub reason: String,
    pub fingerprint: Option<FingerprintInfo>,
}

impl MatchResult {
    #[inline]
    #[must_use]
    pub fn new(target: impl Into<String>, port: u16, state: PortState) -> Self {
        Self {
            target: target.into(),
            port,
            state,
            reason: String::new(),
            fingerprint: None,
        }
    }

    /// Builder: closed result carrying a failure narrative.
    #[must_use]
    pub fn closed(target: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::new(target, port, PortState::Closed).with_reason(reason)
    }

    #[inline]
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_fingerprint(mut self, info: FingerprintInfo) -> Self {
        self.fingerprint = Some(info);
        self
    }

    #[inline]
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, PortState::Open)
    }

    /// Service name, or an empty string when nothing was identified.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.fingerprint
            .as_ref()
            .map(|f| f.service_name.as_str())
            .unwrap_or("")
    }

    /// Fold another result for the same endpoint into this one.
    ///
    /// Used to combine the rule-based outcome (`self`) with a web detector
    /// outcome (`other`). State only moves up in certainty, CPEs are unioned,
    /// service names are slash-joined without repeats, HTTP flows and TLS
    /// results are concatenated and `checked_tls` is OR'd.
    pub fn merge(&mut self, other: &MatchResult) {
        if other.state > self.state {
            self.state = other.state;
        }
        if self.reason.is_empty() {
            self.reason = other.reason.clone();
        }

        let Some(theirs) = other.fingerprint.as_ref() else {
            return;
        };
        if self.fingerprint.is_none() {
            self.fingerprint = Some(theirs.clone());
            return;
        }
        let Some(ours) = self.fingerprint.as_mut() else {
            return;
        };

        ours.service_name = join_service_names(&ours.service_name, &theirs.service_name);
        for (mine, incoming) in [
            (&mut ours.product_verbose, &theirs.product_verbose),
            (&mut ours.info, &theirs.info),
            (&mut ours.version, &theirs.version),
            (&mut ours.hostname, &theirs.hostname),
            (&mut ours.operation_verbose, &theirs.operation_verbose),
            (&mut ours.device_type, &theirs.device_type),
            (&mut ours.banner, &theirs.banner),
            (&mut ours.raw, &theirs.raw),
        ] {
            if mine.is_empty() && !incoming.is_empty() {
                *mine = incoming.clone();
            }
        }
        if ours.transport.is_none() {
            ours.transport = theirs.transport;
        }

        ours.cpes = dedup_keep_order(ours.cpes.drain(..).chain(theirs.cpes.iter().cloned()));
        ours.http_flows.extend(theirs.http_flows.iter().cloned());
        ours.tls_inspect_results
            .extend(theirs.tls_inspect_results.iter().cloned());
        for (url, cpes) in &theirs.cpe_from_urls {
            let entry = ours.cpe_from_urls.entry(url.clone()).or_default();
            let merged = dedup_keep_order(entry.drain(..).chain(cpes.iter().cloned()));
            *entry = merged;
        }
        ours.checked_tls |= theirs.checked_tls;
    }

    /// Normalise the fingerprint after merging.
    pub fn tidy(&mut self) {
        if let Some(info) = self.fingerprint.as_mut() {
            info.tidy();
        }
        self.reason = self.reason.trim().to_string();
    }

    /// Cache key in `scheme://host:port` form.
    #[must_use]
    pub fn cache_key(transport: Transport, host: &str, port: u16) -> String {
        format!("{}://{}:{}", transport.as_str(), host, port)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.target, self.port, self.state)?;
        if let Some(info) = &self.fingerprint {
            for part in [&info.service_name, &info.product_verbose, &info.version] {
                if !part.is_empty() {
                    write!(f, " {part}")?;
                }
            }
            if !info.cpes.is_empty() {
                write!(f, " [{}]", info.cpes.join(" "))?;
            }
        }
        if self.state != PortState::Open && !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// Slash-joined union of two service name lists, first occurrence wins.
fn join_service_names(ours: &str, theirs: &str) -> String {
    let names = ours
        .split('/')
        .chain(theirs.split('/'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    dedup_keep_order(names).join("/")
}

fn dedup_keep_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(service: &str, cpes: &[&str]) -> FingerprintInfo {
        let mut i = FingerprintInfo::new("10.0.0.1", 80, Transport::TCP);
        i.service_name = service.to_string();
        i.cpes = cpes.iter().map(|s| s.to_string()).collect();
        i
    }

    #[test]
    fn transport_parsing() {
        assert_eq!(" TCP ".parse::<Transport>().unwrap(), Transport::TCP);
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::UDP);
        assert!("sctp".parse::<Transport>().is_err());
    }

    #[test]
    fn state_order_is_certainty() {
        assert!(PortState::Open > PortState::Closed);
        assert!(PortState::Closed > PortState::Unknown);
    }

    #[test]
    fn merge_promotes_state_and_unions_cpes() {
        let mut nmap = MatchResult::new("10.0.0.1", 80, PortState::Closed)
            .with_fingerprint(info("http", &["cpe:/a:apache:http_server"]));
        let mut web_info = info("http/nginx", &["cpe:/a:apache:http_server", "cpe:/a:nginx:nginx"]);
        web_info.checked_tls = true;
        web_info.http_flows.push(HttpFlow {
            url: "http://10.0.0.1/".into(),
            status_code: 200,
            ..Default::default()
        });
        web_info
            .cpe_from_urls
            .insert("http://10.0.0.1/".into(), vec!["cpe:/a:nginx:nginx".into()]);
        let web = MatchResult::new("10.0.0.1", 80, PortState::Open).with_fingerprint(web_info);

        nmap.merge(&web);

        assert_eq!(nmap.state, PortState::Open);
        let fp = nmap.fingerprint.unwrap();
        assert_eq!(fp.service_name, "http/nginx");
        assert_eq!(
            fp.cpes,
            vec!["cpe:/a:apache:http_server".to_string(), "cpe:/a:nginx:nginx".to_string()]
        );
        assert_eq!(fp.http_flows.len(), 1);
        assert!(fp.checked_tls);
        assert_eq!(fp.cpe_from_urls.len(), 1);
    }

    #[test]
    fn merge_never_downgrades_open() {
        let mut open = MatchResult::new("h", 22, PortState::Open);
        open.merge(&MatchResult::closed("h", 22, "refused"));
        assert_eq!(open.state, PortState::Open);
    }

    #[test]
    fn merge_takes_web_service_when_rules_found_nothing() {
        let mut nmap = MatchResult::new("h", 8080, PortState::Open).with_fingerprint(info("", &[]));
        nmap.merge(&MatchResult::new("h", 8080, PortState::Open).with_fingerprint(info("http", &[])));
        assert_eq!(nmap.service_name(), "http");

        let mut empty = MatchResult::new("h", 8080, PortState::Unknown);
        empty.merge(&MatchResult::new("h", 8080, PortState::Open).with_fingerprint(info("http", &[])));
        assert_eq!(empty.service_name(), "http");
    }

    #[test]
    fn tidy_trims_and_dedups() {
        let mut r = MatchResult::new("h", 21, PortState::Open)
            .with_fingerprint(info(" ftp ", &["cpe:/a:x", " cpe:/a:x", ""]))
            .with_reason(" ok ");
        r.tidy();
        let fp = r.fingerprint.as_ref().unwrap();
        assert_eq!(fp.service_name, "ftp");
        assert_eq!(fp.cpes, vec!["cpe:/a:x".to_string()]);
        assert_eq!(r.reason, "ok");
    }

    #[test]
    fn display_and_cache_key() {
        let mut i = info("ssh", &[]);
        i.product_verbose = "OpenSSH".into();
        i.version = "7.6p1".into();
        let r = MatchResult::new("10.0.0.1", 22, PortState::Open).with_fingerprint(i);
        assert_eq!(r.to_string(), "10.0.0.1:22 open ssh OpenSSH 7.6p1");
        assert_eq!(MatchResult::cache_key(Transport::TCP, "10.0.0.1", 22), "tcp://10.0.0.1:22");

        let closed = MatchResult::closed("10.0.0.1", 23, "connection refused");
        assert_eq!(closed.to_string(), "10.0.0.1:23 closed (connection refused)");
    }

    #[test]
    fn match_result_json_roundtrip() {
        let r = MatchResult::new("10.0.0.1", 22, PortState::Open).with_fingerprint(info("ssh", &[]));
        let json = serde_json::to_string(&r).unwrap();
        let back: MatchResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
