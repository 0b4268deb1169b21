//! Scan-wide configuration
//!
//! `Config` is read-only during a match. Per-call `ConfigOption`s are applied
//! to a clone, so the matcher's base configuration never changes.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use servprobe_common::{FingerprintError, FingerprintResult, MatchResult, Transport};
use servprobe_probe::{ProbeClient, ProxyEndpoint};
use servprobe_rules::{parse_ports, RuleDatabase};
use servprobe_target_resolver::ip_range_bounds;

pub const DEFAULT_RARITY_MAX: u8 = 5;
pub const DEFAULT_PROBES_MAX: usize = 5;
pub const DEFAULT_PROBES_CONCURRENT_MAX: usize = 5;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FINGERPRINT_DATA_SIZE: usize = 20480;
pub const DEFAULT_POOL_SIZE: usize = 20;

const FALLBACK_PROBES: usize = 5;
const FALLBACK_POOL_SIZE: usize = 50;
const FALLBACK_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook invoked with a finished result.
pub type ResultCallback = Arc<dyn Fn(&MatchResult) + Send + Sync>;

/// Where the rule database comes from.
#[derive(Clone)]
pub enum RuleSource {
    /// Rule text, merged over the bundled ruleset.
    InlineBytes(Vec<u8>),
    /// Rule file, merged over the bundled ruleset.
    FilePath(PathBuf),
    /// A complete database, used as is.
    ParsedRules(Arc<RuleDatabase>),
}

impl RuleSource {
    /// Build the database this source describes.
    pub fn resolve(&self) -> FingerprintResult<Arc<RuleDatabase>> {
        match self {
            RuleSource::ParsedRules(db) => Ok(Arc::clone(db)),
            RuleSource::InlineBytes(raw) => Ok(Arc::new(Self::over_bundled(raw))),
            RuleSource::FilePath(path) => {
                let raw = std::fs::read(path).map_err(|e| {
                    FingerprintError::Config(format!("read rules {}: {e}", path.display()))
                })?;
                Ok(Arc::new(Self::over_bundled(&raw)))
            }
        }
    }

    fn over_bundled(raw: &[u8]) -> RuleDatabase {
        RuleDatabase::merged(&RuleDatabase::bundled(), &RuleDatabase::parse(raw))
    }
}

impl fmt::Debug for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSource::InlineBytes(raw) => write!(f, "InlineBytes({} bytes)", raw.len()),
            RuleSource::FilePath(path) => write!(f, "FilePath({})", path.display()),
            RuleSource::ParsedRules(db) => write!(f, "ParsedRules({} probes)", db.len()),
        }
    }
}

/// Per-call override applied on top of a cloned `Config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "option", content = "value", rename_all = "snake_case")]
pub enum ConfigOption {
    Transports(Vec<String>),
    ActiveMode(bool),
    RarityMax(u8),
    ProbesMax(i64),
    ProbesConcurrentMax(i64),
    ProbeTimeoutSecs(f64),
    FingerprintDataSize(usize),
    PoolSize(i64),
    Proxies(Vec<String>),
    OnlyWebFingerprint(bool),
    DisableWebFingerprint(bool),
    ForceAllFingerprint(bool),
    EnableCache(bool),
    /// Comma separated hosts, IPs or CIDRs.
    ExcludeHosts(String),
    /// Port list such as `22,80-90`.
    ExcludePorts(String),
    DebugLog(bool),
    RuntimeId(String),
}

#[derive(Clone)]
pub struct Config {
    pub transports: Vec<Transport>,
    pub active_mode: bool,
    pub rarity_max: u8,
    /// Zero means unbounded.
    pub probes_max: usize,
    pub probes_concurrent_max: usize,
    pub probe_timeout: Duration,
    pub fingerprint_data_size: usize,
    pub pool_size: usize,
    pub proxies: Vec<String>,

    pub only_web_fingerprint: bool,
    pub disable_web_fingerprint: bool,
    pub force_all_fingerprint: bool,
    pub enable_cache: bool,

    pub exclude_hosts: Vec<String>,
    pub exclude_ports: Vec<u16>,

    pub debug_log: bool,
    pub runtime_id: Option<String>,

    pub rules: Option<RuleSource>,
    pub(crate) on_port_open: Option<ResultCallback>,
    pub(crate) on_finished: Option<ResultCallback>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transports: vec![Transport::TCP],
            active_mode: true,
            rarity_max: DEFAULT_RARITY_MAX,
            probes_max: DEFAULT_PROBES_MAX,
            probes_concurrent_max: DEFAULT_PROBES_CONCURRENT_MAX,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            fingerprint_data_size: DEFAULT_FINGERPRINT_DATA_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            proxies: Vec::new(),
            only_web_fingerprint: false,
            disable_web_fingerprint: false,
            force_all_fingerprint: false,
            enable_cache: false,
            exclude_hosts: Vec::new(),
            exclude_ports: Vec::new(),
            debug_log: false,
            runtime_id: None,
            rules: None,
            on_port_open: None,
            on_finished: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("transports", &self.transports)
            .field("active_mode", &self.active_mode)
            .field("rarity_max", &self.rarity_max)
            .field("probes_max", &self.probes_max)
            .field("probes_concurrent_max", &self.probes_concurrent_max)
            .field("probe_timeout", &self.probe_timeout)
            .field("fingerprint_data_size", &self.fingerprint_data_size)
            .field("pool_size", &self.pool_size)
            .field("proxies", &self.proxies.len())
            .field("only_web_fingerprint", &self.only_web_fingerprint)
            .field("disable_web_fingerprint", &self.disable_web_fingerprint)
            .field("force_all_fingerprint", &self.force_all_fingerprint)
            .field("enable_cache", &self.enable_cache)
            .field("exclude_hosts", &self.exclude_hosts)
            .field("exclude_ports", &self.exclude_ports)
            .field("debug_log", &self.debug_log)
            .field("runtime_id", &self.runtime_id)
            .field("rules", &self.rules)
            .field("on_port_open", &self.on_port_open.is_some())
            .field("on_finished", &self.on_finished.is_some())
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = normalize_transports(transports);
        self
    }

    #[must_use]
    pub fn with_active_mode(mut self, active: bool) -> Self {
        self.active_mode = active;
        self
    }

    #[must_use]
    pub fn with_rarity_max(mut self, rarity: u8) -> Self {
        self.rarity_max = rarity;
        self
    }

    #[must_use]
    pub fn with_probes_max(mut self, max: usize) -> Self {
        self.probes_max = max;
        self
    }

    #[must_use]
    pub fn with_probes_concurrent_max(mut self, max: usize) -> Self {
        self.probes_concurrent_max = max.max(1);
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fingerprint_data_size(mut self, size: usize) -> Self {
        self.fingerprint_data_size = size;
        self
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies.into_iter().filter(|p| !p.trim().is_empty()).collect();
        self
    }

    #[must_use]
    pub fn with_rules(mut self, source: RuleSource) -> Self {
        self.rules = Some(source);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_runtime_id(mut self, id: impl Into<String>) -> Self {
        self.runtime_id = Some(id.into());
        self
    }

    /// Called after each request whose state is Open.
    #[must_use]
    pub fn with_on_port_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MatchResult) + Send + Sync + 'static,
    {
        self.on_port_open = Some(Arc::new(callback));
        self
    }

    /// Called after every request.
    #[must_use]
    pub fn with_on_finished<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MatchResult) + Send + Sync + 'static,
    {
        self.on_finished = Some(Arc::new(callback));
        self
    }

    /// Apply one option in place.
    pub fn apply_option(&mut self, option: &ConfigOption) -> FingerprintResult<()> {
        match option {
            ConfigOption::Transports(list) => self.transports = parse_transports(list.as_slice())?,
            ConfigOption::ActiveMode(b) => self.active_mode = *b,
            ConfigOption::RarityMax(r) => self.rarity_max = *r,
            ConfigOption::ProbesMax(n) => self.probes_max = positive_or(*n, FALLBACK_PROBES),
            ConfigOption::ProbesConcurrentMax(n) => {
                self.probes_concurrent_max = positive_or(*n, FALLBACK_PROBES)
            }
            ConfigOption::ProbeTimeoutSecs(secs) => {
                self.probe_timeout = if secs.is_finite() && *secs > 0.0 {
                    Duration::from_secs_f64(*secs)
                } else {
                    FALLBACK_PROBE_TIMEOUT
                }
            }
            ConfigOption::FingerprintDataSize(n) => self.fingerprint_data_size = *n,
            ConfigOption::PoolSize(n) => self.pool_size = positive_or(*n, FALLBACK_POOL_SIZE),
            ConfigOption::Proxies(list) => {
                self.proxies = list
                    .iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            }
            ConfigOption::OnlyWebFingerprint(b) => self.only_web_fingerprint = *b,
            ConfigOption::DisableWebFingerprint(b) => self.disable_web_fingerprint = *b,
            ConfigOption::ForceAllFingerprint(b) => self.force_all_fingerprint = *b,
            ConfigOption::EnableCache(b) => self.enable_cache = *b,
            ConfigOption::ExcludeHosts(hosts) => {
                self.exclude_hosts = hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            ConfigOption::ExcludePorts(ports) => {
                self.exclude_ports = if ports.trim().is_empty() {
                    Vec::new()
                } else {
                    parse_ports(&format!("ports {ports}"))
                        .map_err(|e| FingerprintError::Config(e.to_string()))?
                }
            }
            ConfigOption::DebugLog(b) => self.debug_log = *b,
            ConfigOption::RuntimeId(id) => self.runtime_id = Some(id.clone()),
        }
        Ok(())
    }

    /// A clone of `self` with `options` applied in order.
    pub fn apply(&self, options: &[ConfigOption]) -> FingerprintResult<Config> {
        let mut config = self.clone();
        for option in options {
            config.apply_option(option)?;
        }
        Ok(config)
    }

    /// Reject contradictory settings before any I/O happens.
    pub fn validate(&self) -> FingerprintResult<()> {
        if self.only_web_fingerprint && self.disable_web_fingerprint {
            return Err(FingerprintError::Config(
                "only_web_fingerprint and disable_web_fingerprint are mutually exclusive".into(),
            ));
        }
        if self.transports.is_empty() {
            return Err(FingerprintError::Config("no transport enabled".into()));
        }
        self.proxy_endpoints()?;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn transport_enabled(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }

    pub fn proxy_endpoints(&self) -> FingerprintResult<Vec<ProxyEndpoint>> {
        self.proxies.iter().map(|p| p.parse()).collect()
    }

    /// Transport client configured from this config.
    pub fn probe_client(&self) -> FingerprintResult<ProbeClient> {
        Ok(ProbeClient::new()
            .with_timeout(self.probe_timeout)
            .with_data_size(self.fingerprint_data_size)
            .with_proxies(self.proxy_endpoints()?))
    }

    /// Whether `host`/`port` is excluded by the host or port filters.
    ///
    /// Host entries match by name (case-insensitive), by IP, by CIDR, or by
    /// IPv4 range ("10.0.0.1-10.0.0.9" or "10.0.0.1-9").
    #[must_use]
    pub fn is_filtered(&self, host: &str, port: u16) -> bool {
        if self.exclude_ports.contains(&port) {
            return true;
        }
        let ip = host.parse::<IpAddr>().ok();
        self.exclude_hosts.iter().any(|entry| {
            if entry.eq_ignore_ascii_case(host) {
                return true;
            }
            let Some(ip) = ip else {
                return false;
            };
            if let Ok(net) = entry.parse::<IpNet>() {
                return net.contains(&ip);
            }
            if let Ok(single) = entry.parse::<IpAddr>() {
                return single == ip;
            }
            match (ip, ip_range_bounds(entry)) {
                (IpAddr::V4(v4), Ok((start, end))) => (start..=end).contains(&v4),
                _ => false,
            }
        })
    }

    pub(crate) fn notify(&self, result: &MatchResult) {
        if result.is_open() {
            if let Some(cb) = &self.on_port_open {
                cb(result);
            }
        }
        if let Some(cb) = &self.on_finished {
            cb(result);
        }
    }
}

/// Parse transport names, dropping duplicates. An empty list means TCP.
pub fn parse_transports<S: AsRef<str>>(names: &[S]) -> FingerprintResult<Vec<Transport>> {
    let parsed = names
        .iter()
        .map(|n| n.as_ref())
        .filter(|n| !n.trim().is_empty())
        .map(|n| n.parse::<Transport>().map_err(FingerprintError::Config))
        .collect::<FingerprintResult<Vec<_>>>()?;
    Ok(normalize_transports(parsed))
}

fn normalize_transports(transports: Vec<Transport>) -> Vec<Transport> {
    let mut out = Vec::with_capacity(transports.len());
    for t in transports {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    if out.is_empty() {
        out.push(Transport::TCP);
    }
    out
}

fn positive_or(value: i64, fallback: usize) -> usize {
    if value <= 0 {
        fallback
    } else {
        usize::try_from(value).unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use servprobe_common::PortState;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.transports, vec![Transport::TCP]);
        assert!(c.active_mode);
        assert_eq!(c.rarity_max, 5);
        assert_eq!(c.probes_max, 5);
        assert_eq!(c.probes_concurrent_max, 5);
        assert_eq!(c.probe_timeout, Duration::from_secs(5));
        assert_eq!(c.fingerprint_data_size, 20480);
        assert_eq!(c.pool_size, 20);
    }

    #[test]
    fn options_apply_to_a_clone() {
        let base = Config::default();
        let tuned = base
            .apply(&[
                ConfigOption::ProbesMax(2),
                ConfigOption::Transports(vec!["udp".into(), "TCP ".into(), "udp".into()]),
                ConfigOption::ProbeTimeoutSecs(1.5),
            ])
            .unwrap();
        assert_eq!(tuned.probes_max, 2);
        assert_eq!(tuned.transports, vec![Transport::UDP, Transport::TCP]);
        assert_eq!(tuned.probe_timeout, Duration::from_millis(1500));
        assert_eq!(base.probes_max, 5);
        assert_eq!(base.transports, vec![Transport::TCP]);
    }

    #[test]
    fn non_positive_values_fall_back() {
        let c = Config::default()
            .apply(&[
                ConfigOption::ProbesMax(0),
                ConfigOption::ProbesConcurrentMax(-3),
                ConfigOption::PoolSize(0),
                ConfigOption::ProbeTimeoutSecs(0.0),
                ConfigOption::Transports(vec![]),
                ConfigOption::Proxies(vec!["".into(), " socks5://127.0.0.1:1080 ".into()]),
            ])
            .unwrap();
        assert_eq!(c.probes_max, 5);
        assert_eq!(c.probes_concurrent_max, 5);
        assert_eq!(c.pool_size, 50);
        assert_eq!(c.probe_timeout, Duration::from_secs(10));
        assert_eq!(c.transports, vec![Transport::TCP]);
        assert_eq!(c.proxies, vec!["socks5://127.0.0.1:1080".to_string()]);
    }

    #[test]
    fn bad_transport_is_config_error() {
        assert!(matches!(
            parse_transports(&["sctp"]),
            Err(FingerprintError::Config(_))
        ));
    }

    #[test]
    fn web_flags_conflict() {
        let c = Config::default()
            .apply(&[
                ConfigOption::OnlyWebFingerprint(true),
                ConfigOption::DisableWebFingerprint(true),
            ])
            .unwrap();
        assert!(matches!(c.validate(), Err(FingerprintError::Config(_))));
    }

    #[test]
    fn invalid_proxy_fails_validation() {
        let c = Config::default().with_proxies(vec!["nonsense".into()]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn host_and_port_filters() {
        let c = Config::default()
            .apply(&[
                ConfigOption::ExcludeHosts("10.0.0.0/8, example.org,192.168.1.7".into()),
                ConfigOption::ExcludePorts("23,8000-8002".into()),
            ])
            .unwrap();
        assert!(c.is_filtered("10.1.2.3", 22));
        assert!(c.is_filtered("EXAMPLE.org", 22));
        assert!(c.is_filtered("192.168.1.7", 22));
        assert!(!c.is_filtered("192.168.1.8", 22));
        assert!(c.is_filtered("192.168.1.8", 8001));
        assert!(!c.is_filtered("example.com", 80));
    }

    #[test]
    fn host_filter_accepts_ipv4_ranges() {
        let c = Config::default()
            .apply(&[ConfigOption::ExcludeHosts("1.2.3.1-20,172.16.0.250-172.16.1.5".into())])
            .unwrap();
        assert!(c.is_filtered("1.2.3.1", 80));
        assert!(c.is_filtered("1.2.3.20", 80));
        assert!(!c.is_filtered("1.2.3.21", 80));
        assert!(c.is_filtered("172.16.1.0", 80));
        assert!(!c.is_filtered("172.16.1.6", 80));
        assert!(!c.is_filtered("::1", 80));
        assert!(!c.is_filtered("my-host", 80));
    }

    #[test]
    fn option_serde_shape() {
        let json = serde_json::to_string(&ConfigOption::ProbesMax(3)).unwrap();
        assert_eq!(json, r#"{"option":"probes_max","value":3}"#);
        let back: ConfigOption = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConfigOption::ProbesMax(3));
    }

    #[test]
    fn callbacks_fire_by_state() {
        let opened = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (o, f) = (Arc::clone(&opened), Arc::clone(&finished));
        let c = Config::default()
            .with_on_port_open(move |_| {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_finished(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });

        c.notify(&MatchResult::new("h", 22, PortState::Open));
        c.notify(&MatchResult::closed("h", 23, "refused"));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn inline_rules_merge_over_bundled() {
        let source = RuleSource::InlineBytes(
            b"Probe TCP NULL q||\nmatch custom m|^CUSTOM| p/Custom/\n".to_vec(),
        );
        let db = source.resolve().unwrap();
        let bundled = RuleDatabase::bundled();
        assert_eq!(db.len(), bundled.len());
        assert_eq!(db.match_count(), bundled.match_count() + 1);
    }

    #[test]
    fn missing_rule_file_is_config_error() {
        let source = RuleSource::FilePath(PathBuf::from("/nonexistent/servprobe-rules.txt"));
        assert!(matches!(source.resolve(), Err(FingerprintError::Config(_))));
    }
}
