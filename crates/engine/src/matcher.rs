//! Request-level matcher: one (host, port) in, one `MatchResult` out

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use servprobe_common::{
    FingerprintError, FingerprintResult, MatchResult, PortState, Transport, WebFingerprinter,
};
use servprobe_probe::ProbeClient;
use servprobe_rules::RuleDatabase;
use servprobe_target_resolver::resolve_host;

use crate::cache::ResultCache;
use crate::config::{Config, ConfigOption};
use crate::merge::{merge_errors, merge_info, merge_states};
use crate::probing::ProbeTarget;
use crate::scheduler::run_blocks;
use crate::selector::select_rule_blocks;
use crate::special::apply_special_cases;

pub const FILTERED_REASON: &str = "filtered by config";

/// Identifies services by replaying rule probes against a port.
///
/// The rule database is resolved once in `new` and shared read-only by every
/// request. Per-call options only ever change a clone of the base config.
pub struct Matcher {
    config: Arc<Config>,
    rules: Arc<RuleDatabase>,
    web: Option<Arc<dyn WebFingerprinter>>,
    cache: ResultCache,
}

impl Matcher {
    pub fn new(config: Config) -> FingerprintResult<Self> {
        config.validate()?;
        let rules = match &config.rules {
            Some(source) => source.resolve()?,
            None => Arc::new(RuleDatabase::bundled()),
        };
        info!(probes = rules.len(), matches = rules.match_count(), "rule database ready");
        Ok(Self {
            config: Arc::new(config),
            rules,
            web: None,
            cache: ResultCache::new(),
        })
    }

    /// Register the HTTP detector consulted after the rule probes.
    #[must_use]
    pub fn with_web_fingerprinter(mut self, detector: Arc<dyn WebFingerprinter>) -> Self {
        self.web = Some(detector);
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn rules(&self) -> &RuleDatabase {
        &self.rules
    }

    pub async fn match_port(
        &self,
        host: &str,
        port: u16,
        options: &[ConfigOption],
    ) -> FingerprintResult<MatchResult> {
        self.match_with_cancel(&CancellationToken::new(), host, port, options)
            .await
    }

    /// Identify the service on `host:port`.
    ///
    /// Probe failures end up in the result's state and reason. `Err` is only
    /// returned for a bad configuration or when `cancel` fires mid-request.
    #[instrument(skip(self, cancel, options), fields(runtime_id = tracing::field::Empty))]
    pub async fn match_with_cancel(
        &self,
        cancel: &CancellationToken,
        host: &str,
        port: u16,
        options: &[ConfigOption],
    ) -> FingerprintResult<MatchResult> {
        let config = if options.is_empty() {
            Arc::clone(&self.config)
        } else {
            Arc::new(self.config.apply(options)?)
        };
        config.validate()?;
        if let Some(id) = config.runtime_id.as_deref() {
            Span::current().record("runtime_id", id);
        }

        let host = host.trim();
        if config.is_filtered(host, port) {
            return Ok(self.finish(&config, filtered(host, port), None));
        }

        let scheme = if config.transport_enabled(Transport::TCP) {
            Transport::TCP
        } else {
            Transport::UDP
        };
        let key = MatchResult::cache_key(scheme, host, port);
        if config.enable_cache {
            if let Some(hit) = self.cache.get(&key) {
                debug!(%key, "cache hit");
                config.notify(&hit);
                return Ok(hit);
            }
        }

        let ip = match resolve_host(host).await {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                debug!(error = %e, "resolve failed");
                let result = MatchResult::closed(host, port, format!("resolve {host}: {e}"));
                return Ok(self.finish(&config, result, None));
            }
        };
        if ip != host && config.is_filtered(&ip, port) {
            return Ok(self.finish(&config, filtered(host, port), None));
        }

        let mut result = if config.only_web_fingerprint {
            MatchResult::new(host, port, PortState::Unknown)
        } else {
            self.match_rules(host, &ip, port, &config, cancel).await?
        };

        self.detect_web(host, port, &config, &mut result).await;

        if cancel.is_cancelled() {
            return Err(FingerprintError::Cancelled);
        }
        let key = config.enable_cache.then_some(key);
        Ok(self.finish(&config, result, key))
    }

    async fn match_rules(
        &self,
        host: &str,
        ip: &str,
        port: u16,
        config: &Arc<Config>,
        cancel: &CancellationToken,
    ) -> FingerprintResult<MatchResult> {
        let client = Arc::new(config.probe_client()?);
        let selection = select_rule_blocks(&self.rules, port, config);
        debug!(
            probes = selection.len(),
            port_specific = selection.port_specific,
            "rule blocks selected"
        );
        if selection.is_empty() {
            return Ok(MatchResult::closed(host, port, "no probe selected for port"));
        }

        let target = ProbeTarget::new(ip, port);
        let outcomes = run_blocks(
            &target,
            selection.into_dispatch_order(),
            Arc::clone(config),
            Arc::clone(&client),
            cancel,
        )
        .await;
        if cancel.is_cancelled() {
            return Err(FingerprintError::Cancelled);
        }

        let states: Vec<PortState> = outcomes.iter().map(|o| o.state).collect();
        let mut infos = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for outcome in outcomes {
            infos.extend(outcome.info);
            errors.extend(outcome.error);
        }

        let mut result = MatchResult::new(host, port, merge_states(&states));
        if let Some(mut info) = merge_info(infos) {
            apply_special_cases(&mut info, &client).await;
            result.fingerprint = Some(info);
        }
        if !result.is_open() {
            result.reason = merge_errors(&errors);
        }
        Ok(result)
    }

    async fn detect_web(&self, host: &str, port: u16, config: &Config, result: &mut MatchResult) {
        let Some(web) = self.web.as_ref() else {
            return;
        };
        if config.disable_web_fingerprint {
            return;
        }
        let wanted = config.force_all_fingerprint
            || config.only_web_fingerprint
            || (result.is_open() && looks_like_web(result.service_name()));
        if !wanted {
            return;
        }

        let banner: Option<Vec<u8>> = result
            .fingerprint
            .as_ref()
            .filter(|f| !f.banner.is_empty())
            .map(|f| f.banner.as_bytes().to_vec());
        match web.fingerprint(host, port, banner.as_deref()).await {
            Ok(web_result) => {
                debug!(detector = web.name(), state = %web_result.state, "web detector finished");
                result.merge(&web_result);
            }
            Err(e) => {
                warn!(detector = web.name(), error = %e, "web detector failed");
                if !result.is_open() && result.reason.is_empty() {
                    result.reason = e.to_string();
                }
            }
        }
    }

    fn finish(&self, config: &Config, mut result: MatchResult, cache_key: Option<String>) -> MatchResult {
        result.tidy();
        config.notify(&result);
        if let Some(key) = cache_key {
            self.cache.insert(key, result.clone());
        }
        result
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("config", &self.config)
            .field("probes", &self.rules.len())
            .field("web", &self.web.as_ref().map(|w| w.name().to_string()))
            .finish()
    }
}

fn filtered(host: &str, port: u16) -> MatchResult {
    MatchResult::new(host, port, PortState::Unknown).with_reason(FILTERED_REASON)
}

/// Unidentified ports and anything http-ish go to the web detector.
fn looks_like_web(service: &str) -> bool {
    service.is_empty() || service.to_ascii_lowercase().contains("http")
}
