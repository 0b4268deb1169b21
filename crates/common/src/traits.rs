//! Seam traits for collaborators that live outside the rule engine

use crate::error::FingerprintResult;
use crate::types::MatchResult;
use async_trait::async_trait;

/// HTTP fingerprint detector.
///
/// The rule engine hands over the target and whatever banner the rule probes
/// already collected; the detector returns its own `MatchResult`, which is
/// merged into the rule-based one with `MatchResult::merge`.
#[async_trait]
pub trait WebFingerprinter: Send + Sync {
    /// Fingerprint the web service behind `host:port`.
    async fn fingerprint(
        &self,
        host: &str,
        port: u16,
        banner: Option<&[u8]>,
    ) -> FingerprintResult<MatchResult>;

    /// Detector name, used in logs.
    fn name(&self) -> &str;
}
