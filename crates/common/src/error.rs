//! Error types for servprobe
//!
//! Probe-level failures are aggregated into a `MatchResult` reason and never
//! abort a port evaluation; only request-level failures surface as `Err`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("probe aborted: {0}")]
    Probe(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl FingerprintError {
    /// Dial failures map to a closed probe rather than an unknown one.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, FingerprintError::Network(_))
            || matches!(self, FingerprintError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }
}

/// Result type alias for servprobe operations
pub type FingerprintResult<T> = Result<T, FingerprintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_recognised() {
        let refused = FingerprintError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_connect_failure());
        assert!(FingerprintError::Network("dial 10.0.0.1:22 failed".into()).is_connect_failure());
        assert!(!FingerprintError::Timeout("read".into()).is_connect_failure());
    }
}
