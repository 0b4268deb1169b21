//! Servprobe Common - shared types and traits
//!
//! This crate provides the result model, error type and seam traits used
//! across the servprobe crates.
//!
//! Key pieces:
//! - `MatchResult` / `FingerprintInfo`: what a port identification produces
//! - `FingerprintError`: one error enum for every library crate
//! - `WebFingerprinter`: hook for an external HTTP fingerprint detector

pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{FingerprintError, FingerprintResult};
pub use traits::WebFingerprinter;
pub use types::{
    FingerprintInfo, HttpFlow, MatchResult, PortState, TlsInspectResult, Transport,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
