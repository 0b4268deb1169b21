use servprobe_common::FingerprintError;
use thiserror::Error;

/// Failure to interpret a single rule line.
///
/// Database builds log these and skip the line; they never abort a load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("invalid probe line: {0}")]
    Probe(String),

    #[error("invalid escape sequence at byte {offset}: {reason}")]
    Escape { offset: usize, reason: String },

    #[error("invalid match line: {0}")]
    Match(String),

    #[error("malformed data block: {0}")]
    DataBlock(String),

    #[error("invalid regex: {0}")]
    Regex(String),

    #[error("invalid directive: {0}")]
    Directive(String),
}

impl From<RuleParseError> for FingerprintError {
    fn from(err: RuleParseError) -> Self {
        FingerprintError::Parse(err.to_string())
    }
}
