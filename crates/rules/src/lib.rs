//! Rule engine for nmap-service-probes style fingerprint databases
//!
//! This crate provides:
//! - Line parsers for `Probe`, `match`/`softmatch`, `rarity` and `ports`
//! - The tagged data-block scanner used by match lines
//! - Placeholder resolution (`$n`, `$P(n)`, `$SUBST(n,"a","b")`, `$I(n,"<")`)
//! - `RuleDatabase`: probe-to-matches mapping with override merging

mod database;
mod error;
mod parser;
mod scanner;
mod template;

pub use database::{RuleDatabase, RuleEntry, DEFAULT_RULES};
pub use error::RuleParseError;
pub use parser::{
    escape_payload, parse_match_line, parse_ports, parse_probe_line, parse_rarity,
    unescape_payload, Match, Probe, ProbeId, MATCH_BACKTRACK_LIMIT,
};
pub use scanner::{DataBlock, DataBlockScanner};
pub use template::{resolve_placeholders, to_match_text, CaptureGroups, ResolvedFields};
