//! Servprobe Engine - rule-driven service identification
//!
//! Given a host and a port, the [`Matcher`] picks the rule blocks worth
//! sending, fires them concurrently, folds the per-probe outcomes into one
//! [`MatchResult`](servprobe_common::MatchResult) and optionally hands the
//! port to a web detector.
//!
//! Pipeline:
//! - `selector`: which probes, in which order, under the probe budget
//! - `probing`: one probe exchange and its Open / Closed / Unknown outcome
//! - `scheduler`: bounded-concurrency dispatch with cancellation
//! - `merge`: state, fingerprint and error folding
//! - `special`: proxy and RDP corrections after matching

pub mod cache;
pub mod config;
pub mod matcher;
pub mod merge;
pub mod probing;
pub mod scheduler;
pub mod selector;
pub mod special;

pub use cache::{ResultCache, DEFAULT_CACHE_TTL, SWEEP_EVERY};
pub use config::{
    parse_transports, Config, ConfigOption, ResultCallback, RuleSource, DEFAULT_FINGERPRINT_DATA_SIZE,
    DEFAULT_POOL_SIZE, DEFAULT_PROBES_CONCURRENT_MAX, DEFAULT_PROBES_MAX, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_RARITY_MAX,
};
pub use matcher::{Matcher, FILTERED_REASON};
pub use merge::{merge_errors, merge_info, merge_states};
pub use probing::{match_banner, probe_block, ProbeOutcome, ProbeTarget};
pub use scheduler::run_blocks;
pub use selector::{select_rule_blocks, RuleBlock, RuleSelection};
pub use special::apply_special_cases;

pub use tokio_util::sync::CancellationToken;
