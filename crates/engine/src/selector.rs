//! Rule selection: which probes to send to a port, and in what order
//!
//! Probes whose default ports cover the target port ("best" blocks) go first,
//! then the general probes that survive the transport, active-mode and rarity
//! filters. Both groups are ordered by rarity, then parse index. Every
//! empty-payload TCP probe is folded into one separate block that is always
//! tried and does not count against `probes_max`.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::trace;

use servprobe_common::Transport;
use servprobe_rules::{Match, Probe, RuleDatabase};

use crate::config::Config;

/// A probe paired with the matches to try against its banner.
#[derive(Debug, Clone)]
pub struct RuleBlock {
    pub probe: Arc<Probe>,
    pub matches: Vec<Arc<Match>>,
}

impl RuleBlock {
    fn new(probe: &Arc<Probe>, matches: &[Arc<Match>]) -> Self {
        Self {
            probe: Arc::clone(probe),
            matches: matches.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSelection {
    /// Merged empty-payload block, present when TCP is enabled.
    pub empty: Option<RuleBlock>,
    /// Payload probes, best blocks first, capped at `probes_max`.
    pub blocks: Vec<RuleBlock>,
    /// Whether any probe declared the target port.
    pub port_specific: bool,
}

impl RuleSelection {
    /// Number of probes that will be sent.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len() + usize::from(self.empty.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything to dispatch, empty block first.
    #[must_use]
    pub fn into_dispatch_order(self) -> Vec<RuleBlock> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.empty);
        out.extend(self.blocks);
        out
    }
}

/// Rarity ascending, then index ascending, then name descending.
fn block_order(a: &RuleBlock, b: &RuleBlock) -> Ordering {
    a.probe
        .rarity
        .cmp(&b.probe.rarity)
        .then(a.probe.index.cmp(&b.probe.index))
        .then_with(|| b.probe.name.cmp(&a.probe.name))
}

/// Pick and order the probes for `port` under `config`.
#[must_use]
pub fn select_rule_blocks(db: &RuleDatabase, port: u16, config: &Config) -> RuleSelection {
    let tcp_enabled = config.transport_enabled(Transport::TCP);
    let mut empty: Option<RuleBlock> = None;
    let mut best: Vec<RuleBlock> = Vec::new();
    let mut general: Vec<RuleBlock> = Vec::new();

    for entry in db.iter() {
        let probe = &entry.probe;

        if probe.is_empty_payload() {
            if tcp_enabled && probe.transport == Transport::TCP {
                match empty.as_mut() {
                    Some(block) => block.matches.extend(entry.matches.iter().cloned()),
                    None => empty = Some(RuleBlock::new(probe, &entry.matches)),
                }
            }
            continue;
        }

        let enabled = config.transport_enabled(probe.transport);
        if enabled && probe.covers_port(port) {
            best.push(RuleBlock::new(probe, &entry.matches));
            continue;
        }
        if !enabled || !config.active_mode || probe.rarity > config.rarity_max {
            trace!(probe = %probe.name, rarity = probe.rarity, "general probe filtered");
            continue;
        }
        general.push(RuleBlock::new(probe, &entry.matches));
    }

    best.sort_by(block_order);
    general.sort_by(block_order);

    let port_specific = !best.is_empty();
    let mut blocks = best;
    blocks.append(&mut general);
    if config.probes_max > 0 {
        blocks.truncate(config.probes_max);
    }

    RuleSelection {
        empty,
        blocks,
        port_specific,
    }
}
