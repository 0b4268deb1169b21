//! Rule database: probes and the matches attached to them
//!
//! Built once from rule text, then shared read-only (behind an `Arc`) by every
//! matcher. Probes are keyed by the `ProbeId` assigned while parsing, so
//! iteration follows file order.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::parser::{parse_match_line, parse_ports, parse_probe_line, parse_rarity, Match, Probe, ProbeId};

/// Ruleset shipped with the crate.
pub const DEFAULT_RULES: &str = include_str!("../data/service-probes.txt");

/// A probe together with its ordered match list.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub probe: Arc<Probe>,
    pub matches: Vec<Arc<Match>>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleDatabase {
    entries: BTreeMap<ProbeId, RuleEntry>,
}

impl RuleDatabase {
    /// Parse a whole rule file.
    ///
    /// Never fails: a line that does not parse is logged and skipped. Lines
    /// seen before any `Probe`, or after a `Probe` line that failed, are
    /// dropped until the next good `Probe`.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut staged: Vec<(Probe, Vec<Match>)> = Vec::new();
        // Index into `staged` of the probe that owns the following lines.
        // `None` before the first probe and after a `Probe` line that failed.
        let mut current: Option<usize> = None;
        let mut skipped = 0usize;

        for (lineno, raw_line) in raw.split(|&b| b == b'\n').enumerate() {
            let text = String::from_utf8_lossy(raw_line);
            let line = text.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let keyword = line.split_whitespace().next().unwrap_or("");
            if keyword == "Probe" {
                match parse_probe_line(line) {
                    Ok(mut probe) => {
                        probe.index = staged.len();
                        current = Some(staged.len());
                        staged.push((probe, Vec::new()));
                    }
                    Err(err) => {
                        current = None;
                        skipped += 1;
                        warn!(line = lineno + 1, error = %err, "skipping probe and its directives");
                    }
                }
                continue;
            }

            let Some((probe, matches)) = current.and_then(|i| staged.get_mut(i)) else {
                if matches!(keyword, "match" | "softmatch" | "rarity" | "ports") {
                    debug!(line = lineno + 1, "no open probe, skipping");
                }
                continue;
            };

            let outcome = match keyword {
                "match" | "softmatch" => parse_match_line(line).map(|m| matches.push(m)),
                "rarity" => parse_rarity(line).map(|r| probe.rarity = r),
                "ports" => parse_ports(line).map(|p| probe.default_ports = p),
                // sslports, totalwaitms, tcpwrappedms, fallback, Exclude
                _ => Ok(()),
            };

            if let Err(err) = outcome {
                skipped += 1;
                warn!(line = lineno + 1, error = %err, "skipping rule line");
            }
        }

        let entries = staged
            .into_iter()
            .map(|(probe, matches)| {
                let id = probe.id();
                let entry = RuleEntry {
                    probe: Arc::new(probe),
                    matches: matches.into_iter().map(Arc::new).collect(),
                };
                (id, entry)
            })
            .collect::<BTreeMap<_, _>>();

        let db = Self { entries };
        debug!(
            probes = db.len(),
            matches = db.match_count(),
            skipped,
            "rule database parsed"
        );
        db
    }

    /// The bundled default ruleset.
    #[must_use]
    pub fn bundled() -> Self {
        Self::parse(DEFAULT_RULES.as_bytes())
    }

    /// Merge `overrides` into this database.
    ///
    /// Probes are matched by (name, payload). On a hit the override matches are
    /// appended to the existing list, skipping any whose raw line is already
    /// present; on a miss the probe is inserted under a fresh id. Merging the
    /// same overrides again changes nothing.
    pub fn merge(&mut self, overrides: &RuleDatabase) {
        for entry in overrides.entries.values() {
            let existing = self
                .entries
                .values_mut()
                .find(|e| e.probe.same_identity(&entry.probe));

            match existing {
                Some(base) => {
                    for m in &entry.matches {
                        if !base.matches.iter().any(|b| b.raw_line == m.raw_line) {
                            base.matches.push(Arc::clone(m));
                        }
                    }
                }
                None => {
                    let index = self.next_index();
                    let mut probe = Probe::clone(&entry.probe);
                    probe.index = index;
                    let mut matches: Vec<Arc<Match>> = Vec::with_capacity(entry.matches.len());
                    for m in &entry.matches {
                        if !matches.iter().any(|b| b.raw_line == m.raw_line) {
                            matches.push(Arc::clone(m));
                        }
                    }
                    self.entries.insert(
                        ProbeId(index),
                        RuleEntry {
                            probe: Arc::new(probe),
                            matches,
                        },
                    );
                }
            }
        }
    }

    /// Base plus overrides as a new database; `base` is left untouched.
    #[must_use]
    pub fn merged(base: &RuleDatabase, overrides: &RuleDatabase) -> RuleDatabase {
        let mut db = base.clone();
        db.merge(overrides);
        db
    }

    fn next_index(&self) -> usize {
        self.entries
            .keys()
            .next_back()
            .map(|id| id.0 + 1)
            .unwrap_or(0)
    }

    /// Entries in probe-index order.
    pub fn iter(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn get(&self, id: ProbeId) -> Option<&RuleEntry> {
        self.entries.get(&id)
    }

    #[must_use]
    pub fn find_probe(&self, name: &str) -> Option<&RuleEntry> {
        self.entries.values().find(|e| e.probe.name == name)
    }

    /// Number of probes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn match_count(&self) -> usize {
        self.entries.values().map(|e| e.matches.len()).sum()
    }
}
