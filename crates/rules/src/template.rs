//! Placeholder resolution for versioninfo fields
//!
//! Passes run in a fixed order and each one only rewrites tokens it
//! recognises: `$n` → `$P(n)` → `$SUBST(n,"a","b")` → `$I(n,"<"|">")`.
//! Anything left over stays in the output verbatim.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());
static PRINTABLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$P\((\d+)\)").unwrap());
static SUBST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$SUBST\((\d+),"([^"]*)","([^"]*)"\)"#).unwrap());
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\$I\((\d+),"([^"]*)"\)"#).unwrap());

/// Banner bytes as a regex haystack: one char per byte (`0xHH` → `U+00HH`),
/// so `\xHH` escapes in rule patterns address raw bytes.
#[must_use]
pub fn to_match_text(banner: &[u8]) -> String {
    banner.iter().map(|&b| b as char).collect()
}

fn to_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Capture groups of a successful rule match; index 0 is the whole match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureGroups {
    groups: Vec<Option<String>>,
}

impl CaptureGroups {
    #[must_use]
    pub fn new(groups: Vec<Option<String>>) -> Self {
        Self { groups }
    }

    pub(crate) fn from_captures(caps: &fancy_regex::Captures<'_>) -> Self {
        let groups = (0..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
        Self { groups }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group `n`; `None` when out of range, `Some("")` when it did not participate.
    #[must_use]
    pub fn get(&self, n: usize) -> Option<&str> {
        self.groups
            .get(n)
            .map(|g| g.as_deref().unwrap_or(""))
    }
}

/// Templated fields of a match after resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedFields {
    pub product_verbose: String,
    pub version: String,
    pub info: String,
    pub hostname: String,
    pub operation_verbose: String,
    pub device_type: String,
    pub cpes: Vec<String>,
}

/// Resolve every supported placeholder in `template`.
#[must_use]
pub fn resolve_placeholders(template: &str, groups: &CaptureGroups) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    let out = substitute_groups(template, groups);
    let out = substitute_printable(&out, groups);
    let out = substitute_subst(&out, groups);
    substitute_int(&out, groups)
}

fn group_index(caps: &Captures<'_>) -> Option<usize> {
    caps.get(1)?.as_str().parse().ok()
}

fn substitute_groups(input: &str, groups: &CaptureGroups) -> String {
    GROUP_RE
        .replace_all(input, |caps: &Captures<'_>| {
            match group_index(caps).and_then(|n| groups.get(n)) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn substitute_printable(input: &str, groups: &CaptureGroups) -> String {
    PRINTABLE_RE
        .replace_all(input, |caps: &Captures<'_>| {
            match group_index(caps).and_then(|n| groups.get(n)) {
                Some(value) => value
                    .chars()
                    .filter(|c| c.is_ascii_graphic() || *c == ' ')
                    .collect::<String>(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn substitute_subst(input: &str, groups: &CaptureGroups) -> String {
    SUBST_RE
        .replace_all(input, |caps: &Captures<'_>| {
            match group_index(caps).and_then(|n| groups.get(n)) {
                Some(value) if !caps[2].is_empty() => value.replace(&caps[2], &caps[3]),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn substitute_int(input: &str, groups: &CaptureGroups) -> String {
    INT_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let Some(value) = group_index(caps).and_then(|n| groups.get(n)) else {
                return caps[0].to_string();
            };
            let bytes = to_bytes(value);
            if bytes.len() > 8 {
                return caps[0].to_string();
            }
            let number = match &caps[2] {
                ">" => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
                "<" => bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
                _ => return caps[0].to_string(),
            };
            number.to_string()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_match_line;

    fn groups(values: &[&str]) -> CaptureGroups {
        CaptureGroups::new(values.iter().map(|v| Some(v.to_string())).collect())
    }

    #[test]
    fn ssh_groups_resolve() {
        let m = parse_match_line(r"match ssh m|^SSH-([\d.]+)-OpenSSH_([\w._-]+)| v/$2/").unwrap();
        let caps = m.find(&to_match_text(b"SSH-2.0-OpenSSH_7.6p1\r\n")).unwrap();
        assert_eq!(resolve_placeholders("$1:$2", &caps), "2.0:7.6p1");
        assert_eq!(m.resolve(&caps).version, "7.6p1");
    }

    #[test]
    fn out_of_range_group_left_verbatim() {
        let g = groups(&["whole", "a"]);
        assert_eq!(resolve_placeholders("$1 $2 $P(5)", &g), "a $2 $P(5)");
    }

    #[test]
    fn non_participating_group_is_empty() {
        let g = CaptureGroups::new(vec![Some("x".into()), None]);
        assert_eq!(resolve_placeholders("[$1]", &g), "[]");
    }

    #[test]
    fn printable_strips_control_bytes() {
        let g = CaptureGroups::new(vec![None, Some("ab\u{0}c\u{7}d\u{ff}".into())]);
        assert_eq!(resolve_placeholders("$P(1)", &g), "abcd");
    }

    #[test]
    fn subst_replaces_literal() {
        let g = groups(&["", "1_2_3"]);
        assert_eq!(resolve_placeholders(r#"$SUBST(1,"_",".")"#, &g), "1.2.3");
    }

    #[test]
    fn int_endianness() {
        let g = CaptureGroups::new(vec![None, Some("\u{0}\u{32}".into())]);
        assert_eq!(resolve_placeholders(r#"$I(1,">")"#, &g), "50");
        assert_eq!(resolve_placeholders(r#"$I(1,"<")"#, &g), "12800");
    }

    #[test]
    fn int_rejects_oversized_and_unknown_endian() {
        let g = groups(&["", "123456789"]);
        assert_eq!(resolve_placeholders(r#"$I(1,">")"#, &g), r#"$I(1,">")"#);
        let g = groups(&["", "ab"]);
        assert_eq!(resolve_placeholders(r#"$I(1,"=")"#, &g), r#"$I(1,"=")"#);
    }

    #[test]
    fn int_from_binary_banner() {
        let m = parse_match_line(r#"match x m|^\x01(..)| v/$I(1,">")/"#).unwrap();
        let caps = m.find(&to_match_text(&[0x01, 0x01, 0x00])).unwrap();
        assert_eq!(m.resolve(&caps).version, "256");
    }

    #[test]
    fn passes_compose() {
        let g = groups(&["", "7_0", "\u{1}srv"]);
        assert_eq!(
            resolve_placeholders(r#"v$SUBST(1,"_",".") on $P(2) ($1)"#, &g),
            "v7.0 on srv (7_0)"
        );
    }

    #[test]
    fn no_placeholder_fast_path() {
        assert_eq!(resolve_placeholders("OpenSSH", &CaptureGroups::default()), "OpenSSH");
    }
}
