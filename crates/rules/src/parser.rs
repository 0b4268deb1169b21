//! Line parsers for the probe-definition language
//!
//! ```text
//! Probe TCP GetRequest q|GET / HTTP/1.0\r\n\r\n|
//! rarity 1
//! ports 80,443,8000-8010
//! match http m|^HTTP/1\.[01] \d\d\d| p/Generic httpd/
//! ```

use fancy_regex::{Regex, RegexBuilder};
use servprobe_common::Transport;

use crate::error::RuleParseError;
use crate::scanner::DataBlockScanner;
use crate::template::{resolve_placeholders, CaptureGroups, ResolvedFields};

/// Backtracking budget per match attempt.
///
/// Rule regexes run on a backtracking engine; this bounds a pathological
/// pattern to well under a second of work on a 20KiB banner.
pub const MATCH_BACKTRACK_LIMIT: usize = 200_000;

/// Stable probe identity assigned at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub usize);

/// A named payload sent to elicit a banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: usize,
    pub rarity: u8,
    pub default_ports: Vec<u16>,
    pub transport: Transport,
    pub name: String,
    pub payload: Vec<u8>,
    pub raw_line: String,
}

impl Probe {
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProbeId {
        ProbeId(self.index)
    }

    /// Probes with no payload only listen for what the service volunteers.
    #[inline]
    #[must_use]
    pub fn is_empty_payload(&self) -> bool {
        self.payload.is_empty()
    }

    /// Identity used when merging rule sets.
    #[inline]
    #[must_use]
    pub fn same_identity(&self, other: &Probe) -> bool {
        self.name == other.name && self.payload == other.payload
    }

    #[inline]
    #[must_use]
    pub fn covers_port(&self, port: u16) -> bool {
        self.default_ports.contains(&port)
    }
}

/// A compiled `match` / `softmatch` rule.
#[derive(Debug, Clone)]
pub struct Match {
    pub soft: bool,
    pub service_name: String,
    pub pattern: String,
    pub flags: String,
    regex: Regex,

    pub product_verbose: String,
    pub version: String,
    pub info: String,
    pub hostname: String,
    pub operation_verbose: String,
    pub device_type: String,
    pub cpes: Vec<String>,

    pub raw_line: String,
}

impl Match {
    /// Run the rule regex against a matchable banner (see `to_match_text`).
    ///
    /// A regex that exhausts its backtracking budget counts as no match.
    #[must_use]
    pub fn find(&self, text: &str) -> Option<CaptureGroups> {
        match self.regex.captures(text) {
            Ok(Some(caps)) => Some(CaptureGroups::from_captures(&caps)),
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(service = %self.service_name, error = %err, "match aborted");
                None
            }
        }
    }

    /// Fill every templated field from the capture groups.
    #[must_use]
    pub fn resolve(&self, groups: &CaptureGroups) -> ResolvedFields {
        ResolvedFields {
            product_verbose: resolve_placeholders(&self.product_verbose, groups),
            version: resolve_placeholders(&self.version, groups),
            info: resolve_placeholders(&self.info, groups),
            hostname: resolve_placeholders(&self.hostname, groups),
            operation_verbose: resolve_placeholders(&self.operation_verbose, groups),
            device_type: resolve_placeholders(&self.device_type, groups),
            cpes: self
                .cpes
                .iter()
                .map(|cpe| resolve_placeholders(cpe, groups))
                .collect(),
        }
    }
}

/// Parse `Probe <TCP|UDP> <name> q<d><payload><d> [no-payload]`.
pub fn parse_probe_line(line: &str) -> Result<Probe, RuleParseError> {
    let mut parts = line.splitn(4, ' ');
    if parts.next() != Some("Probe") {
        return Err(RuleParseError::Probe(format!("missing Probe keyword: {line}")));
    }
    let transport = match parts.next() {
        Some("TCP") => Transport::TCP,
        Some("UDP") => Transport::UDP,
        other => {
            return Err(RuleParseError::Probe(format!(
                "unsupported transport {:?}",
                other.unwrap_or("")
            )))
        }
    };
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RuleParseError::Probe("missing probe name".to_string()))?;
    let raw_payload = parts
        .next()
        .ok_or_else(|| RuleParseError::Probe(format!("missing payload for {name}")))?;

    let mut chars = raw_payload.char_indices();
    match chars.next() {
        Some((_, 'q')) => {}
        _ => {
            return Err(RuleParseError::Probe(format!(
                "payload must start with q<delim>: {raw_payload}"
            )))
        }
    }
    let (start, delimiter) = chars
        .next()
        .ok_or_else(|| RuleParseError::Probe("payload has no delimiter".to_string()))?;
    let body_start = start + delimiter.len_utf8();
    let body_len = raw_payload[body_start..]
        .find(delimiter)
        .ok_or_else(|| RuleParseError::Probe(format!("unterminated payload in {name}")))?;
    let payload = unescape_payload(&raw_payload[body_start..body_start + body_len])?;

    Ok(Probe {
        index: 0,
        rarity: 0,
        default_ports: Vec::new(),
        transport,
        name: name.to_string(),
        payload,
        raw_line: line.to_string(),
    })
}

/// C-style unescape of a probe payload.
///
/// Supports `\0 \a \b \f \n \r \t \v \xHH`; any other escaped character is
/// passed through literally (`\\` → `\`, `\|` → `|`).
pub fn unescape_payload(input: &str) -> Result<Vec<u8>, RuleParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        let Some(&next) = bytes.get(i + 1) else {
            // lone trailing backslash
            out.push(b'\\');
            break;
        };
        match next {
            b'0' => out.push(0x00),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                let hex = bytes.get(i + 2..i + 4).ok_or_else(|| RuleParseError::Escape {
                    offset: i,
                    reason: "truncated \\x escape".to_string(),
                })?;
                let value = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| RuleParseError::Escape {
                        offset: i,
                        reason: format!("bad hex digits {:?}", String::from_utf8_lossy(hex)),
                    })?;
                out.push(value);
                i += 4;
                continue;
            }
            other => out.push(other),
        }
        i += 2;
    }
    Ok(out)
}

/// Inverse of `unescape_payload`, suitable for writing a `q|...|` payload.
#[must_use]
pub fn escape_payload(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len());
    for &b in payload {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'|' => out.push_str("\\x7c"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Parse a `match` or `softmatch` line.
pub fn parse_match_line(line: &str) -> Result<Match, RuleParseError> {
    let (soft, rest) = if let Some(rest) = line.strip_prefix("softmatch ") {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix("match ") {
        (false, rest)
    } else {
        return Err(RuleParseError::Match(format!("not a match line: {line}")));
    };

    let rest = rest.trim_start();
    let (service_name, blocks_text) = rest
        .split_once(' ')
        .ok_or_else(|| RuleParseError::Match(format!("missing pattern: {line}")))?;

    let blocks = DataBlockScanner::scan(blocks_text)?;
    let mut iter = blocks.into_iter();
    let pattern_block = iter
        .next()
        .filter(|b| b.tag == "m")
        .ok_or_else(|| RuleParseError::Match(format!("first block must be m/.../: {line}")))?;

    let regex = compile_pattern(&pattern_block.data, &pattern_block.options)?;
    let mut rule = Match {
        soft,
        service_name: service_name.to_string(),
        pattern: pattern_block.data,
        flags: pattern_block.options,
        regex,
        product_verbose: String::new(),
        version: String::new(),
        info: String::new(),
        hostname: String::new(),
        operation_verbose: String::new(),
        device_type: String::new(),
        cpes: Vec::new(),
        raw_line: line.to_string(),
    };

    for block in iter {
        match block.tag.as_str() {
            "p" => rule.product_verbose = block.data,
            "v" => rule.version = block.data,
            "i" => rule.info = block.data,
            "h" => rule.hostname = block.data,
            "o" => rule.operation_verbose = block.data,
            "d" => rule.device_type = block.data,
            "cpe:" => rule.cpes.push(format!("cpe:/{}", block.data)),
            "m" => {
                return Err(RuleParseError::Match(format!("duplicate m block: {line}")));
            }
            _ => {}
        }
    }
    Ok(rule)
}

fn compile_pattern(pattern: &str, flags: &str) -> Result<Regex, RuleParseError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    let mut inline = String::new();
    if flags.contains('i') {
        inline.push('i');
    }
    if flags.contains('s') {
        inline.push('s');
    }
    if !inline.is_empty() {
        source.push_str(&format!("(?{inline})"));
    }
    source.push_str(&normalize_null_escapes(pattern));

    RegexBuilder::new(&source)
        .backtrack_limit(MATCH_BACKTRACK_LIMIT)
        .build()
        .map_err(|e| RuleParseError::Regex(format!("{pattern}: {e}")))
}

/// Rewrite `\0` as `\x00`; an escaped backslash is left alone.
fn normalize_null_escapes(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('0') => out.push_str("\\x00"),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse `rarity N`.
pub fn parse_rarity(line: &str) -> Result<u8, RuleParseError> {
    let value = line
        .strip_prefix("rarity")
        .map(str::trim)
        .ok_or_else(|| RuleParseError::Directive(format!("not a rarity line: {line}")))?;
    value
        .parse::<u8>()
        .map_err(|e| RuleParseError::Directive(format!("rarity {value:?}: {e}")))
}

/// Parse `ports 80,443,8000-8010`.
pub fn parse_ports(line: &str) -> Result<Vec<u16>, RuleParseError> {
    let list = line
        .strip_prefix("ports")
        .map(str::trim)
        .ok_or_else(|| RuleParseError::Directive(format!("not a ports line: {line}")))?;

    let mut ports = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let bad = |e: std::num::ParseIntError| {
            RuleParseError::Directive(format!("port {token:?}: {e}"))
        };
        if let Some((start, end)) = token.split_once('-') {
            let start: u16 = start.trim().parse().map_err(bad)?;
            let end: u16 = end.trim().parse().map_err(bad)?;
            if start > end {
                return Err(RuleParseError::Directive(format!("inverted range {token}")));
            }
            ports.extend(start..=end);
        } else {
            ports.push(token.parse().map_err(bad)?);
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::to_match_text;

    #[test]
    fn probe_line_roundtrip() {
        let line = r"Probe TCP GetRequest q|GET / HTTP/1.0\r\n\r\n|";
        let probe = parse_probe_line(line).unwrap();
        assert_eq!(probe.raw_line, line);
        assert_eq!(probe.transport, Transport::TCP);
        assert_eq!(probe.name, "GetRequest");
        assert_eq!(probe.payload, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(escape_payload(&probe.payload), r"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn probe_payload_with_nulls() {
        let line = r"Probe UDP Citrix q|\x1e\0\x01\x30\x02\xfd\xa8\xe3\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0|";
        let probe = parse_probe_line(line).unwrap();
        assert_eq!(probe.transport, Transport::UDP);
        assert_eq!(probe.payload.len(), 30);
        assert_eq!(&probe.payload[..4], &[0x1e, 0x00, 0x01, 0x30]);
    }

    #[test]
    fn empty_payload_and_trailing_options() {
        let probe = parse_probe_line("Probe TCP NULL q||").unwrap();
        assert!(probe.is_empty_payload());

        let probe = parse_probe_line(r"Probe UDP DNSStatusRequest q|\0\0\x10\0\0\0\0\0\0\0\0\0| no-payload").unwrap();
        assert_eq!(probe.payload.len(), 12);
    }

    #[test]
    fn probe_line_errors() {
        assert!(parse_probe_line("Probe SCTP X q||").is_err());
        assert!(parse_probe_line("Probe TCP X |abc|").is_err());
        assert!(parse_probe_line("Probe TCP X q|abc").is_err());
        assert!(parse_probe_line(r"Probe TCP X q|\x4|").is_err());
        assert!(parse_probe_line(r"Probe TCP X q|\xzz|").is_err());
    }

    #[test]
    fn escape_roundtrip() {
        let raw = b"\x00\x01GET |x|\\\r\n\t\xff";
        let escaped = escape_payload(raw);
        assert_eq!(unescape_payload(&escaped).unwrap(), raw.to_vec());
    }

    #[test]
    fn unescape_named_escapes() {
        assert_eq!(
            unescape_payload(r"\a\b\f\v\\\|").unwrap(),
            vec![0x07, 0x08, 0x0c, 0x0b, b'\\', b'|']
        );
    }

    #[test]
    fn match_line_fields() {
        let line = r"match ssh m|^SSH-([\d.]+)-OpenSSH_([\w._-]+)\r?\n| p/OpenSSH/ v/$2/ i/protocol $1/ o/Linux/ cpe:/a:openbsd:openssh:$2/ cpe:/o:linux:linux_kernel/a";
        let m = parse_match_line(line).unwrap();
        assert!(!m.soft);
        assert_eq!(m.service_name, "ssh");
        assert_eq!(m.product_verbose, "OpenSSH");
        assert_eq!(m.version, "$2");
        assert_eq!(m.operation_verbose, "Linux");
        assert_eq!(
            m.cpes,
            vec!["cpe:/a:openbsd:openssh:$2".to_string(), "cpe:/o:linux:linux_kernel".to_string()]
        );
        assert_eq!(m.raw_line, line);
    }

    #[test]
    fn softmatch_without_tags() {
        let m = parse_match_line(r"softmatch ftp m|^220[- ].*FTP|i").unwrap();
        assert!(m.soft);
        assert_eq!(m.flags, "i");
        assert!(m.find(&to_match_text(b"220 welcome to ftp service\r\n")).is_some());
    }

    #[test]
    fn single_line_flag() {
        let m = parse_match_line(r"match http m|^HTTP/1\.1 200.*Server: nginx|s p/nginx/").unwrap();
        assert!(m.find(&to_match_text(b"HTTP/1.1 200 OK\r\nServer: nginx\r\n")).is_some());

        let strict = parse_match_line(r"match http m|^HTTP/1\.1 200.*Server: nginx| p/nginx/").unwrap();
        assert!(strict.find(&to_match_text(b"HTTP/1.1 200 OK\r\nServer: nginx\r\n")).is_none());
    }

    #[test]
    fn null_escape_in_pattern_matches_binary() {
        let m = parse_match_line(r"match mysql m|^.\0\0\0\x0a([\w._-]+)\0| p/MySQL/ v/$1/").unwrap();
        let banner = b"J\x00\x00\x00\x0a5.7.33-log\x00\x08\x00\x00\x00";
        let groups = m.find(&to_match_text(banner)).unwrap();
        assert_eq!(m.resolve(&groups).version, "5.7.33-log");
    }

    #[test]
    fn match_line_errors() {
        assert!(parse_match_line("match ssh").is_err());
        assert!(parse_match_line("match ssh p/OpenSSH/").is_err());
        assert!(parse_match_line("match ssh m|(unclosed|").is_err());
        assert!(parse_match_line("match ssh m|x| qqqqq/y/").is_err());
    }

    #[test]
    fn directives() {
        assert_eq!(parse_rarity("rarity 7").unwrap(), 7);
        assert!(parse_rarity("rarity x").is_err());
        assert_eq!(parse_ports("ports 80,443,8000-8002").unwrap(), vec![80, 443, 8000, 8001, 8002]);
        assert!(parse_ports("ports 90-80").is_err());
        assert!(parse_ports("ports abc").is_err());
    }
}
