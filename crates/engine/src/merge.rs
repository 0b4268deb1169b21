//! Folding per-probe outcomes into one result

use servprobe_common::{FingerprintError, FingerprintInfo, PortState};

/// Open if any probe saw the port open, otherwise Closed.
#[must_use]
pub fn merge_states(states: &[PortState]) -> PortState {
    if states.contains(&PortState::Open) {
        PortState::Open
    } else {
        PortState::Closed
    }
}

/// Combine fingerprints from several probes of the same port.
///
/// The first info is the root. A later info for the same endpoint replaces it
/// when the root has no rule evidence and the candidate does. HTTP flows and
/// CPEs from every info are concatenated onto the result either way.
#[must_use]
pub fn merge_info(infos: Vec<FingerprintInfo>) -> Option<FingerprintInfo> {
    let mut flows = Vec::new();
    let mut cpes = Vec::new();
    let mut root: Option<FingerprintInfo> = None;

    for info in infos {
        flows.extend(info.http_flows.iter().cloned());
        cpes.extend(info.cpes.iter().cloned());

        match root.as_mut() {
            None => root = Some(info),
            Some(current) if current.same_endpoint(&info) => {
                if !current.has_match_evidence() && info.has_match_evidence() {
                    *current = info;
                } else if current.banner.is_empty() && !info.banner.is_empty() && !current.has_match_evidence() {
                    current.banner = info.banner;
                }
            }
            Some(_) => {}
        }
    }

    root.map(|mut info| {
        info.http_flows = flows;
        info.cpes = cpes;
        info
    })
}

/// One numbered line per probe error, in order; empty when there are none.
#[must_use]
pub fn merge_errors(errors: &[FingerprintError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {e}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use servprobe_common::{HttpFlow, Transport};

    fn info(raw: &str, cpes: &[&str]) -> FingerprintInfo {
        let mut i = FingerprintInfo::new("127.0.0.1", 80, Transport::TCP);
        i.raw = raw.to_string();
        i.service_name = if raw.is_empty() { String::new() } else { "http".into() };
        i.cpes = cpes.iter().map(|c| c.to_string()).collect();
        i
    }

    #[test]
    fn state_precedence() {
        use PortState::*;
        assert_eq!(merge_states(&[Closed, Open, Unknown]), Open);
        assert_eq!(merge_states(&[Closed, Closed]), Closed);
        assert_eq!(merge_states(&[Unknown]), Closed);
        assert_eq!(merge_states(&[]), Closed);
    }

    #[test]
    fn evidence_replaces_root() {
        let mut bare = info("", &["cpe:/a:first"]);
        bare.banner = "HTTP/1.0 200".into();
        bare.http_flows.push(HttpFlow::default());
        let matched = info("match http m|^HTTP|", &["cpe:/a:second"]);
        let later = info("match other m|^X|", &["cpe:/a:third"]);

        let merged = merge_info(vec![bare, matched, later]).unwrap();
        assert_eq!(merged.raw, "match http m|^HTTP|");
        assert_eq!(merged.service_name, "http");
        assert_eq!(merged.cpes, vec!["cpe:/a:first", "cpe:/a:second", "cpe:/a:third"]);
        assert_eq!(merged.http_flows.len(), 1);
    }

    #[test]
    fn other_endpoints_never_become_root() {
        let root = info("", &[]);
        let mut elsewhere = info("match x m|x|", &[]);
        elsewhere.port = 81;
        let merged = merge_info(vec![root, elsewhere]).unwrap();
        assert!(merged.raw.is_empty());
    }

    #[test]
    fn banner_backfilled_without_evidence() {
        let silent = info("", &[]);
        let mut chatty = info("", &[]);
        chatty.banner = "hello".into();
        let merged = merge_info(vec![silent, chatty]).unwrap();
        assert_eq!(merged.banner, "hello");
        assert!(merge_info(Vec::new()).is_none());
    }

    #[test]
    fn every_error_is_numbered() {
        let errs = vec![
            FingerprintError::Network("dial 127.0.0.1:1: refused".into()),
            FingerprintError::Network("dial 127.0.0.1:1: refused".into()),
            FingerprintError::Protocol("UDP cannot support null banner".into()),
        ];
        assert_eq!(
            merge_errors(&errs),
            "1. network error: dial 127.0.0.1:1: refused\n\
             2. network error: dial 127.0.0.1:1: refused\n\
             3. protocol error: UDP cannot support null banner"
        );
        assert_eq!(merge_errors(&[]), "");
    }
}
