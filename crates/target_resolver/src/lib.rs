//! Target Resolver - target-list expansion and DNS resolution
//!
//! `expand_targets` turns a comma-separated target string into individual
//! hosts. Supported token forms:
//! - single address: "1.2.3.4" or "::1"
//! - CIDR: "192.168.1.0/24", "fd00::/120"
//! - IPv4 range: "192.168.1.1-192.168.1.10" or "192.168.1.1-10"
//! - hostname: "example.com" (kept as a name, resolved per request)
//!
//! `resolve_host` maps one host to the address that gets dialed.

use anyhow::{Context, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

/// Largest CIDR expanded without an explicit override.
pub const MAX_HOSTS: u128 = 4096;
pub const ALLOW_LARGE_CIDR_ENV: &str = "SERVPROBE_ALLOW_LARGE_CIDR";

/// Address to dial for `host`.
///
/// Literal addresses (bracketed IPv6 included) are returned as is; names go
/// through the system resolver configuration and the first address wins.
pub async fn resolve_host(host: &str) -> Result<IpAddr> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("empty host");
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .context("Failed to load system resolver configuration")?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .with_context(|| format!("DNS lookup for {host} failed"))?;
    let ip = lookup
        .iter()
        .next()
        .with_context(|| format!("{host} has no address records"))?;
    debug!(host, %ip, "resolved");
    Ok(ip)
}

/// Expand a comma-separated target string into unique hosts, in input order.
pub fn expand_targets(targets: &str) -> Result<Vec<String>> {
    if targets.trim().is_empty() {
        anyhow::bail!("No targets specified");
    }

    let mut hosts: Vec<String> = Vec::new();
    let mut push = |host: String| {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    };

    for token in targets.split(',') {
        let t = token.trim();
        if t.is_empty() {
            continue;
        }

        if let Ok(net) = t.parse::<IpNet>() {
            for ip in expand_cidr(net)? {
                push(ip.to_string());
            }
            continue;
        }

        if t.contains('-') && !t.contains(':') && t.starts_with(|c: char| c.is_ascii_digit()) {
            if let Ok(range) = parse_ip_range(t) {
                for ip in range {
                    push(ip.to_string());
                }
                continue;
            }
        }

        push(t.to_string());
    }

    if hosts.is_empty() {
        anyhow::bail!("No valid targets found in {targets:?}");
    }
    Ok(hosts)
}

fn expand_cidr(net: IpNet) -> Result<Vec<IpAddr>> {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    let hosts_count = if host_bits >= 128 { u128::MAX } else { 1u128 << host_bits };
    let allow_large = std::env::var(ALLOW_LARGE_CIDR_ENV)
        .map(|v| v == "1")
        .unwrap_or(false);
    if hosts_count > MAX_HOSTS && !allow_large {
        anyhow::bail!(
            "CIDR {} expands to {} hosts which exceeds the allowed limit of {}. Set {}=1 to override.",
            net,
            hosts_count,
            MAX_HOSTS,
            ALLOW_LARGE_CIDR_ENV
        );
    }
    Ok(net.hosts().collect())
}

/// Inclusive bounds of an IPv4 range, either "a.b.c.d-a.b.c.e" or the
/// last-octet shorthand "a.b.c.d-e".
pub fn ip_range_bounds(range: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let (start, end) = range
        .split_once('-')
        .with_context(|| format!("Invalid IP range: {range}"))?;
    let start: Ipv4Addr = start
        .trim()
        .parse()
        .with_context(|| format!("Invalid start IP: {start}"))?;
    let end = end.trim();
    let end: Ipv4Addr = match end.parse::<u8>() {
        Ok(last) => {
            let [a, b, c, _] = start.octets();
            Ipv4Addr::new(a, b, c, last)
        }
        Err(_) => end
            .parse()
            .with_context(|| format!("Invalid end IP: {end}"))?,
    };

    if start > end {
        anyhow::bail!("Invalid IP range: start > end");
    }
    Ok((start, end))
}

fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>> {
    let (start, end) = ip_range_bounds(range)?;
    let (start, end) = (u32::from(start), u32::from(end));
    Ok((start..=end).map(|v| IpAddr::V4(Ipv4Addr::from(v))).collect())
}
