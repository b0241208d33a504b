//! CIDR pattern parsing, normalization and matching.
//!
//! Whitelist entries are keyed by CIDR patterns. Admin-supplied IPv4
//! addresses are widened to their /24 network; IPv6 addresses are stored
//! as /128 unless an explicit prefix is given. Matching is exact binary
//! prefix containment on canonicalized addresses.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::net::canonicalize_ip;

/// Parse a pattern as supplied: a CIDR, or a bare IP as a host network.
/// No widening. Returns None for malformed literals.
pub fn parse_pattern(s: &str) -> Option<IpNet> {
    let s = s.trim();
    if s.contains('/') {
        s.parse::<IpNet>().ok().map(|n| n.trunc())
    } else {
        let ip = canonicalize_ip(s.parse::<IpAddr>().ok()?);
        Some(IpNet::from(ip))
    }
}

/// Normalize an admin-supplied IP or CIDR into the stored pattern form:
/// IPv4 collapses to the /24 network of its address, IPv6 keeps an
/// explicit prefix or becomes /128.
pub fn normalize_pattern(s: &str) -> Option<String> {
    let s = s.trim();
    match s.split_once('/') {
        Some((addr, _)) => {
            let ip = canonicalize_ip(addr.parse::<IpAddr>().ok()?);
            match ip {
                IpAddr::V4(_) => Some(IpNet::new(ip, 24).ok()?.trunc().to_string()),
                IpAddr::V6(_) => Some(s.parse::<IpNet>().ok()?.trunc().to_string()),
            }
        }
        None => {
            let ip = canonicalize_ip(s.parse::<IpAddr>().ok()?);
            Some(widen_host(ip).to_string())
        }
    }
}

/// Widen a single address into its stored network: /24 for IPv4,
/// /128 for IPv6.
pub fn widen_host(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(_) => IpNet::new(ip, 24).map(|n| n.trunc()).unwrap_or_else(|_| IpNet::from(ip)),
        IpAddr::V6(_) => IpNet::from(ip),
    }
}

/// Check a canonicalized client address against one stored pattern.
pub fn ip_in_pattern(ip: IpAddr, pattern: &str) -> bool {
    match parse_pattern(pattern) {
        Some(net) => net.contains(&ip),
        None => false,
    }
}

/// Check an address against a pattern list, reporting the matched pattern.
pub fn match_patterns<'a>(ip: IpAddr, patterns: &'a [String]) -> Option<&'a str> {
    let ip = canonicalize_ip(ip);
    patterns
        .iter()
        .find(|p| !p.is_empty() && ip_in_pattern(ip, p))
        .map(String::as_str)
}

/// Encode a pattern for use inside a Redis key segment.
pub fn encode_key_segment(pattern: &str) -> String {
    pattern.replace('/', "_")
}
