//! Client address handling.
//!
//! Every IP entering the system goes through [`canonicalize_ip`] before it
//! is hashed, CIDR-matched or logged, so all textual representations of
//! the same address land in the same whitelist bucket.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

/// Canonicalize an address: IPv4-mapped IPv6 collapses to IPv4, everything
/// else keeps its parsed (shortest) form.
pub fn canonicalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Parse and canonicalize an IP literal.
pub fn parse_ip(s: &str) -> Option<IpAddr> {
    s.trim().parse::<IpAddr>().ok().map(canonicalize_ip)
}

/// Resolve the client address: first X-Forwarded-For entry, then
/// X-Real-IP, then the peer socket address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    if let Some(fwd) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = fwd.split(',').next().and_then(parse_ip) {
            return ip;
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = parse_ip(real) {
            return ip;
        }
    }
    canonicalize_ip(peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_ipv4_mapped_collapses() {
        let ip = parse_ip("::ffff:192.0.2.10").expect("parse");
        assert_eq!(ip, IpAddr::from_str("192.0.2.10").expect("v4"));
    }

    #[test]
    fn test_ipv6_keeps_canonical_form() {
        let ip = parse_ip("2001:0db8:0000:0000:0000:0000:0000:0001").expect("parse");
        assert_eq!(ip.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().expect("hv"));
        let peer: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
        assert_eq!(client_ip(&headers, peer).to_string(), "203.0.113.7");
    }

    #[test]
    fn test_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.5:443".parse().expect("addr");
        assert_eq!(client_ip(&headers, peer).to_string(), "192.168.1.5");
    }

    #[test]
    fn test_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.4".parse().expect("hv"));
        let peer: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        assert_eq!(client_ip(&headers, peer).to_string(), "198.51.100.4");
    }
}
