//! Address helpers
//!
//! Port range parsing, ingress IP derivation, IP family selection between hops
//! and the address policy used to pick probe targets.

use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::error::{CoreError, CoreResult};
use crate::model::{IpPreference, Node};

/// Parse a port range spec such as `"1000-1005, 2000,abc"` into sorted, unique ports.
///
/// Tokens that do not parse are skipped.
pub fn parse_port_range(spec: &str) -> Vec<u16> {
    let mut ports = BTreeSet::new();

    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((start, end)) = token.split_once('-') {
            let (Some(mut start), Some(mut end)) = (parse_port(start), parse_port(end)) else {
                continue;
            };
            if end < start {
                std::mem::swap(&mut start, &mut end);
            }
            ports.extend(start..=end);
        } else if let Some(port) = parse_port(token) {
            ports.insert(port);
        }
    }

    ports.into_iter().collect()
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Some(p as u16),
        _ => None,
    }
}

/// First port named by a range spec, if any
pub fn first_port_from_range(spec: &str) -> Option<u16> {
    let first = spec.split(',').next()?.trim();
    match first.split_once('-') {
        Some((start, _)) => parse_port(start),
        None => parse_port(first),
    }
}

/// Strip whitespace and IPv6 brackets
pub fn normalize_host(raw: &str) -> String {
    raw.trim().trim_start_matches('[').trim_end_matches(']').to_string()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(normalize_host)
        .filter(|s| !s.is_empty())
}

/// Explicit IPv4 address, else the legacy address when it is IPv4 or a hostname
pub fn node_address_v4(node: &Node) -> Option<String> {
    if let Some(v4) = non_empty(&node.server_ip_v4) {
        return Some(v4);
    }
    let legacy = normalize_host(&node.server_ip);
    match legacy.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Some(legacy),
        Ok(IpAddr::V6(_)) => None,
        Err(_) if !legacy.is_empty() => Some(legacy),
        Err(_) => None,
    }
}

/// Explicit IPv6 address, else the legacy address when it is IPv6 or a hostname
pub fn node_address_v6(node: &Node) -> Option<String> {
    if let Some(v6) = non_empty(&node.server_ip_v6) {
        return Some(v6);
    }
    let legacy = normalize_host(&node.server_ip);
    match legacy.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => Some(legacy),
        Ok(IpAddr::V4(_)) => None,
        Err(_) if !legacy.is_empty() => Some(legacy),
        Err(_) => None,
    }
}

/// Whether a node can be reached over IPv4
pub fn node_supports_v4(node: &Node) -> bool {
    if non_empty(&node.server_ip_v4).is_some() {
        return true;
    }
    if non_empty(&node.server_ip_v6).is_some() {
        return false;
    }
    node_address_v4(node).is_some()
}

/// Whether a node can be reached over IPv6
pub fn node_supports_v6(node: &Node) -> bool {
    if non_empty(&node.server_ip_v6).is_some() {
        return true;
    }
    if non_empty(&node.server_ip_v4).is_some() {
        return false;
    }
    node_address_v6(node).is_some()
}

/// Host `from` should dial to reach `to`, honoring the tunnel preference.
///
/// A family is only usable when both ends support it.
pub fn select_dial_host(from: &Node, to: &Node, preference: IpPreference) -> CoreResult<String> {
    let v4 = || {
        (node_supports_v4(from) && node_supports_v4(to))
            .then(|| node_address_v4(to))
            .flatten()
    };
    let v6 = || {
        (node_supports_v6(from) && node_supports_v6(to))
            .then(|| node_address_v6(to))
            .flatten()
    };

    let host = match preference {
        IpPreference::V6 => v6().or_else(v4),
        IpPreference::V4 | IpPreference::Any => v4().or_else(v6),
    };

    host.ok_or_else(|| {
        CoreError::InvalidInput(format!(
            "nodes {} and {} share no usable IP family",
            from.name, to.name
        ))
    })
}

/// Effective ingress addresses of a tunnel: IPv4 then IPv6 of each entry node,
/// in entry order, without duplicates; legacy address when a node has neither.
pub fn build_in_ip<'a>(entry_nodes: impl IntoIterator<Item = &'a Node>) -> String {
    let mut seen = BTreeSet::new();
    let mut out: Vec<String> = Vec::new();
    let mut push = |value: String| {
        if !value.is_empty() && seen.insert(value.clone()) {
            out.push(value);
        }
    };

    for node in entry_nodes {
        let v4 = non_empty(&node.server_ip_v4);
        let v6 = non_empty(&node.server_ip_v6);
        if v4.is_none() && v6.is_none() {
            push(normalize_host(&node.server_ip));
            continue;
        }
        if let Some(v4) = v4 {
            push(v4);
        }
        if let Some(v6) = v6 {
            push(v6);
        }
    }

    out.join(",")
}

/// Split `host:port` (IPv6 may be bracketed); `None` when unusable
pub fn parse_target_address(raw: &str) -> Option<(String, u16)> {
    let raw = raw.trim();
    let (host, port) = if let Ok(addr) = raw.parse::<std::net::SocketAddr>() {
        (addr.ip().to_string(), addr.port().to_string())
    } else {
        let idx = raw.rfind(':')?;
        if idx == 0 || idx + 1 >= raw.len() {
            return None;
        }
        (raw[..idx].to_string(), raw[idx + 1..].to_string())
    };

    let port = parse_port(&port)?;
    let host = normalize_host(&host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// `host:port`, bracketing bare IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Comma separated target list, invalid entries dropped
pub fn parse_target_list(raw: &str) -> Vec<(String, u16)> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(parse_target_address)
        .collect()
}

/// Policy choosing which address of a node to probe for a given tunnel preference
pub trait AddressSelector: Send + Sync {
    /// Policy name used in configuration
    fn name(&self) -> &'static str;

    /// Address to target on `node`, or `None` if it has none configured
    fn select(&self, node: &Node, preference: IpPreference) -> Option<String>;
}

/// Preferred family first, then the other family, then the legacy address.
/// With no preference IPv4 is tried first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferenceOrder;

impl AddressSelector for PreferenceOrder {
    fn name(&self) -> &'static str {
        "preference-order"
    }

    fn select(&self, node: &Node, preference: IpPreference) -> Option<String> {
        let v4 = non_empty(&node.server_ip_v4);
        let v6 = non_empty(&node.server_ip_v6);
        let legacy = Some(normalize_host(&node.server_ip)).filter(|s| !s.is_empty());

        match preference {
            IpPreference::V6 => v6.or(v4).or(legacy),
            IpPreference::V4 | IpPreference::Any => v4.or(v6).or(legacy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(server_ip: &str, v4: Option<&str>, v6: Option<&str>) -> Node {
        Node {
            id: 1,
            name: "n".into(),
            secret: "s".into(),
            server_ip: server_ip.into(),
            server_ip_v4: v4.map(String::from),
            server_ip_v6: v6.map(String::from),
            port: "1000-1010".into(),
            tcp_listen_addr: "[::]".into(),
            udp_listen_addr: "[::]".into(),
            interface_name: None,
            version: None,
            http: false,
            tls: false,
            socks: false,
            status: 0,
            is_remote: false,
            remote_url: None,
            remote_token: None,
            remote_config: None,
            created_time: 0,
        }
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("5-3, 4,10,abc, 0, 70000,9-x"), vec![3, 4, 5, 10]);
        assert_eq!(parse_port_range(""), Vec::<u16>::new());
        assert_eq!(parse_port_range("30000-30002").len(), 3);
    }

    #[test]
    fn test_first_port_from_range() {
        assert_eq!(first_port_from_range("2000-3000,10"), Some(2000));
        assert_eq!(first_port_from_range(" 15 "), Some(15));
        assert_eq!(first_port_from_range("x"), None);
    }

    #[test]
    fn test_build_in_ip() {
        let a = make_node("legacy-a", Some("1.1.1.1"), Some("::1"));
        let b = make_node("2.2.2.2", None, None);
        let c = make_node("", Some("1.1.1.1"), None);

        assert_eq!(build_in_ip([&a, &b, &c]), "1.1.1.1,::1,2.2.2.2");
    }

    #[test]
    fn test_select_dial_host_prefers_v6_when_shared() {
        let from = make_node("", Some("1.1.1.1"), Some("2001:db8::1"));
        let to = make_node("", Some("2.2.2.2"), Some("[2001:db8::2]"));

        assert_eq!(select_dial_host(&from, &to, IpPreference::V6).unwrap(), "2001:db8::2");
        assert_eq!(select_dial_host(&from, &to, IpPreference::V4).unwrap(), "2.2.2.2");
        assert_eq!(select_dial_host(&from, &to, IpPreference::Any).unwrap(), "2.2.2.2");
    }

    #[test]
    fn test_select_dial_host_falls_back_to_common_family() {
        let v4_only = make_node("", Some("1.1.1.1"), None);
        let dual = make_node("", Some("2.2.2.2"), Some("2001:db8::2"));
        let v6_only = make_node("2001:db8::3", None, None);

        assert_eq!(select_dial_host(&v4_only, &dual, IpPreference::V6).unwrap(), "2.2.2.2");
        assert!(select_dial_host(&v4_only, &v6_only, IpPreference::Any).is_err());
    }

    #[test]
    fn test_hostname_counts_for_both_families() {
        let host = make_node("relay.example.com", None, None);
        assert!(node_supports_v4(&host));
        assert!(node_supports_v6(&host));
    }

    #[test]
    fn test_preference_order_selector() {
        let dual = make_node("legacy", Some("1.1.1.1"), Some("2001:db8::1"));
        let v4_only = make_node("", Some("1.1.1.1"), None);
        let legacy_only = make_node("legacy.example.com", None, None);

        let policy = PreferenceOrder;
        assert_eq!(policy.select(&dual, IpPreference::V6).as_deref(), Some("2001:db8::1"));
        assert_eq!(policy.select(&dual, IpPreference::Any).as_deref(), Some("1.1.1.1"));
        assert_eq!(policy.select(&v4_only, IpPreference::V6).as_deref(), Some("1.1.1.1"));
        assert_eq!(
            policy.select(&legacy_only, IpPreference::V4).as_deref(),
            Some("legacy.example.com")
        );
    }

    #[test]
    fn test_parse_target_address() {
        assert_eq!(parse_target_address("1.2.3.4:80"), Some(("1.2.3.4".into(), 80)));
        assert_eq!(parse_target_address("[2001:db8::1]:443"), Some(("2001:db8::1".into(), 443)));
        assert_eq!(parse_target_address("example.com:8080"), Some(("example.com".into(), 8080)));
        assert_eq!(parse_target_address("example.com"), None);
        assert_eq!(parse_target_address("example.com:0"), None);
        assert_eq!(
            parse_target_list("a:1, bad, b:2"),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("1.2.3.4", 80), "1.2.3.4:80");
        assert_eq!(join_host_port("2001:db8::1", 443), "[2001:db8::1]:443");
        assert_eq!(join_host_port("[::]", 10000), "[::]:10000");
    }
}
