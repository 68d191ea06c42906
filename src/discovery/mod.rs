//! Peer discovery: finders (L8) and the fan-out manager (L9).

pub mod global_client;
pub mod local_beacon;
pub mod manager;
pub mod peer_assisted;

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use url::{Host, Url};

use crate::cert::pinning::DeviceId;
use crate::error::CoreResult;

/// A single discovery mechanism; the manager composes finders as a
/// capability it can fan out to and merge results from.
#[async_trait]
pub trait Finder: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn timeout(&self) -> Duration;
    async fn lookup(&self, device: DeviceId) -> CoreResult<Vec<String>>;
}

/// Filters a raw candidate address list: drops loopback, multicast,
/// broadcast, port-0, and unparsable entries; for
/// the `relay` scheme, only the `id` query parameter is retained.
pub fn filter_addresses(raw: &[String]) -> Vec<String> {
    raw.iter().filter_map(|s| filter_one(s)).collect()
}

/// Reconstructs the address from its parsed parts rather than
/// round-tripping through `Url::to_string()`, which appends a trailing
/// slash to authority-only URLs (`tcp://host:port` becomes
/// `tcp://host:port/`).
fn filter_one(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let port = url.port().unwrap_or(0);
    if port == 0 {
        return None;
    }

    match url.host()? {
        Host::Ipv4(v4) => {
            let ip = IpAddr::V4(v4);
            if ip.is_loopback() || is_multicast(&ip) || is_broadcast(&ip) {
                return None;
            }
        }
        Host::Ipv6(v6) => {
            let ip = IpAddr::V6(v6);
            if ip.is_loopback() || is_multicast(&ip) {
                return None;
            }
        }
        Host::Domain(_) => {}
    }

    let host_str = url.host_str()?;
    let scheme = url.scheme();

    if scheme == "relay" {
        let id = url
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned());
        return Some(match id {
            Some(id) => format!("relay://{host_str}:{port}?id={id}"),
            None => format!("relay://{host_str}:{port}"),
        });
    }

    Some(format!("{scheme}://{host_str}:{port}"))
}

fn is_multicast(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_multicast(),
        std::net::IpAddr::V6(v6) => v6.is_multicast(),
    }
}

fn is_broadcast(ip: &std::net::IpAddr) -> bool {
    matches!(ip, std::net::IpAddr::V4(v4) if *v4 == std::net::Ipv4Addr::BROADCAST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_invalid_and_reserved_addresses() {
        let input = vec![
            "tcp://192.0.2.1:22000".to_string(),
            "tcp://127.0.0.1:22000".to_string(),
            "tcp://0.0.0.0:22000".to_string(),
            "tcp://foo:bar".to_string(),
            "tcp://[::1]:22000".to_string(),
        ];
        let filtered = filter_addresses(&input);
        assert_eq!(
            filtered,
            vec!["tcp://192.0.2.1:22000".to_string(), "tcp://0.0.0.0:22000".to_string()]
        );
    }

    #[test]
    fn relay_scheme_keeps_only_id_param() {
        let input = vec!["relay://relay.example.com:443?id=ABC&token=secret".to_string()];
        let filtered = filter_addresses(&input);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].contains("id=ABC"));
        assert!(!filtered[0].contains("token"));
    }
}
