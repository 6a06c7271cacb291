//! Geographic attribution for the network defense service.
//!
//! Country lookup sits behind the `GeoResolver` trait so a real geolocation
//! provider (MaxMind or similar) can be substituted without touching the
//! detection logic. The shipped implementation is a coarse first-octet
//! heuristic and must not be treated as authoritative.

use std::net::IpAddr;

/// Resolves a source address to an ISO-style country code.
///
/// Returning `None` means "unattributable" (private ranges, loopback, or an
/// address family the resolver does not cover); detection treats such sources
/// as geographically neutral.
pub trait GeoResolver: Send + Sync {
    fn country(&self, ip: &IpAddr) -> Option<&'static str>;
}

/// Placeholder resolver mapping first-octet ranges to coarse country codes.
///
/// The ranges are illustrative, not real allocations. Production deployments
/// substitute a resolver backed by an actual geolocation database.
pub struct OctetHeuristicResolver;

impl GeoResolver for OctetHeuristicResolver {
    fn country(&self, ip: &IpAddr) -> Option<&'static str> {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            // The heuristic only covers IPv4.
            IpAddr::V6(_) => return None,
        };

        if v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() {
            return None;
        }

        match v4.octets()[0] {
            1..=99 => Some("US"),
            100..=126 => Some("DE"),
            128..=149 => Some("CN"),
            150..=179 => Some("RU"),
            180..=199 => Some("BR"),
            200..=219 => Some("AU"),
            _ => Some("JP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_private_addresses_unattributed() {
        let resolver = OctetHeuristicResolver;

        assert_eq!(resolver.country(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), None);
        assert_eq!(resolver.country(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))), None);
        assert_eq!(resolver.country(&IpAddr::V4(Ipv4Addr::LOCALHOST)), None);
    }

    #[test]
    fn test_ipv6_unattributed() {
        let resolver = OctetHeuristicResolver;
        assert_eq!(resolver.country(&IpAddr::V6(Ipv6Addr::LOCALHOST)), None);
    }

    #[test]
    fn test_public_addresses_resolve_deterministically() {
        let resolver = OctetHeuristicResolver;
        let ip = IpAddr::V4(Ipv4Addr::new(128, 9, 1, 1));

        assert_eq!(resolver.country(&ip), Some("CN"));
        assert_eq!(resolver.country(&ip), resolver.country(&ip));
    }
}
