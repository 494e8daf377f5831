//! Local source-address inventory.
//!
//! Enumerates the interface addresses this host could plausibly bind
//! outbound sockets to. The result is what the agent reports to the
//! coordinator on registration and on every heartbeat, so it must be cheap
//! to recompute and deterministic for a given interface state.
//!
//! The inventory is advisory: an address that disappears between two scans
//! simply causes the next bind attempt against it to fail, which the
//! coordinator handles like any other per-request failure.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

/// Enumerate usable local addresses: deduplicated and lexicographically
/// sorted by textual form.
pub fn scan() -> Vec<String> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
            return Vec::new();
        }
    };
    let addresses = filter_and_sort(interfaces.into_iter().map(|(_, ip)| ip));
    if addresses.is_empty() {
        warn!("no routable local addresses found");
    } else {
        debug!(count = addresses.len(), "scanned local addresses");
    }
    addresses
}

/// Filter a raw address list down to bindable source candidates.
pub fn filter_and_sort(addresses: impl IntoIterator<Item = IpAddr>) -> Vec<String> {
    let set: BTreeSet<String> = addresses
        .into_iter()
        .filter(is_routable)
        .map(|ip| ip.to_string())
        .collect();
    set.into_iter().collect()
}

/// Whether an address is worth offering to the pool.
///
/// Rejects loopback, link-local, multicast, unspecified, broadcast,
/// IPv6 unique-local, IPv4-mapped IPv6, and the documentation ranges.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => is_routable_v6(v6),
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    if ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
    {
        return false;
    }
    // Documentation ranges: 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24.
    let o = ip.octets();
    !matches!(
        (o[0], o[1], o[2]),
        (192, 0, 2) | (198, 51, 100) | (203, 0, 113)
    )
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return false;
    }
    if ip.to_ipv4_mapped().is_some() {
        return false;
    }
    let seg = ip.segments();
    // Link-local fe80::/10.
    if seg[0] & 0xffc0 == 0xfe80 {
        return false;
    }
    // Unique-local fc00::/7.
    if seg[0] & 0xfe00 == 0xfc00 {
        return false;
    }
    // Documentation 2001:db8::/32.
    if seg[0] == 0x2001 && seg[1] == 0x0db8 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_non_global_ranges() {
        for addr in [
            "127.0.0.1",
            "169.254.10.1",
            "224.0.0.1",
            "0.0.0.0",
            "192.0.2.7",
            "203.0.113.200",
            "::1",
            "fe80::1",
            "fd00::1234",
            "fc01::1",
            "ff02::1",
            "::",
            "2001:db8::dead",
            "::ffff:10.0.0.1",
        ] {
            assert!(!is_routable(&ip(addr)), "{addr} should be filtered");
        }
    }

    #[test]
    fn accepts_global_addresses() {
        for addr in ["10.1.2.3", "93.184.216.34", "2001:4860:4860::8888", "2a00:1450::1"] {
            assert!(is_routable(&ip(addr)), "{addr} should be kept");
        }
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let out = filter_and_sort([
            ip("2001:4860:4860::8888"),
            ip("10.0.0.2"),
            ip("10.0.0.2"),
            ip("127.0.0.1"),
            ip("10.0.0.1"),
        ]);
        assert_eq!(out, vec!["10.0.0.1", "10.0.0.2", "2001:4860:4860::8888"]);
    }
}
