use base64::Engine;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use std::net::IpAddr;

use crate::tunnel::peer::PeerConfig;

/// Routes packets to peers based on AllowedIPs
///
/// Uses longest-prefix matching to determine which peer should handle
/// traffic for a given destination IP address.
#[derive(Default)]
pub struct AllowedIpsRouter {
    /// Routing table mapping destination IPs to peer indices
    table: IpNetworkTable<u32>,
}

impl AllowedIpsRouter {
    /// Create a new router from `(index, config)` pairs
    pub fn new<'a>(peers: impl IntoIterator<Item = (u32, &'a PeerConfig)>) -> Self {
        let mut table = IpNetworkTable::new();

        for (idx, peer) in peers {
            for allowed_ip in &peer.allowed_ips {
                table.insert(*allowed_ip, idx);
                tracing::trace!(
                    "Route {} -> peer {} ({})",
                    allowed_ip,
                    idx,
                    base64::prelude::BASE64_STANDARD.encode(peer.public_key.as_bytes())
                );
            }
        }

        Self { table }
    }

    /// Look up which peer should handle a packet to the given destination
    pub fn lookup(&self, dest: IpAddr) -> Option<u32> {
        self.table.longest_match(dest).map(|(_, idx)| *idx)
    }

    /// Peer currently owning exactly `network`
    pub fn owner(&self, network: IpNetwork) -> Option<u32> {
        self.table.exact_match(network).copied()
    }
}

/// Extract destination IP address from an IP packet
pub fn extract_dest_ip(packet: &[u8]) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }

    let version = (packet[0] >> 4) & 0x0f;

    match version {
        4 => {
            // IPv4 - destination is at offset 16
            if packet.len() < 20 {
                return None;
            }
            Some(IpAddr::V4(std::net::Ipv4Addr::new(
                packet[16], packet[17], packet[18], packet[19],
            )))
        }
        6 => {
            // IPv6 - destination is at offset 24
            if packet.len() < 40 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_dest_ip_v4() {
        // Minimal IPv4 header with dst = 10.0.0.1
        let mut packet = [0u8; 20];
        packet[0] = 0x45; // Version 4, IHL 5
        packet[16] = 10;
        packet[17] = 0;
        packet[18] = 0;
        packet[19] = 1;

        let dest = extract_dest_ip(&packet).unwrap();
        assert_eq!(dest, IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_router_lookup() {
        use boringtun::x25519::PublicKey;

        let mut peer = PeerConfig::new(PublicKey::from([0u8; 32]));
        peer.allowed_ips = vec!["10.0.0.0/24".parse().unwrap()];

        let router = AllowedIpsRouter::new([(7, &peer)]);

        assert_eq!(
            router.lookup(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1))),
            Some(7)
        );
        assert_eq!(
            router.lookup(IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 1))),
            None
        );
        assert_eq!(router.owner("10.0.0.0/24".parse().unwrap()), Some(7));
    }

    #[test]
    fn test_router_prefers_longest_prefix() {
        use boringtun::x25519::PublicKey;

        let mut wide = PeerConfig::new(PublicKey::from([1u8; 32]));
        wide.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];
        let mut narrow = PeerConfig::new(PublicKey::from([2u8; 32]));
        narrow.allowed_ips = vec!["10.1.0.0/16".parse().unwrap()];

        let router = AllowedIpsRouter::new([(0, &wide), (1, &narrow)]);

        assert_eq!(router.lookup("10.1.2.3".parse().unwrap()), Some(1));
        assert_eq!(router.lookup("8.8.8.8".parse().unwrap()), Some(0));
    }

    #[test]
    fn test_extract_ip_rejects_short_packets() {
        assert!(extract_dest_ip(&[0x45; 10]).is_none());
        assert!(extract_dest_ip(&[]).is_none());
        assert!(extract_dest_ip(&[0x60; 20]).is_none());
    }
}
