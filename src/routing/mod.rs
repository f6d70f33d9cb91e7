//! Allowed-IPs routing table
//!
//! Maps destination addresses to peers by longest-prefix match. The table is
//! immutable once built; the device keeps it behind an `ArcSwap` so the TUN
//! reader's lookups never take a lock and control-plane updates are a single
//! pointer swap. Lookups allocate nothing beyond an `Arc` refcount bump.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::peer::Peer;

/// Longest-prefix-match table from allowed IP networks to peers
#[derive(Clone, Default)]
pub struct AllowedIps {
    /// IPv4 prefixes, sorted by prefix length descending
    v4: Vec<(Ipv4Net, Arc<Peer>)>,
    /// IPv6 prefixes, sorted by prefix length descending
    v6: Vec<(Ipv6Net, Arc<Peer>)>,
}

impl AllowedIps {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `net` to `peer`, replacing any existing entry for the same net
    pub fn insert(&mut self, net: IpNet, peer: Arc<Peer>) {
        match net {
            IpNet::V4(net) => {
                self.v4.retain(|(existing, _)| *existing != net);
                self.v4.push((net, peer));
                self.v4
                    .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
            }
            IpNet::V6(net) => {
                self.v6.retain(|(existing, _)| *existing != net);
                self.v6.push((net, peer));
                self.v6
                    .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
            }
        }
    }

    /// Remove every route pointing at `peer`
    pub fn remove_peer(&mut self, peer: &Arc<Peer>) {
        self.v4.retain(|(_, p)| !Arc::ptr_eq(p, peer));
        self.v6.retain(|(_, p)| !Arc::ptr_eq(p, peer));
    }

    /// Look up the peer for an IPv4 destination
    #[must_use]
    pub fn lookup_v4(&self, dst: [u8; 4]) -> Option<Arc<Peer>> {
        let addr = Ipv4Addr::from(dst);
        self.v4
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, peer)| Arc::clone(peer))
    }

    /// Look up the peer for an IPv6 destination
    #[must_use]
    pub fn lookup_v6(&self, dst: [u8; 16]) -> Option<Arc<Peer>> {
        let addr = Ipv6Addr::from(dst);
        self.v6
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, peer)| Arc::clone(peer))
    }

    /// Number of routes in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Whether the table has no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

impl std::fmt::Debug for AllowedIps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowedIps")
            .field("v4_routes", &self.v4.len())
            .field("v6_routes", &self.v6.len())
            .finish()
    }
}
