//! UDP bind and endpoints
//!
//! The bind owns the sockets the tunnel transmits on. Replies must egress
//! the same interface and source address the peer's traffic arrived on
//! ("sticky source"), so each [`Endpoint`] caches the source the receive
//! path observed; the Linux bind attaches it to outgoing datagrams as a
//! pktinfo control message and invalidates it when kernel routing changes.
//!
//! Implementations: [`NativeBind`] (Linux, `sendmsg`/`recvmsg` level) and
//! [`MemoryBind`] (in-memory, for tests and non-UDP embeddings).

mod memory;
#[cfg(target_os = "linux")]
mod route;
#[cfg(target_os = "linux")]
mod socket;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BindError;
use crate::BoxFuture;

pub use memory::{MemoryBind, SentDatagram};
#[cfg(target_os = "linux")]
pub use socket::NativeBind;

/// Cached source address for sticky-source transmission
///
/// For IPv4 the outgoing interface index rides here; for IPv6 it lives in
/// the destination's scope id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum SourceCache {
    /// No source pinned; the kernel chooses
    #[default]
    None,
    /// Pinned IPv4 source and interface
    V4 { src: Ipv4Addr, ifindex: i32 },
    /// Pinned IPv6 source
    V6 { src: Ipv6Addr },
}

/// A remote UDP endpoint with a sticky-source cache.
///
/// The destination is immutable; the source cache is written by the receive
/// path and the route listener and read by the send path, so it sits behind
/// its own lock.
#[derive(Debug)]
pub struct Endpoint {
    dst: SocketAddr,
    src: Mutex<SourceCache>,
}

impl Endpoint {
    /// Create an endpoint with no pinned source
    #[must_use]
    pub fn new(dst: SocketAddr) -> Self {
        Self {
            dst,
            src: Mutex::new(SourceCache::None),
        }
    }

    /// Destination address
    #[must_use]
    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    /// Whether the destination is IPv6
    #[must_use]
    pub fn is_v6(&self) -> bool {
        self.dst.is_ipv6()
    }

    /// Forget the pinned source; the next send lets the kernel choose
    pub fn clear_src(&self) {
        *self.src.lock() = SourceCache::None;
    }

    /// Pinned source address, if any
    #[must_use]
    pub fn src_ip(&self) -> Option<IpAddr> {
        match *self.src.lock() {
            SourceCache::None => None,
            SourceCache::V4 { src, .. } => Some(IpAddr::V4(src)),
            SourceCache::V6 { src } => Some(IpAddr::V6(src)),
        }
    }

    /// Pinned IPv4 source and interface index, if any
    #[must_use]
    pub fn src_v4(&self) -> Option<(Ipv4Addr, i32)> {
        match *self.src.lock() {
            SourceCache::V4 { src, ifindex } => Some((src, ifindex)),
            _ => None,
        }
    }

    /// Pinned IPv6 source, if any
    #[must_use]
    pub fn src_v6(&self) -> Option<Ipv6Addr> {
        match *self.src.lock() {
            SourceCache::V6 { src } => Some(src),
            _ => None,
        }
    }

    /// Pin an IPv4 source and interface index
    pub(crate) fn set_src_v4(&self, src: Ipv4Addr, ifindex: i32) {
        *self.src.lock() = SourceCache::V4 { src, ifindex };
    }

    /// Pin an IPv6 source
    pub(crate) fn set_src_v6(&self, src: Ipv6Addr) {
        *self.src.lock() = SourceCache::V6 { src };
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dst)
    }
}

/// Parse an endpoint string such as `"203.0.113.5:51820"`,
/// `"[2001:db8::1]:51820"`, or `"[fe80::1%eth0]:51820"`.
///
/// IPv6 zone identifiers may be numeric or, on Linux, an interface name.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, BindError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Endpoint::new(addr));
    }

    #[cfg(target_os = "linux")]
    if let Some(endpoint) = parse_named_zone_v6(s)? {
        return Ok(endpoint);
    }

    Err(BindError::InvalidEndpoint(s.to_string()))
}

/// Resolve `"[addr%ifname]:port"` by looking up the interface index
#[cfg(target_os = "linux")]
fn parse_named_zone_v6(s: &str) -> Result<Option<Endpoint>, BindError> {
    let Some(rest) = s.strip_prefix('[') else {
        return Ok(None);
    };
    let Some((inner, port)) = rest.split_once("]:") else {
        return Ok(None);
    };
    let Some((addr, zone)) = inner.split_once('%') else {
        return Ok(None);
    };

    let mut name = zone.as_bytes().to_vec();
    name.push(0);
    // Safety: `name` is a NUL-terminated byte string
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr().cast()) };
    if ifindex == 0 {
        return Err(BindError::InvalidEndpoint(format!(
            "{s}: no such interface {zone:?}"
        )));
    }

    let numeric = format!("[{addr}%{ifindex}]:{port}");
    numeric
        .parse::<SocketAddr>()
        .map(|addr| Some(Endpoint::new(addr)))
        .map_err(|_| BindError::InvalidEndpoint(s.to_string()))
}

/// Contract to the UDP transport.
///
/// Object-safe: async methods return boxed futures so the device and peers
/// hold a `dyn Bind`.
pub trait Bind: Send + Sync {
    /// Transmit one datagram to the endpoint, preferring its cached source
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(), BindError>>;

    /// Receive one IPv4 datagram, returning its length and source endpoint
    fn receive_v4<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>>;

    /// Receive one IPv6 datagram, returning its length and source endpoint
    fn receive_v6<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>>;

    /// Apply a firewall/routing mark to the sockets
    fn set_mark(&self, mark: u32) -> Result<(), BindError>;

    /// Local UDP port
    fn port(&self) -> u16;

    /// Shut the sockets down, unblocking any receiver
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4_endpoint() {
        let ep = parse_endpoint("192.0.2.1:51820").unwrap();
        assert_eq!(ep.dst(), "192.0.2.1:51820".parse().unwrap());
        assert!(!ep.is_v6());
        assert!(ep.src_ip().is_none());
    }

    #[test]
    fn test_parse_v6_endpoint() {
        let ep = parse_endpoint("[2001:db8::1]:51820").unwrap();
        assert!(ep.is_v6());
    }

    #[test]
    fn test_parse_numeric_zone() {
        let ep = parse_endpoint("[fe80::1%3]:51820").unwrap();
        let SocketAddr::V6(v6) = ep.dst() else {
            panic!("expected v6");
        };
        assert_eq!(v6.scope_id(), 3);
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(parse_endpoint("not an endpoint").is_err());
        assert!(parse_endpoint("192.0.2.1").is_err()); // missing port
    }

    #[test]
    fn test_source_cache_lifecycle() {
        let ep = Endpoint::new("192.0.2.1:51820".parse().unwrap());
        assert!(ep.src_v4().is_none());

        ep.set_src_v4(std::net::Ipv4Addr::new(10, 0, 0, 1), 4);
        assert_eq!(ep.src_v4(), Some((std::net::Ipv4Addr::new(10, 0, 0, 1), 4)));
        assert_eq!(ep.src_ip(), Some("10.0.0.1".parse().unwrap()));

        ep.clear_src();
        assert!(ep.src_v4().is_none());
    }
}
