//! Netlink route-change listener
//!
//! Subscribes to `RTNLGRP_IPV4_ROUTE` on a `NETLINK_ROUTE` socket. Whenever
//! the kernel announces a route change, the listener asks it how the cached
//! sticky flow (destination, pinned source, mark) would route now, using a
//! fixed sequence number to recognize its own reply. If the resolved
//! outgoing interface no longer matches the pinned one, the cached source on
//! the last endpoint is cleared and the next send goes out
//! source-unspecified, letting the kernel pick the fresh route.
//!
//! This is advisory: if the listener is unavailable the `EINVAL`
//! clear-and-retry in the send path still recovers, one datagram later.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

use super::socket::BindShared;

/// Netlink multicast group for IPv4 route updates (rtnetlink(7))
const RTNLGRP_IPV4_ROUTE: u32 = 7;

/// Sequence number marking our own GETROUTE queries
const GETROUTE_SEQ: u32 = 0xFF;

// Route attribute types (rtnetlink(7); RTA_MARK is absent from libc)
const RTA_DST: u16 = 1;
const RTA_SRC: u16 = 2;
const RTA_OIF: u16 = 4;
const RTA_MARK: u16 = 16;

const NLMSG_HDRLEN: usize = mem::size_of::<libc::nlmsghdr>();
const RTATTR_HDRLEN: usize = mem::size_of::<RtAttr>();

/// `struct rtmsg` from rtnetlink(7); not exposed by the libc crate
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

/// `struct rtattr` from rtnetlink(7)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

/// A complete RTM_GETROUTE query keyed on (dst, src, mark)
#[repr(C)]
struct RouteQuery {
    hdr: libc::nlmsghdr,
    msg: RtMsg,
    dst_hdr: RtAttr,
    dst: [u8; 4],
    src_hdr: RtAttr,
    src: [u8; 4],
    mark_hdr: RtAttr,
    mark: u32,
}

const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Open a nonblocking `NETLINK_ROUTE` socket joined to the IPv4 route group
pub(super) fn open_route_socket() -> io::Result<AsyncFd<OwnedFd>> {
    // Safety: plain socket(2) call
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: fd is a fresh descriptor we now own
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    // Safety: zeroed sockaddr_nl is a valid representation
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = 1 << (RTNLGRP_IPV4_ROUTE - 1);

    // Safety: addr points at live stack storage of the stated size
    let rc = unsafe {
        libc::bind(
            owned.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    AsyncFd::new(owned)
}

/// Consume route notifications until the socket dies or the task is aborted
pub(super) async fn run_route_listener(fd: AsyncFd<OwnedFd>, shared: Arc<BindShared>) {
    debug!("route listener started");
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        match guard.try_io(|fd| recv_raw(fd.get_ref().as_raw_fd(), &mut buf)) {
            Ok(Ok(n)) => process_messages(&buf[..n], &shared, fd.get_ref().as_raw_fd()),
            Ok(Err(_)) => break,
            Err(_would_block) => {}
        }
    }
    debug!("route listener stopped");
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // Safety: buf is live for the duration of the call
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(rc as usize)
    }
}

/// Walk a buffer of netlink messages and handle the route ones
fn process_messages(data: &[u8], shared: &BindShared, nlfd: RawFd) {
    let mut remain = data;
    while remain.len() >= NLMSG_HDRLEN {
        // Safety: length checked above; nlmsghdr is plain data
        let hdr: libc::nlmsghdr = unsafe { std::ptr::read_unaligned(remain.as_ptr().cast()) };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > remain.len() {
            break;
        }
        if hdr.nlmsg_type == libc::RTM_NEWROUTE || hdr.nlmsg_type == libc::RTM_DELROUTE {
            handle_route_message(&hdr, &remain[..msg_len], shared, nlfd);
        }
        let advance = nlmsg_align(msg_len);
        if advance >= remain.len() {
            break;
        }
        remain = &remain[advance..];
    }
}

fn handle_route_message(hdr: &libc::nlmsghdr, msg: &[u8], shared: &BindShared, nlfd: RawFd) {
    let Some(endpoint) = shared.last_endpoint.load_full() else {
        return;
    };
    if endpoint.is_v6() {
        return;
    }
    let Some((src, ifindex)) = endpoint.src_v4() else {
        return;
    };
    if ifindex == 0 {
        return;
    }

    if hdr.nlmsg_seq == GETROUTE_SEQ {
        // our own query reply: compare the resolved OIF with the pinned one
        let attrs_at = NLMSG_HDRLEN + mem::size_of::<RtMsg>();
        if msg.len() <= attrs_at {
            return;
        }
        if let Some(oif) = parse_route_oif(&msg[attrs_at..]) {
            #[allow(clippy::cast_sign_loss)]
            if oif != ifindex as u32 {
                debug!(oif, ifindex, "route moved; clearing cached source");
                endpoint.clear_src();
            }
        }
        return;
    }

    // some route changed: ask the kernel how the cached flow routes now
    let SocketAddr::V4(dst) = endpoint.dst() else {
        return;
    };
    trace!(dst = %dst, "probing route for cached flow");
    let query = build_route_query(
        dst.ip().octets(),
        src.octets(),
        shared.last_mark.load(Ordering::Relaxed),
    );
    // Safety: the query bytes are live for the duration of the call
    let _ = unsafe { libc::send(nlfd, query_bytes(&query).as_ptr().cast(), mem::size_of::<RouteQuery>(), 0) };
}

/// Find the RTA_OIF attribute in a route message's attribute list
fn parse_route_oif(mut attrs: &[u8]) -> Option<u32> {
    while attrs.len() >= RTATTR_HDRLEN {
        // Safety: length checked above; RtAttr is plain data
        let hdr: RtAttr = unsafe { std::ptr::read_unaligned(attrs.as_ptr().cast()) };
        let attr_len = hdr.rta_len as usize;
        if attr_len < RTATTR_HDRLEN || attr_len > attrs.len() {
            return None;
        }
        if hdr.rta_type == RTA_OIF && attr_len == RTATTR_HDRLEN + 4 {
            return Some(u32::from_ne_bytes(attrs[4..8].try_into().ok()?));
        }
        let advance = nlmsg_align(attr_len);
        if advance >= attrs.len() {
            return None;
        }
        attrs = &attrs[advance..];
    }
    None
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn build_route_query(dst: [u8; 4], src: [u8; 4], mark: u32) -> RouteQuery {
    // Safety: zeroed nlmsghdr is a valid representation
    let mut hdr: libc::nlmsghdr = unsafe { mem::zeroed() };
    hdr.nlmsg_len = mem::size_of::<RouteQuery>() as u32;
    hdr.nlmsg_type = libc::RTM_GETROUTE;
    hdr.nlmsg_flags = libc::NLM_F_REQUEST as u16;
    hdr.nlmsg_seq = GETROUTE_SEQ;

    RouteQuery {
        hdr,
        msg: RtMsg {
            rtm_family: libc::AF_INET as u8,
            rtm_dst_len: 32,
            rtm_src_len: 32,
            rtm_tos: 0,
            rtm_table: 0,
            rtm_protocol: 0,
            rtm_scope: 0,
            rtm_type: 0,
            rtm_flags: 0,
        },
        dst_hdr: RtAttr {
            rta_len: (RTATTR_HDRLEN + 4) as u16,
            rta_type: RTA_DST,
        },
        dst,
        src_hdr: RtAttr {
            rta_len: (RTATTR_HDRLEN + 4) as u16,
            rta_type: RTA_SRC,
        },
        src,
        mark_hdr: RtAttr {
            rta_len: (RTATTR_HDRLEN + 4) as u16,
            rta_type: RTA_MARK,
        },
        mark,
    }
}

/// View a query as raw bytes for the netlink send
fn query_bytes(query: &RouteQuery) -> &[u8] {
    // Safety: RouteQuery is repr(C) with no padding between its 4-aligned fields
    unsafe {
        std::slice::from_raw_parts(
            std::ptr::from_ref(query).cast::<u8>(),
            mem::size_of::<RouteQuery>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwapOption;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::bind::Endpoint;

    fn oif_attr(oif: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&8u16.to_ne_bytes());
        out.extend_from_slice(&RTA_OIF.to_ne_bytes());
        out.extend_from_slice(&oif.to_ne_bytes());
        out
    }

    fn gateway_attr() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&8u16.to_ne_bytes());
        out.extend_from_slice(&5u16.to_ne_bytes()); // RTA_GATEWAY
        out.extend_from_slice(&[192, 0, 2, 1]);
        out
    }

    #[test]
    fn test_parse_oif_first_attribute() {
        assert_eq!(parse_route_oif(&oif_attr(4)), Some(4));
    }

    #[test]
    fn test_parse_oif_after_other_attributes() {
        let mut attrs = gateway_attr();
        attrs.extend_from_slice(&oif_attr(9));
        assert_eq!(parse_route_oif(&attrs), Some(9));
    }

    #[test]
    fn test_parse_oif_absent_or_truncated() {
        assert_eq!(parse_route_oif(&gateway_attr()), None);
        assert_eq!(parse_route_oif(&[1, 0, 4]), None);
        // attribute claiming to be longer than the buffer
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&64u16.to_ne_bytes());
        bogus.extend_from_slice(&RTA_OIF.to_ne_bytes());
        assert_eq!(parse_route_oif(&bogus), None);
    }

    #[test]
    fn test_query_layout() {
        let query = build_route_query([10, 0, 0, 1], [192, 168, 1, 2], 0x77);
        let bytes = query_bytes(&query);

        assert_eq!(bytes.len(), 52);
        assert_eq!(query.hdr.nlmsg_len, 52);
        assert_eq!(query.hdr.nlmsg_type, libc::RTM_GETROUTE);
        assert_eq!(query.hdr.nlmsg_seq, GETROUTE_SEQ);
        // attributes sit after the 16-byte nlmsghdr and 12-byte rtmsg
        assert_eq!(&bytes[32..36], &[10, 0, 0, 1]);
        assert_eq!(&bytes[40..44], &[192, 168, 1, 2]);
        assert_eq!(&bytes[48..52], &0x77u32.to_ne_bytes());
    }

    fn shared_with_endpoint(endpoint: Arc<Endpoint>) -> BindShared {
        let shared = BindShared {
            last_endpoint: ArcSwapOption::empty(),
            last_mark: AtomicU32::new(0),
        };
        shared.last_endpoint.store(Some(endpoint));
        shared
    }

    fn reply_message(seq: u32, oif: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let payload_len = NLMSG_HDRLEN + mem::size_of::<RtMsg>() + 8;
        #[allow(clippy::cast_possible_truncation)]
        {
            out.extend_from_slice(&(payload_len as u32).to_ne_bytes());
        }
        out.extend_from_slice(&libc::RTM_NEWROUTE.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes()); // flags
        out.extend_from_slice(&seq.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes()); // pid
        out.extend_from_slice(&[0u8; mem::size_of::<RtMsg>()]);
        out.extend_from_slice(&oif_attr(oif));
        out
    }

    #[test]
    fn test_matching_reply_with_new_oif_clears_source() {
        let endpoint = Arc::new(Endpoint::new("192.0.2.9:51820".parse().unwrap()));
        endpoint.set_src_v4(Ipv4Addr::new(10, 0, 0, 1), 4);
        let shared = shared_with_endpoint(Arc::clone(&endpoint));

        // reply says the flow now egresses interface 9, not 4
        process_messages(&reply_message(GETROUTE_SEQ, 9), &shared, -1);
        assert!(endpoint.src_v4().is_none());
    }

    #[test]
    fn test_matching_reply_with_same_oif_keeps_source() {
        let endpoint = Arc::new(Endpoint::new("192.0.2.9:51820".parse().unwrap()));
        endpoint.set_src_v4(Ipv4Addr::new(10, 0, 0, 1), 4);
        let shared = shared_with_endpoint(Arc::clone(&endpoint));

        process_messages(&reply_message(GETROUTE_SEQ, 4), &shared, -1);
        assert_eq!(endpoint.src_v4(), Some((Ipv4Addr::new(10, 0, 0, 1), 4)));
    }

    #[test]
    fn test_no_cached_ifindex_is_ignored() {
        let endpoint = Arc::new(Endpoint::new("192.0.2.9:51820".parse().unwrap()));
        endpoint.set_src_v4(Ipv4Addr::new(10, 0, 0, 1), 0);
        let shared = shared_with_endpoint(Arc::clone(&endpoint));

        process_messages(&reply_message(GETROUTE_SEQ, 9), &shared, -1);
        // ifindex 0 means nothing is pinned; the cache is left alone
        assert!(endpoint.src_v4().is_some());
    }
}
