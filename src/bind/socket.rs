//! Linux UDP sockets with sticky-source transmission
//!
//! One AF_INET and one AF_INET6 socket (`IPV6_V6ONLY`), both nonblocking
//! under `AsyncFd`, both with `SO_REUSEADDR` and per-packet source
//! information enabled (`IP_PKTINFO` / `IPV6_RECVPKTINFO`). Sends go through
//! `sendmsg` with a pktinfo control message carrying the endpoint's cached
//! source address and interface, so replies egress where the peer's traffic
//! arrived. If the kernel rejects the control message with `EINVAL` (the
//! cached source went stale), the cache is cleared and the send retried once
//! source-unspecified.
//!
//! # Safety
//!
//! The `sendmsg`/`recvmsg` plumbing builds `msghdr` structures pointing into
//! stack-owned storage; every unsafe block documents the invariant it relies
//! on. Control messages use a contiguous `repr(C)` header + payload layout,
//! the same shape the kernel emits for a single cmsg.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::route;
use super::{Bind, Endpoint};
use crate::error::BindError;
use crate::BoxFuture;

/// State shared with the route-listener task
pub(super) struct BindShared {
    /// Endpoint of the most recent IPv4 receive; target of route invalidation
    pub last_endpoint: ArcSwapOption<Endpoint>,
    /// Last mark applied via `set_mark`, echoed into GETROUTE queries
    pub last_mark: AtomicU32,
}

/// A single control message: header followed by its payload.
///
/// Matches the kernel layout for one cmsg whose payload needs no padding
/// (both `in_pktinfo` and `in6_pktinfo` are naturally aligned).
#[repr(C)]
struct CmsgBuf<P> {
    hdr: libc::cmsghdr,
    info: P,
}

/// The native Linux UDP bind
pub struct NativeBind {
    sock4: AsyncFd<Socket>,
    sock6: AsyncFd<Socket>,
    shared: Arc<BindShared>,
    route_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    port: u16,
}

impl NativeBind {
    /// Bind both sockets and start the route listener.
    ///
    /// `port` 0 picks an ephemeral port; the IPv6 socket binds first and the
    /// IPv4 socket reuses whatever port it got, so both families share one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(port: u16) -> Result<Self, BindError> {
        let shared = Arc::new(BindShared {
            last_endpoint: ArcSwapOption::empty(),
            last_mark: AtomicU32::new(0),
        });

        let (sock6, port) = open_v6(port)?;
        let (sock4, port) = open_v4(port)?;

        let route_task = match route::open_route_socket() {
            Ok(fd) => {
                let shared = Arc::clone(&shared);
                Some(tokio::spawn(route::run_route_listener(fd, shared)))
            }
            Err(e) => {
                // route invalidation is advisory; the EINVAL retry in send
                // still recovers from stale sources
                warn!(error = %e, "route listener unavailable");
                None
            }
        };

        let sock4 = AsyncFd::new(sock4).map_err(BindError::SocketCreation)?;
        let sock6 = AsyncFd::new(sock6).map_err(BindError::SocketCreation)?;

        debug!(port, "UDP bind ready");

        Ok(Self {
            sock4,
            sock6,
            shared,
            route_task: Mutex::new(route_task),
            closed: AtomicBool::new(false),
            port,
        })
    }

    async fn send_inner(&self, buf: &[u8], endpoint: &Endpoint) -> Result<(), BindError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BindError::Closed);
        }
        let sock = if endpoint.is_v6() {
            &self.sock6
        } else {
            &self.sock4
        };
        loop {
            let mut guard = sock.writable().await.map_err(BindError::Send)?;
            let result = guard.try_io(|fd| {
                if endpoint.is_v6() {
                    send_v6(fd.get_ref(), buf, endpoint)
                } else {
                    send_v4(fd.get_ref(), buf, endpoint)
                }
            });
            match result {
                Ok(res) => return res.map_err(BindError::Send),
                Err(_would_block) => {}
            }
        }
    }

    async fn receive_v4_inner(&self, buf: &mut [u8]) -> Result<(usize, Arc<Endpoint>), BindError> {
        loop {
            let mut guard = self.sock4.readable().await.map_err(BindError::Receive)?;
            match guard.try_io(|fd| recv_v4(fd.get_ref(), buf)) {
                Ok(res) => {
                    let (n, endpoint) = res.map_err(BindError::Receive)?;
                    let endpoint = Arc::new(endpoint);
                    // the route listener invalidates the most recent v4 source
                    self.shared.last_endpoint.store(Some(Arc::clone(&endpoint)));
                    return Ok((n, endpoint));
                }
                Err(_would_block) => {}
            }
        }
    }

    async fn receive_v6_inner(&self, buf: &mut [u8]) -> Result<(usize, Arc<Endpoint>), BindError> {
        loop {
            let mut guard = self.sock6.readable().await.map_err(BindError::Receive)?;
            match guard.try_io(|fd| recv_v6(fd.get_ref(), buf)) {
                Ok(res) => {
                    let (n, endpoint) = res.map_err(BindError::Receive)?;
                    return Ok((n, Arc::new(endpoint)));
                }
                Err(_would_block) => {}
            }
        }
    }
}

impl Bind for NativeBind {
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(), BindError>> {
        Box::pin(self.send_inner(buf, endpoint))
    }

    fn receive_v4<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>> {
        Box::pin(self.receive_v4_inner(buf))
    }

    fn receive_v6<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(usize, Arc<Endpoint>), BindError>> {
        Box::pin(self.receive_v6_inner(buf))
    }

    fn set_mark(&self, mark: u32) -> Result<(), BindError> {
        setsockopt_int(
            self.sock6.get_ref(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            mark as libc::c_int,
            "SO_MARK",
        )?;
        setsockopt_int(
            self.sock4.get_ref(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            mark as libc::c_int,
            "SO_MARK",
        )?;
        self.shared.last_mark.store(mark, Ordering::Relaxed);
        Ok(())
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        // shutdown unblocks parked receivers; the fds close on drop
        let _ = self.sock4.get_ref().shutdown(std::net::Shutdown::Read);
        let _ = self.sock6.get_ref().shutdown(std::net::Shutdown::Read);
        if let Some(task) = self.route_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for NativeBind {
    fn drop(&mut self) {
        self.close();
    }
}

/// Set an integer socket option through raw `setsockopt`
fn setsockopt_int(
    sock: &Socket,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
    name: &'static str,
) -> Result<(), BindError> {
    // Safety: `value` outlives the call and optlen matches its size
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            option,
            std::ptr::addr_of!(value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(BindError::SocketOption {
            option: name,
            reason: io::Error::last_os_error(),
        })
    }
}

fn open_v4(port: u16) -> Result<(Socket, u16), BindError> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(BindError::SocketCreation)?;
    sock.set_reuse_address(true)
        .map_err(|e| BindError::SocketOption {
            option: "SO_REUSEADDR",
            reason: e,
        })?;
    setsockopt_int(&sock, libc::IPPROTO_IP, libc::IP_PKTINFO, 1, "IP_PKTINFO")?;
    sock.set_nonblocking(true).map_err(BindError::SocketCreation)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    sock.bind(&addr.into())
        .map_err(|reason| BindError::BindFailed { port, reason })?;

    let port = local_port(&sock, port)?;
    Ok((sock, port))
}

fn open_v6(port: u16) -> Result<(Socket, u16), BindError> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .map_err(BindError::SocketCreation)?;
    sock.set_reuse_address(true)
        .map_err(|e| BindError::SocketOption {
            option: "SO_REUSEADDR",
            reason: e,
        })?;
    sock.set_only_v6(true).map_err(|e| BindError::SocketOption {
        option: "IPV6_V6ONLY",
        reason: e,
    })?;
    setsockopt_int(
        &sock,
        libc::IPPROTO_IPV6,
        libc::IPV6_RECVPKTINFO,
        1,
        "IPV6_RECVPKTINFO",
    )?;
    sock.set_nonblocking(true).map_err(BindError::SocketCreation)?;

    let addr = SocketAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    sock.bind(&addr.into())
        .map_err(|reason| BindError::BindFailed { port, reason })?;

    let port = local_port(&sock, port)?;
    Ok((sock, port))
}

fn local_port(sock: &Socket, requested: u16) -> Result<u16, BindError> {
    let addr = sock
        .local_addr()
        .map_err(|reason| BindError::BindFailed {
            port: requested,
            reason,
        })?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| BindError::BindFailed {
            port: requested,
            reason: io::Error::new(io::ErrorKind::Other, "not an inet socket"),
        })
}

#[allow(clippy::cast_possible_truncation)] // msg_controllen/namelen fit their types
fn send_v4(sock: &Socket, buf: &[u8], endpoint: &Endpoint) -> io::Result<()> {
    let SocketAddr::V4(dst) = endpoint.dst() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a v4 endpoint"));
    };
    let mut name = sockaddr_in_from(dst);

    let (src, ifindex) = endpoint
        .src_v4()
        .unwrap_or((Ipv4Addr::UNSPECIFIED, 0));

    // Safety: zeroed cmsghdr/in_pktinfo are valid representations
    let mut cmsg: CmsgBuf<libc::in_pktinfo> = unsafe { mem::zeroed() };
    cmsg.hdr.cmsg_len = (mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::in_pktinfo>()) as _;
    cmsg.hdr.cmsg_level = libc::IPPROTO_IP;
    cmsg.hdr.cmsg_type = libc::IP_PKTINFO;
    cmsg.info.ipi_ifindex = ifindex;
    cmsg.info.ipi_spec_dst.s_addr = u32::from_ne_bytes(src.octets());

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast(),
        iov_len: buf.len(),
    };
    // Safety: zeroed msghdr is a valid representation
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(name).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = std::ptr::addr_of_mut!(cmsg).cast();
    msg.msg_controllen = mem::size_of::<CmsgBuf<libc::in_pktinfo>>() as _;

    // Safety: every pointer in `msg` targets stack storage that outlives the call
    let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if rc >= 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINVAL) {
        return Err(err);
    }

    // stale cached source: clear it and retry once source-unspecified
    endpoint.clear_src();
    // Safety: in_pktinfo is valid all-zeroes
    cmsg.info = unsafe { mem::zeroed() };
    // Safety: as above; `msg` still points at live stack storage
    let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if rc >= 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn send_v6(sock: &Socket, buf: &[u8], endpoint: &Endpoint) -> io::Result<()> {
    let SocketAddr::V6(dst) = endpoint.dst() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a v6 endpoint"));
    };
    let mut name = sockaddr_in6_from(dst);

    let src = endpoint.src_v6();

    // Safety: zeroed cmsghdr/in6_pktinfo are valid representations
    let mut cmsg: CmsgBuf<libc::in6_pktinfo> = unsafe { mem::zeroed() };
    cmsg.hdr.cmsg_len =
        (mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::in6_pktinfo>()) as _;
    cmsg.hdr.cmsg_level = libc::IPPROTO_IPV6;
    cmsg.hdr.cmsg_type = libc::IPV6_PKTINFO;
    if let Some(src) = src {
        cmsg.info.ipi6_addr.s6_addr = src.octets();
        cmsg.info.ipi6_ifindex = dst.scope_id();
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast(),
        iov_len: buf.len(),
    };
    // Safety: zeroed msghdr is a valid representation
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(name).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = std::ptr::addr_of_mut!(cmsg).cast();
    msg.msg_controllen = mem::size_of::<CmsgBuf<libc::in6_pktinfo>>() as _;

    // Safety: every pointer in `msg` targets stack storage that outlives the call
    let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if rc >= 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINVAL) {
        return Err(err);
    }

    endpoint.clear_src();
    // Safety: in6_pktinfo is valid all-zeroes
    cmsg.info = unsafe { mem::zeroed() };
    // Safety: as above
    let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if rc >= 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn recv_v4(sock: &Socket, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
    // Safety: zeroed sockaddr_in / cmsg storage are valid representations
    let mut name: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut cmsg: CmsgBuf<libc::in_pktinfo> = unsafe { mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // Safety: zeroed msghdr is a valid representation
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(name).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = std::ptr::addr_of_mut!(cmsg).cast();
    msg.msg_controllen = mem::size_of::<CmsgBuf<libc::in_pktinfo>>() as _;

    // Safety: every pointer in `msg` targets stack storage that outlives the call
    let rc = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let dst = SocketAddr::V4(sockaddr_in_to(&name));
    let endpoint = Endpoint::new(dst);

    if cmsg.hdr.cmsg_level == libc::IPPROTO_IP
        && cmsg.hdr.cmsg_type == libc::IP_PKTINFO
        && cmsg.hdr.cmsg_len as usize
            >= mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::in_pktinfo>()
    {
        endpoint.set_src_v4(
            Ipv4Addr::from(cmsg.info.ipi_spec_dst.s_addr.to_ne_bytes()),
            cmsg.info.ipi_ifindex,
        );
    }

    Ok((rc as usize, endpoint))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn recv_v6(sock: &Socket, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
    // Safety: zeroed sockaddr_in6 / cmsg storage are valid representations
    let mut name: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut cmsg: CmsgBuf<libc::in6_pktinfo> = unsafe { mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // Safety: zeroed msghdr is a valid representation
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(name).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = std::ptr::addr_of_mut!(cmsg).cast();
    msg.msg_controllen = mem::size_of::<CmsgBuf<libc::in6_pktinfo>>() as _;

    // Safety: every pointer in `msg` targets stack storage that outlives the call
    let rc = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let has_pktinfo = cmsg.hdr.cmsg_level == libc::IPPROTO_IPV6
        && cmsg.hdr.cmsg_type == libc::IPV6_PKTINFO
        && cmsg.hdr.cmsg_len as usize
            >= mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::in6_pktinfo>();

    let mut addr = sockaddr_in6_to(&name);
    // the arriving interface pins the reply for link-local peers
    if has_pktinfo && addr.scope_id() == 0 {
        addr.set_scope_id(cmsg.info.ipi6_ifindex);
    }
    let endpoint = Endpoint::new(SocketAddr::V6(addr));
    if has_pktinfo {
        endpoint.set_src_v6(Ipv6Addr::from(cmsg.info.ipi6_addr.s6_addr));
    }

    Ok((rc as usize, endpoint))
}

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    // Safety: zeroed sockaddr_in is a valid representation
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn sockaddr_in_to(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sa.sin_port),
    )
}

fn sockaddr_in6_from(addr: SocketAddrV6) -> libc::sockaddr_in6 {
    // Safety: zeroed sockaddr_in6 is a valid representation
    let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = addr.port().to_be();
    sa.sin6_addr.s6_addr = addr.ip().octets();
    sa.sin6_scope_id = addr.scope_id();
    sa
}

fn sockaddr_in6_to(sa: &libc::sockaddr_in6) -> SocketAddrV6 {
    SocketAddrV6::new(
        Ipv6Addr::from(sa.sin6_addr.s6_addr),
        u16::from_be(sa.sin6_port),
        u32::from_be(sa.sin6_flowinfo),
        sa.sin6_scope_id,
    )
}
