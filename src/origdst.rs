//! Original-destination recovery for redirected connections
//!
//! Traffic reaches the proxy because a NAT REDIRECT rule rewrote its
//! destination, so the accepted socket's own addresses all point at the
//! proxy. The kernel's connection tracking keeps the pre-routing destination
//! per socket; `getsockopt(SOL_IP, SO_ORIGINAL_DST)` returns it as a
//! `sockaddr_in`. Linux only.

use std::net::SocketAddrV4;
use std::os::fd::RawFd;

use crate::error::ProxyError;

/// Netfilter's per-socket original destination option.
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recover the pre-NAT destination of an accepted socket.
#[cfg(target_os = "linux")]
pub fn original_destination(fd: RawFd) -> Result<SocketAddrV4, ProxyError> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // Safety: fd is an open socket and addr/len describe a valid buffer.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(ProxyError::OriginalDestination(
            std::io::Error::last_os_error(),
        ));
    }

    Ok(sockaddr_to_addr(&addr))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_fd: RawFd) -> Result<SocketAddrV4, ProxyError> {
    Err(ProxyError::Unsupported(
        "SO_ORIGINAL_DST is only available on Linux",
    ))
}

/// Port and IPv4 address sit in the sockaddr in network byte order.
#[cfg(target_os = "linux")]
fn sockaddr_to_addr(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    SocketAddrV4::new(ip, port)
}
