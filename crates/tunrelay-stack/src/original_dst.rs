//! Recovery of the destination a redirected connection was originally sent to.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Destination the peer originally connected to.
///
/// On Linux this asks netfilter through `SO_ORIGINAL_DST`. Connections that
/// were not redirected, and other platforms, report the socket's own local
/// address.
pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    #[cfg(target_os = "linux")]
    {
        match linux::original_dst(stream) {
            Ok(addr) => return Ok(addr),
            Err(e) => tracing::trace!(error = %e, "no original destination, using local address"),
        }
    }
    stream.local_addr()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::fd::AsRawFd;

    use tokio::net::TcpStream;

    pub(super) fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        let fd = stream.as_raw_fd();
        match stream.local_addr()? {
            SocketAddr::V4(_) => {
                let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                let ret = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_IP,
                        libc::SO_ORIGINAL_DST,
                        std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                        &mut len,
                    )
                };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
            }
            SocketAddr::V6(_) => {
                let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
                let ret = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_IPV6,
                        libc::IP6T_SO_ORIGINAL_DST,
                        std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                        &mut len,
                    )
                };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(addr.sin6_port),
                    addr.sin6_flowinfo,
                    addr.sin6_scope_id,
                )))
            }
        }
    }
}
