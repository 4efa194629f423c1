use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Converts a `sockaddr_storage` filled by the kernel into a `SocketAddr`.
pub(crate) fn to_socket_addr(
    storage: &libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: `ss_family` guarantees an IPv4 layout.
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // SAFETY: `ss_family` guarantees an IPv6 layout.
            let addr: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Non-blocking `read(2)` into `buf`.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len()
    ))
    .map(|n| n as usize)
}

/// Non-blocking `recvfrom(2)` returning the datagram's source address.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut addr_len,
    ))?;

    // SAFETY: `recvfrom` initialised `addr_len` bytes of the storage.
    let storage = unsafe { storage.assume_init() };
    let addr = to_socket_addr(&storage)?;
    Ok((n as usize, addr))
}
