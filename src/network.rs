//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::IoError;
use crate::ip::AddressFamily;
use crate::packet::Packet;
use crate::socket::{SocketExt, TTL_MAX, UdpSocket, UdpSocketExt};

// RFC 5881 §4: the well-known destination port for single-hop BFD.
pub const PORT: u16 = 3784;

// Opens the single shared listening socket, bound to the wildcard
// address on both families where the OS permits a dual-stack bind, with
// ancillary TTL/hop-limit delivery enabled (§4.5 ADDED). Opened once at
// startup and reused, never recreated, across reload (§4.8).
#[cfg(not(feature = "testing"))]
pub fn open_listen_socket() -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind_reuseaddr(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        PORT,
    ))
    .or_else(|_| {
        UdpSocket::bind_reuseaddr(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            PORT,
        ))
    })?;

    match socket.local_addr()? {
        SocketAddr::V4(_) => socket.set_ipv4_recvttl(true)?,
        SocketAddr::V6(_) => socket.set_ipv6_recvhoplimit(true)?,
    }

    Ok(socket)
}

#[cfg(feature = "testing")]
pub fn open_listen_socket() -> std::io::Result<UdpSocket> {
    Ok(UdpSocket::default())
}

// Opens a session's dedicated output socket: bound to the configured
// source address if any, with `IP_TTL`/`IPV6_UNICAST_HOPS` set to 255.
#[cfg(not(feature = "testing"))]
pub fn open_output_socket(
    af: AddressFamily,
    source: Option<IpAddr>,
) -> std::io::Result<UdpSocket> {
    let bind_addr = match source {
        Some(addr) => SocketAddr::new(addr, 0),
        None => SocketAddr::new(
            match af {
                AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            },
            0,
        ),
    };
    let socket = UdpSocket::bind_reuseaddr(bind_addr)?;
    match af {
        AddressFamily::Ipv4 => socket.set_ipv4_ttl(TTL_MAX)?,
        AddressFamily::Ipv6 => socket.set_ipv6_unicast_hops(TTL_MAX)?,
    }
    Ok(socket)
}

#[cfg(feature = "testing")]
pub fn open_output_socket(
    _af: AddressFamily,
    _source: Option<IpAddr>,
) -> std::io::Result<UdpSocket> {
    Ok(UdpSocket::default())
}

// Sends one encoded control packet to `dst`. A send failure is reported
// to the caller, which decides the session's fate (§7: a send failure
// transitions the session to AdminDown; that decision belongs to
// `engine.rs`, not this function).
#[cfg(not(feature = "testing"))]
pub async fn send_packet(
    socket: &UdpSocket,
    dst: SocketAddr,
    packet: &Packet,
) -> Result<(), IoError> {
    let buf = packet.encode();
    socket
        .send_to(&buf, dst)
        .await
        .map(|_| ())
        .map_err(IoError::UdpSendError)
}

#[cfg(feature = "testing")]
pub async fn send_packet(
    socket: &UdpSocket,
    dst: SocketAddr,
    packet: &Packet,
) -> Result<(), IoError> {
    let buf = packet.encode();
    socket.sent.borrow_mut().push((buf.to_vec(), dst));
    Ok(())
}

// Receives one datagram from the listening socket along with its source
// address and ancillary TTL/hop-limit, retried across `EAGAIN`/`EINTR`.
#[cfg(not(feature = "testing"))]
pub async fn recv_packet(
    socket: &UdpSocket,
) -> Result<(Vec<u8>, SocketAddr, Option<u8>), IoError> {
    loop {
        socket.readable().await.map_err(IoError::UdpRecvError)?;
        if let Some(result) = try_recv(socket) {
            return result;
        }
    }
}

// `recvmsg` isn't wrapped by `UdpSocket`, and the ancillary TTL/hop-limit
// cmsg isn't exposed by any higher-level crate in this stack, so it's
// retrieved by walking the control buffer with the standard
// `CMSG_FIRSTHDR`/`CMSG_NXTHDR`/`CMSG_DATA` macros directly, the same way
// raw ancillary data is extracted anywhere a typed wrapper doesn't cover
// the cmsg type in question. Returns `None` on a transient condition
// (`EAGAIN`/`EINTR`) the caller should just retry.
#[cfg(not(feature = "testing"))]
fn try_recv(
    socket: &UdpSocket,
) -> Option<Result<(Vec<u8>, SocketAddr, Option<u8>), IoError>> {
    use std::os::fd::AsRawFd;

    let mut buf = [0u8; 1024];
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; 128];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: &mut addr as *mut _ as *mut libc::c_void,
        msg_namelen: std::mem::size_of::<libc::sockaddr_storage>() as u32,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len(),
        msg_flags: 0,
    };

    // SAFETY: `msg` points to stack-local, correctly-sized buffers for
    // the name, iovec and control sections for the duration of the call.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        return match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                None
            }
            _ => Some(Err(IoError::UdpRecvError(err))),
        };
    }

    let Some(src) = sockaddr_to_std(&addr) else {
        return Some(Err(IoError::UdpRecvMissingSourceAddr));
    };

    let mut ttl = None;
    // SAFETY: `msg`'s control buffer was filled in by the `recvmsg` call
    // above; the macros only ever read within `msg_controllen` bytes.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let is_ttl =
                hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_TTL;
            let is_hoplimit = hdr.cmsg_level == libc::IPPROTO_IPV6
                && hdr.cmsg_type == libc::IPV6_HOPLIMIT;
            if is_ttl || is_hoplimit {
                let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                ttl = Some(std::ptr::read_unaligned(data) as u8);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Some(Ok((buf[..n as usize].to_vec(), src, ttl)))
}

#[cfg(not(feature = "testing"))]
fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    // SAFETY: `storage` was filled in by `recvmsg` and `ss_family`
    // identifies which of the two layouts below is valid to read.
    unsafe {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                let port = u16::from_be(sin.sin_port);
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            libc::AF_INET6 => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let port = u16::from_be(sin6.sin6_port);
                Some(SocketAddr::new(IpAddr::V6(ip), port))
            }
            _ => None,
        }
    }
}

#[cfg(feature = "testing")]
pub async fn recv_packet(
    socket: &UdpSocket,
) -> Result<(Vec<u8>, SocketAddr, Option<u8>), IoError> {
    socket
        .recv_queue
        .borrow_mut()
        .pop_front()
        .ok_or(IoError::UdpRecvMissingSourceAddr)
}
