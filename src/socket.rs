//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::AsRawFd;

// Normal build: re-export the standard socket type.
#[cfg(not(feature = "testing"))]
pub use {socket2::Socket, tokio::net::UdpSocket};
// Test build: export the mock socket.
#[cfg(feature = "testing")]
pub use crate::socket::mock::UdpSocket;

use crate::ip::AddressFamily;

// Maximum TTL for IPv4 or Hop Limit for IPv6.
pub const TTL_MAX: u8 = 255;

type Result<T> = std::io::Result<T>;

// Extension methods shared by every socket type this daemon opens.
pub trait SocketExt: Sized + AsRawFd {
    // Sets the value of the IP_TTL option for this socket.
    fn set_ipv4_ttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TTL,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }

    // Sets the value of the IPV6_UNICAST_HOPS option for this socket.
    fn set_ipv6_unicast_hops(&self, hops: u8) -> Result<()> {
        let optval = hops as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }

    // Enables delivery of the received TTL as ancillary data (IP_RECVTTL).
    fn set_ipv4_recvttl(&self, value: bool) -> Result<()> {
        let optval = value as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }

    // Enables delivery of the received hop limit as ancillary data
    // (IPV6_RECVHOPLIMIT).
    fn set_ipv6_recvhoplimit(&self, value: bool) -> Result<()> {
        let optval = value as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }
}

// Extension methods for UdpSocket.
pub trait UdpSocketExt: SocketExt {
    // Creates a UDP socket not bound to any address.
    #[allow(clippy::new_ret_no_self)]
    fn new(af: AddressFamily) -> Result<UdpSocket>;

    // Creates a UDP socket from the given address.
    //
    // This is the same as [`UdpSocket::bind`], except that the
    // `SO_REUSEADDR` option is set before binding.
    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket>;
}

// ===== impl UdpSocket =====

#[cfg(not(feature = "testing"))]
impl SocketExt for UdpSocket {}

#[cfg(not(feature = "testing"))]
impl UdpSocketExt for UdpSocket {
    fn new(af: AddressFamily) -> Result<UdpSocket> {
        use socket2::{Domain, Type};

        let domain = match af {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        UdpSocket::from_std(socket.into())
    }

    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket> {
        use socket2::{Domain, Type};

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }
}

// ===== impl Socket =====

#[cfg(not(feature = "testing"))]
impl SocketExt for Socket {}

// ===== Mock sockets for unit testing =====

pub mod mock {
    // A socket double that records outgoing datagrams instead of touching
    // the network, and yields queued datagrams on receive.
    #[derive(Debug, Default)]
    pub struct UdpSocket {
        pub sent: std::cell::RefCell<Vec<(Vec<u8>, std::net::SocketAddr)>>,
        pub recv_queue:
            std::cell::RefCell<std::collections::VecDeque<(Vec<u8>, std::net::SocketAddr, Option<u8>)>>,
    }

    impl UdpSocket {
        pub fn push_recv(
            &self,
            data: Vec<u8>,
            from: std::net::SocketAddr,
            ttl: Option<u8>,
        ) {
            self.recv_queue.borrow_mut().push_back((data, from, ttl));
        }

        pub fn take_sent(&self) -> Vec<(Vec<u8>, std::net::SocketAddr)> {
            self.sent.borrow_mut().drain(..).collect()
        }
    }
}

// ===== global functions =====

fn setsockopt<F: AsRawFd>(
    sock: &F,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(sock.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
