//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// Address family of a neighbor or source address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

// ===== impl AddressFamily =====

impl AddressFamily {
    pub fn from_addr(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

// ===== helper traits =====

pub trait IpAddrExt {
    // Returns whether the address may be used as a BFD endpoint.
    fn is_usable(&self) -> bool;
}

impl IpAddrExt for IpAddr {
    fn is_usable(&self) -> bool {
        match self {
            IpAddr::V4(addr) => addr.is_usable(),
            IpAddr::V6(addr) => addr.is_usable(),
        }
    }
}

pub trait Ipv4AddrExt {
    fn is_usable(&self) -> bool;
}

impl Ipv4AddrExt for Ipv4Addr {
    fn is_usable(&self) -> bool {
        !self.is_unspecified() && !self.is_multicast() && !self.is_broadcast()
    }
}

pub trait Ipv6AddrExt {
    fn is_usable(&self) -> bool;
}

impl Ipv6AddrExt for Ipv6Addr {
    fn is_usable(&self) -> bool {
        !self.is_unspecified() && !self.is_multicast()
    }
}
