//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use generational_arena::{Arena, Index};
use rand::RngCore;

use crate::debug::Debug;
use crate::ip::AddressFamily;
use crate::packet::{DiagnosticCode, State};
use crate::socket::UdpSocket;
use crate::timer::SessionTimers;

// A session is looked up through a `generational_arena::Index`, which
// stays stable across reload (§4.8) even as sessions are rebuilt.
pub type SessionId = Index;

// Default configuration values, in microseconds, per spec.md §3/§6.
pub const DFLT_MIN_RX_INTV: u32 = 10_000;
pub const DFLT_MIN_TX_INTV: u32 = 10_000;
pub const DFLT_IDLE_TX_INTV: u32 = 1_000_000;
pub const DFLT_DETECT_MULT: u8 = 5;

// Per-peer configuration, as parsed from a `bfd_instance` block.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub neighbor: SocketAddr,
    pub source: Option<IpAddr>,
    pub local_min_rx_intv: u32,
    pub local_min_tx_intv: u32,
    pub local_idle_tx_intv: u32,
    pub local_detect_mult: u8,
    pub disabled: bool,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            neighbor: SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 3784),
            source: None,
            local_min_rx_intv: DFLT_MIN_RX_INTV,
            local_min_tx_intv: DFLT_MIN_TX_INTV,
            local_idle_tx_intv: DFLT_IDLE_TX_INTV,
            local_detect_mult: DFLT_DETECT_MULT,
            disabled: false,
        }
    }
}

impl SessionConfig {
    pub fn address_family(&self) -> AddressFamily {
        AddressFamily::from_addr(&self.neighbor.ip())
    }
}

// Local runtime state (spec.md §3).
#[derive(Clone, Copy, Debug)]
pub struct Local {
    pub state: State,
    pub diag: DiagnosticCode,
    pub discr: u32,
    pub poll: bool,
    pub final_: bool,
    pub tx_intv: u32,
    pub detect_time: u32,
}

// Remote runtime state, populated verbatim from the peer's packets.
#[derive(Clone, Copy, Debug)]
pub struct Remote {
    pub state: State,
    pub diag: DiagnosticCode,
    pub discr: u32,
    pub min_tx_intv: u32,
    pub min_rx_intv: u32,
    pub demand: bool,
    pub detect_mult: u8,
    pub tx_intv: u32,
    pub detect_time: u32,
}

impl Default for Remote {
    fn default() -> Remote {
        Remote {
            state: State::Down,
            diag: DiagnosticCode::Nothing,
            discr: 0,
            min_tx_intv: 0,
            min_rx_intv: 0,
            demand: false,
            detect_mult: 0,
            tx_intv: 0,
            detect_time: 0,
        }
    }
}

// A single BFD session.
#[derive(Debug)]
pub struct Session {
    pub name: String,
    pub config: SessionConfig,
    pub local: Local,
    pub remote: Remote,
    pub timers: SessionTimers,
    pub last_seen: Option<Instant>,
    pub socket_tx: Option<UdpSocket>,
}

impl Session {
    // Builds a fresh session from configuration, per the lifecycle in
    // spec.md §3: a fresh discriminator, all remote fields zero, local
    // state Down unless disabled (then AdminDown).
    pub fn new(name: String, config: SessionConfig, discr: u32) -> Session {
        let state = if config.disabled { State::AdminDown } else { State::Down };
        let local = Local {
            state,
            diag: DiagnosticCode::Nothing,
            discr,
            poll: false,
            final_: false,
            tx_intv: config.local_idle_tx_intv,
            detect_time: 0,
        };
        Session {
            name,
            config,
            local,
            remote: Remote::default(),
            timers: SessionTimers::default(),
            last_seen: None,
            socket_tx: None,
        }
    }

    // Re-applies the `bfd0` reset template (§3 ADDED, `bfd_t` in the
    // original): every remote field zeroed, local state Down, diag
    // cleared, poll/final cleared, `local_tx_intv` back to idle, and a
    // freshly drawn discriminator. Used both at construction (folded
    // into `new` above) and whenever the `rst` timer fires (§4.4).
    pub fn reset(&mut self, discr: u32) {
        self.remote = Remote::default();
        self.local.state = State::Down;
        self.local.diag = DiagnosticCode::Nothing;
        self.local.discr = discr;
        self.local.poll = false;
        self.local.final_ = false;
        self.local.tx_intv = self.config.local_idle_tx_intv;
        self.local.detect_time = 0;
        self.last_seen = None;
    }

    // Builds the outgoing packet reflecting current local state. Desired
    // Min TX carries the *effective* transmit interval (idle while not
    // Up), not the raw configured minimum — see DESIGN.md on why this
    // crate follows the teacher's RFC-compliant reading rather than
    // keepalived's literal (always-configured-value) wire behavior.
    pub fn generate_packet(&self) -> crate::packet::Packet {
        use crate::packet::{Packet, PacketFlags};

        let mut flags = PacketFlags::empty();
        if self.local.poll {
            flags.insert(PacketFlags::P);
        }
        Packet {
            version: Packet::VERSION,
            diag: self.local.diag as u8,
            state: self.local.state,
            flags,
            detect_mult: self.config.local_detect_mult,
            my_discr: self.local.discr,
            your_discr: self.remote.discr,
            desired_min_tx: self.local.tx_intv,
            req_min_rx: self.config.local_min_rx_intv,
            req_min_echo_rx: 0,
        }
    }

    // Builds the one-shot reply to a Poll: same as a regular packet, but
    // with Poll cleared and Final set instead (§4.2: never both on the
    // same outbound packet).
    pub fn generate_final_packet(&self) -> crate::packet::Packet {
        use crate::packet::PacketFlags;

        let mut packet = self.generate_packet();
        packet.flags.remove(PacketFlags::P);
        packet.flags.insert(PacketFlags::F);
        packet
    }

    // Recomputes `local_tx_intv`/`remote_tx_intv` per invariants 3 and 4.
    pub fn recompute_intervals(&mut self) {
        self.local.tx_intv = if self.local.state == State::Up {
            std::cmp::max(self.config.local_min_tx_intv, self.remote.min_rx_intv)
        } else {
            self.config.local_idle_tx_intv
        };
        self.remote.tx_intv =
            std::cmp::max(self.config.local_min_rx_intv, self.remote.min_tx_intv);
    }

    // Recomputes detect times per invariants 5 and 6. Called on every
    // accepted packet, unconditionally, per §4.3.
    pub fn recompute_detect_times(&mut self) {
        self.local.detect_time =
            self.remote.detect_mult as u32 * self.remote.tx_intv;
        self.remote.detect_time =
            self.config.local_detect_mult as u32 * self.local.tx_intv;
    }
}

// Dual-lookup registry: by instance name, by local discriminator, and by
// neighbor address. All three must be kept consistent (§4.7).
//
// `by_addr` is keyed on the neighbor's IP alone, not the full `SocketAddr`
// (`config.neighbor` carries the well-known port 3784, but a peer's control
// packets arrive from an ephemeral source port per RFC 5881 §4), matching
// keepalived's `find_bfd_by_addr`, which is used both against a configured
// `nbr_addr` (port 3784) and a live packet's source address (ephemeral
// port) and so can only be comparing by address.
#[derive(Debug, Default)]
pub struct Registry {
    arena: Arena<Session>,
    by_name: HashMap<String, SessionId>,
    by_discr: HashMap<u32, SessionId>,
    by_addr: HashMap<IpAddr, SessionId>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    // Draws a fresh, non-zero discriminator unique across every live
    // session, by rejection sampling the 32-bit range against the
    // discriminator map (§4.7, `bfd.c`'s discriminator generation).
    pub fn fresh_discriminator(&self) -> u32 {
        loop {
            let candidate = rand::rng().next_u32();
            if candidate != 0 && !self.by_discr.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    // Inserts a freshly built session, registering it under all three
    // lookup maps. The caller is responsible for having already checked
    // for a duplicate neighbor address (§4.7 — that's a configuration
    // error handled at load time, not here).
    pub fn insert(&mut self, name: String, config: SessionConfig) -> SessionId {
        let discr = self.fresh_discriminator();
        self.insert_with_discr(name, config, discr)
    }

    // As `insert`, but with a caller-supplied discriminator instead of a
    // freshly drawn one. Used by the reload coordinator (§4.8) to carry a
    // matched session's discriminator across its registry rebuild, so a
    // peer never sees it change.
    pub fn insert_preserving(
        &mut self,
        name: String,
        config: SessionConfig,
        discr: u32,
    ) -> SessionId {
        self.insert_with_discr(name, config, discr)
    }

    fn insert_with_discr(
        &mut self,
        name: String,
        config: SessionConfig,
        discr: u32,
    ) -> SessionId {
        let neighbor_ip = config.neighbor.ip();
        Debug::SessionCreate(&name).log();
        let session = Session::new(name.clone(), config, discr);
        let id = self.arena.insert(session);
        self.by_name.insert(name, id);
        self.by_discr.insert(discr, id);
        self.by_addr.insert(neighbor_ip, id);
        id
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.arena.remove(id)?;
        self.by_name.remove(&session.name);
        self.by_discr.remove(&session.local.discr);
        self.by_addr.remove(&session.config.neighbor.ip());
        Some(session)
    }

    // Re-keys a session's discriminator, used after the `rst` timer
    // draws a fresh one (§4.4).
    pub fn rekey_discriminator(&mut self, id: SessionId, old: u32, new: u32) {
        self.by_discr.remove(&old);
        self.by_discr.insert(new, id);
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.arena.get_mut(id)
    }

    pub fn by_name(&self, name: &str) -> Option<SessionId> {
        self.by_name.get(name).copied()
    }

    pub fn by_discr(&self, discr: u32) -> Option<SessionId> {
        self.by_discr.get(&discr).copied()
    }

    pub fn by_addr(&self, addr: &IpAddr) -> Option<SessionId> {
        self.by_addr.get(addr).copied()
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Session)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionId, &mut Session)> {
        self.arena.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(neighbor: &str) -> SessionConfig {
        SessionConfig {
            neighbor: neighbor.parse().unwrap(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn fresh_sessions_get_distinct_discriminators() {
        let mut registry = Registry::new();
        let a = registry.insert("a".into(), config("10.0.0.1:3784"));
        let b = registry.insert("b".into(), config("10.0.0.2:3784"));
        let discr_a = registry.get(a).unwrap().local.discr;
        let discr_b = registry.get(b).unwrap().local.discr;
        assert_ne!(discr_a, 0);
        assert_ne!(discr_b, 0);
        assert_ne!(discr_a, discr_b);
    }

    #[test]
    fn disabled_session_starts_admin_down() {
        let mut registry = Registry::new();
        let mut cfg = config("10.0.0.1:3784");
        cfg.disabled = true;
        let id = registry.insert("a".into(), cfg);
        assert_eq!(registry.get(id).unwrap().local.state, State::AdminDown);
    }

    #[test]
    fn lookup_by_discriminator_and_address_agree() {
        let mut registry = Registry::new();
        let id = registry.insert("a".into(), config("10.0.0.1:3784"));
        let discr = registry.get(id).unwrap().local.discr;
        assert_eq!(registry.by_discr(discr), Some(id));
        assert_eq!(registry.by_addr(&"10.0.0.1".parse().unwrap()), Some(id));
    }

    #[test]
    fn lookup_by_addr_ignores_the_peer_source_port() {
        let mut registry = Registry::new();
        // Configured on the well-known port, but an inbound packet's
        // source address carries the peer's ephemeral source port instead.
        let id = registry.insert("a".into(), config("10.0.0.1:3784"));
        let src: SocketAddr = "10.0.0.1:54821".parse().unwrap();
        assert_eq!(registry.by_addr(&src.ip()), Some(id));
    }

    #[test]
    fn recompute_intervals_uses_idle_while_not_up() {
        let mut session = Session::new(
            "a".into(),
            config("10.0.0.1:3784"),
            1,
        );
        session.remote.min_rx_intv = 5_000;
        session.recompute_intervals();
        assert_eq!(session.local.tx_intv, DFLT_IDLE_TX_INTV);
    }

    #[test]
    fn recompute_intervals_negotiates_max_while_up() {
        let mut session = Session::new(
            "a".into(),
            config("10.0.0.1:3784"),
            1,
        );
        session.local.state = State::Up;
        session.remote.min_rx_intv = 50_000;
        session.recompute_intervals();
        assert_eq!(session.local.tx_intv, 50_000);
    }
}
