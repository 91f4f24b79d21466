//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Instant;

use num_traits::FromPrimitive;

use crate::debug::Debug;
use crate::packet::{DiagnosticCode, Packet, State};
use crate::session::{Registry, SessionId};
use crate::sink::{EventRecord, EventSink};
use crate::timer::{TimerRole, Wheel, jittered_delay};

// Applies the entry actions for a transition into `state` (§4.6). Used
// both from `process_packet` below and directly by the engine when a
// send or socket-open failure forces a session to AdminDown (§7).
pub fn enter_state(
    registry: &mut Registry,
    wheel: &mut Wheel,
    sink: &mut dyn EventSink,
    id: SessionId,
    state: State,
    diag: DiagnosticCode,
    now: Instant,
) {
    let Some(session) = registry.get_mut(id) else {
        return;
    };
    let old_state = session.local.state;
    session.local.state = state;
    session.local.diag = diag;
    Debug::FsmTransition(&session.name, old_state, state).log();

    match state {
        State::Down => {
            session.local.tx_intv = session.config.local_idle_tx_intv;
            let delay = std::time::Duration::from_micros(session.local.detect_time as u64);
            let name = session.name.clone();
            wheel.cancel(&mut session.timers, &name, TimerRole::Exp);
            wheel.cancel(&mut session.timers, &name, TimerRole::Rst);
            wheel.schedule(&mut session.timers, &name, id, TimerRole::Rst, now, delay);
        }
        State::AdminDown => {
            session.local.tx_intv = session.config.local_idle_tx_intv;
            let name = session.name.clone();
            wheel.cancel(&mut session.timers, &name, TimerRole::Out);
            wheel.cancel(&mut session.timers, &name, TimerRole::Exp);
            wheel.cancel(&mut session.timers, &name, TimerRole::Rst);
        }
        State::Init | State::Up => {
            session.local.diag = DiagnosticCode::Nothing;
            let name = session.name.clone();
            wheel.cancel(&mut session.timers, &name, TimerRole::Rst);
            if !session.timers.is_scheduled(TimerRole::Exp) {
                let delay =
                    std::time::Duration::from_micros(session.local.detect_time as u64);
                wheel.schedule(&mut session.timers, &name, id, TimerRole::Exp, now, delay);
            }
        }
    }

    let session = registry.get(id).unwrap();
    sink.emit(EventRecord::now(&session.name, state));
}

// Processes a validated, accepted control packet against `session`
// (§4.2/§4.3/§4.6). Returns the one-shot Final reply to send immediately
// if the incoming packet carried Poll, bypassing the scheduler entirely
// (§4.2: "schedules an immediate transmit ... not resetting the periodic
// timer phase").
pub fn process_packet(
    registry: &mut Registry,
    wheel: &mut Wheel,
    sink: &mut dyn EventSink,
    id: SessionId,
    now: Instant,
    packet: &Packet,
) -> Option<Packet> {
    let session = registry.get_mut(id)?;
    if session.local.state == State::AdminDown {
        return None;
    }
    let name = session.name.clone();

    // Update remote fields verbatim. `packet.diag` is already validated
    // to be in range by `Packet::parse_and_validate`.
    session.remote.state = packet.state;
    session.remote.diag =
        DiagnosticCode::from_u8(packet.diag).unwrap_or(DiagnosticCode::Nothing);
    session.remote.discr = packet.my_discr;
    session.remote.min_tx_intv = packet.desired_min_tx;
    session.remote.min_rx_intv = packet.req_min_rx;
    session.remote.demand = packet.flags.contains(crate::packet::PacketFlags::D);
    session.remote.detect_mult = packet.detect_mult;
    session.last_seen = Some(now);

    let poll = packet.flags.contains(crate::packet::PacketFlags::P);
    let final_bit = packet.flags.contains(crate::packet::PacketFlags::F);

    if final_bit {
        session.local.poll = false;
        Debug::PollTerminated(&name).log();
    }

    // Interval recomputation (§4.3 ADDED trigger condition).
    let recompute = final_bit || poll || session.local.state != State::Up;
    if recompute {
        let old_tx_intv = session.local.tx_intv;
        session.recompute_intervals();
        if session.local.tx_intv < old_tx_intv
            && session.timers.is_scheduled(TimerRole::Out)
        {
            let delay = jittered_delay(session.local.tx_intv);
            wheel.reschedule(&mut session.timers, &name, id, TimerRole::Out, now, delay);
        }
    }
    session.recompute_detect_times();

    // State machine (§4.2).
    let next = if session.remote.state == State::AdminDown
        && session.local.state != State::Down
    {
        Some((State::Down, DiagnosticCode::NbrDown))
    } else {
        match (session.local.state, session.remote.state) {
            (State::Down, State::Down) => {
                Some((State::Init, DiagnosticCode::Nothing))
            }
            (State::Down, State::Init) => {
                Some((State::Up, DiagnosticCode::Nothing))
            }
            (State::Init, State::Init) | (State::Init, State::Up) => {
                Some((State::Up, DiagnosticCode::Nothing))
            }
            (State::Up, State::Down) => {
                Some((State::Down, DiagnosticCode::NbrDown))
            }
            // Direct Down -> Up is forbidden: a Down endpoint observing
            // remote=Up reaches Up only via Init, never in one step.
            _ => None,
        }
    };
    if let Some((state, diag)) = next {
        enter_state(registry, wheel, sink, id, state, diag, now);
    }

    let session = registry.get_mut(id)?;

    // Demand-mode transmitter suppression (§4.6 ADDED).
    if session.remote.demand
        && session.local.state == State::Up
        && session.remote.state == State::Up
    {
        wheel.cancel(&mut session.timers, &name, TimerRole::Out);
    } else if !session.timers.is_scheduled(TimerRole::Out) {
        let delay = jittered_delay(session.local.tx_intv);
        wheel.schedule(&mut session.timers, &name, id, TimerRole::Out, now, delay);
    }

    // Poll reply (§4.2): build it here, let the caller perform the I/O.
    let reply = if poll {
        session.local.final_ = true;
        Debug::PollStarted(&name).log();
        let reply = session.generate_final_packet();
        session.local.final_ = false;
        Some(reply)
    } else {
        None
    };

    // Detection timer is kept fresh on every accepted packet.
    if session.timers.is_scheduled(TimerRole::Exp) {
        let delay = std::time::Duration::from_micros(session.local.detect_time as u64);
        wheel.reschedule(&mut session.timers, &name, id, TimerRole::Exp, now, delay);
    }

    reply
}

// The `exp` timer fired: the detection window elapsed with no valid
// packet (§4.4). Forces a Down transition with diagnostic EXPIRED and
// clears the remote discriminator.
pub fn process_exp_fire(
    registry: &mut Registry,
    wheel: &mut Wheel,
    sink: &mut dyn EventSink,
    id: SessionId,
    now: Instant,
) {
    let Some(session) = registry.get_mut(id) else {
        return;
    };
    Debug::DetectionTimeExpiry(&session.name).log();
    session.remote.discr = 0;
    enter_state(registry, wheel, sink, id, State::Down, DiagnosticCode::TimeExpired, now);
}

// The `rst` timer fired: the session has been Down long enough that its
// runtime is reset to a clean slate, including a fresh discriminator, so
// a returning peer never sees a stale one (§4.4).
pub fn process_rst_fire(registry: &mut Registry, id: SessionId) {
    let new_discr = registry.fresh_discriminator();
    let Some(session) = registry.get_mut(id) else {
        return;
    };
    let old_discr = session.local.discr;
    session.reset(new_discr);
    registry.rekey_discriminator(id, old_discr, new_discr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFlags;
    use crate::session::SessionConfig;
    use crate::sink::NullSink;

    fn setup() -> (Registry, Wheel, NullSink, SessionId, Instant) {
        let mut registry = Registry::new();
        let config = SessionConfig {
            neighbor: "10.0.0.1:3784".parse().unwrap(),
            ..SessionConfig::default()
        };
        let id = registry.insert("peer".into(), config);
        (registry, Wheel::new(), NullSink, id, Instant::now())
    }

    fn packet_from(state: State, my_discr: u32, your_discr: u32) -> Packet {
        Packet {
            version: 1,
            diag: 0,
            state,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr,
            your_discr,
            desired_min_tx: 100_000,
            req_min_rx: 100_000,
            req_min_echo_rx: 0,
        }
    }

    #[test]
    fn down_to_init_on_remote_down() {
        let (mut registry, mut wheel, mut sink, id, now) = setup();
        let packet = packet_from(State::Down, 42, 0);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &packet);
        assert_eq!(registry.get(id).unwrap().local.state, State::Init);
    }

    #[test]
    fn init_to_up_on_remote_up() {
        let (mut registry, mut wheel, mut sink, id, now) = setup();
        let my_discr = registry.get(id).unwrap().local.discr;
        let down = packet_from(State::Down, 42, 0);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &down);
        let up = packet_from(State::Up, 42, my_discr);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &up);
        assert_eq!(registry.get(id).unwrap().local.state, State::Up);
    }

    #[test]
    fn remote_admin_down_forces_down() {
        let (mut registry, mut wheel, mut sink, id, now) = setup();
        let my_discr = registry.get(id).unwrap().local.discr;
        let down = packet_from(State::Down, 42, 0);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &down);
        let up = packet_from(State::Up, 42, my_discr);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &up);

        let admin_down = packet_from(State::AdminDown, 42, my_discr);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &admin_down);
        let session = registry.get(id).unwrap();
        assert_eq!(session.local.state, State::Down);
        assert_eq!(session.local.diag, DiagnosticCode::NbrDown);
    }

    #[test]
    fn poll_triggers_immediate_final_reply() {
        let (mut registry, mut wheel, mut sink, id, now) = setup();
        let mut packet = packet_from(State::Down, 42, 0);
        packet.flags.insert(PacketFlags::P);
        let reply =
            process_packet(&mut registry, &mut wheel, &mut sink, id, now, &packet);
        let reply = reply.expect("poll must trigger an immediate final reply");
        assert!(reply.flags.contains(PacketFlags::F));
        assert!(!reply.flags.contains(PacketFlags::P));
    }

    #[test]
    fn exp_fire_transitions_to_down_with_expired_diag() {
        let (mut registry, mut wheel, mut sink, id, now) = setup();
        let my_discr = registry.get(id).unwrap().local.discr;
        let down = packet_from(State::Down, 42, 0);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &down);
        let up = packet_from(State::Up, 42, my_discr);
        process_packet(&mut registry, &mut wheel, &mut sink, id, now, &up);

        process_exp_fire(&mut registry, &mut wheel, &mut sink, id, now);
        let session = registry.get(id).unwrap();
        assert_eq!(session.local.state, State::Down);
        assert_eq!(session.local.diag, DiagnosticCode::TimeExpired);
        assert_eq!(session.remote.discr, 0);
    }

    #[test]
    fn rst_fire_draws_a_fresh_discriminator() {
        let (mut registry, _wheel, _sink, id, _now) = setup();
        let old_discr = registry.get(id).unwrap().local.discr;
        process_rst_fire(&mut registry, id);
        let session = registry.get(id).unwrap();
        assert_ne!(session.local.discr, old_discr);
        assert_eq!(registry.by_discr(session.local.discr), Some(id));
        assert_eq!(registry.by_discr(old_discr), None);
    }
}
