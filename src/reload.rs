//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::time::Instant;

use crate::debug::Debug;
use crate::engine::{Engine, arm_fresh_session};
use crate::error::IoError;
use crate::fsm;
use crate::network;
use crate::packet::{DiagnosticCode, State};
use crate::session::{Local, Registry, Remote, SessionConfig};
use crate::timer::{ROLES, SessionTimers, Wheel};

// One session's full runtime, captured while its timers are suspended
// so it can be transplanted onto whatever the reparsed configuration
// rebuilds under the same instance name, if anything (§4.8 step 2).
struct Snapshot {
    local: Local,
    remote: Remote,
    last_seen: Option<Instant>,
    timers: SessionTimers,
    config: SessionConfig,
}

// Rebuilds `engine`'s registry from `configs` without ever tearing down
// the listening socket (§4.8). Every currently scheduled timer is first
// suspended rather than cancelled, so a session matched by name in the
// new configuration resumes with its original deadline intact instead
// of restarting its detection window from scratch.
//
// Three-way branch per rebuilt session, decided in this order:
//   1. disabled in the new configuration -> any snapshot is discarded,
//      the session sits AdminDown with no timer armed.
//   2. matched by name and enabled -> runtime state and timers are
//      restored from the snapshot; only the roles that were actually
//      scheduled before reload are resumed.
//   3. new (no snapshot) and enabled -> armed exactly as a freshly
//      loaded session would be (`arm_fresh_session`).
pub fn apply(engine: &mut Engine, now: Instant, configs: Vec<(String, SessionConfig)>) {
    let mut snapshots: HashMap<String, Snapshot> = HashMap::new();

    for (_, session) in engine.registry.iter_mut() {
        for role in ROLES {
            if session.timers.is_scheduled(role) {
                engine.wheel.suspend(&mut session.timers, &session.name, role, now);
            }
        }
        session.socket_tx = None;
        snapshots.insert(
            session.name.clone(),
            Snapshot {
                local: session.local,
                remote: session.remote,
                last_seen: session.last_seen,
                timers: session.timers,
                config: session.config.clone(),
            },
        );
    }

    let mut registry = Registry::new();
    let mut wheel = Wheel::new();

    for (name, config) in configs {
        let prior = snapshots.remove(&name);
        let id = match &prior {
            Some(snap) => {
                registry.insert_preserving(name.clone(), config, snap.local.discr)
            }
            None => registry.insert(name.clone(), config),
        };

        let disabled = registry
            .get(id)
            .map(|s| s.local.state == State::AdminDown)
            .unwrap_or(true);

        if disabled {
            if prior.is_some() {
                Debug::ReloadSessionDiscarded(&name).log();
            }
            continue;
        }

        match prior {
            Some(snap) => restore_session(
                &mut registry,
                &mut wheel,
                engine.sink.as_mut(),
                id,
                &name,
                snap,
                now,
            ),
            None => {
                arm_fresh_session(&mut registry, &mut wheel, engine.sink.as_mut(), id, now)
            }
        }
    }

    engine.registry = registry;
    engine.wheel = wheel;
}

// Restores a matched session's runtime state, reopens its output
// socket, and resumes whichever timer roles were actually scheduled
// before the reload.
fn restore_session(
    registry: &mut Registry,
    wheel: &mut Wheel,
    sink: &mut dyn crate::sink::EventSink,
    id: crate::session::SessionId,
    name: &str,
    snap: Snapshot,
    now: Instant,
) {
    let Some(session) = registry.get_mut(id) else {
        return;
    };
    session.local = snap.local;
    session.remote = snap.remote;
    session.last_seen = snap.last_seen;

    // Poll-on-slowdown (§4.2/§4.3): an operator raising a negotiated
    // interval on an already-Up session can't take effect until the peer
    // has acknowledged it, so a Poll sequence is started instead of
    // applying the new value outright. Mirrors keepalived's
    // `bfd_set_poll`, which never overrides an in-progress Final reply.
    let slowed_down = session.local.state == State::Up
        && (session.config.local_min_rx_intv > snap.config.local_min_rx_intv
            || session.config.local_min_tx_intv > snap.config.local_min_tx_intv);
    if slowed_down && !session.local.final_ {
        session.local.poll = true;
        Debug::PollStarted(name).log();
    }

    let af = session.config.address_family();
    let source = session.config.source;

    match network::open_output_socket(af, source) {
        Ok(socket) => {
            let Some(session) = registry.get_mut(id) else {
                return;
            };
            session.socket_tx = Some(socket);
        }
        Err(e) => {
            IoError::UdpSocketOpenError(e).log();
            fsm::enter_state(
                registry,
                wheel,
                sink,
                id,
                State::AdminDown,
                DiagnosticCode::AdminDown,
                now,
            );
            return;
        }
    }

    let Some(session) = registry.get_mut(id) else {
        return;
    };
    session.timers = snap.timers;
    for role in ROLES {
        if session.timers.get(role).is_suspended() {
            wheel.resume(&mut session.timers, name, id, role, now);
        }
    }
    Debug::ReloadSessionPreserved(name).log();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::sink::NullSink;
    use crate::timer::TimerRole;

    fn config(neighbor: &str) -> SessionConfig {
        SessionConfig {
            neighbor: neighbor.parse().unwrap(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn matched_session_keeps_its_discriminator_and_timer() {
        let mut engine =
            Engine::new(vec![("a".into(), config("10.0.0.1:3784"))], Box::new(NullSink))
                .unwrap();
        let old_discr = engine.registry.iter().next().unwrap().1.local.discr;

        engine.reload(vec![("a".into(), config("10.0.0.1:3784"))]);

        let (_, session) = engine.registry.iter().next().unwrap();
        assert_eq!(session.local.discr, old_discr);
        assert!(session.timers.is_scheduled(TimerRole::Out));
    }

    #[test]
    fn removed_instance_is_dropped() {
        let mut engine = Engine::new(
            vec![
                ("a".into(), config("10.0.0.1:3784")),
                ("b".into(), config("10.0.0.2:3784")),
            ],
            Box::new(NullSink),
        )
        .unwrap();

        engine.reload(vec![("a".into(), config("10.0.0.1:3784"))]);

        assert_eq!(engine.session_count(), 1);
        assert!(engine.registry.by_name("b").is_none());
    }

    #[test]
    fn newly_disabled_instance_discards_its_snapshot() {
        let mut engine =
            Engine::new(vec![("a".into(), config("10.0.0.1:3784"))], Box::new(NullSink))
                .unwrap();

        let mut disabled = config("10.0.0.1:3784");
        disabled.disabled = true;
        engine.reload(vec![("a".into(), disabled)]);

        let (_, session) = engine.registry.iter().next().unwrap();
        assert_eq!(session.local.state, State::AdminDown);
        assert!(!session.timers.is_scheduled(TimerRole::Out));
    }

    #[test]
    fn brand_new_instance_is_armed_fresh() {
        let mut engine =
            Engine::new(vec![("a".into(), config("10.0.0.1:3784"))], Box::new(NullSink))
                .unwrap();

        engine.reload(vec![
            ("a".into(), config("10.0.0.1:3784")),
            ("b".into(), config("10.0.0.2:3784")),
        ]);

        assert_eq!(engine.session_count(), 2);
        let id = engine.registry.by_name("b").unwrap();
        let session = engine.registry.get(id).unwrap();
        assert!(session.timers.is_scheduled(TimerRole::Out));
    }
}
