//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{Error, IoError};
use crate::fsm;
use crate::network;
use crate::packet::{DiagnosticCode, Packet, State};
use crate::session::{Registry, SessionConfig, SessionId};
use crate::sink::EventSink;
use crate::socket::UdpSocket;
use crate::timer::{TimerRole, TimerState, Wheel, jittered_delay};

// Fallback wakeup when the wheel holds no deadline at all (e.g. every
// configured instance is disabled). Never the limiting factor once any
// session is live; it only keeps the event loop polling the listening
// socket while there is nothing else to wait on.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(60);

// The single-threaded cooperative core (SPEC_FULL.md §5): one registry,
// one timer wheel, one shared event sink, one listening socket, driven
// from a `tokio` current-thread runtime by `run`'s event loop. There is
// no per-session task and no per-timer task; every state change happens
// inline on the loop's own stack, so two sessions never race each other.
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) wheel: Wheel,
    pub(crate) sink: Box<dyn EventSink>,
    pub(crate) listen_socket: UdpSocket,
}

impl Engine {
    // Opens the shared listening socket and brings up every enabled
    // session from `configs`: an output socket each, and an initial,
    // jittered `out` timer (§4.4). A session that starts disabled, or
    // whose output socket can't be opened, starts (or is forced) into
    // AdminDown instead, never scheduling a timer.
    pub fn new(
        configs: Vec<(String, SessionConfig)>,
        sink: Box<dyn EventSink>,
    ) -> Result<Engine, Error> {
        let listen_socket = network::open_listen_socket()
            .map_err(IoError::UdpSocketOpenError)?;

        let mut engine = Engine {
            registry: Registry::new(),
            wheel: Wheel::new(),
            sink,
            listen_socket,
        };

        let now = Instant::now();
        for (name, config) in configs {
            let id = engine.registry.insert(name, config);
            let Engine { registry, wheel, sink, .. } = &mut engine;
            arm_fresh_session(registry, wheel, sink.as_mut(), id, now);
        }

        Ok(engine)
    }

    // Rebuilds the registry from `configs`, preserving every session
    // matched by name across the reparse (§4.8).
    pub fn reload(&mut self, configs: Vec<(String, SessionConfig)>) {
        let now = Instant::now();
        crate::reload::apply(self, now, configs);
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    // Runs the event loop forever: each iteration waits for either a
    // datagram on the listening socket or the next timer deadline,
    // handles exactly one of the two, then loops. `now` is sampled once
    // per branch taken, never more than once per iteration (SPEC_FULL.md
    // §5 ADDED: a single clock read anchors every recompute that follows
    // from the same event).
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let deadline = self.wheel.next_deadline();
        let sleep = match deadline {
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
            }
            None => tokio::time::sleep(IDLE_POLL_INTERVAL),
        };
        tokio::pin!(sleep);

        tokio::select! {
            result = network::recv_packet(&self.listen_socket) => {
                self.handle_recv(result).await;
            }
            _ = &mut sleep => {
                self.handle_timers_due().await;
            }
        }
    }

    async fn handle_recv(
        &mut self,
        result: Result<(Vec<u8>, SocketAddr, Option<u8>), IoError>,
    ) {
        let now = Instant::now();
        let (data, src, ttl) = match result {
            Ok(v) => v,
            Err(err) => {
                err.log();
                return;
            }
        };

        match Packet::parse_and_validate(&data, ttl) {
            Ok(packet) => self.dispatch_packet(src, packet, now).await,
            Err(reason) => crate::error::log_rejected(&src.to_string(), reason),
        }
    }

    // Demultiplexes an accepted packet to its session, preferring Your
    // Discriminator when the peer supplied one, falling back to source
    // address for a session still in its first exchange (§4.1/§4.7).
    async fn dispatch_packet(&mut self, src: SocketAddr, packet: Packet, now: Instant) {
        let id = if packet.your_discr != 0 {
            self.registry.by_discr(packet.your_discr)
        } else {
            self.registry.by_addr(&src.ip())
        };

        let Some(id) = id else {
            Error::SessionNotFound { src, your_discr: packet.your_discr }.log();
            return;
        };

        let reply = fsm::process_packet(
            &mut self.registry,
            &mut self.wheel,
            self.sink.as_mut(),
            id,
            now,
            &packet,
        );
        if let Some(reply) = reply {
            self.send_packet(id, reply).await;
        }
    }

    async fn handle_timers_due(&mut self) {
        let now = Instant::now();
        let due = self.pop_due_timers(now);
        for (id, role) in due {
            self.clear_timer(id, role);
            match role {
                TimerRole::Out => self.fire_transmit(id, now).await,
                TimerRole::Exp => fsm::process_exp_fire(
                    &mut self.registry,
                    &mut self.wheel,
                    self.sink.as_mut(),
                    id,
                    now,
                ),
                TimerRole::Rst => fsm::process_rst_fire(&mut self.registry, id),
            }
        }
    }

    fn pop_due_timers(&mut self, now: Instant) -> Vec<(SessionId, TimerRole)> {
        let Engine { wheel, registry, .. } = self;
        wheel.pop_due(|id| registry.get(id).map(|s| s.timers), now)
    }

    // `Wheel::pop_due` only tells us which roles fired; resetting the
    // session's own `TimerState` back to Idle is the caller's job, same
    // as a one-shot timer going back to rest once it fires.
    fn clear_timer(&mut self, id: SessionId, role: TimerRole) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        match role {
            TimerRole::Out => session.timers.out = TimerState::Idle,
            TimerRole::Exp => session.timers.exp = TimerState::Idle,
            TimerRole::Rst => session.timers.rst = TimerState::Idle,
        }
    }

    // The `out` timer fired: transmit one control packet, then
    // reschedule unless the session has gone AdminDown (a send failure),
    // or demand-mode transmitter suppression now applies (§4.6 ADDED).
    async fn fire_transmit(&mut self, id: SessionId, now: Instant) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if session.local.state == State::AdminDown {
            return;
        }
        let packet = session.generate_packet();
        self.send_packet(id, packet).await;

        let Some(session) = self.registry.get(id) else {
            return;
        };
        if session.local.state == State::AdminDown {
            return;
        }
        let suppressed = session.remote.demand
            && session.local.state == State::Up
            && session.remote.state == State::Up;
        let already_scheduled = session.timers.is_scheduled(TimerRole::Out);
        let tx_intv = session.local.tx_intv;

        if !suppressed && !already_scheduled {
            let delay = jittered_delay(tx_intv);
            self.schedule_out(id, now, delay);
        }
    }

    fn schedule_out(&mut self, id: SessionId, now: Instant, delay: Duration) {
        let Engine { registry, wheel, .. } = self;
        let Some(session) = registry.get_mut(id) else {
            return;
        };
        let name = session.name.clone();
        wheel.schedule(&mut session.timers, &name, id, TimerRole::Out, now, delay);
    }

    // Sends one encoded packet to a session's neighbor over its
    // dedicated output socket. A send failure forces the session to
    // AdminDown (§7): keepalived's own reading of a permanently failing
    // output path is "give up cleanly", not "retry forever".
    async fn send_packet(&mut self, id: SessionId, packet: Packet) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let Some(socket) = session.socket_tx.as_ref() else {
            return;
        };
        let dst = session.config.neighbor;

        if let Err(err) = network::send_packet(socket, dst, &packet).await {
            err.log();
            fsm::enter_state(
                &mut self.registry,
                &mut self.wheel,
                self.sink.as_mut(),
                id,
                State::AdminDown,
                DiagnosticCode::AdminDown,
                Instant::now(),
            );
        }
    }
}

// Brings a single freshly-inserted, enabled session up: opens its output
// socket and arms the initial `out` timer, or forces it to AdminDown if
// the socket can't be opened. Shared between `Engine::new` (startup) and
// `reload::apply` (a brand-new instance appearing in a reparsed config),
// since both describe the identical lifecycle step (`bfd_open_fds`
// followed by `bfd_register_workers`'s fresh-schedule branch).
pub(crate) fn arm_fresh_session(
    registry: &mut Registry,
    wheel: &mut Wheel,
    sink: &mut dyn EventSink,
    id: SessionId,
    now: Instant,
) {
    let Some(session) = registry.get(id) else {
        return;
    };
    if session.local.state == State::AdminDown {
        return;
    }
    let af = session.config.address_family();
    let source = session.config.source;

    match network::open_output_socket(af, source) {
        Ok(socket) => {
            let Some(session) = registry.get_mut(id) else {
                return;
            };
            session.socket_tx = Some(socket);
            let name = session.name.clone();
            let delay = jittered_delay(session.local.tx_intv);
            wheel.schedule(&mut session.timers, &name, id, TimerRole::Out, now, delay);
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
        }
    }
}
