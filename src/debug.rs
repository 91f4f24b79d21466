//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::packet::State;
use crate::timer::TimerRole;

// Verbose protocol-event messages, logged at debug level and kept
// structurally distinct from warn-level `Error`s (see error.rs).
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a str),
    SessionDelete(&'a str),
    SessionDisabled(&'a str, &'a str),
    PacketRejected(&'a str, &'a str),
    FsmTransition(&'a str, State, State),
    DetectionTimeExpiry(&'a str),
    TimerScheduled(&'a str, TimerRole, u64),
    TimerCancelled(&'a str, TimerRole),
    PollStarted(&'a str),
    PollTerminated(&'a str),
    ReloadSessionPreserved(&'a str),
    ReloadSessionDiscarded(&'a str),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log the message using the tracing API.
    pub fn log(&self) {
        match self {
            Debug::SessionCreate(name) | Debug::SessionDelete(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::SessionDisabled(name, reason) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::PacketRejected(name, reason) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::FsmTransition(name, old_state, new_state) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(?old_state, ?new_state, "{}", self);
                });
            }
            Debug::DetectionTimeExpiry(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::TimerScheduled(name, role, delay_us) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(?role, %delay_us, "{}", self);
                });
            }
            Debug::TimerCancelled(name, role) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(?role, "{}", self);
                });
            }
            Debug::PollStarted(name) | Debug::PollTerminated(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::ReloadSessionPreserved(name)
            | Debug::ReloadSessionDiscarded(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => write!(f, "session created"),
            Debug::SessionDelete(..) => write!(f, "session deleted"),
            Debug::SessionDisabled(..) => write!(f, "session disabled"),
            Debug::PacketRejected(..) => write!(f, "packet rejected"),
            Debug::FsmTransition(..) => write!(f, "state transition"),
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
            Debug::TimerScheduled(..) => write!(f, "timer scheduled"),
            Debug::TimerCancelled(..) => write!(f, "timer cancelled"),
            Debug::PollStarted(..) => write!(f, "poll sequence started"),
            Debug::PollTerminated(..) => write!(f, "poll sequence terminated"),
            Debug::ReloadSessionPreserved(..) => {
                write!(f, "session preserved across reload")
            }
            Debug::ReloadSessionDiscarded(..) => {
                write!(f, "session snapshot discarded across reload")
            }
        }
    }
}
