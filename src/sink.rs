//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use crate::packet::State;

// The fixed-size record emitted on every published local-state
// transition, matching `bfd_event_t` from the original (§6 ADDED).
#[derive(Clone, Copy, Debug)]
pub struct EventRecord {
    pub instance_name: [u8; 32],
    pub new_local_state: u8,
    pub sent_time: i64,
}

impl EventRecord {
    pub fn new(name: &str, state: State, sent_time: i64) -> EventRecord {
        let mut instance_name = [0u8; 32];
        let bytes = name.as_bytes();
        let len = bytes.len().min(instance_name.len() - 1);
        instance_name[..len].copy_from_slice(&bytes[..len]);
        EventRecord {
            instance_name,
            new_local_state: state as u8,
            sent_time,
        }
    }

    // Convenience constructor stamping the current wall-clock time.
    pub fn now(name: &str, state: State) -> EventRecord {
        EventRecord::new(name, state, chrono::Utc::now().timestamp_micros())
    }

    pub fn name(&self) -> std::borrow::Cow<'_, str> {
        let len = self
            .instance_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.instance_name.len());
        String::from_utf8_lossy(&self.instance_name[..len])
    }
}

// One-way sink for published local-state transitions. A caller who needs
// a real transport (pipe, channel, wire format) implements this trait;
// the daemon itself never reads state back out of it.
pub trait EventSink {
    fn emit(&mut self, record: EventRecord);
}

// Default sink: logs every transition via `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, record: EventRecord) {
        tracing::info!(
            name = %record.name(),
            state = record.new_local_state,
            sent_time = record.sent_time,
            "session state changed"
        );
    }
}

// A sink that discards every record, used by tests that only care about
// FSM/timer behavior.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _record: EventRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_truncated_not_overrun() {
        let name = "a".repeat(64);
        let record = EventRecord::new(&name, State::Up, 0);
        assert_eq!(record.name(), "a".repeat(31));
    }

    #[test]
    fn short_names_round_trip() {
        let record = EventRecord::new("peer1", State::Down, 1234);
        assert_eq!(record.name(), "peer1");
        assert_eq!(record.new_local_state, State::Down as u8);
    }
}
