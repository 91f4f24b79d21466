//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::debug::Debug;
use crate::session::SessionId;

// A session carries exactly three timer roles, each driving one of the
// behaviors described in spec.md §4.4.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerRole {
    // Periodic transmit, jittered.
    Out,
    // Detection-time expiration.
    Exp,
    // Reset-to-initial after a Down sojourn.
    Rst,
}

impl std::fmt::Display for TimerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerRole::Out => write!(f, "out"),
            TimerRole::Exp => write!(f, "exp"),
            TimerRole::Rst => write!(f, "rst"),
        }
    }
}

pub const ROLES: [TimerRole; 3] =
    [TimerRole::Out, TimerRole::Exp, TimerRole::Rst];

// A role is always in exactly one of these states (invariant 2, spec.md
// §3/§8) — modeled as an enum rather than independent booleans so that
// "scheduled and suspended at once" isn't representable at all.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TimerState {
    #[default]
    Idle,
    Scheduled(Instant),
    Suspended(Duration),
}

impl TimerState {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, TimerState::Scheduled(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, TimerState::Suspended(_))
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            TimerState::Scheduled(deadline) => Some(*deadline),
            _ => None,
        }
    }
}

// The three timer handles a session carries, keyed by role.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionTimers {
    pub out: TimerState,
    pub exp: TimerState,
    pub rst: TimerState,
}

impl SessionTimers {
    pub fn get(&self, role: TimerRole) -> TimerState {
        match role {
            TimerRole::Out => self.out,
            TimerRole::Exp => self.exp,
            TimerRole::Rst => self.rst,
        }
    }

    fn get_mut(&mut self, role: TimerRole) -> &mut TimerState {
        match role {
            TimerRole::Out => &mut self.out,
            TimerRole::Exp => &mut self.exp,
            TimerRole::Rst => &mut self.rst,
        }
    }

    pub fn is_scheduled(&self, role: TimerRole) -> bool {
        self.get(role).is_scheduled()
    }
}

// A single entry in the wheel's priority queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    session: SessionId,
    role: TimerRole,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// The central timer scheduler: a binary heap of (deadline, session, role)
// triples, with lazy deletion. Cancelling a timer never removes its heap
// entry directly — it only resets the session's own per-role `TimerState`
// to `Idle`. A popped entry is honored only if the session's current
// state for that role is still `Scheduled` with a matching deadline;
// otherwise it's a stale entry left behind by an earlier cancel or
// reschedule, and is silently discarded. This avoids the bookkeeping a
// remove-capable heap, or a `tokio::task`-per-timer model, would require
// — see DESIGN.md and SPEC_FULL.md §5.
#[derive(Debug, Default)]
pub struct Wheel {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl Wheel {
    pub fn new() -> Wheel {
        Wheel::default()
    }

    // Schedules `role` on `session` to fire after `delay`. The role MUST
    // currently be `Idle`; scheduling an already-scheduled role is a
    // programming error (spec.md §4.4).
    pub fn schedule(
        &mut self,
        timers: &mut SessionTimers,
        name: &str,
        session: SessionId,
        role: TimerRole,
        now: Instant,
        delay: Duration,
    ) {
        assert!(
            !timers.get(role).is_scheduled(),
            "attempted to schedule an already-scheduled {role} timer"
        );
        let deadline = now + delay;
        *timers.get_mut(role) = TimerState::Scheduled(deadline);
        self.heap.push(Reverse(Entry { deadline, session, role }));
        Debug::TimerScheduled(name, role, delay.as_micros() as u64).log();
    }

    // Cancels `role` on `session` if it is currently scheduled. A no-op
    // (not an error) if the role is already idle, since several call
    // sites cancel unconditionally ("cancel if scheduled").
    pub fn cancel(
        &mut self,
        timers: &mut SessionTimers,
        name: &str,
        role: TimerRole,
    ) {
        if timers.get(role).is_scheduled() {
            *timers.get_mut(role) = TimerState::Idle;
            Debug::TimerCancelled(name, role).log();
        }
    }

    // Cancel-then-schedule as a single step.
    pub fn reschedule(
        &mut self,
        timers: &mut SessionTimers,
        name: &str,
        session: SessionId,
        role: TimerRole,
        now: Instant,
        delay: Duration,
    ) {
        self.cancel(timers, name, role);
        self.schedule(timers, name, session, role, now, delay);
    }

    // Suspends a scheduled role, recording the remaining time until its
    // deadline. Suspending a role that isn't scheduled is a programming
    // error.
    pub fn suspend(
        &mut self,
        timers: &mut SessionTimers,
        name: &str,
        role: TimerRole,
        now: Instant,
    ) {
        let TimerState::Scheduled(deadline) = timers.get(role) else {
            panic!("attempted to suspend a {role} timer that isn't scheduled");
        };
        let remaining = deadline.saturating_duration_since(now);
        *timers.get_mut(role) = TimerState::Suspended(remaining);
        Debug::TimerCancelled(name, role).log();
    }

    // Re-arms a suspended role with its recorded remaining time.
    pub fn resume(
        &mut self,
        timers: &mut SessionTimers,
        name: &str,
        session: SessionId,
        role: TimerRole,
        now: Instant,
    ) {
        let TimerState::Suspended(remaining) = timers.get(role) else {
            panic!("attempted to resume a {role} timer that isn't suspended");
        };
        *timers.get_mut(role) = TimerState::Idle;
        self.schedule(timers, name, session, role, now, remaining);
    }

    // Forgets a suspended deadline outright, without re-arming it.
    pub fn discard(&mut self, timers: &mut SessionTimers, role: TimerRole) {
        debug_assert!(
            timers.get(role).is_suspended(),
            "attempted to discard a {role} timer that isn't suspended"
        );
        *timers.get_mut(role) = TimerState::Idle;
    }

    // The earliest scheduled deadline across every live entry in the
    // heap. A stale entry's deadline is never earlier than the live
    // replacement that superseded it, so this remains a safe lower bound
    // for how long the event loop may sleep even though staleness itself
    // is only resolved on pop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    // Pops every heap entry whose deadline has passed, yielding only the
    // ones that are still live (i.e. the session's current `TimerState`
    // for that role is still `Scheduled` with this exact deadline).
    // `timers_of` is read-only, so resetting a yielded role's state back
    // to `Idle` is the caller's job, same as any one-shot timer going
    // back to rest once it fires.
    pub fn pop_due(
        &mut self,
        timers_of: impl Fn(SessionId) -> Option<SessionTimers>,
        now: Instant,
    ) -> Vec<(SessionId, TimerRole)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            match timers_of(entry.session) {
                Some(timers)
                    if timers.get(entry.role)
                        == TimerState::Scheduled(entry.deadline) =>
                {
                    due.push((entry.session, entry.role));
                }
                _ => {
                    // Stale: cancelled, rescheduled, or the session is gone.
                }
            }
        }
        due
    }
}

// Draws a jittered delay for the `out` role per the formula in
// `bfd_scheduler.c`: `min_jitter = I/10`, `max_jitter = I/4`, fire after
// `I - uniform(min_jitter, max_jitter)`. `local_detect_mult` is always
// >= 1 in this daemon (config validation enforces `1..=10`), so the
// zero-jitter branch the original reserves for an (unreachable here)
// multiplier of 0 never applies; see DESIGN.md.
pub fn jittered_delay(tx_intv: u32) -> Duration {
    let tx_intv = tx_intv as u64;
    let min_jitter = tx_intv / 10;
    let max_jitter = tx_intv / 4;
    let jitter = if max_jitter > min_jitter {
        rand::rng().random_range(min_jitter..=max_jitter)
    } else {
        min_jitter
    };
    Duration::from_micros(tx_intv.saturating_sub(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn session_id() -> SessionId {
        let mut arena: Arena<()> = Arena::new();
        arena.insert(())
    }

    #[test]
    fn schedule_then_cancel_returns_to_idle() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        let id = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers, "peer", id, TimerRole::Out, now, Duration::from_millis(10));
        assert!(timers.is_scheduled(TimerRole::Out));

        wheel.cancel(&mut timers, "peer", TimerRole::Out);
        assert!(!timers.is_scheduled(TimerRole::Out));
    }

    #[test]
    #[should_panic(expected = "already-scheduled")]
    fn scheduling_an_already_scheduled_role_panics() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        let id = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers, "peer", id, TimerRole::Out, now, Duration::from_millis(10));
        wheel.schedule(&mut timers, "peer", id, TimerRole::Out, now, Duration::from_millis(10));
    }

    #[test]
    fn cancel_on_an_idle_role_is_a_no_op() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        wheel.cancel(&mut timers, "peer", TimerRole::Exp);
        assert!(!timers.is_scheduled(TimerRole::Exp));
    }

    #[test]
    fn suspend_then_resume_rearms_with_remaining_time() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        let id = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers, "peer", id, TimerRole::Exp, now, Duration::from_millis(100));
        wheel.suspend(&mut timers, "peer", TimerRole::Exp, now);
        assert!(timers.get(TimerRole::Exp).is_suspended());

        let later = now + Duration::from_millis(40);
        wheel.resume(&mut timers, "peer", id, TimerRole::Exp, later);
        assert!(timers.is_scheduled(TimerRole::Exp));
        let deadline = timers.get(TimerRole::Exp).deadline().unwrap();
        assert_eq!(deadline, later + Duration::from_millis(100));
    }

    #[test]
    #[should_panic(expected = "isn't scheduled")]
    fn suspending_an_idle_role_panics() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        wheel.suspend(&mut timers, "peer", TimerRole::Rst, Instant::now());
    }

    #[test]
    fn discard_forgets_a_suspended_deadline() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        let id = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers, "peer", id, TimerRole::Rst, now, Duration::from_millis(10));
        wheel.suspend(&mut timers, "peer", TimerRole::Rst, now);
        wheel.discard(&mut timers, TimerRole::Rst);
        assert!(!timers.get(TimerRole::Rst).is_suspended());
        assert!(!timers.is_scheduled(TimerRole::Rst));
    }

    #[test]
    fn pop_due_ignores_stale_entries_after_reschedule() {
        let mut wheel = Wheel::new();
        let mut timers = SessionTimers::default();
        let id = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers, "peer", id, TimerRole::Out, now, Duration::from_millis(10));
        wheel.reschedule(&mut timers, "peer", id, TimerRole::Out, now, Duration::from_millis(20));

        let due = wheel.pop_due(|i| if i == id { Some(timers) } else { None }, now + Duration::from_millis(15));
        assert!(due.is_empty(), "the first, superseded deadline must not fire");

        let due = wheel.pop_due(|i| if i == id { Some(timers) } else { None }, now + Duration::from_millis(25));
        assert_eq!(due, vec![(id, TimerRole::Out)]);
    }

    #[test]
    fn next_deadline_tracks_the_earliest_live_entry() {
        let mut wheel = Wheel::new();
        let mut timers_a = SessionTimers::default();
        let mut timers_b = SessionTimers::default();
        let a = session_id();
        let b = session_id();
        let now = Instant::now();

        wheel.schedule(&mut timers_a, "a", a, TimerRole::Out, now, Duration::from_millis(50));
        wheel.schedule(&mut timers_b, "b", b, TimerRole::Exp, now, Duration::from_millis(10));

        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn jittered_delay_stays_within_keepalived_bounds() {
        for _ in 0..200 {
            let delay = jittered_delay(1_000_000);
            assert!(delay >= Duration::from_micros(750_000));
            assert!(delay <= Duration::from_micros(900_000));
        }
    }

    #[test]
    fn jittered_delay_falls_back_to_min_jitter_when_the_range_collapses() {
        // tx_intv=5: min_jitter=0, max_jitter=1 -> the uniform range is
        // non-empty, but tx_intv=3 gives min_jitter=0 == max_jitter=0.
        let delay = jittered_delay(3);
        assert_eq!(delay, Duration::from_micros(3));
    }
}
