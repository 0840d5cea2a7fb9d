//! Wrapped time and the event scheduler.
//!
//! The daemon keeps two views of time: a monotonic microsecond count for
//! the scheduler itself, and a 32-bit tick counter at `WTHZ` Hz whose
//! values are compared only through signed wrap-around deltas.  Every
//! deadline stored in the PIT is a [`WrappedTime`]; the scheduler's heap
//! uses the absolute microsecond count so that ordering survives the
//! 32-bit wrap.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Tick rate for wrapped time.  1_000_000 / WTHZ must be integral.
pub const WTHZ: u64 = 500;
/// Microseconds per tick.
pub const MICROS_PER_TICK: u64 = 1_000_000 / WTHZ;

/// Largest clock step accepted in one update, in ticks.
const MAX_STEP_TICKS: u64 = (1 << 30) / WTHZ * WTHZ;

/// A 32-bit wrapped tick timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WrappedTime(pub u32);

impl WrappedTime {
    /// Total order over any window narrower than 2^31 ticks.
    pub fn cmp_wrapped(self, other: WrappedTime) -> Ordering {
        let delta = self.0.wrapping_sub(other.0);
        if delta == 0 {
            Ordering::Equal
        } else if delta >= 0x8000_0000 {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    pub fn is_before(self, other: WrappedTime) -> bool {
        self.cmp_wrapped(other) == Ordering::Less
    }

    pub fn is_at_or_before(self, other: WrappedTime) -> bool {
        self.cmp_wrapped(other) != Ordering::Greater
    }

    /// Ticks from `earlier` to `self`, wrapping.
    pub fn ticks_since(self, earlier: WrappedTime) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub fn plus_ticks(self, ticks: u32) -> WrappedTime {
        WrappedTime(self.0.wrapping_add(ticks))
    }

    /// Advance by a microsecond delay, rounding up to whole ticks.
    pub fn plus_micros(self, micros: u64) -> WrappedTime {
        let ticks = micros.div_ceil(MICROS_PER_TICK);
        WrappedTime(self.0.wrapping_add(ticks as u32))
    }
}

/// Convert a tick count to microseconds.
pub fn ticks_to_micros(ticks: u64) -> u64 {
    ticks * MICROS_PER_TICK
}

/* ---------------------------------------------------------------- *
 * Clock
 * ---------------------------------------------------------------- */

/// The daemon's clock: monotonic ticks plus cached wall time.
#[derive(Debug)]
pub struct Clock {
    ticks: u64,
    sliver_us: u64,
    last: Option<Instant>,
    /// Cached wall-clock seconds, for logs and staleness accounting.
    pub sec: u64,
    /// Cached wall-clock microseconds.
    pub usec: u32,
    pub start_sec: u64,
    pub start_usec: u32,
}

impl Clock {
    pub fn new() -> Self {
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            ticks: 0,
            sliver_us: 0,
            last: None,
            sec: wall.as_secs(),
            usec: wall.subsec_micros(),
            start_sec: wall.as_secs(),
            start_usec: wall.subsec_micros(),
        }
    }

    /// Refresh from the system clocks.
    pub fn update(&mut self) {
        let now = Instant::now();
        let elapsed_us = match self.last {
            Some(prev) => now.saturating_duration_since(prev).as_micros() as u64,
            None => 0,
        };
        self.last = Some(now);
        self.step_micros(elapsed_us);
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        self.sec = wall.as_secs();
        self.usec = wall.subsec_micros();
    }

    /// Advance by an explicit amount (tests and simulations).
    pub fn advance_micros(&mut self, micros: u64) {
        self.step_micros(micros);
        let total = self.sec * 1_000_000 + self.usec as u64 + micros;
        self.sec = total / 1_000_000;
        self.usec = (total % 1_000_000) as u32;
    }

    fn step_micros(&mut self, elapsed_us: u64) {
        let total = elapsed_us + self.sliver_us;
        let mut step = total / MICROS_PER_TICK;
        self.sliver_us = total % MICROS_PER_TICK;
        if step > MAX_STEP_TICKS {
            step = MAX_STEP_TICKS;
            self.sliver_us = 0;
        }
        self.ticks += step;
    }

    pub fn wtnow(&self) -> WrappedTime {
        WrappedTime(self.ticks as u32)
    }

    /// Absolute (non-wrapping) microsecond count.
    pub fn abs_micros(&self) -> u64 {
        self.ticks * MICROS_PER_TICK + self.sliver_us
    }

    pub fn uptime_secs(&self) -> u64 {
        self.sec.saturating_sub(self.start_sec)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/* ---------------------------------------------------------------- *
 * Scheduler
 * ---------------------------------------------------------------- */

/// Deferred daemon work, named rather than captured so the dispatcher can
/// run it against `&mut Daemon` without shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nonce/namespace/datagram-face housekeeping.
    Reap,
    /// Forwarding entry aging, every 5 seconds.
    AgeForwarding,
    /// Content store eviction pass.
    CleanContent,
    /// Interest expiry wheel for one PIT entry (by serial).
    Propagate(u32),
    /// Strategy wakeup for one PIT entry; the op is stored as evint.
    StrategyWakeup(u32),
    /// Drain one face content queue (faceid, delay class).
    ContentSender(u32, u8),
    /// Freshness expiry for one content accession.
    ExpireContent(u64),
    /// Push coalesced face notices.
    NoticePush,
    /// Let the internal client produce output.
    InternalClientDrain,
    /// Adjacency machinery, by faceid.
    AdjacencySolicit(u32),
    AdjacencyReset(u32),
    AdjacencyRefresh(u32),
    FlushGuidCob(u32),
}

/// Handle for a scheduled event; stale handles are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    id: u32,
    gen: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub action: Action,
    pub evint: u64,
    due_us: u64,
    gen: u32,
}

impl ScheduledEvent {
    pub fn due_us(&self) -> u64 {
        self.due_us
    }
}

/// Min-heap of timed events over absolute microseconds.
#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<(u64, u64, u32, u32)>>,
    events: HashMap<u32, ScheduledEvent>,
    next_id: u32,
    next_gen: u32,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Schedule `action` to fire `delay_us` after `now_us`.
    pub fn schedule(&mut self, now_us: u64, delay_us: u64, action: Action, evint: u64) -> EventHandle {
        let id = loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.events.contains_key(&id) {
                break id;
            }
        };
        self.next_gen = self.next_gen.wrapping_add(1);
        let gen = self.next_gen;
        let due_us = now_us + delay_us;
        self.events.insert(
            id,
            ScheduledEvent {
                action,
                evint,
                due_us,
                gen,
            },
        );
        self.seq += 1;
        self.heap.push(Reverse((due_us, self.seq, id, gen)));
        EventHandle { id, gen }
    }

    /// Remove the event; returns it so the owner can run cancel cleanup.
    pub fn cancel(&mut self, h: EventHandle) -> Option<ScheduledEvent> {
        match self.events.get(&h.id) {
            Some(ev) if ev.gen == h.gen => self.events.remove(&h.id),
            _ => None,
        }
        // the heap entry goes stale and is skipped on pop
    }

    /// Pop the next event due at or before `now_us`.
    pub fn pop_due(&mut self, now_us: u64) -> Option<(EventHandle, ScheduledEvent)> {
        loop {
            let &Reverse((due, _seq, id, gen)) = self.heap.peek()?;
            match self.events.get(&id) {
                Some(ev) if ev.gen == gen && ev.due_us == due => {
                    if due > now_us {
                        return None;
                    }
                    self.heap.pop();
                    let ev = self.events.remove(&id).expect("event present");
                    let gen = ev.gen;
                    return Some((EventHandle { id, gen }, ev));
                }
                _ => {
                    // cancelled or rescheduled; drop the stale heap entry
                    self.heap.pop();
                }
            }
        }
    }

    /// Put a popped event back, `delay_us` from now, keeping its handle.
    pub fn requeue(&mut self, h: EventHandle, mut ev: ScheduledEvent, now_us: u64, delay_us: u64) {
        ev.due_us = now_us + delay_us;
        ev.gen = h.gen;
        self.seq += 1;
        self.heap.push(Reverse((ev.due_us, self.seq, h.id, h.gen)));
        self.events.insert(h.id, ev);
    }

    /// Microseconds until the next live event, if any.
    pub fn next_delay_us(&mut self, now_us: u64) -> Option<u64> {
        loop {
            let &Reverse((due, _seq, id, gen)) = self.heap.peek()?;
            match self.events.get(&id) {
                Some(ev) if ev.gen == gen && ev.due_us == due => {
                    return Some(due.saturating_sub(now_us));
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_compare_is_antisymmetric_near_wrap() {
        let a = WrappedTime(u32::MAX - 5);
        let b = a.plus_ticks(10); // wraps past zero
        assert!(a.is_before(b));
        assert!(!b.is_before(a));
        assert_eq!(b.ticks_since(a), 10);
    }

    #[test]
    fn wrapped_compare_transitive_within_window() {
        let a = WrappedTime(0xFFFF_FF00);
        let b = a.plus_ticks(0x200);
        let c = b.plus_ticks(0x200);
        assert!(a.is_before(b));
        assert!(b.is_before(c));
        assert!(a.is_before(c));
    }

    #[test]
    fn plus_micros_rounds_up_to_ticks() {
        let t = WrappedTime(0);
        assert_eq!(t.plus_micros(1).0, 1);
        assert_eq!(t.plus_micros(MICROS_PER_TICK).0, 1);
        assert_eq!(t.plus_micros(MICROS_PER_TICK + 1).0, 2);
    }

    #[test]
    fn clock_accumulates_sliver() {
        let mut c = Clock::new();
        let t0 = c.wtnow();
        c.advance_micros(MICROS_PER_TICK / 2);
        assert_eq!(c.wtnow(), t0);
        c.advance_micros(MICROS_PER_TICK / 2);
        assert_eq!(c.wtnow(), t0.plus_ticks(1));
    }

    #[test]
    fn scheduler_fires_in_due_order() {
        let mut s = Scheduler::new();
        s.schedule(0, 300, Action::Reap, 0);
        s.schedule(0, 100, Action::NoticePush, 0);
        s.schedule(0, 200, Action::CleanContent, 0);
        let mut fired = Vec::new();
        while let Some((_, ev)) = s.pop_due(1_000) {
            fired.push(ev.action);
        }
        assert_eq!(
            fired,
            vec![Action::NoticePush, Action::CleanContent, Action::Reap]
        );
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let mut s = Scheduler::new();
        let h = s.schedule(0, 100, Action::Reap, 0);
        s.schedule(0, 200, Action::NoticePush, 0);
        assert!(s.cancel(h).is_some());
        assert!(s.cancel(h).is_none());
        let (_, ev) = s.pop_due(1_000).unwrap();
        assert_eq!(ev.action, Action::NoticePush);
        assert!(s.pop_due(1_000).is_none());
    }

    #[test]
    fn requeue_keeps_handle_alive() {
        let mut s = Scheduler::new();
        let h = s.schedule(0, 100, Action::Reap, 7);
        let (h2, ev) = s.pop_due(100).unwrap();
        assert_eq!(h, h2);
        s.requeue(h2, ev, 100, 50);
        assert!(s.pop_due(100).is_none());
        let (_, ev) = s.pop_due(150).unwrap();
        assert_eq!(ev.evint, 7);
        // and the original handle still cancels it once requeued again
        s.requeue(h, ev, 150, 50);
        assert!(s.cancel(h).is_some());
    }

    #[test]
    fn next_delay_skips_stale_entries() {
        let mut s = Scheduler::new();
        let h = s.schedule(0, 100, Action::Reap, 0);
        s.schedule(0, 500, Action::NoticePush, 0);
        s.cancel(h);
        assert_eq!(s.next_delay_us(0), Some(500));
    }

    #[test]
    fn events_not_due_stay_queued() {
        let mut s = Scheduler::new();
        s.schedule(0, 1_000, Action::Reap, 0);
        assert!(s.pop_due(999).is_none());
        assert!(s.pop_due(1_000).is_some());
    }
}
