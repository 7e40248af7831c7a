//! Single-threaded scheduler with a swappable time source.
//!
//! Events are kept in a `BTreeMap` keyed by `(due, sequence)`: earlier
//! times run first, and events due at the same time run in the order they
//! were scheduled. A crank only runs events that were already queued when
//! it started, so a handler that reschedules itself "now" cannot spin.
//!
//! In [`ClockMode::Virtual`] time only moves when the owner calls
//! [`VirtualClock::advance_to`] or [`VirtualClock::advance_to_next`], which
//! makes timeouts and backoff reproducible. [`ClockMode::RealTime`] follows
//! the wall clock.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Time source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Time advances only when told to
    Virtual,
    /// Time follows the wall clock
    RealTime,
}

/// Handle to a scheduled event, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

/// Deterministic event queue plus clock
pub struct VirtualClock<E> {
    mode: ClockMode,
    virtual_now: Duration,
    started: Instant,
    /// Unix time (seconds) at clock time zero
    epoch_secs: u64,
    queue: BTreeMap<(Duration, u64), E>,
    due_of: BTreeMap<u64, Duration>,
    next_seq: u64,
}

impl<E> fmt::Debug for VirtualClock<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualClock")
            .field("mode", &self.mode)
            .field("now", &self.now())
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl<E> VirtualClock<E> {
    /// Virtual clock starting at unix time `epoch_secs`
    pub fn new_virtual(epoch_secs: u64) -> Self {
        Self::with_mode(ClockMode::Virtual, epoch_secs)
    }

    /// Wall-clock driven clock
    pub fn new_real_time() -> Self {
        let epoch = chrono::Utc::now().timestamp().max(0) as u64;
        Self::with_mode(ClockMode::RealTime, epoch)
    }

    fn with_mode(mode: ClockMode, epoch_secs: u64) -> Self {
        Self {
            mode,
            virtual_now: Duration::ZERO,
            started: Instant::now(),
            epoch_secs,
            queue: BTreeMap::new(),
            due_of: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Time source in use
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Time since the clock started
    pub fn now(&self) -> Duration {
        match self.mode {
            ClockMode::Virtual => self.virtual_now,
            ClockMode::RealTime => self.started.elapsed(),
        }
    }

    /// Current unix time in seconds
    pub fn system_time_secs(&self) -> u64 {
        self.epoch_secs + self.now().as_secs()
    }

    /// Schedule `event` at absolute clock time `due`
    pub fn schedule_at(&mut self, due: Duration, event: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), event);
        self.due_of.insert(seq, due);
        TimerHandle(seq)
    }

    /// Schedule `event` after `delay`
    pub fn schedule_after(&mut self, delay: Duration, event: E) -> TimerHandle {
        let due = self.now() + delay;
        self.schedule_at(due, event)
    }

    /// Cancel a scheduled event. Returns it if it had not run yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        let due = self.due_of.remove(&handle.0)?;
        self.queue.remove(&(due, handle.0))
    }

    /// True if the event behind `handle` is still queued
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.due_of.contains_key(&handle.0)
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Due time of the earliest queued event
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Marker for [`VirtualClock::pop_due_before`]: events scheduled after
    /// this point are left for the next crank.
    pub fn sequence_mark(&self) -> u64 {
        self.next_seq
    }

    /// Remove and return the earliest event that is due now and was
    /// scheduled before `mark`.
    pub fn pop_due_before(&mut self, mark: u64) -> Option<E> {
        let now = self.now();
        let key = self
            .queue
            .keys()
            .take_while(|(due, _)| *due <= now)
            .find(|(_, seq)| *seq < mark)
            .copied()?;
        self.due_of.remove(&key.1);
        self.queue.remove(&key)
    }

    /// Run every event due now through `handler`; returns how many ran.
    /// Zero means idle at the current time.
    pub fn crank<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, E),
    {
        let mark = self.sequence_mark();
        let mut count = 0;
        while let Some(event) = self.pop_due_before(mark) {
            handler(self, event);
            count += 1;
        }
        count
    }

    /// Move virtual time forward to `to`. Moving backwards is a no-op.
    pub fn advance_to(&mut self, to: Duration) -> Result<()> {
        if self.mode != ClockMode::Virtual {
            return Err(Error::Clock("cannot advance a real-time clock".to_string()));
        }
        if to > self.virtual_now {
            self.virtual_now = to;
        }
        Ok(())
    }

    /// Move virtual time forward by `delta`
    pub fn advance_by(&mut self, delta: Duration) -> Result<()> {
        let to = self.now() + delta;
        self.advance_to(to)
    }

    /// Jump to the next scheduled event. Returns false if nothing is queued.
    pub fn advance_to_next(&mut self) -> Result<bool> {
        match self.next_due() {
            Some(due) => {
                self.advance_to(due)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_crank_returns_zero() {
        let mut clock: VirtualClock<u32> = VirtualClock::new_virtual(0);
        assert_eq!(clock.crank(|_, _| {}), 0);
        assert_eq!(clock.crank(|_, _| {}), 0);

        clock.schedule_after(Duration::from_secs(1), 7);
        // not due yet
        assert_eq!(clock.crank(|_, _| {}), 0);
        clock.advance_to_next().unwrap();
        assert_eq!(clock.crank(|_, _| {}), 1);
        assert_eq!(clock.crank(|_, _| {}), 0);
    }

    #[test]
    fn test_same_time_runs_fifo() {
        let mut clock = VirtualClock::new_virtual(0);
        let t = Duration::from_millis(500);
        clock.schedule_at(t, "b");
        clock.schedule_at(t, "c");
        clock.schedule_at(Duration::from_millis(100), "a");
        clock.schedule_at(t, "d");
        clock.advance_to(t).unwrap();

        let mut seen = Vec::new();
        clock.crank(|_, e| seen.push(e));
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cancel() {
        let mut clock = VirtualClock::new_virtual(0);
        let h1 = clock.schedule_after(Duration::from_secs(1), 1);
        let h2 = clock.schedule_after(Duration::from_secs(1), 2);
        assert_eq!(clock.cancel(h1), Some(1));
        assert_eq!(clock.cancel(h1), None);
        assert!(!clock.is_pending(h1));
        assert!(clock.is_pending(h2));

        clock.advance_by(Duration::from_secs(5)).unwrap();
        let mut seen = Vec::new();
        clock.crank(|_, e| seen.push(e));
        assert_eq!(seen, vec![2]);
        assert_eq!(clock.cancel(h2), None);
    }

    #[test]
    fn test_events_scheduled_during_crank_wait() {
        let mut clock = VirtualClock::new_virtual(0);
        clock.schedule_after(Duration::ZERO, 0u32);
        let ran = clock.crank(|c, e| {
            c.schedule_after(Duration::ZERO, e + 1);
        });
        assert_eq!(ran, 1);
        assert_eq!(clock.pending(), 1);
        assert_eq!(clock.crank(|_, _| {}), 1);
    }

    #[test]
    fn test_advance_never_goes_back() {
        let mut clock: VirtualClock<()> = VirtualClock::new_virtual(1_000);
        clock.advance_to(Duration::from_secs(10)).unwrap();
        clock.advance_to(Duration::from_secs(3)).unwrap();
        assert_eq!(clock.now(), Duration::from_secs(10));
        assert_eq!(clock.system_time_secs(), 1_010);
        assert!(!clock.advance_to_next().unwrap());
    }

    #[test]
    fn test_real_time_cannot_advance() {
        let mut clock: VirtualClock<()> = VirtualClock::new_real_time();
        assert!(clock.advance_by(Duration::from_secs(1)).is_err());
        assert!(clock.system_time_secs() > 0);
    }
}
