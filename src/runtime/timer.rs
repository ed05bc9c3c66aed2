//! Deadline-based timers folded into the reactor's poll timeout.

use std::time::{Duration, Instant};

/// Fires every `period`, keeping cadence with the first deadline.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    period: Duration,
    next: Instant,
}

impl PeriodicTimer {
    /// Start a timer whose first deadline is one period after `now`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Consume the current deadline if it has passed.
    ///
    /// Returns `true` at most once per deadline. When the caller fell behind
    /// by more than a whole period the schedule restarts from `now` instead of
    /// firing once per missed period.
    pub fn fire(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        true
    }
}

/// One-shot deadline, possibly disarmed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Arm a deadline `delay` after `now`.
    ///
    /// A delay too large to represent as an `Instant` leaves it disarmed.
    pub fn after(now: Instant, delay: Option<Duration>) -> Self {
        Self(delay.and_then(|d| now.checked_add(d)))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.0.is_some_and(|at| now >= at)
    }
}

/// Time until the earliest of `deadlines`, or `None` to wait indefinitely.
pub fn poll_timeout<I>(now: Instant, deadlines: I) -> Option<Duration>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines
        .into_iter()
        .flatten()
        .min()
        .map(|at| at.saturating_duration_since(now))
}
