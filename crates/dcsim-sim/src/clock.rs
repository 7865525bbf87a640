//! Discrete virtual time.
//!
//! Time is a `u64` count of nanoseconds since the start of the run. It only
//! moves when the scheduler dispatches an event, and it never moves backward.
//! Configuration surfaces speak milliseconds as `f64`; the helpers here
//! convert at the boundary.

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Converts validated (finite, non-negative) milliseconds to nanoseconds.
pub fn ms_to_ns(ms: f64) -> u64 {
    debug_assert!(ms.is_finite() && ms >= 0.0, "ms_to_ns called with {ms}");
    (ms * NS_PER_MS as f64).round() as u64
}

/// Converts nanoseconds to fractional milliseconds for reporting.
pub fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / NS_PER_MS as f64
}

/// The simulation clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_ns: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.now_ns
    }

    /// Moves the clock to `time_ns`.
    ///
    /// # Panics
    ///
    /// Panics if `time_ns` is earlier than the current time; the scheduler
    /// never hands out such an event.
    pub fn advance_to(&mut self, time_ns: u64) {
        assert!(
            time_ns >= self.now_ns,
            "virtual time cannot go backward: {} -> {}",
            self.now_ns,
            time_ns
        );
        self.now_ns = time_ns;
    }
}
