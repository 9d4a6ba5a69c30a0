//! Delayed-action timer used for job retries, polling schedules, and event
//! handler dispatch.
//!
//! A timer holds an ordered list of delays. Each call to [`ActionTimer::next`]
//! consumes one delay and computes the wall-clock deadline for the next
//! attempt; when the list is exhausted `next` returns `None` and the caller
//! retires the action (or, with `no_exhaust`, keeps reusing the last delay as
//! polling schedules do).

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Identifies which retry slot on a task a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SubmissionRetry,
    ExecutionRetry,
}

#[derive(Debug, Clone)]
pub struct ActionTimer {
    delays: Vec<f64>,
    /// Number of trials consumed so far.
    pub num: usize,
    /// Delay (seconds) selected by the most recent `next` call.
    pub delay: Option<f64>,
    /// Wall-clock deadline for the next attempt, if one has been computed.
    pub timeout: Option<DateTime<Utc>>,
    /// True while an external command for this action is in flight.
    pub is_waiting: bool,
}

impl ActionTimer {
    pub fn new(delays: Vec<f64>) -> Self {
        Self {
            delays: if delays.is_empty() { vec![0.0] } else { delays },
            num: 0,
            delay: None,
            timeout: None,
            is_waiting: false,
        }
    }

    /// Replace the delay list, preserving the trial counter.
    pub fn set_delays(&mut self, delays: Vec<f64>) {
        self.delays = if delays.is_empty() { vec![0.0] } else { delays };
    }

    pub fn delays(&self) -> &[f64] {
        &self.delays
    }

    /// Consume the next delay and compute the deadline from `now`.
    ///
    /// Returns `None` when the delay list is exhausted, unless `no_exhaust`
    /// is set, in which case the last delay repeats forever.
    pub fn next(&mut self, now: DateTime<Utc>, no_exhaust: bool) -> Option<DateTime<Utc>> {
        let delay = match self.delays.get(self.num) {
            Some(delay) => *delay,
            None if no_exhaust => *self.delays.last()?,
            None => return None,
        };
        self.delay = Some(delay);
        let deadline = now + ChronoDuration::milliseconds((delay * 1000.0) as i64);
        self.timeout = Some(deadline);
        self.num += 1;
        Some(deadline)
    }

    /// True once `next` has computed a deadline for the current attempt.
    pub fn is_timeout_set(&self) -> bool {
        self.timeout.is_some()
    }

    /// True when the current deadline has passed (a timer with no deadline is
    /// never done).
    pub fn is_delay_done(&self, now: DateTime<Utc>) -> bool {
        match self.timeout {
            Some(timeout) => now >= timeout,
            None => false,
        }
    }

    pub fn set_waiting(&mut self) {
        self.delay = None;
        self.timeout = None;
        self.is_waiting = true;
    }

    pub fn unset_waiting(&mut self) {
        self.is_waiting = false;
    }

    /// Return to the initial state, keeping the delay list.
    pub fn reset(&mut self) {
        self.num = 0;
        self.delay = None;
        self.timeout = None;
        self.is_waiting = false;
    }

    /// Human-readable "delay (after deadline)" string for log lines.
    pub fn delay_timeout_as_str(&self) -> String {
        let delay = self.delay.unwrap_or(0.0);
        match self.timeout {
            Some(timeout) => format!("PT{}S (after {})", delay as i64, timeout.to_rfc3339()),
            None => format!("PT{}S", delay as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn consumes_delays_in_order_then_exhausts() {
        let mut timer = ActionTimer::new(vec![0.0, 60.0]);
        let now = t0();
        let first = timer.next(now, false).unwrap();
        assert_eq!(first, now);
        assert_eq!(timer.num, 1);
        let second = timer.next(now, false).unwrap();
        assert_eq!(second, now + ChronoDuration::seconds(60));
        assert_eq!(timer.num, 2);
        assert!(timer.next(now, false).is_none());
    }

    #[test]
    fn no_exhaust_repeats_last_delay() {
        let mut timer = ActionTimer::new(vec![30.0]);
        let now = t0();
        timer.next(now, true).unwrap();
        let again = timer.next(now, true).unwrap();
        assert_eq!(again, now + ChronoDuration::seconds(30));
        assert_eq!(timer.num, 2);
    }

    #[test]
    fn empty_delay_list_defaults_to_single_immediate_try() {
        let mut timer = ActionTimer::new(vec![]);
        let now = t0();
        assert_eq!(timer.next(now, false), Some(now));
        assert!(timer.next(now, false).is_none());
    }

    #[test]
    fn delay_done_only_after_deadline() {
        let mut timer = ActionTimer::new(vec![60.0]);
        let now = t0();
        assert!(!timer.is_delay_done(now));
        timer.next(now, false);
        assert!(!timer.is_delay_done(now + ChronoDuration::seconds(59)));
        assert!(timer.is_delay_done(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn reset_clears_trials_and_waiting() {
        let mut timer = ActionTimer::new(vec![0.0]);
        timer.next(t0(), false);
        timer.set_waiting();
        timer.reset();
        assert_eq!(timer.num, 0);
        assert!(!timer.is_waiting);
        assert!(timer.timeout.is_none());
    }

    #[test]
    fn set_waiting_clears_deadline() {
        let mut timer = ActionTimer::new(vec![5.0]);
        timer.next(t0(), false);
        timer.set_waiting();
        assert!(timer.is_waiting);
        assert!(!timer.is_timeout_set());
    }
}
