//! Wall-clock sources and round-epoch arithmetic
//!
//! Round identity is `floor(unix_millis / round_millis)`, so any process that
//! reads the clock agrees on the current round without a stored counter.

use crate::types::RoundIndex;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with the tokio timer, so paused-time tests see
/// round boundaries move exactly as `tokio::time::sleep` does.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor);
        let elapsed = ChronoDuration::from_std(elapsed).unwrap_or_else(|_| ChronoDuration::zero());
        self.anchor_wall + elapsed
    }
}

/// Manually driven clock for synchronous tests
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: ChronoDuration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }
}

/// Fixed-length round epochs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundClock {
    round_millis: i64,
}

impl RoundClock {
    pub fn new(round_seconds: u64) -> Self {
        let round_millis = i64::try_from(round_seconds.saturating_mul(1_000))
            .unwrap_or(i64::MAX)
            .max(1);
        Self { round_millis }
    }

    pub fn round_length(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.round_millis)
    }

    /// Round containing `at`. Times before the unix epoch map to round 0.
    pub fn round_index(&self, at: DateTime<Utc>) -> RoundIndex {
        let index = at.timestamp_millis().div_euclid(self.round_millis);
        u64::try_from(index).unwrap_or(0)
    }

    pub fn starts_at(&self, round: RoundIndex) -> DateTime<Utc> {
        let millis = i64::try_from(round)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.round_millis);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }

    /// Boundary at which the round is resolved and the next one opens
    pub fn closes_at(&self, round: RoundIndex) -> DateTime<Utc> {
        self.starts_at(round.saturating_add(1))
    }

    /// Moment bets stop being accepted
    pub fn locks_at(&self, round: RoundIndex, lock_seconds: u64) -> DateTime<Utc> {
        let lock = i64::try_from(lock_seconds).unwrap_or(i64::MAX);
        self.closes_at(round) - ChronoDuration::seconds(lock)
    }

    pub fn remaining(&self, at: DateTime<Utc>) -> ChronoDuration {
        self.closes_at(self.round_index(at)) - at
    }

    /// Whether `at` falls inside the lock window of its round
    pub fn is_locked(&self, at: DateTime<Utc>, lock_seconds: u64) -> bool {
        at >= self.locks_at(self.round_index(at), lock_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn test_round_index_is_epoch_division() {
        let rounds = RoundClock::new(60);
        assert_eq!(rounds.round_index(at_millis(0)), 0);
        assert_eq!(rounds.round_index(at_millis(59_999)), 0);
        assert_eq!(rounds.round_index(at_millis(60_000)), 1);
        assert_eq!(rounds.round_index(at_millis(1_700_000_000_000)), 28_333_333);
    }

    #[test]
    fn test_boundaries_and_lock_window() {
        let rounds = RoundClock::new(60);
        let round = 1_000;
        assert_eq!(rounds.starts_at(round), at_millis(60_000_000));
        assert_eq!(rounds.closes_at(round), at_millis(60_060_000));
        assert_eq!(rounds.locks_at(round, 5), at_millis(60_055_000));

        assert!(!rounds.is_locked(at_millis(60_054_999), 5));
        assert!(rounds.is_locked(at_millis(60_055_000), 5));
        assert_eq!(rounds.remaining(at_millis(60_030_000)), ChronoDuration::seconds(30));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(at_millis(1_000));
        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(clock.now(), at_millis(3_000));
        clock.set(at_millis(10));
        assert_eq!(clock.now(), at_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(at_millis(5_000));
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert_eq!(clock.now(), at_millis(66_000));
    }
}
