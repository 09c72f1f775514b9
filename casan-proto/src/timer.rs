//! Time handling: the 64-bit clock and the two association timers
//!
//! The engine never reads wall-clock time itself; the application samples its
//! platform timer and feeds it in. Hardware counters are commonly 32 bits of
//! milliseconds and wrap after about 50 days, so [`Clock`] widens them into a
//! monotonic 64-bit timeline.

use std::ops::{Add, AddAssign, Sub};

/// A point on the engine's monotonic millisecond timeline
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The origin of the timeline
    pub const ZERO: Self = Self(0);

    /// Construct from a millisecond count
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the origin
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds since `earlier`, or 0 when `earlier` is not earlier
    pub const fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u64> for Timestamp {
    type Output = Self;

    fn add(self, millis: u64) -> Self {
        Self(self.0 + millis)
    }
}

impl AddAssign<u64> for Timestamp {
    fn add_assign(&mut self, millis: u64) {
        self.0 += millis;
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, earlier: Self) -> u64 {
        self.0 - earlier.0
    }
}

/// Widens a wrapping 32-bit millisecond counter into [`Timestamp`]s
///
/// Requires being synced at least once per counter period (about 49.7 days)
/// to observe every rollover.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    epoch: u32,
    last: u32,
}

impl Clock {
    /// A clock at the origin
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current counter value and get the widened timestamp
    pub fn sync(&mut self, millis: u32) -> Timestamp {
        if millis < self.last {
            // counter wrapped since the previous sync
            self.epoch += 1;
        }
        self.last = millis;
        self.now()
    }

    /// The timestamp as of the last [`sync`](Self::sync)
    pub fn now(&self) -> Timestamp {
        Timestamp((u64::from(self.epoch) << 32) | u64::from(self.last))
    }
}

/// First interval between discovery broadcasts
const DISCOVERY_INITIAL: u64 = 500;
/// Additive increase applied after each broadcast
const DISCOVERY_INCREMENT: u64 = 1_000;
/// Ceiling on the interval between broadcasts
const DISCOVERY_INTERVAL_MAX: u64 = 10_000;
/// Give up waiting for the current master after this long
const DISCOVERY_LIMIT: u64 = 30_000;
/// Floor on the interval between renewal probes
const RENEWAL_MIN_INTERVAL: u64 = 500;

/// Paces discovery broadcasts while no association is in force
///
/// Fires at 500 ms, then backs off additively by 1 s per firing up to a 10 s
/// ceiling. Independently of the firings, the timer as a whole expires after
/// 30 s, signalling that a previously known master should be forgotten.
#[derive(Debug, Clone)]
pub struct DiscoveryTimer {
    next: Timestamp,
    limit: Timestamp,
    increment: u64,
}

impl DiscoveryTimer {
    /// Start (or restart) the schedule from `now`
    pub fn start(now: Timestamp) -> Self {
        Self {
            next: now + DISCOVERY_INITIAL,
            limit: now + DISCOVERY_LIMIT,
            increment: DISCOVERY_INITIAL,
        }
    }

    /// Whether a broadcast is due; advances the schedule when it is
    pub fn due(&mut self, now: Timestamp) -> bool {
        if now < self.next {
            return false;
        }
        self.increment = (self.increment + DISCOVERY_INCREMENT).min(DISCOVERY_INTERVAL_MAX);
        self.next += self.increment;
        true
    }

    /// Whether the whole schedule has run out
    pub fn expired(&self, now: Timestamp) -> bool {
        now >= self.limit
    }
}

/// Paces renewal probes while an association is in force
///
/// Starts probing halfway through the association TTL and halves the
/// interval after each probe, down to a 500 ms floor. Expires when the TTL
/// itself runs out.
#[derive(Debug, Clone)]
pub struct RenewalTimer {
    next: Timestamp,
    limit: Timestamp,
    increment: u64,
}

impl RenewalTimer {
    /// Start the schedule from `now` for an association lasting `ttl` ms
    pub fn start(now: Timestamp, ttl: u64) -> Self {
        let increment = ttl / 2;
        Self {
            next: now + increment,
            limit: now + ttl,
            increment,
        }
    }

    /// Whether a probe is due; advances the schedule when it is
    pub fn due(&mut self, now: Timestamp) -> bool {
        if now < self.next {
            return false;
        }
        self.increment = (self.increment / 2).max(RENEWAL_MIN_INTERVAL);
        self.next += self.increment;
        true
    }

    /// Whether the association TTL has run out
    pub fn expired(&self, now: Timestamp) -> bool {
        now >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_widens_rollover() {
        let mut clock = Clock::new();
        assert_eq!(clock.sync(1_000), Timestamp::from_millis(1_000));
        assert_eq!(clock.sync(u32::MAX), Timestamp::from_millis(u64::from(u32::MAX)));
        // counter wraps to a small value
        let after = clock.sync(5);
        assert_eq!(after, Timestamp::from_millis((1 << 32) + 5));
        assert!(after > Timestamp::from_millis(u64::from(u32::MAX)));
    }

    #[test]
    fn clock_now_is_stable() {
        let mut clock = Clock::new();
        clock.sync(42);
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now(), Timestamp::from_millis(42));
    }

    #[test]
    fn discovery_backoff_is_additive_and_capped() {
        let t0 = Timestamp::from_millis(10_000);
        let mut timer = DiscoveryTimer::start(t0);
        assert!(!timer.due(t0));
        assert!(!timer.due(t0 + 499));

        // firing times follow 500, then +1500, +2500, ... capped at +10000
        let mut now = t0 + DISCOVERY_INITIAL;
        let mut intervals = Vec::new();
        for _ in 0..8 {
            assert!(timer.due(now));
            assert!(!timer.due(now));
            let prev = now;
            now = prev + timer.increment;
            intervals.push(now - prev);
        }
        assert_eq!(
            intervals,
            [1_500, 2_500, 3_500, 4_500, 5_500, 6_500, 7_500, 8_500]
        );
        for _ in 0..4 {
            assert!(timer.due(now));
            now = now + timer.increment;
        }
        assert_eq!(timer.increment, DISCOVERY_INTERVAL_MAX);
    }

    #[test]
    fn discovery_expires_independently() {
        let t0 = Timestamp::ZERO;
        let timer = DiscoveryTimer::start(t0);
        assert!(!timer.expired(t0 + (DISCOVERY_LIMIT - 1)));
        assert!(timer.expired(t0 + DISCOVERY_LIMIT));
    }

    #[test]
    fn renewal_halves_with_floor() {
        let t0 = Timestamp::ZERO;
        let ttl = 8_000;
        let mut timer = RenewalTimer::start(t0, ttl);
        assert!(!timer.due(t0 + 3_999));
        assert!(timer.due(t0 + 4_000));
        // 4000 -> 2000 -> 1000 -> 500 -> 500 ...
        assert_eq!(timer.increment, 2_000);
        assert!(timer.due(t0 + 6_000));
        assert_eq!(timer.increment, 1_000);
        assert!(timer.due(t0 + 7_000));
        assert_eq!(timer.increment, 500);
        assert!(timer.due(t0 + 7_500));
        assert_eq!(timer.increment, RENEWAL_MIN_INTERVAL);
        assert!(!timer.expired(t0 + 7_999));
        assert!(timer.expired(t0 + ttl));
    }
}
