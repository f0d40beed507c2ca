use chrono::{DateTime, TimeZone};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

const NEVER: i64 = i64::MIN;

/// Rate limiter for persisting blurry samples.
///
/// Holds the timestamp of the last permitted save as microseconds since the
/// Unix epoch. `try_acquire` is a single compare-and-update, so concurrent
/// sessions sharing one throttle through an `Arc` can never both acquire
/// inside the same interval.
#[derive(Debug)]
pub struct SaveThrottle {
    last_saved_us: AtomicI64,
    interval_us: i64,
}

impl SaveThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_saved_us: AtomicI64::new(NEVER),
            interval_us: i64::try_from(interval.as_micros()).unwrap_or(i64::MAX),
        }
    }

    /// Intervals too large for a `Duration` saturate; negative or NaN
    /// intervals mean no throttling.
    pub fn from_secs_f64(interval_secs: f64) -> Self {
        let interval = match Duration::try_from_secs_f64(interval_secs) {
            Ok(d) => d,
            Err(_) if interval_secs > 0.0 => Duration::MAX,
            Err(_) => Duration::ZERO,
        };
        Self::new(interval)
    }

    /// Returns `true` (and records `now`) when the detection is blurry and
    /// more than one interval has passed since the last permitted save.
    ///
    /// A `now` earlier than the last save counts as inside the interval.
    pub fn try_acquire<Tz: TimeZone>(&self, now: &DateTime<Tz>, is_blurry: bool) -> bool {
        if !is_blurry {
            return false;
        }
        let now_us = now.timestamp_micros();
        let acquired = self
            .last_saved_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                if last == NEVER || now_us.saturating_sub(last) > self.interval_us {
                    Some(now_us)
                } else {
                    None
                }
            })
            .is_ok();
        if !acquired {
            debug!(now_us, "save throttled");
        }
        acquired
    }

    /// Timestamp of the last permitted save in Unix microseconds, if any.
    pub fn last_saved_micros(&self) -> Option<i64> {
        match self.last_saved_us.load(Ordering::Acquire) {
            NEVER => None,
            us => Some(us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Local, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn throttle() -> SaveThrottle {
        SaveThrottle::new(Duration::from_secs(5))
    }

    #[test]
    fn first_blurry_save_is_immediate() {
        let t = throttle();
        assert_eq!(t.last_saved_micros(), None);
        assert!(t.try_acquire(&Utc::now(), true));
        assert!(t.last_saved_micros().is_some());
    }

    #[test]
    fn interval_sequence() {
        let t = throttle();
        let t0 = Local::now();
        assert!(t.try_acquire(&t0, true));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::seconds(1)), true));
        assert!(t.try_acquire(&(t0 + ChronoDuration::milliseconds(5010)), true));
    }

    #[test]
    fn exactly_one_interval_later_is_still_throttled() {
        let t = throttle();
        let t0 = Utc::now();
        assert!(t.try_acquire(&t0, true));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::seconds(5)), true));
        assert!(t.try_acquire(&(t0 + ChronoDuration::microseconds(5_000_001)), true));
    }

    #[test]
    fn clear_detection_never_acquires() {
        let t = throttle();
        let t0 = Utc::now();
        assert!(!t.try_acquire(&t0, false));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::hours(1)), false));
        assert_eq!(t.last_saved_micros(), None);
    }

    #[test]
    fn clock_going_backwards_is_throttled() {
        let t = throttle();
        let t0 = Utc::now();
        assert!(t.try_acquire(&t0, true));
        assert!(!t.try_acquire(&(t0 - ChronoDuration::minutes(10)), true));
    }

    #[test]
    fn failed_attempt_does_not_move_window() {
        let t = throttle();
        let t0 = Utc::now();
        assert!(t.try_acquire(&t0, true));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::seconds(4)), true));
        // Window is still anchored at t0, not t0+4.
        assert!(t.try_acquire(&(t0 + ChronoDuration::seconds(6)), true));
    }

    #[test]
    fn huge_interval_saturates_instead_of_panicking() {
        let t = SaveThrottle::from_secs_f64(1e20);
        let t0 = Utc::now();
        assert!(t.try_acquire(&t0, true));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::hours(1)), true));
        assert!(!t.try_acquire(&(t0 + ChronoDuration::days(365 * 100)), true));
    }

    #[test]
    fn non_positive_interval_never_throttles() {
        for secs in [-1.0, f64::NAN] {
            let t = SaveThrottle::from_secs_f64(secs);
            let t0 = Utc::now();
            assert!(t.try_acquire(&t0, true));
            assert!(t.try_acquire(&(t0 + ChronoDuration::microseconds(1)), true));
        }
    }

    #[test]
    fn concurrent_callers_acquire_once_per_window() {
        const THREADS: usize = 16;
        let t = Arc::new(throttle());
        let barrier = Arc::new(Barrier::new(THREADS));
        let wins = Arc::new(AtomicUsize::new(0));
        let t0 = Utc::now();

        std::thread::scope(|s| {
            for i in 0..THREADS {
                let t = Arc::clone(&t);
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                s.spawn(move || {
                    // All timestamps fall inside one 5s window.
                    let now = t0 + ChronoDuration::milliseconds((i as i64) * 250);
                    barrier.wait();
                    if t.try_acquire(&now, true) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
