//! Rate limiting for error reports.
//!
//! Flow exporters misbehave in floods: a router that loses its templates
//! will produce one `TemplateNotFound` per datagram at line rate. The muter
//! lets the first few reports of a window through and counts the rest.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding-window counter that throttles repeated error reports.
///
/// Within one `interval`, the first `threshold` calls to [`increment`]
/// return `(false, 0)` and should be reported. Later calls in the same
/// window return `(true, 0)` and should be suppressed. The first call after
/// the window has elapsed returns `(false, skipped)` where `skipped` is the
/// number of suppressed reports, and the window restarts.
///
/// [`increment`]: BatchMute::increment
#[derive(Debug)]
pub struct BatchMute {
    interval: Duration,
    threshold: u64,
    state: Mutex<MuteState>,
}

#[derive(Debug)]
struct MuteState {
    window_start: Option<Instant>,
    count: u64,
    skipped: u64,
}

impl BatchMute {
    pub fn new(interval: Duration, threshold: u64) -> Self {
        Self {
            interval,
            threshold,
            state: Mutex::new(MuteState {
                window_start: None,
                count: 0,
                skipped: 0,
            }),
        }
    }

    /// Records one error report. Returns `(muted, skipped)`.
    pub fn increment(&self) -> (bool, u64) {
        self.increment_at(Instant::now())
    }

    fn increment_at(&self, now: Instant) -> (bool, u64) {
        let mut state = self.state.lock();

        let expired = match state.window_start {
            Some(start) => now.duration_since(start) >= self.interval,
            None => true,
        };

        if expired {
            let skipped = state.skipped;
            state.window_start = Some(now);
            state.count = 1;
            state.skipped = 0;
            return (false, skipped);
        }

        state.count += 1;
        if state.count > self.threshold {
            state.skipped += 1;
            (true, 0)
        } else {
            (false, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_up_to_threshold_then_mutes() {
        let mute = BatchMute::new(Duration::from_secs(1), 3);
        let start = Instant::now();

        for i in 0..10u64 {
            let at = start + Duration::from_millis(i * 10);
            let (muted, skipped) = mute.increment_at(at);
            if i < 3 {
                assert_eq!((muted, skipped), (false, 0), "increment {i}");
            } else {
                assert_eq!((muted, skipped), (true, 0), "increment {i}");
            }
        }

        // First increment after the window reports what was skipped.
        let later = start + Duration::from_millis(1100);
        assert_eq!(mute.increment_at(later), (false, 7));

        // And the window has reset.
        assert_eq!(mute.increment_at(later + Duration::from_millis(1)), (false, 0));
        assert_eq!(mute.increment_at(later + Duration::from_millis(2)), (false, 0));
        assert_eq!(mute.increment_at(later + Duration::from_millis(3)), (true, 0));
    }

    #[test]
    fn idle_window_resets_cleanly() {
        let mute = BatchMute::new(Duration::from_millis(100), 2);
        let start = Instant::now();

        assert_eq!(mute.increment_at(start), (false, 0));
        assert_eq!(mute.increment_at(start + Duration::from_millis(10)), (false, 0));
        assert_eq!(mute.increment_at(start + Duration::from_millis(20)), (true, 0));

        // Nothing was muted in the new window, so skipped resets to zero
        // after being reported once.
        assert_eq!(mute.increment_at(start + Duration::from_millis(200)), (false, 1));
        assert_eq!(mute.increment_at(start + Duration::from_millis(400)), (false, 0));
    }

    #[test]
    fn threshold_counts_per_window() {
        let mute = BatchMute::new(Duration::from_millis(50), 1);
        let start = Instant::now();

        assert_eq!(mute.increment_at(start), (false, 0));
        assert_eq!(mute.increment_at(start + Duration::from_millis(1)), (true, 0));
        assert_eq!(mute.increment_at(start + Duration::from_millis(2)), (true, 0));
        assert_eq!(mute.increment_at(start + Duration::from_millis(60)), (false, 2));
    }
}
