use serde::{Deserialize, Serialize};
use std::{
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

/// Battery sample built from an unsolicited charge push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Minutes since the first push of the session, rounded to the nearest minute
    pub elapsed_minutes: u32,
    /// Raw charge counter reported by the firmware
    pub charge: u32,
    /// Standard Battery Level reading taken right after the push, if available
    pub battery_percent: Option<u8>,
}

impl BatteryStatus {
    /// Elapsed time as `HH:MM`
    #[must_use]
    pub fn elapsed_label(&self) -> String {
        format!(
            "{:02}:{:02}",
            self.elapsed_minutes / 60,
            self.elapsed_minutes % 60
        )
    }
}

/// Tracks the wall-clock base for battery pushes within one session
#[derive(Debug, Default)]
pub struct BatteryTracker {
    first_push: Mutex<Option<SystemTime>>,
}

impl BatteryTracker {
    /// Create a tracker with no base
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the status for a push received at `now`
    ///
    /// The first push of the session becomes the elapsed-time base.
    pub fn record(&self, charge: u32, battery_percent: Option<u8>, now: SystemTime) -> BatteryStatus {
        let base = *self
            .first_push
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(now);

        let elapsed = now.duration_since(base).unwrap_or_default();
        // f64::round rounds half away from zero
        let minutes = (elapsed.as_secs_f64() / 60.0).round();

        BatteryStatus {
            elapsed_minutes: minutes_to_u32(minutes),
            charge,
            battery_percent,
        }
    }

    /// Forget the base; the next push starts from zero
    pub fn reset(&self) {
        *self
            .first_push
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn minutes_to_u32(minutes: f64) -> u32 {
    minutes.clamp(0.0, f64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_push_is_base() {
        let tracker = BatteryTracker::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let status = tracker.record(4_000, Some(87), t0);
        assert_eq!(status.elapsed_minutes, 0);
        assert_eq!(status.charge, 4_000);
        assert_eq!(status.battery_percent, Some(87));
        assert_eq!(status.elapsed_label(), "00:00");
    }

    #[test]
    fn test_elapsed_rounding() {
        let tracker = BatteryTracker::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        tracker.record(1, None, t0);

        assert_eq!(tracker.record(1, None, t0 + Duration::from_secs(59)).elapsed_minutes, 1);
        assert_eq!(tracker.record(1, None, t0 + Duration::from_secs(29)).elapsed_minutes, 0);
        assert_eq!(tracker.record(1, None, t0 + Duration::from_secs(30)).elapsed_minutes, 1);
        assert_eq!(tracker.record(1, None, t0 + Duration::from_secs(89)).elapsed_minutes, 1);

        let later = tracker.record(1, None, t0 + Duration::from_secs(125 * 60 + 10));
        assert_eq!(later.elapsed_minutes, 125);
        assert_eq!(later.elapsed_label(), "02:05");
    }

    #[test]
    fn test_clock_going_backwards_saturates() {
        let tracker = BatteryTracker::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        tracker.record(1, None, t0);

        let status = tracker.record(1, None, t0 - Duration::from_secs(120));
        assert_eq!(status.elapsed_minutes, 0);
    }

    #[test]
    fn test_reset() {
        let tracker = BatteryTracker::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        tracker.record(1, None, t0);
        tracker.reset();

        let status = tracker.record(1, None, t0 + Duration::from_secs(600));
        assert_eq!(status.elapsed_minutes, 0);
    }
}
