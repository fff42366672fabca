use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::pipeline::error::WindowError;
use crate::pipeline::sample::{align_down_ms, from_millis, Window};

/// Wall clock that turns a reference instant into bucket-aligned windows.
///
/// The reference is fixed at construction so every table reduced in one
/// invocation shares the same window end.
#[derive(Debug, Clone, Copy)]
pub struct WindowClock {
    end: DateTime<Utc>,
}

impl WindowClock {
    /// Create a clock anchored at `reference`, or at the current time.
    pub fn new(reference: Option<DateTime<Utc>>, bucket_width: Duration) -> Result<Self> {
        let width_ms = bucket_width.as_millis();
        if width_ms == 0 {
            bail!("bucket_width must be > 0");
        }

        let width_ms = i64::try_from(width_ms).unwrap_or(i64::MAX);
        let reference = reference.unwrap_or_else(Utc::now);
        let end = from_millis(align_down_ms(reference.timestamp_millis(), width_ms));

        debug!(%reference, %end, "window clock anchored");

        Ok(Self { end })
    }

    /// Return the aligned end shared by every window of this clock.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Return the `[end - length, end)` window.
    pub fn window(&self, length: Duration) -> Result<Window, WindowError> {
        let length = chrono::Duration::from_std(length).unwrap_or(chrono::Duration::zero());
        let start = self
            .end
            .checked_sub_signed(length)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Window::new(start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn test_end_aligned_down_to_bucket() {
        let clock = WindowClock::new(
            Some(ts("2024-03-08T12:34:56Z")),
            Duration::from_secs(600),
        )
        .expect("valid params");
        assert_eq!(clock.end(), ts("2024-03-08T12:30:00Z"));
    }

    #[test]
    fn test_already_aligned_reference_is_kept() {
        let clock = WindowClock::new(Some(ts("2024-03-08T12:30:00Z")), Duration::from_secs(600))
            .expect("valid params");
        assert_eq!(clock.end(), ts("2024-03-08T12:30:00Z"));
    }

    #[test]
    fn test_window_spans_length_before_end() {
        let clock = WindowClock::new(Some(ts("2024-03-08T00:05:00Z")), Duration::from_secs(600))
            .expect("valid params");
        let window = clock
            .window(Duration::from_secs(7 * 86_400))
            .expect("window");
        assert_eq!(window.start, ts("2024-03-01T00:00:00Z"));
        assert_eq!(window.end, ts("2024-03-08T00:00:00Z"));
    }

    #[test]
    fn test_zero_length_window_rejected() {
        let clock = WindowClock::new(Some(ts("2024-03-08T00:00:00Z")), Duration::from_secs(600))
            .expect("valid params");
        assert!(matches!(
            clock.window(Duration::ZERO),
            Err(WindowError::Empty { .. })
        ));
    }

    #[test]
    fn test_clock_new_rejects_zero_width() {
        let result = WindowClock::new(None, Duration::ZERO);
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("bucket_width"));
    }

    #[test]
    fn test_default_reference_is_now() {
        let before = Utc::now();
        let clock = WindowClock::new(None, Duration::from_secs(60)).expect("valid params");
        assert!(clock.end() <= before + chrono::Duration::seconds(1));
        assert!(clock.end() > before - chrono::Duration::seconds(61));
    }
}
