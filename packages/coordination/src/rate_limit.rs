// ABOUTME: Fixed-window rate counter arithmetic shared by every store backend
// ABOUTME: Windows are aligned to multiples of their length so all instances agree on boundaries

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the current window ends.
    pub reset_at_ms: i64,
}

/// Start and end (exclusive) of the window containing `now_ms`.
pub fn fixed_window(now_ms: i64, window_secs: u64) -> (i64, i64) {
    let window_ms = (window_secs.max(1) * 1000) as i64;
    let start = now_ms.div_euclid(window_ms) * window_ms;
    (start, start + window_ms)
}

impl RateLimitDecision {
    /// Decision for the `count`-th request of a window.
    pub fn from_count(count: u64, limit: u32, reset_at_ms: i64) -> Self {
        Self {
            allowed: count <= u64::from(limit),
            limit,
            remaining: u64::from(limit).saturating_sub(count) as u32,
            reset_at_ms,
        }
    }

    /// Nominal decision used when the store cannot be consulted.
    pub fn fail_open(limit: u32, now_ms: i64, window_secs: u64) -> Self {
        let (_, reset_at_ms) = fixed_window(now_ms, window_secs);
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at_ms,
        }
    }

    /// Whole seconds until the window resets, never less than one.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let remaining_ms = (self.reset_at_ms - now_ms).max(0) as u64;
        remaining_ms.div_ceil(1000).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_align_to_their_length() {
        assert_eq!(fixed_window(0, 60), (0, 60_000));
        assert_eq!(fixed_window(59_999, 60), (0, 60_000));
        assert_eq!(fixed_window(60_000, 60), (60_000, 120_000));
        assert_eq!(fixed_window(125_500, 60), (120_000, 180_000));
    }

    #[test]
    fn remaining_never_underflows() {
        let d = RateLimitDecision::from_count(7, 5, 60_000);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);

        let d = RateLimitDecision::from_count(5, 5, 60_000);
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn retry_after_is_floored_at_one_second() {
        let d = RateLimitDecision::from_count(6, 5, 60_000);
        assert_eq!(d.retry_after_secs(59_999), 1);
        assert_eq!(d.retry_after_secs(61_000), 1);
        assert_eq!(d.retry_after_secs(30_000), 30);
        assert_eq!(d.retry_after_secs(29_500), 31);
    }

    #[test]
    fn fail_open_reports_nominal_limit() {
        let d = RateLimitDecision::fail_open(120, 10_000, 60);
        assert!(d.allowed);
        assert_eq!(d.remaining, 120);
        assert_eq!(d.reset_at_ms, 60_000);
    }
}
