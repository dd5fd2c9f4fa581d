use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Millisecond wall clock truncated to 32 bits. Used as the age stamp on datagrams; comparisons
/// only ever happen between stamps produced by the same peer, so the 49 day wrap is tolerable.
#[inline]
pub fn clock_ms() -> u32 {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis();

    millis as u32
}

/// Millisecond deadline timer backing every blocking wait.
#[derive(Debug, Copy, Clone)]
pub struct Timer {
    start: Instant,
    limit: Duration,
}

impl Timer {
    #[inline]
    pub fn new(limit_ms: u64) -> Timer {
        Timer {
            start: Instant::now(),
            limit: Duration::from_millis(limit_ms),
        }
    }

    /// Returns true once the limit has elapsed.
    #[inline]
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.limit
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before expiry, zero once expired.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.limit.checked_sub(self.start.elapsed()).unwrap_or(Duration::from_millis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_expiry() {
        let timer = Timer::new(0);
        assert!(timer.expired());
        assert_eq!(timer.remaining(), Duration::from_millis(0));

        let timer = Timer::new(60_000);
        assert!(!timer.expired());
        assert!(timer.remaining() > Duration::from_millis(59_000));
    }
}
