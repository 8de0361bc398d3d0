//! Sliding window of request timestamps.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Timestamps of admitted requests for a single key, oldest first.
///
/// Not synchronized on its own; the owning limiter serializes access.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    records: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop records that fall at or before `now - window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        // A window longer than the clock's history keeps every record.
        let Some(window_start) = now.checked_sub(window) else {
            return;
        };

        while let Some(&oldest) = self.records.front() {
            if oldest > window_start {
                break;
            }
            self.records.pop_front();
        }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the window holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether another request fits under `limit`.
    pub fn has_capacity(&self, limit: u64) -> bool {
        (self.records.len() as u64) < limit
    }

    /// Record an admitted request.
    pub fn record(&mut self, now: Instant) {
        self.records.push_back(now);
    }

    /// The oldest record still in the window.
    pub fn oldest(&self) -> Option<Instant> {
        self.records.front().copied()
    }

    /// The most recent record.
    pub fn newest(&self) -> Option<Instant> {
        self.records.back().copied()
    }

    /// Whole seconds until the oldest record leaves the window, never less than 1.
    ///
    /// An empty window (only possible with a zero limit) reports the full window.
    pub fn cooldown_secs(&self, now: Instant, window: Duration) -> u64 {
        let remaining = match self.oldest() {
            Some(oldest) => window.saturating_sub(now.saturating_duration_since(oldest)),
            None => window,
        };

        (remaining.as_secs_f64().round() as u64).max(1)
    }

    /// Whether every record is older than `idle_after`.
    pub fn is_idle(&self, now: Instant, idle_after: Duration) -> bool {
        match self.newest() {
            Some(newest) => now.saturating_duration_since(newest) > idle_after,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: f64) -> Instant {
        base + Duration::from_secs_f64(secs)
    }

    #[test]
    fn test_record_and_capacity() {
        let base = Instant::now();
        let mut window = SlidingWindow::new();

        assert!(window.has_capacity(2));
        window.record(base);
        assert!(window.has_capacity(2));
        window.record(at(base, 1.0));
        assert!(!window.has_capacity(2));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_zero_limit_never_has_capacity() {
        let window = SlidingWindow::new();
        assert!(!window.has_capacity(0));
    }

    #[test]
    fn test_prune_drops_expired_records() {
        let base = Instant::now();
        let mut window = SlidingWindow::new();
        window.record(base);
        window.record(at(base, 5.0));

        window.prune(at(base, 9.0), Duration::from_secs(10));
        assert_eq!(window.len(), 2);

        // The boundary itself counts as expired
        window.prune(at(base, 10.0), Duration::from_secs(10));
        assert_eq!(window.len(), 1);
        assert_eq!(window.oldest(), Some(at(base, 5.0)));

        window.prune(at(base, 16.0), Duration::from_secs(10));
        assert!(window.is_empty());
    }

    #[test]
    fn test_cooldown_from_oldest_record() {
        let base = Instant::now();
        let mut window = SlidingWindow::new();
        window.record(at(base, 10.0));
        window.record(at(base, 20.0));

        let cooldown = window.cooldown_secs(at(base, 50.0), Duration::from_secs(60));
        assert_eq!(cooldown, 20);
    }

    #[test]
    fn test_cooldown_floor_is_one_second() {
        let base = Instant::now();
        let mut window = SlidingWindow::new();
        window.record(base);

        let cooldown = window.cooldown_secs(at(base, 59.9), Duration::from_secs(60));
        assert_eq!(cooldown, 1);
    }

    #[test]
    fn test_cooldown_empty_window_is_full_window() {
        let window = SlidingWindow::new();
        assert_eq!(window.cooldown_secs(Instant::now(), Duration::from_secs(45)), 45);
    }

    #[test]
    fn test_is_idle() {
        let base = Instant::now();
        let mut window = SlidingWindow::new();
        assert!(window.is_idle(base, Duration::from_secs(1)));

        window.record(base);
        assert!(!window.is_idle(at(base, 1.0), Duration::from_secs(5)));
        assert!(window.is_idle(at(base, 6.0), Duration::from_secs(5)));
    }
}
