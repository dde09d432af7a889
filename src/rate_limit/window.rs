use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-log request window: at most `max_requests` admissions in any
/// rolling interval of length `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            admitted: VecDeque::with_capacity(max_requests as usize),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest + self.window <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long a request arriving at `now` must wait to stay under budget.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if self.admitted.len() < self.max_requests {
            return Duration::ZERO;
        }
        match self.admitted.front() {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Admit a request at `now`, or return the wait still required.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        let wait = self.wait_time(now);
        if wait.is_zero() {
            self.admitted.push_back(now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Admissions inside the window ending at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_budget_then_waits() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            assert!(w.try_admit(start).is_ok());
        }
        assert_eq!(w.try_admit(start), Err(Duration::from_secs(10)));
        assert_eq!(
            w.wait_time(start + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert!(w.try_admit(start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn old_admissions_slide_out() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(2, Duration::from_secs(5));
        w.try_admit(start).unwrap();
        w.try_admit(start + Duration::from_secs(3)).unwrap();
        assert_eq!(w.count(start + Duration::from_secs(4)), 2);
        assert_eq!(w.count(start + Duration::from_secs(5)), 1);
        assert_eq!(w.count(start + Duration::from_secs(8)), 0);
    }

    #[test]
    fn never_exceeds_budget_in_any_rolling_window() {
        let budget = 4;
        let window = Duration::from_millis(1000);
        let start = Instant::now();
        let mut w = SlidingWindow::new(budget, window);
        let mut admitted = Vec::new();

        // Deterministic pseudo-random arrival offsets.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut offset_ms = 0u64;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            offset_ms += seed % 120;
            let now = start + Duration::from_millis(offset_ms);
            if w.try_admit(now).is_ok() {
                admitted.push(now);
            }
        }

        assert!(admitted.len() > budget as usize);
        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[i..].iter().take_while(|&&u| u < t + window).count();
            assert!(in_window <= budget as usize, "window starting at admission {i} holds {in_window}");
        }
    }
}
