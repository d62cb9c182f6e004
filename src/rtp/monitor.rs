use std::collections::VecDeque;

const HISTORY: usize = 8;

/// Stream quality estimator: turns periodic loss samples into a 0..=10
/// score.
///
/// The score chases a target derived from the recent loss average. Going
/// down it halves the distance on every sample, going up it climbs a single
/// point at a time, so a burst of loss is reflected immediately while
/// recovery has to prove itself.
#[derive(Debug)]
pub struct RtpMonitor {
    samples: VecDeque<u8>,
    score: u8,
}

impl Default for RtpMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpMonitor {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(HISTORY),
            score: 10,
        }
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    /// Feed a loss sample in Q.8 (`fraction_lost`, 0..=255). Returns the new
    /// score if it changed.
    pub fn add_sample(&mut self, fraction_lost: u8) -> Option<u8> {
        if self.samples.len() == HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(fraction_lost);

        let sum: u32 = self.samples.iter().map(|&s| s as u32).sum();
        let avg_loss_pct = (sum / self.samples.len() as u32) * 100 / 256;
        let target = 10u8.saturating_sub(((avg_loss_pct + 5) / 10) as u8);

        let previous = self.score;
        if target < self.score {
            self.score -= (self.score - target).div_ceil(2);
        } else if target > self.score {
            self.score += 1;
        }

        if self.score != previous {
            Some(self.score)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod monitor_test {
    use super::*;

    #[test]
    fn test_initial_score_is_ten() {
        assert_eq!(RtpMonitor::new().score(), 10);
    }

    #[test]
    fn test_no_loss_keeps_score() {
        let mut monitor = RtpMonitor::new();
        for _ in 0..20 {
            assert_eq!(monitor.add_sample(0), None);
        }
        assert_eq!(monitor.score(), 10);
    }

    #[test]
    fn test_total_loss_drops_fast() {
        let mut monitor = RtpMonitor::new();
        monitor.add_sample(255);
        let after_one = monitor.score();
        assert!(after_one < 10);

        for _ in 0..7 {
            monitor.add_sample(255);
        }
        assert_eq!(monitor.score(), 0);
    }

    #[test]
    fn test_recovery_is_slow() {
        let mut monitor = RtpMonitor::new();
        for _ in 0..8 {
            monitor.add_sample(255);
        }
        assert_eq!(monitor.score(), 0);

        // one clean sample must not jump the score back up
        monitor.add_sample(0);
        assert!(monitor.score() <= 1);

        for _ in 0..30 {
            monitor.add_sample(0);
        }
        assert_eq!(monitor.score(), 10);
    }
}
