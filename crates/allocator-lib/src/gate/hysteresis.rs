//! Over-threshold hysteresis for one region

use crate::config::GateConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hysteresis {
    over_threshold: bool,
    over_streak: u32,
    under_streak: u32,
}

impl Hysteresis {
    pub fn is_over_threshold(&self) -> bool {
        self.over_threshold
    }

    /// Feed one snapshot's draw; returns the new mode if it changed.
    ///
    /// Entering needs `enter_count` consecutive draws above `threshold`;
    /// leaving needs `exit_count` consecutive draws below
    /// `reset_ratio * threshold`. Any other draw breaks the streak.
    pub fn observe(&mut self, power_draw: f64, threshold: f64, config: &GateConfig) -> Option<bool> {
        if self.over_threshold {
            if power_draw < threshold * config.reset_ratio {
                self.under_streak += 1;
            } else {
                self.under_streak = 0;
            }
            if self.under_streak >= config.exit_count {
                self.over_threshold = false;
                self.under_streak = 0;
                self.over_streak = 0;
                return Some(false);
            }
        } else {
            if power_draw > threshold {
                self.over_streak += 1;
            } else {
                self.over_streak = 0;
            }
            if self.over_streak >= config.enter_count {
                self.over_threshold = true;
                self.over_streak = 0;
                self.under_streak = 0;
                return Some(true);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(h: &mut Hysteresis, draws: &[f64]) -> Vec<Option<bool>> {
        let config = GateConfig::default();
        draws.iter().map(|d| h.observe(*d, 1000.0, &config)).collect()
    }

    #[test]
    fn test_enter_needs_exactly_k_consecutive() {
        let mut h = Hysteresis::default();
        feed(&mut h, &[1200.0, 1200.0]);
        assert!(!h.is_over_threshold(), "K-1 snapshots must not trigger");
        assert_eq!(feed(&mut h, &[1200.0]), vec![Some(true)]);
        assert!(h.is_over_threshold());
    }

    #[test]
    fn test_interrupted_streak_restarts() {
        let mut h = Hysteresis::default();
        feed(&mut h, &[1200.0, 1200.0, 900.0, 1200.0, 1200.0]);
        assert!(!h.is_over_threshold());
    }

    #[test]
    fn test_exit_needs_m_below_reset_limit() {
        let mut h = Hysteresis::default();
        feed(&mut h, &[1200.0, 1200.0, 1200.0]);

        // below threshold but above the 90% reset limit keeps the mode
        feed(&mut h, &[950.0, 950.0, 950.0]);
        assert!(h.is_over_threshold());

        feed(&mut h, &[800.0]);
        assert!(h.is_over_threshold(), "M-1 snapshots must not exit");
        assert_eq!(feed(&mut h, &[800.0]), vec![Some(false)]);
        assert!(!h.is_over_threshold());
    }

    #[test]
    fn test_noise_between_limits_does_not_flap() {
        let mut h = Hysteresis::default();
        let changes = feed(&mut h, &[1010.0, 990.0, 1010.0, 990.0, 1010.0, 990.0]);
        assert!(changes.iter().all(|c| c.is_none()));
    }
}
