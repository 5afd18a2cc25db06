//! Round-trip estimation from `ping` / `pong` pairs.

use crate::core::config::RTT_SMOOTHING;

/// Exponentially weighted round-trip estimate, seconds.
#[derive(Debug, Default, Clone)]
pub struct LatencyEstimator {
    rtt: Option<f64>,
}

impl LatencyEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample: the `sentAt` echoed back and the local receive time,
    /// both in seconds of the same local clock. Negative samples are ignored.
    pub fn on_pong(&mut self, sent_at: f64, now: f64) -> Option<f64> {
        let sample = now - sent_at;
        if !sample.is_finite() || sample < 0.0 {
            return self.rtt;
        }
        self.rtt = Some(match self.rtt {
            Some(rtt) => rtt + RTT_SMOOTHING * (sample - rtt),
            None => sample,
        });
        self.rtt
    }

    pub fn rtt(&self) -> Option<f64> {
        self.rtt
    }

    /// One-way delay estimate used as the automatic sync offset.
    pub fn one_way(&self) -> f64 {
        self.rtt.map_or(0.0, |r| r / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooths_samples() {
        let mut est = LatencyEstimator::new();
        assert_eq!(est.one_way(), 0.0);
        let first = est.on_pong(1.0, 1.2).unwrap();
        assert!((first - 0.2).abs() < 1e-9);
        let rtt = est.on_pong(2.0, 2.6).unwrap();
        assert!((rtt - 0.3).abs() < 1e-9);
        assert!((est.one_way() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn ignores_clock_going_backwards() {
        let mut est = LatencyEstimator::new();
        est.on_pong(1.0, 1.1);
        let before = est.rtt();
        assert_eq!(est.on_pong(5.0, 4.0), before);
    }
}
