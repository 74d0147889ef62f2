use crate::types::{MotionSample, GRAVITY};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    /// Below threshold (or no sample seen yet)
    Idle,
    /// The most recent sample crossed the threshold
    ImpactDetected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpactEvent {
    pub timestamp: f64,
    pub g_force: f64,
    pub accel_magnitude: f64, // m/s²
}

/// Threshold impact detector, one comparison per sample.
///
/// The threshold is held in g and compared as `(threshold_g * GRAVITY)²`
/// against `ax² + ay² + az²` so both sides are squared m/s².
pub struct ImpactDetector {
    threshold_g: f64,
    threshold_sq: f64,
    state: DetectorState,
    impacts: u64,
}

impl ImpactDetector {
    pub fn new(threshold_g: f64) -> Self {
        let mut detector = Self {
            threshold_g: 0.0,
            threshold_sq: 0.0,
            state: DetectorState::Idle,
            impacts: 0,
        };
        detector.set_threshold(threshold_g);
        detector
    }

    pub fn set_threshold(&mut self, threshold_g: f64) {
        let threshold_ms2 = threshold_g * GRAVITY;
        self.threshold_g = threshold_g;
        self.threshold_sq = threshold_ms2 * threshold_ms2;
    }

    pub fn threshold_g(&self) -> f64 {
        self.threshold_g
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn impact_count(&self) -> u64 {
        self.impacts
    }

    /// Check one sample. No debounce: every sample at or above threshold yields an event.
    #[inline]
    pub fn observe(&mut self, sample: &MotionSample) -> Option<ImpactEvent> {
        let accel_sq = sample.accel_sq();
        if accel_sq < self.threshold_sq {
            self.state = DetectorState::Idle;
            return None;
        }

        // sqrt only on the (rare) impact path
        let accel_magnitude = accel_sq.sqrt();
        self.state = DetectorState::ImpactDetected;
        self.impacts += 1;
        Some(ImpactEvent {
            timestamp: sample.timestamp,
            g_force: accel_magnitude / GRAVITY,
            accel_magnitude,
        })
    }

    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.impacts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_at_g(g: f64, t: f64) -> MotionSample {
        MotionSample::from_accel(0.0, 0.0, g * GRAVITY, t)
    }

    #[test]
    fn test_below_threshold_never_fires() {
        let mut detector = ImpactDetector::new(30.0);
        for (i, g) in [0.0, 1.0, 10.0, 29.0, 29.999].iter().enumerate() {
            assert!(detector.observe(&sample_at_g(*g, i as f64)).is_none());
            assert_eq!(detector.state(), DetectorState::Idle);
        }
        assert_eq!(detector.impact_count(), 0);
    }

    #[test]
    fn test_threshold_is_scaled_to_ms2() {
        // 35 m/s² is ~3.6g: must not trip a 30g threshold
        let mut detector = ImpactDetector::new(30.0);
        let sample = MotionSample::from_accel(35.0, 0.0, 0.0, 0.0);
        assert!(detector.observe(&sample).is_none());
    }

    #[test]
    fn test_impact_reports_g_force() {
        let mut detector = ImpactDetector::new(30.0);
        let event = detector.observe(&sample_at_g(35.0, 12.5)).unwrap();
        assert_relative_eq!(event.g_force, 35.0, epsilon = 1e-9);
        assert_relative_eq!(event.accel_magnitude, 35.0 * GRAVITY, epsilon = 1e-9);
        assert_eq!(event.timestamp, 12.5);
        assert_eq!(detector.state(), DetectorState::ImpactDetected);
    }

    #[test]
    fn test_exact_threshold_fires() {
        let mut detector = ImpactDetector::new(30.0);
        assert!(detector.observe(&sample_at_g(30.0, 0.0)).is_some());
    }

    #[test]
    fn test_three_axis_magnitude() {
        let mut detector = ImpactDetector::new(5.0);
        // Each axis alone is below 5g, combined magnitude is ~5.2g
        let a = 3.0 * GRAVITY;
        let sample = MotionSample::from_accel(a, a, a, 0.0);
        let event = detector.observe(&sample).unwrap();
        assert_relative_eq!(event.g_force, (27.0f64).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_every_sample_above_threshold_emits() {
        let mut detector = ImpactDetector::new(30.0);
        let events: Vec<_> = (0..5)
            .filter_map(|i| detector.observe(&sample_at_g(40.0, i as f64)))
            .collect();
        assert_eq!(events.len(), 5);
        assert_eq!(detector.impact_count(), 5);

        detector.observe(&sample_at_g(1.0, 6.0));
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn test_threshold_update() {
        let mut detector = ImpactDetector::new(30.0);
        assert!(detector.observe(&sample_at_g(20.0, 0.0)).is_none());
        detector.set_threshold(15.0);
        assert_eq!(detector.threshold_g(), 15.0);
        assert!(detector.observe(&sample_at_g(20.0, 1.0)).is_some());
    }
}
