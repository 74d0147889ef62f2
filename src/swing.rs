use crate::decoder::DeviceSwing;
use crate::error::{GolfImuError, ImuResult};
use crate::store::{KeyParts, KvStore, SessionStore};
use crate::types::{MotionSample, RecordKind, SessionConfig, SwingRecord};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SWING_TYPE: &str = "full_swing";

/// Turns a bounded sample sequence into a persisted `SwingRecord`.
///
/// Boundaries are trusted: the first sample is the start marker and the
/// last one is the impact.
pub struct SwingAggregator {
    cap: usize,
}

impl SwingAggregator {
    /// `cap` bounds the stored swing list (most recent kept)
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1) }
    }

    pub fn assemble(
        &self,
        session_id: &str,
        samples: Vec<MotionSample>,
        impact_g_force: f64,
        swing_type: Option<&str>,
    ) -> ImuResult<SwingRecord> {
        let (start, end) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Err(GolfImuError::InvalidSwing("no samples".to_string())),
        };
        if samples.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
            return Err(GolfImuError::InvalidSwing(
                "samples are not in time order".to_string(),
            ));
        }
        if !impact_g_force.is_finite() || impact_g_force < 0.0 {
            return Err(GolfImuError::InvalidSwing(format!(
                "impact g-force {}",
                impact_g_force
            )));
        }

        Ok(SwingRecord {
            swing_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            imu_data_points: samples,
            swing_start_time: start,
            swing_end_time: end,
            swing_duration: end - start,
            impact_g_force,
            swing_type: swing_type.unwrap_or(DEFAULT_SWING_TYPE).to_string(),
        })
    }

    pub fn persist<S: KvStore>(
        &self,
        store: &mut SessionStore<S>,
        config: &SessionConfig,
        record: &SwingRecord,
    ) -> ImuResult<()> {
        store.append_capped(RecordKind::Swings, &KeyParts::from(config), record, self.cap)?;
        info!(
            "Stored swing {} ({} samples, {:.3}s, {:.1}g)",
            record.swing_id,
            record.imu_data_points.len(),
            record.swing_duration,
            record.impact_g_force
        );
        Ok(())
    }

    /// Assemble and persist in one step.
    pub fn aggregate<S: KvStore>(
        &self,
        store: &mut SessionStore<S>,
        config: &SessionConfig,
        samples: Vec<MotionSample>,
        impact_g_force: f64,
        swing_type: Option<&str>,
    ) -> ImuResult<SwingRecord> {
        let record = self.assemble(&config.session_id, samples, impact_g_force, swing_type)?;
        self.persist(store, config, &record)?;
        Ok(record)
    }

    /// Persist a swing the firmware already segmented.
    ///
    /// Missing impact g-force is taken as the peak over the samples; the
    /// device's swing id is kept when present. The record always belongs
    /// to `config`'s session.
    pub fn from_device_swing<S: KvStore>(
        &self,
        store: &mut SessionStore<S>,
        config: &SessionConfig,
        swing: DeviceSwing,
    ) -> ImuResult<SwingRecord> {
        let impact_g = swing
            .impact_g_force
            .unwrap_or_else(|| peak_g_force(&swing.samples));
        let mut record = self.assemble(
            &config.session_id,
            swing.samples,
            impact_g,
            swing.swing_type.as_deref(),
        )?;
        if let Some(id) = swing.swing_id {
            record.swing_id = id;
        }
        self.persist(store, config, &record)?;
        Ok(record)
    }
}

pub fn peak_g_force(samples: &[MotionSample]) -> f64 {
    samples
        .iter()
        .map(|s| s.accel_sq())
        .fold(0.0, f64::max)
        .sqrt()
        / crate::types::GRAVITY
}

/// Aggregates over a set of swings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwingStatistics {
    pub swing_count: usize,
    pub average_duration: f64,
    pub average_impact_g: f64,
    pub min_impact_g: f64,
    pub max_impact_g: f64,
    pub swing_types: Vec<String>,
}

impl SwingStatistics {
    pub fn from_swings(swings: &[SwingRecord]) -> Self {
        if swings.is_empty() {
            return Self::default();
        }

        let n = swings.len() as f64;
        let mut swing_types: Vec<String> = swings.iter().map(|s| s.swing_type.clone()).collect();
        swing_types.sort();
        swing_types.dedup();

        Self {
            swing_count: swings.len(),
            average_duration: swings.iter().map(|s| s.swing_duration).sum::<f64>() / n,
            average_impact_g: swings.iter().map(|s| s.impact_g_force).sum::<f64>() / n,
            min_impact_g: swings
                .iter()
                .map(|s| s.impact_g_force)
                .fold(f64::INFINITY, f64::min),
            max_impact_g: swings.iter().map(|s| s.impact_g_force).fold(0.0, f64::max),
            swing_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::GRAVITY;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn config() -> SessionConfig {
        SessionConfig {
            session_id: "s1".to_string(),
            user_id: "alice".to_string(),
            club_id: "iron7".to_string(),
            club_length: 0.94,
            club_mass: 0.26,
            face_normal_calibration: None,
            impact_threshold: 30.0,
            session_start_time: Utc::now(),
        }
    }

    fn samples(n: usize, start: f64, dt: f64) -> Vec<MotionSample> {
        (0..n)
            .map(|i| MotionSample::from_accel(0.0, 0.0, GRAVITY, start + i as f64 * dt))
            .collect()
    }

    #[test]
    fn test_assemble_derives_duration() {
        let aggregator = SwingAggregator::new(100);
        let record = aggregator
            .assemble("s1", samples(51, 10.0, 0.01), 35.0, None)
            .unwrap();
        assert_relative_eq!(record.swing_duration, 0.5, epsilon = 1e-9);
        assert_eq!(record.swing_start_time, 10.0);
        assert_eq!(record.swing_type, "full_swing");
        assert_eq!(record.imu_data_points.len(), 51);
        assert!(!record.swing_id.is_empty());
    }

    #[test]
    fn test_assemble_rejects_bad_input() {
        let aggregator = SwingAggregator::new(100);
        assert!(matches!(
            aggregator.assemble("s1", Vec::new(), 35.0, None),
            Err(GolfImuError::InvalidSwing(_))
        ));

        let mut reversed = samples(3, 0.0, 1.0);
        reversed.reverse();
        assert!(aggregator.assemble("s1", reversed, 35.0, None).is_err());
        assert!(aggregator
            .assemble("s1", samples(3, 0.0, 1.0), -1.0, None)
            .is_err());
    }

    #[test]
    fn test_single_sample_swing_has_zero_duration() {
        let aggregator = SwingAggregator::new(100);
        let record = aggregator
            .assemble("s1", samples(1, 4.0, 0.0), 31.0, Some("putt"))
            .unwrap();
        assert_eq!(record.swing_duration, 0.0);
        assert_eq!(record.swing_type, "putt");
    }

    #[test]
    fn test_aggregate_respects_cap() {
        let kv = MemoryStore::new();
        let mut store = SessionStore::new(kv);
        let cfg = config();
        let aggregator = SwingAggregator::new(3);

        let mut ids = Vec::new();
        for i in 0..5 {
            let record = aggregator
                .aggregate(&mut store, &cfg, samples(5, i as f64, 0.1), 30.0 + i as f64, None)
                .unwrap();
            ids.push(record.swing_id);
        }

        let stored: Vec<SwingRecord> = store
            .list_recent(RecordKind::Swings, &KeyParts::from(&cfg), 10)
            .unwrap();
        let stored_ids: Vec<String> = stored.into_iter().map(|s| s.swing_id).collect();
        assert_eq!(stored_ids, ids[2..].to_vec());
    }

    #[test]
    fn test_device_swing_keeps_id_and_computes_peak() {
        let mut store = SessionStore::new(MemoryStore::new());
        let cfg = config();
        let mut points = samples(4, 0.0, 0.25);
        points[2] = MotionSample::from_accel(0.0, 0.0, 40.0 * GRAVITY, 0.5);

        let swing = DeviceSwing {
            swing_id: Some("dev-1".to_string()),
            session_id: Some("someone-else".to_string()),
            samples: points,
            impact_g_force: None,
            swing_type: None,
        };
        let record = SwingAggregator::new(100)
            .from_device_swing(&mut store, &cfg, swing)
            .unwrap();

        assert_eq!(record.swing_id, "dev-1");
        assert_eq!(record.session_id, "s1");
        assert_relative_eq!(record.impact_g_force, 40.0, epsilon = 1e-9);
        assert_relative_eq!(record.swing_duration, 0.75, epsilon = 1e-9);
    }

    #[test]
    fn test_statistics() {
        let aggregator = SwingAggregator::new(100);
        let swings = vec![
            aggregator
                .assemble("s1", samples(11, 0.0, 0.1), 30.0, None)
                .unwrap(),
            aggregator
                .assemble("s1", samples(21, 0.0, 0.1), 40.0, Some("chip"))
                .unwrap(),
        ];
        let stats = SwingStatistics::from_swings(&swings);
        assert_eq!(stats.swing_count, 2);
        assert_relative_eq!(stats.average_duration, 1.5, epsilon = 1e-9);
        assert_relative_eq!(stats.average_impact_g, 35.0);
        assert_eq!(stats.min_impact_g, 30.0);
        assert_eq!(stats.max_impact_g, 40.0);
        assert_eq!(stats.swing_types, vec!["chip", "full_swing"]);

        assert_eq!(SwingStatistics::from_swings(&[]).swing_count, 0);
    }
}
