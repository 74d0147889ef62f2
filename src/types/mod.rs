use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Standard gravity used for every m/s² <-> g conversion
pub const GRAVITY: f64 = 9.81; // m/s²

/// Host wall clock as fractional seconds since the Unix epoch
pub fn now_epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Epoch-seconds receipt stamps that never step backwards.
///
/// The wall clock is read once; later stamps add monotonic elapsed time,
/// so a host clock adjustment mid-run cannot reorder samples.
#[derive(Clone, Copy, Debug)]
pub struct ReceiptClock {
    wall_anchor: f64,
    mono_anchor: Instant,
}

impl ReceiptClock {
    pub fn start() -> Self {
        Self::anchored_at(now_epoch_secs())
    }

    pub fn anchored_at(wall_anchor: f64) -> Self {
        Self {
            wall_anchor,
            mono_anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.wall_anchor + self.mono_anchor.elapsed().as_secs_f64()
    }
}

/// One instantaneous IMU reading
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Device clock (milliseconds since boot) when the firmware reports it
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub device_time_ms: Option<u64>,
    // Accelerometer (m/s²)
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    // Gyroscope (rad/s)
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    // Magnetometer (µT)
    pub mx: f64,
    pub my: f64,
    pub mz: f64,
    // Orientation quaternion
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

impl MotionSample {
    /// Sample with identity orientation and zero gyro/mag readings
    pub fn from_accel(ax: f64, ay: f64, az: f64, timestamp: f64) -> Self {
        Self {
            timestamp,
            device_time_ms: None,
            ax,
            ay,
            az,
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
            mx: 0.0,
            my: 0.0,
            mz: 0.0,
            qw: 1.0,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
        }
    }

    /// ax² + ay² + az², never negative
    #[inline]
    pub fn accel_sq(&self) -> f64 {
        self.ax * self.ax + self.ay * self.ay + self.az * self.az
    }

    pub fn accel_magnitude(&self) -> f64 {
        self.accel_sq().sqrt()
    }

    pub fn g_force(&self) -> f64 {
        self.accel_magnitude() / GRAVITY
    }
}

/// Who is swinging which club
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub club_id: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, club_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            club_id: club_id.into(),
        }
    }
}

/// Physical club parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClubParams {
    /// Club length in meters
    pub club_length: f64,
    /// Club mass in kg
    pub club_mass: f64,
}

/// Session configuration and metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: String,
    pub user_id: String,
    pub club_id: String,
    pub club_length: f64,
    pub club_mass: f64,
    /// Face-normal vector [x, y, z] as supplied by the caller
    pub face_normal_calibration: Option<[f64; 3]>,
    /// Impact detection threshold in g
    pub impact_threshold: f64,
    pub session_start_time: DateTime<Utc>,
}

impl SessionConfig {
    /// The calibration scaled to unit length, `None` when absent or degenerate
    pub fn face_normal_unit(&self) -> Option<[f64; 3]> {
        self.face_normal_calibration.and_then(unit_vector)
    }
}

/// `raw` scaled to unit length; `None` for zero or non-finite vectors
pub fn unit_vector(raw: [f64; 3]) -> Option<[f64; 3]> {
    let v = Vector3::new(raw[0], raw[1], raw[2]);
    let norm = v.norm();
    if !norm.is_finite() || norm < 1e-9 {
        return None;
    }
    let unit = v / norm;
    Some([unit.x, unit.y, unit.z])
}

/// A completed swing, start marker through impact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwingRecord {
    pub swing_id: String,
    pub session_id: String,
    pub imu_data_points: Vec<MotionSample>,
    pub swing_start_time: f64,
    /// Impact time
    pub swing_end_time: f64,
    /// Seconds, end - start
    pub swing_duration: f64,
    /// Peak g-force at impact
    pub impact_g_force: f64,
    pub swing_type: String,
}

/// Timestamped audit tag ("impact", "swing_completed", ...)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwingEvent {
    pub event_id: String,
    pub session_id: String,
    pub event_type: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Running totals persisted alongside a session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub samples_processed: u64,
    pub samples_skipped: u64,
    pub store_failures: u64,
    pub impacts: u64,
    pub swings: u64,
}

/// Session-scoped record families in the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Singleton session configuration
    Config,
    /// Streaming sample ring buffer
    ImuBuffer,
    Swings,
    Events,
    Counters,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Config,
        RecordKind::ImuBuffer,
        RecordKind::Swings,
        RecordKind::Events,
        RecordKind::Counters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Config => "config",
            RecordKind::ImuBuffer => "imu_buffer",
            RecordKind::Swings => "swings",
            RecordKind::Events => "events",
            RecordKind::Counters => "counters",
        }
    }
}
