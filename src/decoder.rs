//! Line decoder for the device wire format.
//!
//! Each data line is a flat JSON object:
//! `{"t":1234,"ax":..,"ay":..,"az":..,"gx":..,"gy":..,"gz":..,"mx":..,"my":..,"mz":..,"qw":..,"qx":..,"qy":..,"qz":..}`
//!
//! Lines that are not wrapped in `{` `}` (startup banners, echoed commands)
//! are filtered before any parsing and reported as `Ok(None)`.

use crate::error::DecodeError;
use crate::types::MotionSample;
use serde::Deserialize;

/// Largest accepted acceleration component (m/s²), ~200g
pub const MAX_ABS_ACCEL: f64 = 2000.0;
/// Largest accepted angular rate component (rad/s)
pub const MAX_ABS_GYRO: f64 = 100.0;
const QUAT_TOLERANCE: f64 = 1.001;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireSample {
    #[serde(default)]
    t: Option<f64>,
    #[serde(default)]
    timestamp: Option<f64>,
    ax: f64,
    ay: f64,
    az: f64,
    gx: f64,
    gy: f64,
    gz: f64,
    mx: f64,
    my: f64,
    mz: f64,
    #[serde(default)]
    qw: Option<f64>,
    #[serde(default)]
    qx: Option<f64>,
    #[serde(default)]
    qy: Option<f64>,
    #[serde(default)]
    qz: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireSwing {
    #[serde(default)]
    swing_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    imu_data_points: Vec<WireSample>,
    #[serde(default)]
    impact_g_force: Option<f64>,
    #[serde(default)]
    swing_type: Option<String>,
}

/// A swing the firmware segmented itself
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSwing {
    pub swing_id: Option<String>,
    pub session_id: Option<String>,
    pub samples: Vec<MotionSample>,
    pub impact_g_force: Option<f64>,
    pub swing_type: Option<String>,
}

/// Envelope check: a record starts with `{` and ends with `}`
#[inline]
pub fn looks_like_record(line: &str) -> bool {
    let line = line.trim();
    line.len() >= 2 && line.starts_with('{') && line.ends_with('}')
}

/// Decode one line into a sample.
///
/// Returns `Ok(None)` for non-record lines. `received_at` (epoch seconds)
/// stamps samples that carry no `timestamp` of their own.
pub fn decode_sample(line: &str, received_at: f64) -> Result<Option<MotionSample>, DecodeError> {
    let line = line.trim();
    if !looks_like_record(line) {
        return Ok(None);
    }

    let wire: WireSample = serde_json::from_str(line).map_err(classify)?;
    wire.into_sample(received_at).map(Some)
}

/// Decode a complete device-segmented swing line.
///
/// Points without a `timestamp` are placed on the host clock by anchoring
/// the last point's device time `t` to `received_at`.
pub fn decode_device_swing(
    line: &str,
    received_at: f64,
) -> Result<Option<DeviceSwing>, DecodeError> {
    let line = line.trim();
    if !looks_like_record(line) {
        return Ok(None);
    }

    let wire: WireSwing = serde_json::from_str(line).map_err(classify)?;
    if wire.imu_data_points.is_empty() {
        return Err(DecodeError::MissingField("imu_data_points".to_string()));
    }
    if let Some(g) = wire.impact_g_force {
        check_range("impact_g_force", g, 0.0, f64::MAX)?;
    }

    let last_device_ms = wire.imu_data_points.iter().rev().find_map(|p| p.t);
    let mut samples = Vec::with_capacity(wire.imu_data_points.len());
    for point in wire.imu_data_points {
        let anchored = match (point.timestamp, point.t, last_device_ms) {
            (None, Some(t), Some(last)) => received_at - (last - t) / 1000.0,
            _ => received_at,
        };
        samples.push(point.into_sample(anchored)?);
    }

    Ok(Some(DeviceSwing {
        swing_id: wire.swing_id,
        session_id: wire.session_id,
        samples,
        impact_g_force: wire.impact_g_force,
        swing_type: wire.swing_type,
    }))
}

impl WireSample {
    fn into_sample(self, received_at: f64) -> Result<MotionSample, DecodeError> {
        for (field, value) in [("ax", self.ax), ("ay", self.ay), ("az", self.az)] {
            check_range(field, value, -MAX_ABS_ACCEL, MAX_ABS_ACCEL)?;
        }
        for (field, value) in [("gx", self.gx), ("gy", self.gy), ("gz", self.gz)] {
            check_range(field, value, -MAX_ABS_GYRO, MAX_ABS_GYRO)?;
        }
        for (field, value) in [("mx", self.mx), ("my", self.my), ("mz", self.mz)] {
            check_range(field, value, f64::MIN, f64::MAX)?;
        }

        let qw = self.qw.unwrap_or(1.0);
        let qx = self.qx.unwrap_or(0.0);
        let qy = self.qy.unwrap_or(0.0);
        let qz = self.qz.unwrap_or(0.0);
        for (field, value) in [("qw", qw), ("qx", qx), ("qy", qy), ("qz", qz)] {
            check_range(field, value, -QUAT_TOLERANCE, QUAT_TOLERANCE)?;
        }

        let device_time_ms = match self.t {
            Some(t) => {
                check_range("t", t, 0.0, u64::MAX as f64)?;
                Some(t.round() as u64)
            }
            None => None,
        };

        let timestamp = match self.timestamp {
            Some(ts) => {
                check_range("timestamp", ts, 0.0, f64::MAX)?;
                ts
            }
            None => received_at,
        };

        Ok(MotionSample {
            timestamp,
            device_time_ms,
            ax: self.ax,
            ay: self.ay,
            az: self.az,
            gx: self.gx,
            gy: self.gy,
            gz: self.gz,
            mx: self.mx,
            my: self.my,
            mz: self.mz,
            qw,
            qx,
            qy,
            qz,
        })
    }
}

#[inline]
fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), DecodeError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(DecodeError::OutOfRangeValue { field, value })
    }
}

fn classify(err: serde_json::Error) -> DecodeError {
    let message = err.to_string();
    if err.is_data() {
        // serde_json reports: missing field `ax` at line 1 column 42
        if let Some(rest) = message.strip_prefix("missing field `") {
            if let Some(end) = rest.find('`') {
                return DecodeError::MissingField(rest[..end].to_string());
            }
        }
    }
    DecodeError::MalformedSyntax(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const FIRMWARE_LINE: &str = r#"{"t":1234,"ax":1.234,"ay":2.345,"az":9.876,"gx":0.123,"gy":0.234,"gz":0.345,"mx":45.6,"my":67.8,"mz":89.0,"qw":0.1234,"qx":0.2345,"qy":0.3456,"qz":0.4567}"#;

    #[test]
    fn test_firmware_line() {
        let sample = decode_sample(FIRMWARE_LINE, 100.0).unwrap().unwrap();
        assert_eq!(sample.ax, 1.234);
        assert_eq!(sample.mz, 89.0);
        assert_eq!(sample.qz, 0.4567);
        assert_eq!(sample.device_time_ms, Some(1234));
        assert_eq!(sample.timestamp, 100.0);
    }

    #[test]
    fn test_missing_quaternion_defaults_to_identity() {
        let line = r#"{"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2,"mz":3}"#;
        let sample = decode_sample(line, 5.0).unwrap().unwrap();
        assert_eq!(sample.qw, 1.0);
        assert_eq!(sample.qx, 0.0);
        assert_eq!(sample.qy, 0.0);
        assert_eq!(sample.qz, 0.0);
        assert_eq!(sample.device_time_ms, None);
    }

    #[test]
    fn test_explicit_timestamp_wins() {
        let line = r#"{"timestamp":1700000000.25,"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":0,"my":0,"mz":0}"#;
        let sample = decode_sample(line, 5.0).unwrap().unwrap();
        assert_relative_eq!(sample.timestamp, 1_700_000_000.25);
    }

    #[test]
    fn test_banner_lines_are_not_records() {
        assert_eq!(decode_sample("GolfIMU firmware v1.2 ready", 0.0), Ok(None));
        assert_eq!(decode_sample("START_MONITORING", 0.0), Ok(None));
        assert_eq!(decode_sample("", 0.0), Ok(None));
        assert_eq!(decode_sample("   ", 0.0), Ok(None));
        assert_eq!(decode_sample("{", 0.0), Ok(None));
    }

    #[test]
    fn test_truncated_record_is_not_a_record() {
        // Cut mid-line by the transport: fails the envelope check
        let truncated = &FIRMWARE_LINE[..40];
        assert_eq!(decode_sample(truncated, 0.0), Ok(None));
    }

    #[test]
    fn test_broken_json_inside_envelope() {
        let err = decode_sample(r#"{"ax":1.0,"ay":}"#, 0.0).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedSyntax(_)));
    }

    #[test]
    fn test_missing_required_field() {
        let line = r#"{"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2}"#;
        assert_eq!(
            decode_sample(line, 0.0),
            Err(DecodeError::MissingField("mz".to_string()))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let line = r#"{"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2,"mz":3,"temp":25}"#;
        assert!(matches!(
            decode_sample(line, 0.0),
            Err(DecodeError::MalformedSyntax(_))
        ));
    }

    #[test]
    fn test_out_of_range_values() {
        let line = r#"{"ax":5000,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2,"mz":3}"#;
        assert_eq!(
            decode_sample(line, 0.0),
            Err(DecodeError::OutOfRangeValue {
                field: "ax",
                value: 5000.0
            })
        );

        let line = r#"{"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2,"mz":3,"qw":2.0}"#;
        assert!(matches!(
            decode_sample(line, 0.0),
            Err(DecodeError::OutOfRangeValue { field: "qw", .. })
        ));

        let line = r#"{"t":-5,"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":1,"my":2,"mz":3}"#;
        assert!(matches!(
            decode_sample(line, 0.0),
            Err(DecodeError::OutOfRangeValue { field: "t", .. })
        ));
    }

    #[test]
    fn test_device_swing_anchors_device_clock() {
        let line = r#"{"swing_id":"abc","imu_data_points":[
            {"t":1000,"ax":0,"ay":0,"az":9.81,"gx":0,"gy":0,"gz":0,"mx":0,"my":0,"mz":0},
            {"t":1250,"ax":0,"ay":0,"az":19.62,"gx":0,"gy":0,"gz":0,"mx":0,"my":0,"mz":0},
            {"t":1500,"ax":0,"ay":0,"az":343.35,"gx":0,"gy":0,"gz":0,"mx":0,"my":0,"mz":0}
        ],"impact_g_force":35.0,"swing_type":"chip"}"#
            .replace('\n', "");
        let swing = decode_device_swing(&line, 200.0).unwrap().unwrap();

        assert_eq!(swing.swing_id.as_deref(), Some("abc"));
        assert_eq!(swing.samples.len(), 3);
        assert_relative_eq!(swing.samples[0].timestamp, 199.5);
        assert_relative_eq!(swing.samples[1].timestamp, 199.75);
        assert_relative_eq!(swing.samples[2].timestamp, 200.0);
        assert_eq!(swing.impact_g_force, Some(35.0));
        assert_eq!(swing.swing_type.as_deref(), Some("chip"));
    }

    #[test]
    fn test_device_swing_requires_points() {
        assert_eq!(
            decode_device_swing(r#"{"imu_data_points":[]}"#, 0.0),
            Err(DecodeError::MissingField("imu_data_points".to_string()))
        );
        assert!(decode_device_swing(FIRMWARE_LINE, 0.0).is_err());
    }
}
