//! Runtime settings for the Golf IMU backend.
//!
//! Defaults can be overridden with `GOLFIMU_*` environment variables
//! (and `REDIS_URL`), then by command-line flags in the binary.

use crate::error::{GolfImuError, ImuResult};
use log::warn;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMPACT_THRESHOLD_G: f64 = 30.0;
pub const MIN_IMPACT_THRESHOLD_G: f64 = 5.0;
pub const MAX_IMPACT_THRESHOLD_G: f64 = 100.0;

pub const DEFAULT_CLUB_LENGTH_M: f64 = 1.07;
pub const DEFAULT_CLUB_MASS_KG: f64 = 0.205;

pub const IMU_BUFFER_SIZE: usize = 1000;
pub const SWING_BUFFER_SIZE: usize = 100;
pub const EVENT_BUFFER_SIZE: usize = 1000;
/// Upper bound accepted for any list cap from the environment
pub const MAX_BUFFER_SIZE: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection URL
    pub redis_url: String,

    /// Serial device path, auto-detected when `None`
    pub serial_port: Option<String>,
    pub serial_baudrate: u32,
    pub serial_timeout: Duration,
    /// Wait after opening the port while the board resets
    pub connect_settle: Duration,
    pub connect_max_retries: u32,
    /// Initial retry delay, doubled after each failed attempt
    pub connect_retry_delay: Duration,

    pub imu_buffer_size: usize,
    pub swing_buffer_size: usize,
    pub event_buffer_size: usize,

    pub default_impact_threshold_g: f64,
    pub min_impact_threshold_g: f64,
    pub max_impact_threshold_g: f64,

    pub default_club_length_m: f64,
    pub default_club_mass_kg: f64,

    /// Log throughput (and persist counters) every N samples
    pub report_every: u64,
    /// Sleep when the transport has no line ready
    pub idle_sleep: Duration,
    /// Buffered mode: length of one collection window
    pub collection_window: Duration,
    /// Buffered mode: a window closes early once this many lines are held
    pub max_buffered_lines: usize,
    /// Buffered mode: reader thread to collector channel bound
    pub channel_capacity: usize,

    /// In-memory samples kept for swing assembly
    pub swing_window_samples: usize,
    /// Impacts with fewer preceding samples do not produce a swing
    pub min_swing_samples: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            serial_port: None,
            serial_baudrate: 115_200,
            serial_timeout: Duration::from_secs(1),
            connect_settle: Duration::from_secs(2),
            connect_max_retries: 3,
            connect_retry_delay: Duration::from_millis(2000),
            imu_buffer_size: IMU_BUFFER_SIZE,
            swing_buffer_size: SWING_BUFFER_SIZE,
            event_buffer_size: EVENT_BUFFER_SIZE,
            default_impact_threshold_g: DEFAULT_IMPACT_THRESHOLD_G,
            min_impact_threshold_g: MIN_IMPACT_THRESHOLD_G,
            max_impact_threshold_g: MAX_IMPACT_THRESHOLD_G,
            default_club_length_m: DEFAULT_CLUB_LENGTH_M,
            default_club_mass_kg: DEFAULT_CLUB_MASS_KG,
            report_every: 1000,
            idle_sleep: Duration::from_millis(1),
            collection_window: Duration::from_secs(5),
            max_buffered_lines: 50_000,
            channel_capacity: 4096,
            swing_window_samples: 2000,
            min_swing_samples: 10,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("GOLFIMU_REDIS_URL"))
            .unwrap_or(defaults.redis_url);

        let serial_port = std::env::var("GOLFIMU_SERIAL_PORT")
            .ok()
            .filter(|p| !p.trim().is_empty());

        Self {
            redis_url,
            serial_port,
            serial_baudrate: env_or("GOLFIMU_SERIAL_BAUDRATE", defaults.serial_baudrate),
            serial_timeout: Duration::from_secs_f64(
                env_or(
                    "GOLFIMU_SERIAL_TIMEOUT_SECS",
                    defaults.serial_timeout.as_secs_f64(),
                )
                .max(0.0)
                .min(60.0),
            ),
            connect_settle: Duration::from_millis(env_or(
                "GOLFIMU_CONNECT_SETTLE_MS",
                defaults.connect_settle.as_millis() as u64,
            )),
            connect_max_retries: env_or("GOLFIMU_CONNECT_RETRIES", defaults.connect_max_retries),
            connect_retry_delay: Duration::from_millis(env_or(
                "GOLFIMU_CONNECT_RETRY_DELAY_MS",
                defaults.connect_retry_delay.as_millis() as u64,
            )),
            imu_buffer_size: env_size("GOLFIMU_IMU_BUFFER_SIZE", defaults.imu_buffer_size),
            swing_buffer_size: env_size("GOLFIMU_SWING_BUFFER_SIZE", defaults.swing_buffer_size),
            event_buffer_size: env_size("GOLFIMU_EVENT_BUFFER_SIZE", defaults.event_buffer_size),
            default_impact_threshold_g: env_or(
                "GOLFIMU_IMPACT_THRESHOLD_G",
                defaults.default_impact_threshold_g,
            ),
            report_every: env_or("GOLFIMU_REPORT_EVERY", defaults.report_every).max(1),
            collection_window: Duration::from_millis(env_or(
                "GOLFIMU_COLLECTION_WINDOW_MS",
                defaults.collection_window.as_millis() as u64,
            )),
            max_buffered_lines: env_or("GOLFIMU_MAX_BUFFERED_LINES", defaults.max_buffered_lines),
            ..defaults
        }
    }

    /// Reject impact thresholds outside the configured window.
    pub fn validate_threshold(&self, threshold_g: f64) -> ImuResult<f64> {
        if !threshold_g.is_finite()
            || threshold_g < self.min_impact_threshold_g
            || threshold_g > self.max_impact_threshold_g
        {
            return Err(GolfImuError::ConfigurationInvalid(format!(
                "impact threshold {}g outside {}..{}g",
                threshold_g, self.min_impact_threshold_g, self.max_impact_threshold_g
            )));
        }
        Ok(threshold_g)
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}, using {}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Buffer sizes must lie in `1..=MAX_BUFFER_SIZE`.
fn env_size(name: &str, default: usize) -> usize {
    let value = env_or(name, default);
    if value == 0 || value > MAX_BUFFER_SIZE {
        warn!(
            "Ignoring {}={} (allowed 1..={}), using {}",
            name, value, MAX_BUFFER_SIZE, default
        );
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.imu_buffer_size, 1000);
        assert_eq!(settings.swing_buffer_size, 100);
        assert_eq!(settings.event_buffer_size, 1000);
        assert_eq!(settings.default_impact_threshold_g, 30.0);
        assert_eq!(settings.serial_baudrate, 115_200);
        assert!(settings.serial_port.is_none());
    }

    #[test]
    fn test_threshold_window() {
        let settings = Settings::default();
        assert_eq!(settings.validate_threshold(30.0).unwrap(), 30.0);
        assert!(settings.validate_threshold(5.0).is_ok());
        assert!(settings.validate_threshold(100.0).is_ok());
        assert!(matches!(
            settings.validate_threshold(4.9),
            Err(GolfImuError::ConfigurationInvalid(_))
        ));
        assert!(settings.validate_threshold(150.0).is_err());
        assert!(settings.validate_threshold(f64::NAN).is_err());
    }

    #[test]
    fn test_env_or_parses_and_falls_back() {
        std::env::set_var("GOLFIMU_TEST_ENV_OR_OK", "42");
        std::env::set_var("GOLFIMU_TEST_ENV_OR_BAD", "forty-two");
        assert_eq!(env_or("GOLFIMU_TEST_ENV_OR_OK", 7usize), 42);
        assert_eq!(env_or("GOLFIMU_TEST_ENV_OR_BAD", 7usize), 7);
        assert_eq!(env_or("GOLFIMU_TEST_ENV_OR_UNSET", 7usize), 7);
    }

    #[test]
    fn test_env_size_rejects_zero_and_oversized() {
        std::env::set_var("GOLFIMU_TEST_ENV_SIZE_ZERO", "0");
        std::env::set_var("GOLFIMU_TEST_ENV_SIZE_HUGE", "18446744073709551615");
        std::env::set_var("GOLFIMU_TEST_ENV_SIZE_OK", "250");
        assert_eq!(env_size("GOLFIMU_TEST_ENV_SIZE_ZERO", 100), 100);
        assert_eq!(env_size("GOLFIMU_TEST_ENV_SIZE_HUGE", 100), 100);
        assert_eq!(env_size("GOLFIMU_TEST_ENV_SIZE_OK", 100), 250);
        assert_eq!(env_size("GOLFIMU_TEST_ENV_SIZE_UNSET", 100), 100);
    }
}
