//! Line-oriented device transports and the device command set.
//!
//! The pipeline only needs a non-blocking line source; discovery and
//! framing live behind the `Transport` trait.

pub mod replay;
pub mod serial;

use crate::decoder::{decode_device_swing, DeviceSwing};
use crate::error::{GolfImuError, ImuResult};
use crate::types::{now_epoch_secs, SessionConfig};
use log::{debug, info};
use serde::Serialize;
use std::time::{Duration, Instant};

pub trait Transport: Send {
    /// Open the device, auto-detecting it when `port` is `None`.
    fn connect(&mut self, port: Option<&str>) -> bool;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Next complete line without its terminator, `None` if nothing is ready.
    /// Never blocks for longer than a short poll.
    fn read_line(&mut self) -> Option<String>;
    /// Write one line, appending the terminator.
    fn write_line(&mut self, line: &str) -> bool;
    fn port_name(&self) -> Option<String> {
        None
    }
}

/// Commands the firmware understands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    StartMonitoring,
    StopMonitoring,
    RequestSwing,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::StartMonitoring => "START_MONITORING",
            DeviceCommand::StopMonitoring => "STOP_MONITORING",
            DeviceCommand::RequestSwing => "REQUEST_SWING",
        }
    }
}

/// Session fields the firmware needs, sent as `CONFIG:{json}`
#[derive(Serialize)]
struct DeviceConfig<'a> {
    session_id: &'a str,
    user_id: &'a str,
    club_id: &'a str,
    club_length: f64,
    club_mass: f64,
    impact_threshold: f64,
}

fn write_checked<T: Transport + ?Sized>(transport: &mut T, line: &str) -> ImuResult<()> {
    if !transport.is_connected() {
        return Err(GolfImuError::TransportUnavailable);
    }
    if !transport.write_line(line) {
        return Err(GolfImuError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("failed to write {:?}", line),
        )));
    }
    Ok(())
}

pub fn send_session_config<T: Transport + ?Sized>(
    transport: &mut T,
    config: &SessionConfig,
) -> ImuResult<()> {
    let payload = serde_json::to_string(&DeviceConfig {
        session_id: &config.session_id,
        user_id: &config.user_id,
        club_id: &config.club_id,
        club_length: config.club_length,
        club_mass: config.club_mass,
        impact_threshold: config.impact_threshold,
    })
    .map_err(crate::error::StoreError::from)?;

    write_checked(transport, &format!("CONFIG:{}", payload))?;
    info!("Sent session config {} to device", config.session_id);
    Ok(())
}

pub fn send_command<T: Transport + ?Sized>(
    transport: &mut T,
    command: DeviceCommand,
) -> ImuResult<()> {
    write_checked(transport, command.as_str())?;
    debug!("Sent {}", command.as_str());
    Ok(())
}

/// Poll for a device-segmented swing line until `timeout` elapses.
///
/// Sample lines and noise seen while waiting are dropped. A swing line
/// that fails to decode ends the wait with `GolfImuError::Decode`.
pub fn wait_for_swing<T: Transport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
    idle_sleep: Duration,
) -> ImuResult<Option<DeviceSwing>> {
    if !transport.is_connected() {
        return Err(GolfImuError::TransportUnavailable);
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline && transport.is_connected() {
        match transport.read_line() {
            Some(line) => match decode_device_swing(&line, now_epoch_secs()) {
                Ok(Some(swing)) => return Ok(Some(swing)),
                Ok(None) => {}
                // The requested swing arrived but is unusable
                Err(e) if line.contains("\"imu_data_points\"") => return Err(e.into()),
                Err(e) => debug!("Not a swing line: {}", e),
            },
            None => std::thread::sleep(idle_sleep),
        }
    }
    Ok(None)
}
