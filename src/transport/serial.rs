//! USB serial transport for the IMU board.

use super::Transport;
use crate::config::Settings;
use log::{debug, error, info, warn};
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;

/// USB-serial chips and vendors used by supported boards
const BOARD_IDENTIFIERS: [&str; 5] = ["arduino", "usb serial", "ch340", "cp210x", "ftdi"];

/// A line longer than this is treated as garbage and dropped
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_LINE_BYTES && !self.pending.contains(&b'\n') {
            warn!("Dropping {} bytes without a line terminator", self.pending.len());
            self.pending.clear();
        }
    }

    /// Next complete line, with `\r\n` or `\n` removed
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

pub fn matches_board_description(description: &str) -> bool {
    let description = description.to_lowercase();
    BOARD_IDENTIFIERS.iter().any(|id| description.contains(id))
}

fn describe(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => format!(
            "{} {} {}",
            usb.manufacturer.as_deref().unwrap_or(""),
            usb.product.as_deref().unwrap_or(""),
            info.port_name
        ),
        _ => info.port_name.clone(),
    }
}

/// First available port that looks like a supported board
pub fn find_board_port() -> Option<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Failed to enumerate serial ports: {}", e);
            return None;
        }
    };
    ports
        .iter()
        .find(|p| matches_board_description(&describe(p)))
        .map(|p| p.port_name.clone())
}

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
    framer: LineFramer,
    read_buf: Vec<u8>,
    baudrate: u32,
    timeout: Duration,
    settle: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl SerialTransport {
    pub fn new(settings: &Settings) -> Self {
        Self {
            port: None,
            port_name: None,
            framer: LineFramer::default(),
            read_buf: vec![0u8; 4096],
            baudrate: settings.serial_baudrate,
            timeout: settings.serial_timeout,
            settle: settings.connect_settle,
            max_retries: settings.connect_max_retries.max(1),
            retry_delay: settings.connect_retry_delay,
        }
    }

    fn open(&self, path: &str) -> serialport::Result<Box<dyn SerialPort>> {
        let port = serialport::new(path, self.baudrate)
            .timeout(self.timeout)
            .open()?;
        // Board resets when the port opens
        std::thread::sleep(self.settle);
        port.clear(ClearBuffer::Input)?;
        Ok(port)
    }

    fn drop_connection(&mut self, reason: &str) {
        error!("Serial connection lost: {}", reason);
        self.port = None;
        self.framer.clear();
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self, port: Option<&str>) -> bool {
        let path = match port.map(str::to_string).or_else(find_board_port) {
            Some(path) => path,
            None => {
                warn!("No board found on any serial port");
                return false;
            }
        };

        let mut delay = self.retry_delay;
        for attempt in 1..=self.max_retries {
            match self.open(&path) {
                Ok(opened) => {
                    info!("Connected to {} at {} baud", path, self.baudrate);
                    self.port = Some(opened);
                    self.port_name = Some(path);
                    self.framer.clear();
                    return true;
                }
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}, retrying in {:?}",
                        path, attempt, self.max_retries, e, delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => {
                    error!("Connect to {} failed after {} attempts: {}", path, attempt, e);
                }
            }
        }
        false
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            info!("Disconnected from {}", self.port_name.as_deref().unwrap_or("?"));
        }
        self.framer.clear();
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn read_line(&mut self) -> Option<String> {
        if let Some(line) = self.framer.next_line() {
            return Some(line);
        }

        let port = self.port.as_mut()?;
        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                self.drop_connection(&e.to_string());
                return None;
            }
        };
        if available == 0 {
            return None;
        }

        let want = available.min(self.read_buf.len());
        match port.read(&mut self.read_buf[..want]) {
            Ok(n) => {
                self.framer.push(&self.read_buf[..n]);
                self.framer.next_line()
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => {
                self.drop_connection(&e.to_string());
                None
            }
        }
    }

    fn write_line(&mut self, line: &str) -> bool {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return false,
        };
        let result = port
            .write_all(line.as_bytes())
            .and_then(|_| port.write_all(b"\n"))
            .and_then(|_| port.flush());
        match result {
            Ok(()) => {
                debug!("-> {}", line);
                true
            }
            Err(e) => {
                self.drop_connection(&e.to_string());
                false
            }
        }
    }

    fn port_name(&self) -> Option<String> {
        self.port.as_ref().and(self.port_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_splits_partial_reads() {
        let mut framer = LineFramer::default();
        framer.push(b"{\"ax\":1");
        assert!(framer.next_line().is_none());
        framer.push(b"}\r\nREADY\n{\"a");
        assert_eq!(framer.next_line().as_deref(), Some("{\"ax\":1}"));
        assert_eq!(framer.next_line().as_deref(), Some("READY"));
        assert!(framer.next_line().is_none());
        framer.push(b"\":2}\n");
        assert_eq!(framer.next_line().as_deref(), Some("{\"a\":2}"));
    }

    #[test]
    fn test_framer_drops_runaway_data() {
        let mut framer = LineFramer::default();
        framer.push(&vec![b'x'; MAX_LINE_BYTES + 1]);
        framer.push(b"ok\n");
        assert_eq!(framer.next_line().as_deref(), Some("ok"));
    }

    #[test]
    fn test_board_identifiers() {
        assert!(matches_board_description("Arduino LLC Arduino Uno /dev/ttyACM0"));
        assert!(matches_board_description("wch.cn USB Serial /dev/ttyUSB0"));
        assert!(matches_board_description("Silicon Labs CP210x UART Bridge"));
        assert!(!matches_board_description("/dev/ttyS0"));
    }

    #[test]
    fn test_unconnected_transport() {
        let mut transport = SerialTransport::new(&Settings::default());
        assert!(!transport.is_connected());
        assert!(transport.read_line().is_none());
        assert!(!transport.write_line("START_MONITORING"));
        assert!(transport.port_name().is_none());
    }
}
