//! Scripted transport: plays back a fixed list of lines, then disconnects.

use super::Transport;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Line(String),
    /// One poll that returns no data
    Idle,
}

#[derive(Debug, Default)]
pub struct ReplayTransport {
    script: VecDeque<Step>,
    written: Vec<String>,
    connected: bool,
    keep_open: bool,
    source: Option<String>,
}

impl ReplayTransport {
    pub fn from_lines<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        Self {
            script: lines.into_iter().map(|l| Step::Line(l.into())).collect(),
            ..Default::default()
        }
    }

    /// Load a capture file, one record per line.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        let mut transport = Self::from_lines(lines);
        transport.source = Some(path.display().to_string());
        Ok(transport)
    }

    /// Append `polls` empty reads to the script
    pub fn idle(mut self, polls: usize) -> Self {
        self.script.extend(std::iter::repeat(Step::Idle).take(polls));
        self
    }

    pub fn then_lines<I, L>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.script
            .extend(lines.into_iter().map(|l| Step::Line(l.into())));
        self
    }

    /// Stay connected (returning no data) once the script is exhausted
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    /// Lines written by the host, in order
    pub fn written(&self) -> &[String] {
        &self.written
    }
}

impl Transport for ReplayTransport {
    fn connect(&mut self, _port: Option<&str>) -> bool {
        self.connected = true;
        true
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_line(&mut self) -> Option<String> {
        if !self.connected {
            return None;
        }
        let step = self.script.pop_front();
        if self.script.is_empty() && !self.keep_open {
            self.connected = false;
        }
        match step {
            Some(Step::Line(line)) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Some(Step::Idle) | None => None,
        }
    }

    fn write_line(&mut self, line: &str) -> bool {
        if !self.connected {
            return false;
        }
        self.written.push(line.to_string());
        true
    }

    fn port_name(&self) -> Option<String> {
        Some(self.source.clone().unwrap_or_else(|| "replay".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_plays_script_then_disconnects() {
        let mut transport = ReplayTransport::from_lines(["a", "b"]).idle(1).then_lines(["c"]);
        assert!(transport.read_line().is_none());

        transport.connect(None);
        assert_eq!(transport.read_line().as_deref(), Some("a"));
        assert_eq!(transport.read_line().as_deref(), Some("b"));
        assert_eq!(transport.read_line(), None);
        assert!(transport.is_connected());
        assert_eq!(transport.read_line().as_deref(), Some("c"));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_keep_open() {
        let mut transport = ReplayTransport::from_lines(["a"]).keep_open();
        transport.connect(None);
        assert_eq!(transport.read_line().as_deref(), Some("a"));
        assert!(transport.read_line().is_none());
        assert!(transport.is_connected());
    }

    #[test]
    fn test_from_file_strips_line_endings() {
        let path = std::env::temp_dir().join(format!("golf_imu_replay_{}.jsonl", uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&path).unwrap();
            write!(file, "first\r\nsecond\n").unwrap();
        }
        let mut transport = ReplayTransport::from_file(&path).unwrap();
        transport.connect(None);
        assert_eq!(transport.read_line().as_deref(), Some("first"));
        assert_eq!(transport.read_line().as_deref(), Some("second"));
        assert!(transport.port_name().unwrap().ends_with(".jsonl"));
        std::fs::remove_file(&path).ok();
    }
}
