//! Streaming ingest: transport lines in, impacts/swings/buffer records out.
//!
//! Two modes share the same per-sample path:
//! - `Direct` decodes, checks and stores each sample as it arrives.
//! - `Buffered` collects raw lines for a window on a reader thread, then
//!   decodes and stores the whole window in one batch.

use crate::config::Settings;
use crate::decoder::{decode_device_swing, decode_sample, looks_like_record};
use crate::error::{GolfImuError, ImuResult};
use crate::impact::{ImpactDetector, ImpactEvent};
use crate::session::SessionRegistry;
use crate::store::{KeyParts, KvStore};
use crate::swing::SwingAggregator;
use crate::transport::Transport;
use crate::types::{MotionSample, ReceiptClock, RecordKind, SessionConfig, SessionCounters};
use crossbeam::channel::{self, RecvTimeoutError};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Only the first and every Nth malformed line is logged at warn level
const MALFORMED_WARN_EVERY: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestMode {
    Direct,
    Buffered,
}

impl FromStr for IngestMode {
    type Err = GolfImuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(IngestMode::Direct),
            "buffered" => Ok(IngestMode::Buffered),
            other => Err(GolfImuError::ConfigurationInvalid(format!(
                "unknown ingest mode {:?} (expected direct or buffered)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestMode::Direct => write!(f, "direct"),
            IngestMode::Buffered => write!(f, "buffered"),
        }
    }
}

/// Totals for one `run`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Samples decoded successfully
    pub processed: u64,
    /// Lines that produced no sample (noise and malformed)
    pub skipped: u64,
    /// Subset of `skipped` that looked like records but failed to decode
    pub malformed: u64,
    pub store_failures: u64,
    pub impacts: u64,
    pub swings: u64,
    pub elapsed_secs: f64,
}

impl IngestStats {
    /// Samples per second of wall time
    pub fn rate_hz(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.processed as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    fn add_to(&self, base: &SessionCounters) -> SessionCounters {
        SessionCounters {
            samples_processed: base.samples_processed + self.processed,
            samples_skipped: base.samples_skipped + self.skipped,
            store_failures: base.store_failures + self.store_failures,
            impacts: base.impacts + self.impacts,
            swings: base.swings + self.swings,
        }
    }
}

/// Holds the shared `running` flag high for the lifetime of one ingest loop.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> ImuResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GolfImuError::AlreadyRunning)?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Whether a sample is written immediately or batched by the caller
#[derive(Clone, Copy, PartialEq, Eq)]
enum Persist {
    Inline,
    Deferred,
}

pub struct Pipeline {
    settings: Settings,
    mode: IngestMode,
    detector: ImpactDetector,
    aggregator: SwingAggregator,
    /// Recent sub-threshold samples, oldest first
    window: VecDeque<MotionSample>,
    stats: IngestStats,
    base_counters: SessionCounters,
}

impl Pipeline {
    pub fn new(settings: Settings, mode: IngestMode) -> Self {
        Self {
            detector: ImpactDetector::new(settings.default_impact_threshold_g),
            aggregator: SwingAggregator::new(settings.swing_buffer_size),
            window: VecDeque::with_capacity(settings.swing_window_samples.min(4096)),
            stats: IngestStats::default(),
            base_counters: SessionCounters::default(),
            settings,
            mode,
        }
    }

    /// Ingest until the transport disconnects or `running` is cleared.
    ///
    /// Refuses to start without a connected transport or a current session.
    /// Stored counters are refreshed before returning.
    pub fn run<T, S>(
        &mut self,
        transport: &mut T,
        registry: &mut SessionRegistry<S>,
        running: &Arc<AtomicBool>,
    ) -> ImuResult<IngestStats>
    where
        T: Transport + ?Sized,
        S: KvStore,
    {
        if !transport.is_connected() {
            return Err(GolfImuError::TransportUnavailable);
        }
        let config = registry
            .current()
            .cloned()
            .ok_or(GolfImuError::NoActiveSession)?;
        let _guard = RunGuard::acquire(running)?;

        self.detector.set_threshold(config.impact_threshold);
        self.detector.reset();
        self.window.clear();
        self.stats = IngestStats::default();
        self.base_counters = registry.counters().unwrap_or_else(|e| {
            warn!("Could not read stored counters: {}", e);
            SessionCounters::default()
        });

        info!(
            "Ingest started ({} mode) for session {} on {}, threshold {}g",
            self.mode,
            config.session_id,
            transport.port_name().unwrap_or_else(|| "?".to_string()),
            config.impact_threshold
        );

        let started = Instant::now();
        let clock = ReceiptClock::start();
        match self.mode {
            IngestMode::Direct => {
                self.run_direct(transport, registry, &config, running, started, clock)
            }
            IngestMode::Buffered => {
                self.run_buffered(transport, registry, &config, running, started, clock)?
            }
        }

        self.stats.elapsed_secs = started.elapsed().as_secs_f64();
        self.save_counters(registry);
        info!(
            "Ingest stopped: {} samples, {} skipped, {} impacts, {} swings, {} store failures, {:.1} Hz",
            self.stats.processed,
            self.stats.skipped,
            self.stats.impacts,
            self.stats.swings,
            self.stats.store_failures,
            self.stats.rate_hz()
        );
        Ok(self.stats.clone())
    }

    fn run_direct<T, S>(
        &mut self,
        transport: &mut T,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
        running: &AtomicBool,
        started: Instant,
        clock: ReceiptClock,
    ) where
        T: Transport + ?Sized,
        S: KvStore,
    {
        let report_every = self.settings.report_every.max(1);
        let mut next_report = report_every;
        while running.load(Ordering::SeqCst) {
            if !transport.is_connected() {
                info!("Transport disconnected");
                break;
            }
            match transport.read_line() {
                Some(line) => {
                    self.ingest_line(&line, clock.now(), registry, config, Persist::Inline);
                }
                None => std::thread::sleep(self.settings.idle_sleep),
            }

            if self.stats.processed >= next_report {
                next_report = self.stats.processed + report_every;
                self.stats.elapsed_secs = started.elapsed().as_secs_f64();
                info!(
                    "{} samples in {:.1}s ({:.1} Hz)",
                    self.stats.processed,
                    self.stats.elapsed_secs,
                    self.stats.rate_hz()
                );
                self.save_counters(registry);
            }
        }
    }

    fn run_buffered<T, S>(
        &mut self,
        transport: &mut T,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
        running: &AtomicBool,
        started: Instant,
        clock: ReceiptClock,
    ) -> ImuResult<()>
    where
        T: Transport + ?Sized,
        S: KvStore,
    {
        loop {
            let (window, window_elapsed) = self.collect_window(transport, running, clock)?;
            if !window.is_empty() {
                self.flush(window, window_elapsed, registry, config);
                self.stats.elapsed_secs = started.elapsed().as_secs_f64();
                self.save_counters(registry);
            }
            if !running.load(Ordering::SeqCst) || !transport.is_connected() {
                return Ok(());
            }
        }
    }

    /// Collection phase: a scoped reader thread drains the transport into a
    /// bounded channel until the window closes. Returns receipt-stamped lines
    /// and how long the window stayed open.
    fn collect_window<T>(
        &mut self,
        transport: &mut T,
        running: &AtomicBool,
        clock: ReceiptClock,
    ) -> ImuResult<(Vec<(f64, String)>, Duration)>
    where
        T: Transport + ?Sized,
    {
        let window_len = self.settings.collection_window;
        let max_lines = self.settings.max_buffered_lines.max(1);
        let report_every = self.settings.report_every.max(1);
        let idle_sleep = self.settings.idle_sleep;
        let (tx, rx) = channel::bounded::<(f64, String)>(self.settings.channel_capacity.max(1));
        let window_open = AtomicBool::new(true);
        let mut skipped = 0u64;

        let collected = crossbeam::scope(|s| {
            let window_open = &window_open;
            s.spawn(move |_| {
                while window_open.load(Ordering::SeqCst)
                    && running.load(Ordering::SeqCst)
                    && transport.is_connected()
                {
                    match transport.read_line() {
                        Some(line) => {
                            if tx.send((clock.now(), line)).is_err() {
                                break;
                            }
                        }
                        None => std::thread::sleep(idle_sleep),
                    }
                }
            });

            let opened = Instant::now();
            let mut lines: Vec<(f64, String)> = Vec::new();
            let mut keep = |entry: (f64, String), lines: &mut Vec<(f64, String)>| {
                if looks_like_record(&entry.1) {
                    lines.push(entry);
                    if lines.len() as u64 % report_every == 0 {
                        let secs = opened.elapsed().as_secs_f64();
                        info!(
                            "Collected {} lines in {:.1}s ({:.1} Hz)",
                            lines.len(),
                            secs,
                            lines.len() as f64 / secs.max(f64::EPSILON)
                        );
                    }
                } else {
                    trace!("Non-record line: {:?}", entry.1);
                    skipped += 1;
                }
            };

            loop {
                if opened.elapsed() >= window_len
                    || lines.len() >= max_lines
                    || !running.load(Ordering::SeqCst)
                {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(entry) => keep(entry, &mut lines),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // Lines already read stay in this window
            window_open.store(false, Ordering::SeqCst);
            for entry in rx.iter() {
                keep(entry, &mut lines);
            }
            (lines, opened.elapsed())
        })
        .map_err(|_| GolfImuError::ReaderPanicked)?;

        self.stats.skipped += skipped;
        Ok(collected)
    }

    /// Flush phase: decode and detect per line, then store the buffer in one batch.
    fn flush<S: KvStore>(
        &mut self,
        lines: Vec<(f64, String)>,
        window_elapsed: Duration,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
    ) {
        let flush_started = Instant::now();
        let window_secs = window_elapsed.as_secs_f64();
        let span = match (lines.first(), lines.last()) {
            (Some(first), Some(last)) => last.0 - first.0,
            _ => 0.0,
        };
        let mut batch = Vec::with_capacity(lines.len());
        for (received_at, line) in &lines {
            if let Some(sample) =
                self.ingest_line(line, *received_at, registry, config, Persist::Deferred)
            {
                batch.push(sample);
            }
        }

        if let Err(e) = registry.store_mut().append_many_capped(
            RecordKind::ImuBuffer,
            &KeyParts::from(config),
            &batch,
            self.settings.imu_buffer_size,
        ) {
            self.stats.store_failures += batch.len() as u64;
            warn!("Failed to store {} buffered samples: {}", batch.len(), e);
        }

        info!(
            "Flushed {} samples from {} lines collected over {:.2}s ({:.1} Hz, receipt span {:.2}s) in {:?}",
            batch.len(),
            lines.len(),
            window_secs,
            window_rate_hz(batch.len(), window_elapsed),
            span,
            flush_started.elapsed()
        );
    }

    /// Per-line path shared by both modes. Returns the decoded sample when
    /// `persist` is `Deferred` so the caller can batch it.
    fn ingest_line<S: KvStore>(
        &mut self,
        line: &str,
        received_at: f64,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
        persist: Persist,
    ) -> Option<MotionSample> {
        if line.contains("\"imu_data_points\"") {
            self.ingest_device_swing(line, received_at, registry, config);
            return None;
        }

        let sample = match decode_sample(line, received_at) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                trace!("Non-record line: {:?}", line);
                self.stats.skipped += 1;
                return None;
            }
            Err(e) => {
                self.note_malformed(line, &e.to_string());
                return None;
            }
        };
        self.stats.processed += 1;

        if let Some(impact) = self.detector.observe(&sample) {
            self.on_impact(&impact, &sample, registry, config);
        } else {
            self.window.push_back(sample.clone());
            while self.window.len() > self.settings.swing_window_samples {
                self.window.pop_front();
            }
        }

        match persist {
            Persist::Inline => {
                if let Err(e) = registry.store_mut().append_capped(
                    RecordKind::ImuBuffer,
                    &KeyParts::from(config),
                    &sample,
                    self.settings.imu_buffer_size,
                ) {
                    self.note_store_failure("sample", &e.to_string());
                }
                None
            }
            Persist::Deferred => Some(sample),
        }
    }

    fn on_impact<S: KvStore>(
        &mut self,
        impact: &ImpactEvent,
        sample: &MotionSample,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
    ) {
        self.stats.impacts += 1;
        debug!("Impact {:.1}g at {:.3}", impact.g_force, impact.timestamp);
        let data = serde_json::json!({
            "g_force": impact.g_force,
            "accel_magnitude": impact.accel_magnitude,
        });
        if let Err(e) = registry.log_event("impact", impact.timestamp, Some(data)) {
            self.note_store_failure("impact event", &e.to_string());
        }

        if self.window.len() < self.settings.min_swing_samples.max(1) {
            return;
        }
        let mut samples: Vec<MotionSample> = self.window.drain(..).collect();
        samples.push(sample.clone());

        match self
            .aggregator
            .aggregate(registry.store_mut(), config, samples, impact.g_force, None)
        {
            Ok(swing) => {
                self.stats.swings += 1;
                let data = serde_json::json!({
                    "swing_id": swing.swing_id,
                    "swing_duration": swing.swing_duration,
                    "impact_g_force": swing.impact_g_force,
                });
                if let Err(e) = registry.log_event("swing_completed", impact.timestamp, Some(data)) {
                    self.note_store_failure("swing event", &e.to_string());
                }
            }
            Err(GolfImuError::Storage(e)) => self.note_store_failure("swing", &e.to_string()),
            Err(e) => warn!("Swing discarded: {}", e),
        }
    }

    fn ingest_device_swing<S: KvStore>(
        &mut self,
        line: &str,
        received_at: f64,
        registry: &mut SessionRegistry<S>,
        config: &SessionConfig,
    ) {
        let swing = match decode_device_swing(line, received_at) {
            Ok(Some(swing)) => swing,
            Ok(None) => {
                self.stats.skipped += 1;
                return;
            }
            Err(e) => {
                self.note_malformed(line, &e.to_string());
                return;
            }
        };

        match self
            .aggregator
            .from_device_swing(registry.store_mut(), config, swing)
        {
            Ok(swing) => {
                self.stats.swings += 1;
                let data = serde_json::json!({ "swing_id": swing.swing_id, "source": "device" });
                if let Err(e) =
                    registry.log_event("swing_completed", swing.swing_end_time, Some(data))
                {
                    self.note_store_failure("swing event", &e.to_string());
                }
            }
            Err(GolfImuError::Storage(e)) => self.note_store_failure("device swing", &e.to_string()),
            Err(e) => warn!("Device swing discarded: {}", e),
        }
    }

    fn note_malformed(&mut self, line: &str, reason: &str) {
        self.stats.skipped += 1;
        self.stats.malformed += 1;
        if self.stats.malformed == 1 || self.stats.malformed % MALFORMED_WARN_EVERY == 0 {
            warn!(
                "Skipping malformed line ({} so far): {}: {:?}",
                self.stats.malformed, reason, line
            );
        } else {
            debug!("Skipping malformed line: {}: {:?}", reason, line);
        }
    }

    fn note_store_failure(&mut self, what: &str, reason: &str) {
        self.stats.store_failures += 1;
        if self.stats.store_failures == 1 || self.stats.store_failures % MALFORMED_WARN_EVERY == 0 {
            warn!(
                "Failed to store {} ({} failures so far): {}",
                what, self.stats.store_failures, reason
            );
        }
    }

    fn save_counters<S: KvStore>(&self, registry: &mut SessionRegistry<S>) {
        let counters = self.stats.add_to(&self.base_counters);
        if let Err(e) = registry.save_counters(&counters) {
            warn!("Failed to store counters: {}", e);
        }
    }
}

/// Samples per second of collection-window wall time
fn window_rate_hz(samples: usize, window_elapsed: Duration) -> f64 {
    let secs = window_elapsed.as_secs_f64();
    if secs > 0.0 {
        samples as f64 / secs
    } else {
        0.0
    }
}
