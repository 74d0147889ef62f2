use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use golf_imu_rs::store::redis_store::RedisStore;
use golf_imu_rs::transport::replay::ReplayTransport;
use golf_imu_rs::transport::serial::SerialTransport;
use golf_imu_rs::transport::{self, DeviceCommand, Transport};
use golf_imu_rs::{
    ClubParams, GolfImuError, IngestMode, IngestStats, Pipeline, SessionIdentity,
    SessionRegistry, SessionUpdate, Settings, SwingAggregator,
};
use log::{error, info, warn};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "golf_imu")]
#[command(about = "Golf IMU backend - serial ingest, impact detection and swing storage", long_about = None)]
struct Cli {
    /// Redis URL (overrides REDIS_URL)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Serial port (auto-detect when omitted)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baudrate: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive shell (default)
    Run,
    /// Connect to the device and ingest until interrupted
    Ingest {
        #[command(flatten)]
        target: SessionArgs,
        /// direct or buffered
        #[arg(long, default_value = "direct")]
        mode: IngestMode,
    },
    /// Feed a capture file through the pipeline
    Replay {
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        target: SessionArgs,
        #[arg(long, default_value = "direct")]
        mode: IngestMode,
    },
    /// Show a stored session's configuration
    Status { session_id: String },
    /// Show a stored session's summary
    Summary { session_id: String },
    /// Swing statistics for a stored session
    Stats { session_id: String },
    /// Most recent records of a stored session
    Recent {
        session_id: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, value_enum, default_value_t = RecentKind::Swings)]
        kind: RecentKind,
    },
    /// Delete every record of a stored session
    Clear { session_id: String },
}

/// Record list shown by `recent`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RecentKind {
    Swings,
    Events,
    Samples,
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Resume an existing session instead of creating one
    #[arg(long)]
    session: Option<String>,
    #[arg(long, default_value = "default_user")]
    user: String,
    #[arg(long, default_value = "default_club")]
    club: String,
    /// Club length in meters
    #[arg(long)]
    club_length: Option<f64>,
    /// Club mass in kg
    #[arg(long)]
    club_mass: Option<f64>,
    /// Impact threshold in g
    #[arg(long)]
    threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(url) = cli.redis_url {
        settings.redis_url = url;
    }
    if cli.port.is_some() {
        settings.serial_port = cli.port;
    }
    if let Some(baud) = cli.baudrate {
        settings.serial_baudrate = baud;
    }

    let running = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(Arc::clone(&running));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            blocking(move || {
                let mut shell = Shell::open(settings, running)?;
                shell.repl()
            })
            .await
        }
        Command::Ingest { target, mode } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                select_session(&mut registry, &target)?;
                let mut device = SerialTransport::new(&settings);
                if !device.connect(settings.serial_port.as_deref()) {
                    bail!(GolfImuError::TransportUnavailable);
                }
                let config = registry
                    .current()
                    .cloned()
                    .ok_or(GolfImuError::NoActiveSession)?;
                transport::send_session_config(&mut device, &config)?;
                transport::send_command(&mut device, DeviceCommand::StartMonitoring)?;
                let stats = Pipeline::new(settings.clone(), mode).run(
                    &mut device,
                    &mut registry,
                    &running,
                );
                stop_and_disconnect(&mut device);
                print_stats(&stats?);
                Ok(())
            })
            .await
        }
        Command::Replay { file, target, mode } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                select_session(&mut registry, &target)?;
                let mut replay = ReplayTransport::from_file(&file)
                    .with_context(|| format!("Failed to open {}", file.display()))?;
                replay.connect(None);
                let stats =
                    Pipeline::new(settings.clone(), mode).run(&mut replay, &mut registry, &running)?;
                print_stats(&stats);
                Ok(())
            })
            .await
        }
        Command::Status { session_id } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                let config = load_or_fail(&mut registry, &session_id)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            })
            .await
        }
        Command::Summary { session_id } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                load_or_fail(&mut registry, &session_id)?;
                if let Some(summary) = registry.summary()? {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                Ok(())
            })
            .await
        }
        Command::Stats { session_id } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                load_or_fail(&mut registry, &session_id)?;
                println!("{}", serde_json::to_string_pretty(&registry.statistics()?)?);
                println!("{}", serde_json::to_string_pretty(&registry.counters()?)?);
                Ok(())
            })
            .await
        }
        Command::Recent {
            session_id,
            count,
            kind,
        } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                load_or_fail(&mut registry, &session_id)?;
                print_recent(&mut registry, kind, count)
            })
            .await
        }
        Command::Clear { session_id } => {
            blocking(move || {
                let mut registry = open_registry(&settings)?;
                if registry.clear(&session_id)? {
                    println!("Cleared session {}", session_id);
                } else {
                    println!("Session {} not found", session_id);
                }
                Ok(())
            })
            .await
        }
    }
}

/// Run blocking store/serial work off the async runtime
async fn blocking<F>(work: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("Task panicked")?
}

/// Ctrl-C stops a running ingest loop; outside of one it exits the process.
fn spawn_interrupt_handler(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            if running.swap(false, Ordering::SeqCst) {
                info!("Interrupt received, stopping ingest");
            } else {
                info!("Interrupt received, exiting");
                std::process::exit(130);
            }
        }
    });
}

fn open_registry(settings: &Settings) -> Result<SessionRegistry<RedisStore>> {
    let store = RedisStore::connect(&settings.redis_url)
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;
    Ok(SessionRegistry::new(store, settings.clone()))
}

fn load_or_fail(registry: &mut SessionRegistry<RedisStore>, session_id: &str) -> Result<golf_imu_rs::SessionConfig> {
    registry
        .load(session_id)?
        .ok_or_else(|| anyhow!("Session {} not found", session_id))
}

fn select_session(registry: &mut SessionRegistry<RedisStore>, args: &SessionArgs) -> Result<()> {
    if let Some(id) = &args.session {
        load_or_fail(registry, id)?;
        if let Some(threshold) = args.threshold {
            registry.update(SessionUpdate {
                impact_threshold: Some(threshold),
                ..Default::default()
            })?;
        }
        return Ok(());
    }

    let defaults = registry.settings().clone();
    let config = registry.create(
        SessionIdentity::new(args.user.clone(), args.club.clone()),
        ClubParams {
            club_length: args.club_length.unwrap_or(defaults.default_club_length_m),
            club_mass: args.club_mass.unwrap_or(defaults.default_club_mass_kg),
        },
        None,
        args.threshold,
    )?;
    println!("Session {} created", config.session_id);
    Ok(())
}

fn print_stats(stats: &IngestStats) {
    println!("\n=== Ingest Stats ===");
    println!("Samples processed: {}", stats.processed);
    println!("Lines skipped: {} ({} malformed)", stats.skipped, stats.malformed);
    println!("Impacts: {}", stats.impacts);
    println!("Swings: {}", stats.swings);
    println!("Store failures: {}", stats.store_failures);
    println!("Elapsed: {:.1}s ({:.1} Hz)", stats.elapsed_secs, stats.rate_hz());
}

fn print_recent(
    registry: &mut SessionRegistry<RedisStore>,
    kind: RecentKind,
    count: usize,
) -> Result<()> {
    match kind {
        RecentKind::Swings => {
            for swing in registry.recent_swings(count)? {
                println!(
                    "{}  {:.3}s  {:.1}g  {}  ({} samples)",
                    swing.swing_id,
                    swing.swing_duration,
                    swing.impact_g_force,
                    swing.swing_type,
                    swing.imu_data_points.len()
                );
            }
        }
        RecentKind::Events => {
            for event in registry.recent_events(count)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        RecentKind::Samples => {
            for sample in registry.recent_samples(count)? {
                println!("{}", serde_json::to_string(&sample)?);
            }
        }
    }
    Ok(())
}

const HELP: &str = "\
Commands:
  start_session <user> <club> [length] [mass]
  load_session <id>
  connect [port]
  disconnect
  send_config
  start_monitoring
  stop_monitoring
  collect [direct|buffered]
  wait_swing [seconds]
  set_threshold <g>
  status
  summary
  statistics
  recent_swings [n]
  clear_session [id]
  help
  quit";

/// Best-effort STOP_MONITORING before closing the device.
fn stop_and_disconnect<T: Transport + ?Sized>(device: &mut T) -> bool {
    let stopped = match transport::send_command(device, DeviceCommand::StopMonitoring) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to stop monitoring: {}", e);
            false
        }
    };
    device.disconnect();
    stopped
}

/// Precondition failures read as a refusal; everything else as a failure.
fn describe_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<GolfImuError>() {
        Some(err) if err.is_precondition() => format!("Not possible right now: {}", err),
        _ => format!("Error: {:#}", e),
    }
}

/// Interactive front end over one registry and one serial device
struct Shell {
    settings: Settings,
    registry: SessionRegistry<RedisStore>,
    device: SerialTransport,
    running: Arc<AtomicBool>,
}

impl Shell {
    fn open(settings: Settings, running: Arc<AtomicBool>) -> Result<Self> {
        let registry = open_registry(&settings)?;
        let device = SerialTransport::new(&settings);
        Ok(Self {
            settings,
            registry,
            device,
            running,
        })
    }

    fn repl(&mut self) -> Result<()> {
        println!("[{}] Golf IMU backend ready. Type 'help' for commands.", ts_now());
        let stdin = std::io::stdin();
        loop {
            print!("golf_imu> ");
            std::io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            match self.execute(line.trim()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("{}", describe_error(&e)),
            }
        }
        if self.device.is_connected() {
            self.device.disconnect();
        }
        Ok(())
    }

    /// Execute one command. `Ok(false)` ends the shell.
    fn execute(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command,
            None => return Ok(true),
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "start_session" => {
                let (user, club) = match (args.first(), args.get(1)) {
                    (Some(user), Some(club)) => (*user, *club),
                    _ => bail!("usage: start_session <user> <club> [length] [mass]"),
                };
                let params = ClubParams {
                    club_length: parse_or(args.get(2), self.settings.default_club_length_m)?,
                    club_mass: parse_or(args.get(3), self.settings.default_club_mass_kg)?,
                };
                let config =
                    self.registry
                        .create(SessionIdentity::new(user, club), params, None, None)?;
                println!("Session {} started", config.session_id);
            }
            "load_session" => {
                let id = args.first().ok_or_else(|| anyhow!("usage: load_session <id>"))?;
                match self.registry.load(id)? {
                    Some(config) => println!("Loaded session {}", config.session_id),
                    None => println!("Session {} not found", id),
                }
            }
            "connect" => {
                let port = args
                    .first()
                    .map(|p| p.to_string())
                    .or_else(|| self.settings.serial_port.clone());
                if self.device.connect(port.as_deref()) {
                    println!(
                        "Connected to {}",
                        self.device.port_name().unwrap_or_default()
                    );
                } else {
                    println!("Failed to connect to device");
                }
            }
            "disconnect" => {
                self.device.disconnect();
                println!("Disconnected");
            }
            "send_config" => {
                let config = self
                    .registry
                    .current()
                    .cloned()
                    .ok_or(GolfImuError::NoActiveSession)?;
                transport::send_session_config(&mut self.device, &config)?;
                println!("Config sent");
            }
            "start_monitoring" => {
                if self.registry.current().is_none() {
                    bail!(GolfImuError::NoActiveSession);
                }
                transport::send_command(&mut self.device, DeviceCommand::StartMonitoring)?;
                println!("Monitoring started");
            }
            "stop_monitoring" => {
                transport::send_command(&mut self.device, DeviceCommand::StopMonitoring)?;
                println!("Monitoring stopped");
            }
            "collect" => {
                let mode = match args.first() {
                    Some(mode) => mode.parse::<IngestMode>()?,
                    None => IngestMode::Direct,
                };
                println!("Collecting in {} mode, Ctrl-C to stop", mode);
                let stats = Pipeline::new(self.settings.clone(), mode).run(
                    &mut self.device,
                    &mut self.registry,
                    &self.running,
                )?;
                print_stats(&stats);
            }
            "wait_swing" => {
                let config = self
                    .registry
                    .current()
                    .cloned()
                    .ok_or(GolfImuError::NoActiveSession)?;
                let secs: f64 = parse_or(args.first(), 10.0)?;
                if !(secs.is_finite() && secs > 0.0) {
                    bail!("wait_swing timeout must be a positive number of seconds");
                }
                let timeout = Duration::from_secs_f64(secs);
                transport::send_command(&mut self.device, DeviceCommand::RequestSwing)?;
                match transport::wait_for_swing(&mut self.device, timeout, self.settings.idle_sleep)? {
                    Some(swing) => {
                        let record = SwingAggregator::new(self.settings.swing_buffer_size)
                            .from_device_swing(self.registry.store_mut(), &config, swing)?;
                        self.registry.log_event(
                            "swing_completed",
                            record.swing_end_time,
                            Some(serde_json::json!({ "swing_id": record.swing_id, "source": "device" })),
                        )?;
                        println!(
                            "Swing {} stored: {:.3}s, {:.1}g",
                            record.swing_id, record.swing_duration, record.impact_g_force
                        );
                    }
                    None => println!("No swing received within {:?}", timeout),
                }
            }
            "set_threshold" => {
                let threshold: f64 = args
                    .first()
                    .ok_or_else(|| anyhow!("usage: set_threshold <g>"))?
                    .parse()
                    .context("threshold must be a number")?;
                let applied = self.registry.update(SessionUpdate {
                    impact_threshold: Some(threshold),
                    ..Default::default()
                })?;
                if !applied {
                    bail!(GolfImuError::NoActiveSession);
                }
                println!("Impact threshold set to {}g", threshold);
                if self.device.is_connected() {
                    if let Some(config) = self.registry.current().cloned() {
                        transport::send_session_config(&mut self.device, &config)?;
                    }
                }
            }
            "status" => {
                match self.registry.current() {
                    Some(config) => println!(
                        "Session {} (user {}, club {}, threshold {}g)",
                        config.session_id, config.user_id, config.club_id, config.impact_threshold
                    ),
                    None => println!("No active session"),
                }
                match self.device.port_name() {
                    Some(port) => println!("Device connected on {}", port),
                    None => println!("Device not connected"),
                }
            }
            "summary" => match self.registry.summary()? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("No active session"),
            },
            "statistics" => {
                let stats = self.registry.statistics()?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            "recent_swings" => {
                let count = parse_or(args.first(), 5usize)?;
                print_recent(&mut self.registry, RecentKind::Swings, count)?;
            }
            "clear_session" => {
                let id = match args.first() {
                    Some(id) => id.to_string(),
                    None => self
                        .registry
                        .current()
                        .map(|c| c.session_id.clone())
                        .ok_or(GolfImuError::NoActiveSession)?,
                };
                if self.registry.clear(&id)? {
                    println!("Cleared session {}", id);
                } else {
                    println!("Session {} not found", id);
                }
            }
            "help" => println!("{}", HELP),
            "quit" | "exit" => return Ok(false),
            other => {
                warn!("Unknown command {:?}", other);
                println!("Unknown command {:?}. Type 'help'.", other);
            }
        }
        Ok(true)
    }
}

fn parse_or<T>(arg: Option<&&str>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match arg {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value {:?}", raw)),
        None => Ok(default),
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_kind_is_validated_by_clap() {
        let cli = Cli::try_parse_from(["golf_imu", "recent", "s1", "--kind", "events"]).unwrap();
        match cli.command {
            Some(Command::Recent { kind, count, .. }) => {
                assert_eq!(kind, RecentKind::Events);
                assert_eq!(count, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["golf_imu", "recent", "s1"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Recent {
                kind: RecentKind::Swings,
                ..
            })
        ));

        assert!(Cli::try_parse_from(["golf_imu", "recent", "s1", "--kind", "putts"]).is_err());
    }

    #[test]
    fn test_stop_and_disconnect() {
        let mut device = ReplayTransport::from_lines(Vec::<String>::new()).keep_open();
        device.connect(None);
        assert!(stop_and_disconnect(&mut device));
        assert_eq!(device.written(), ["STOP_MONITORING"]);
        assert!(!device.is_connected());

        // already gone: the failure is logged, not propagated
        let mut gone = ReplayTransport::from_lines(Vec::<String>::new());
        assert!(!stop_and_disconnect(&mut gone));
        assert!(gone.written().is_empty());
    }

    #[test]
    fn test_shell_error_wording() {
        let refused = anyhow::Error::from(GolfImuError::NoActiveSession);
        assert_eq!(describe_error(&refused), "Not possible right now: No active session");

        let failed = anyhow::Error::from(GolfImuError::ReaderPanicked);
        assert_eq!(describe_error(&failed), "Error: Transport reader thread panicked");

        let other = anyhow!("usage: connect [port]");
        assert_eq!(describe_error(&other), "Error: usage: connect [port]");
    }
}
