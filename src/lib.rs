//! Golf IMU backend: serial IMU ingest, impact detection and
//! session-scoped swing storage on Redis.

pub mod config;
pub mod decoder;
pub mod error;
pub mod impact;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod swing;
pub mod transport;
pub mod types;

pub use config::Settings;
pub use error::{DecodeError, GolfImuError, ImuResult, StoreError};
pub use impact::{DetectorState, ImpactDetector, ImpactEvent};
pub use pipeline::{IngestMode, IngestStats, Pipeline, RunGuard};
pub use session::{SessionRegistry, SessionSummary, SessionUpdate};
pub use store::{KvStore, SessionStore};
pub use swing::{SwingAggregator, SwingStatistics};
pub use transport::Transport;
pub use types::{
    ClubParams, MotionSample, ReceiptClock, RecordKind, SessionConfig, SessionCounters,
    SessionIdentity, SwingEvent, SwingRecord,
};
