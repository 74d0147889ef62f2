use crate::config::Settings;
use crate::error::{GolfImuError, ImuResult};
use crate::store::{KeyParts, KvStore, SessionStore};
use crate::swing::SwingStatistics;
use crate::types::{
    now_epoch_secs, unit_vector, ClubParams, MotionSample, RecordKind, SessionConfig,
    SessionCounters, SessionIdentity, SwingEvent, SwingRecord,
};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields `update` is allowed to change; everything else is fixed at creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub impact_threshold: Option<f64>,
    pub face_normal_calibration: Option<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub club_id: String,
    pub session_start_time: DateTime<Utc>,
    pub swing_count: usize,
    pub club_length: f64,
    pub club_mass: f64,
    pub impact_threshold: f64,
    pub face_normal_calibration: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_normal_unit: Option<[f64; 3]>,
}

/// Owns the store and the single "current session" pointer.
///
/// Loading or creating a session replaces the pointer; nothing else is cached.
pub struct SessionRegistry<S: KvStore> {
    store: SessionStore<S>,
    settings: Settings,
    current: Option<SessionConfig>,
}

impl<S: KvStore> SessionRegistry<S> {
    pub fn new(kv: S, settings: Settings) -> Self {
        Self::with_store(SessionStore::new(kv), settings)
    }

    pub fn with_store(store: SessionStore<S>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            current: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store_mut(&mut self) -> &mut SessionStore<S> {
        &mut self.store
    }

    pub fn current(&self) -> Option<&SessionConfig> {
        self.current.as_ref()
    }

    /// Create and persist a new session, making it current.
    ///
    /// A fresh id is generated on every call. The current pointer is left
    /// untouched if the store write fails.
    pub fn create(
        &mut self,
        identity: SessionIdentity,
        params: ClubParams,
        calibration: Option<[f64; 3]>,
        threshold_g: Option<f64>,
    ) -> ImuResult<SessionConfig> {
        validate_identity(&identity)?;
        validate_club(&params)?;
        let impact_threshold = self
            .settings
            .validate_threshold(threshold_g.unwrap_or(self.settings.default_impact_threshold_g))?;
        let face_normal_calibration = calibration.map(validate_calibration).transpose()?;

        let config = SessionConfig {
            session_id: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            club_id: identity.club_id,
            club_length: params.club_length,
            club_mass: params.club_mass,
            face_normal_calibration,
            impact_threshold,
            session_start_time: Utc::now(),
        };

        if let Err(e) = self.store.save_config(&config) {
            error!("Failed to store session {}: {}", config.session_id, e);
            return Err(e.into());
        }

        info!(
            "Created session {} for user {} with club {} (threshold {}g)",
            config.session_id, config.user_id, config.club_id, config.impact_threshold
        );
        self.current = Some(config.clone());
        Ok(config)
    }

    /// Load a stored session and make it current. Absent sessions are `Ok(None)`
    /// and leave the pointer as it was.
    pub fn load(&mut self, session_id: &str) -> ImuResult<Option<SessionConfig>> {
        let config = self.store.load_config(session_id)?;
        match &config {
            Some(config) => {
                info!("Loaded session {}", config.session_id);
                self.current = Some(config.clone());
            }
            None => info!("Session {} not found", session_id),
        }
        Ok(config)
    }

    /// Apply whitelisted fields to the current session.
    ///
    /// `Ok(false)` when there is no current session. Invalid values are
    /// rejected before anything is written.
    pub fn update(&mut self, update: SessionUpdate) -> ImuResult<bool> {
        let mut updated = match &self.current {
            Some(config) => config.clone(),
            None => return Ok(false),
        };

        if let Some(threshold) = update.impact_threshold {
            updated.impact_threshold = self.settings.validate_threshold(threshold)?;
        }
        if let Some(calibration) = update.face_normal_calibration {
            updated.face_normal_calibration = Some(validate_calibration(calibration)?);
        }

        self.store.save_config(&updated)?;
        info!("Updated session {}", updated.session_id);
        self.current = Some(updated);
        Ok(true)
    }

    /// Delete every record of a session. `Ok(false)` if it does not exist.
    pub fn clear(&mut self, session_id: &str) -> ImuResult<bool> {
        let removed = self.store.delete_all(session_id)?;
        if removed {
            if self.current.as_ref().map(|c| c.session_id.as_str()) == Some(session_id) {
                self.current = None;
            }
            info!("Cleared session {}", session_id);
        }
        Ok(removed)
    }

    /// Drop the current pointer, keeping stored data.
    pub fn end(&mut self) -> Option<SessionConfig> {
        let ended = self.current.take();
        if let Some(config) = &ended {
            info!("Ended session {}", config.session_id);
        }
        ended
    }

    pub fn summary(&mut self) -> ImuResult<Option<SessionSummary>> {
        let config = match &self.current {
            Some(config) => config,
            None => return Ok(None),
        };
        let swing_count = self
            .store
            .list_len(RecordKind::Swings, &KeyParts::from(config))?;

        Ok(Some(SessionSummary {
            session_id: config.session_id.clone(),
            user_id: config.user_id.clone(),
            club_id: config.club_id.clone(),
            session_start_time: config.session_start_time,
            swing_count,
            club_length: config.club_length,
            club_mass: config.club_mass,
            impact_threshold: config.impact_threshold,
            face_normal_calibration: config.face_normal_calibration,
            face_normal_unit: config.face_normal_unit(),
        }))
    }

    /// Append an audit event to the current session's capped event list.
    pub fn log_event(
        &mut self,
        event_type: &str,
        timestamp: f64,
        data: Option<serde_json::Value>,
    ) -> ImuResult<SwingEvent> {
        let config = self.current.as_ref().ok_or(GolfImuError::NoActiveSession)?;
        let event = SwingEvent {
            event_id: Uuid::new_v4().to_string(),
            session_id: config.session_id.clone(),
            event_type: event_type.to_string(),
            timestamp,
            data,
        };
        self.store.append_capped(
            RecordKind::Events,
            &KeyParts::from(config),
            &event,
            self.settings.event_buffer_size,
        )?;
        Ok(event)
    }

    /// `log_event` stamped with the host clock
    pub fn log_event_now(
        &mut self,
        event_type: &str,
        data: Option<serde_json::Value>,
    ) -> ImuResult<SwingEvent> {
        self.log_event(event_type, now_epoch_secs(), data)
    }

    pub fn recent_swings(&mut self, count: usize) -> ImuResult<Vec<SwingRecord>> {
        self.recent(RecordKind::Swings, count)
    }

    pub fn recent_samples(&mut self, count: usize) -> ImuResult<Vec<MotionSample>> {
        self.recent(RecordKind::ImuBuffer, count)
    }

    pub fn recent_events(&mut self, count: usize) -> ImuResult<Vec<SwingEvent>> {
        self.recent(RecordKind::Events, count)
    }

    /// Statistics over every retained swing of the current session
    pub fn statistics(&mut self) -> ImuResult<SwingStatistics> {
        let swings = self.recent_swings(self.settings.swing_buffer_size)?;
        Ok(SwingStatistics::from_swings(&swings))
    }

    /// Stored counters, zeroed if none were written yet
    pub fn counters(&mut self) -> ImuResult<SessionCounters> {
        let config = self.current.as_ref().ok_or(GolfImuError::NoActiveSession)?;
        Ok(self
            .store
            .get(RecordKind::Counters, &KeyParts::from(config))?
            .unwrap_or_default())
    }

    pub fn save_counters(&mut self, counters: &SessionCounters) -> ImuResult<()> {
        let config = self.current.as_ref().ok_or(GolfImuError::NoActiveSession)?;
        self.store
            .put(RecordKind::Counters, &KeyParts::from(config), counters)?;
        Ok(())
    }

    fn recent<T: serde::de::DeserializeOwned>(
        &mut self,
        kind: RecordKind,
        count: usize,
    ) -> ImuResult<Vec<T>> {
        let config = self.current.as_ref().ok_or(GolfImuError::NoActiveSession)?;
        Ok(self
            .store
            .list_recent(kind, &KeyParts::from(config), count)?)
    }
}

fn validate_identity(identity: &SessionIdentity) -> ImuResult<()> {
    for (name, value) in [("user_id", &identity.user_id), ("club_id", &identity.club_id)] {
        // ':' would break the key layout
        if value.trim().is_empty() || value.contains(':') {
            return Err(GolfImuError::ConfigurationInvalid(format!(
                "{} {:?} must be non-empty and contain no ':'",
                name, value
            )));
        }
    }
    Ok(())
}

fn validate_club(params: &ClubParams) -> ImuResult<()> {
    if !(params.club_length.is_finite() && params.club_length > 0.0) {
        return Err(GolfImuError::ConfigurationInvalid(format!(
            "club length {}m",
            params.club_length
        )));
    }
    if !(params.club_mass.is_finite() && params.club_mass > 0.0) {
        return Err(GolfImuError::ConfigurationInvalid(format!(
            "club mass {}kg",
            params.club_mass
        )));
    }
    Ok(())
}

/// Accept any face-normal vector with a direction; it is stored unchanged.
fn validate_calibration(raw: [f64; 3]) -> ImuResult<[f64; 3]> {
    if unit_vector(raw).is_none() {
        return Err(GolfImuError::ConfigurationInvalid(format!(
            "face normal calibration {:?} has no direction",
            raw
        )));
    }
    Ok(raw)
}
