//! Session-scoped persistence over an external key-value store.
//!
//! Every key is derived from `{session_id, user_id, club_id, record_kind}`:
//! - `session_config:<session_id>` for the singleton configuration
//! - `session:<session_id>:<user_id>:<club_id>:<record_kind>` for everything else
//!
//! Lists are stored newest-first (push to the front, trim the tail).

pub mod memory;
pub mod redis_store;

use crate::error::{StoreError, StoreResult};
use crate::types::{RecordKind, SessionConfig};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Operations required from the backing key-value store
pub trait KvStore: Send {
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()>;
    fn get(&mut self, key: &str) -> StoreResult<Option<String>>;
    fn list_push_front(&mut self, key: &str, value: &str) -> StoreResult<()>;
    /// Keep only `start..=end` (Redis LTRIM indexing, negatives count from the tail)
    fn list_trim(&mut self, key: &str, start: isize, end: isize) -> StoreResult<()>;
    fn list_range(&mut self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>>;
    fn list_len(&mut self, key: &str) -> StoreResult<usize>;
    /// Returns how many keys existed
    fn delete(&mut self, keys: &[String]) -> StoreResult<usize>;

    /// Push `values` in order (the last one ends up at the head), then cap the list.
    ///
    /// Two separate calls: another writer may observe the list above `cap`
    /// between them. Backends with transactions should override this.
    fn push_front_capped(&mut self, key: &str, values: &[String], cap: usize) -> StoreResult<()> {
        for value in values {
            self.list_push_front(key, value)?;
        }
        self.list_trim(key, 0, last_index(cap))
    }
}

/// Inclusive end index covering the first `n` list entries.
///
/// Counts beyond `isize::MAX` saturate instead of wrapping to a tail index.
pub fn last_index(n: usize) -> isize {
    isize::try_from(n).unwrap_or(isize::MAX).saturating_sub(1)
}

/// The identity triple every session record key is built from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyParts<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub club_id: &'a str,
}

impl<'a> KeyParts<'a> {
    pub fn new(session_id: &'a str, user_id: &'a str, club_id: &'a str) -> Self {
        Self {
            session_id,
            user_id,
            club_id,
        }
    }

    pub fn key(&self, kind: RecordKind) -> String {
        match kind {
            RecordKind::Config => config_key(self.session_id),
            _ => format!(
                "session:{}:{}:{}:{}",
                self.session_id,
                self.user_id,
                self.club_id,
                kind.as_str()
            ),
        }
    }
}

impl<'a> From<&'a SessionConfig> for KeyParts<'a> {
    fn from(config: &'a SessionConfig) -> Self {
        Self::new(&config.session_id, &config.user_id, &config.club_id)
    }
}

pub fn config_key(session_id: &str) -> String {
    format!("session_config:{}", session_id)
}

/// Ring-bounded, session-scoped record store
pub struct SessionStore<S: KvStore> {
    kv: S,
    delete_retries: u32,
    retry_delay: Duration,
}

impl<S: KvStore> SessionStore<S> {
    pub fn new(kv: S) -> Self {
        Self {
            kv,
            delete_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }

    /// Retry policy for `delete_all` (delay doubles per attempt)
    pub fn with_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.delete_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn put<T: Serialize>(
        &mut self,
        kind: RecordKind,
        parts: &KeyParts,
        record: &T,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        self.kv.set(&parts.key(kind), &json)
    }

    /// A stored value that fails to deserialize reads as absent.
    pub fn get<T: DeserializeOwned>(
        &mut self,
        kind: RecordKind,
        parts: &KeyParts,
    ) -> StoreResult<Option<T>> {
        let key = parts.key(kind);
        match self.kv.get(&key)? {
            Some(json) => Ok(decode_entry(&key, &json)),
            None => Ok(None),
        }
    }

    /// Push one record to the head of a list, keeping at most `cap` entries.
    pub fn append_capped<T: Serialize>(
        &mut self,
        kind: RecordKind,
        parts: &KeyParts,
        record: &T,
        cap: usize,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        self.kv
            .push_front_capped(&parts.key(kind), std::slice::from_ref(&json), cap.max(1))
    }

    /// Batch form of `append_capped`: one push, one trim.
    pub fn append_many_capped<T: Serialize>(
        &mut self,
        kind: RecordKind,
        parts: &KeyParts,
        records: &[T],
        cap: usize,
    ) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        // Only the newest `cap` can survive the trim
        let skip = records.len().saturating_sub(cap.max(1));
        let encoded = records[skip..]
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.kv
            .push_front_capped(&parts.key(kind), &encoded, cap.max(1))
    }

    /// Most recent `count` records, oldest first. Corrupt entries are skipped.
    pub fn list_recent<T: DeserializeOwned>(
        &mut self,
        kind: RecordKind,
        parts: &KeyParts,
        count: usize,
    ) -> StoreResult<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = parts.key(kind);
        let raw = self.kv.list_range(&key, 0, last_index(count))?;
        Ok(raw
            .iter()
            .rev()
            .filter_map(|json| decode_entry(&key, json))
            .collect())
    }

    pub fn list_len(&mut self, kind: RecordKind, parts: &KeyParts) -> StoreResult<usize> {
        self.kv.list_len(&parts.key(kind))
    }

    pub fn save_config(&mut self, config: &SessionConfig) -> StoreResult<()> {
        self.put(RecordKind::Config, &KeyParts::from(config), config)
    }

    pub fn load_config(&mut self, session_id: &str) -> StoreResult<Option<SessionConfig>> {
        let key = config_key(session_id);
        match self.kv.get(&key)? {
            Some(json) => Ok(decode_entry(&key, &json)),
            None => Ok(None),
        }
    }

    /// Remove every record kind for a session.
    ///
    /// `Ok(false)` when the session has no stored configuration. Store
    /// failures are retried, then returned.
    pub fn delete_all(&mut self, session_id: &str) -> StoreResult<bool> {
        let config = match self.load_config(session_id)? {
            Some(config) => config,
            None => {
                debug!("delete_all: session {} not found", session_id);
                return Ok(false);
            }
        };

        let parts = KeyParts::from(&config);
        let keys: Vec<String> = RecordKind::ALL.iter().map(|k| parts.key(*k)).collect();

        let mut delay = self.retry_delay;
        let mut attempt = 0;
        loop {
            match self.kv.delete(&keys) {
                Ok(removed) => {
                    info!(
                        "Deleted {} keys for session {} (attempt {})",
                        removed,
                        session_id,
                        attempt + 1
                    );
                    return Ok(true);
                }
                Err(e) if attempt < self.delete_retries => {
                    warn!(
                        "delete_all {} failed (attempt {}): {}, retrying in {:?}",
                        session_id,
                        attempt + 1,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StoreError::Backend(format!(
                        "delete_all {} failed after {} attempts: {}",
                        session_id,
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }
}

fn decode_entry<T: DeserializeOwned>(key: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping corrupt entry in {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::types::{MotionSample, SwingEvent};
    use chrono::Utc;

    fn config(session_id: &str) -> SessionConfig {
        SessionConfig {
            session_id: session_id.to_string(),
            user_id: "alice".to_string(),
            club_id: "driver".to_string(),
            club_length: 1.07,
            club_mass: 0.205,
            face_normal_calibration: Some([0.0, 1.0, 0.0]),
            impact_threshold: 30.0,
            session_start_time: Utc::now(),
        }
    }

    fn store() -> (MemoryStore, SessionStore<MemoryStore>) {
        let kv = MemoryStore::new();
        let store = SessionStore::new(kv.clone()).with_retry(2, Duration::ZERO);
        (kv, store)
    }

    #[test]
    fn test_key_layout() {
        let parts = KeyParts::new("s1", "alice", "driver");
        assert_eq!(parts.key(RecordKind::Config), "session_config:s1");
        assert_eq!(
            parts.key(RecordKind::ImuBuffer),
            "session:s1:alice:driver:imu_buffer"
        );
        assert_eq!(parts.key(RecordKind::Swings), "session:s1:alice:driver:swings");
        assert_eq!(parts.key(RecordKind::Events), "session:s1:alice:driver:events");
    }

    #[test]
    fn test_config_round_trip() {
        let (_, mut store) = store();
        let original = config("s1");
        store.save_config(&original).unwrap();

        let loaded = store.load_config("s1").unwrap().unwrap();
        assert_eq!(loaded, original);

        let mut without_calibration = config("s2");
        without_calibration.face_normal_calibration = None;
        without_calibration.impact_threshold = 42.5;
        store.save_config(&without_calibration).unwrap();
        assert_eq!(store.load_config("s2").unwrap().unwrap(), without_calibration);
    }

    #[test]
    fn test_append_capped_keeps_most_recent_in_push_order() {
        let (kv, mut store) = store();
        let parts = KeyParts::new("s1", "alice", "driver");

        for i in 0..25 {
            let sample = MotionSample::from_accel(0.0, 0.0, 9.81, i as f64);
            store
                .append_capped(RecordKind::ImuBuffer, &parts, &sample, 10)
                .unwrap();
        }

        assert_eq!(kv.len_of(&parts.key(RecordKind::ImuBuffer)), 10);
        let recent: Vec<MotionSample> = store
            .list_recent(RecordKind::ImuBuffer, &parts, 100)
            .unwrap();
        let times: Vec<f64> = recent.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, (15..25).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_append_many_capped_matches_single_appends() {
        let (_, mut store) = store();
        let parts = KeyParts::new("s1", "alice", "driver");
        let samples: Vec<MotionSample> = (0..12)
            .map(|i| MotionSample::from_accel(0.0, 0.0, 9.81, i as f64))
            .collect();

        store
            .append_many_capped(RecordKind::ImuBuffer, &parts, &samples[..7], 5)
            .unwrap();
        store
            .append_many_capped(RecordKind::ImuBuffer, &parts, &samples[7..], 5)
            .unwrap();

        let recent: Vec<MotionSample> = store
            .list_recent(RecordKind::ImuBuffer, &parts, 5)
            .unwrap();
        assert_eq!(recent, samples[7..].to_vec());
    }

    #[test]
    fn test_huge_counts_do_not_wrap() {
        let (kv, mut store) = store();
        let parts = KeyParts::new("s1", "alice", "driver");
        for i in 0..5 {
            let sample = MotionSample::from_accel(0.0, 0.0, 9.81, i as f64);
            store
                .append_capped(RecordKind::ImuBuffer, &parts, &sample, 10)
                .unwrap();
        }

        let all: Vec<MotionSample> = store
            .list_recent(RecordKind::ImuBuffer, &parts, usize::MAX)
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].timestamp, 0.0);

        let sample = MotionSample::from_accel(0.0, 0.0, 9.81, 5.0);
        store
            .append_capped(RecordKind::ImuBuffer, &parts, &sample, usize::MAX)
            .unwrap();
        assert_eq!(kv.len_of(&parts.key(RecordKind::ImuBuffer)), 6);

        assert_eq!(last_index(0), -1);
        assert_eq!(last_index(10), 9);
        assert_eq!(last_index(usize::MAX), isize::MAX - 1);
    }

    #[test]
    fn test_list_recent_skips_corrupt_entries() {
        let (mut kv, mut store) = store();
        let parts = KeyParts::new("s1", "alice", "driver");
        let key = parts.key(RecordKind::Events);

        let event = SwingEvent {
            event_id: "e1".to_string(),
            session_id: "s1".to_string(),
            event_type: "impact".to_string(),
            timestamp: 1.0,
            data: None,
        };
        store
            .append_capped(RecordKind::Events, &parts, &event, 1000)
            .unwrap();
        kv.list_push_front(&key, "{not json").unwrap();
        store
            .append_capped(RecordKind::Events, &parts, &event, 1000)
            .unwrap();

        let events: Vec<SwingEvent> = store.list_recent(RecordKind::Events, &parts, 10).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_corrupt_config_reads_as_absent() {
        let (mut kv, mut store) = store();
        kv.set(&config_key("bad"), "not-json").unwrap();
        assert!(store.load_config("bad").unwrap().is_none());
    }

    #[test]
    fn test_delete_all_removes_every_kind() {
        let (kv, mut store) = store();
        let cfg = config("s1");
        let parts = KeyParts::from(&cfg);
        store.save_config(&cfg).unwrap();
        let sample = MotionSample::from_accel(0.0, 0.0, 9.81, 1.0);
        for kind in [RecordKind::ImuBuffer, RecordKind::Swings, RecordKind::Events] {
            store.append_capped(kind, &parts, &sample, 10).unwrap();
        }
        store
            .put(RecordKind::Counters, &parts, &crate::types::SessionCounters::default())
            .unwrap();

        assert!(store.delete_all("s1").unwrap());
        assert!(store.load_config("s1").unwrap().is_none());
        for kind in [RecordKind::ImuBuffer, RecordKind::Swings, RecordKind::Events] {
            let left: Vec<MotionSample> = store.list_recent(kind, &parts, 10).unwrap();
            assert!(left.is_empty());
        }
        assert_eq!(kv.key_count(), 0);
    }

    #[test]
    fn test_delete_all_unknown_session() {
        let (kv, mut store) = store();
        store.save_config(&config("other")).unwrap();

        assert!(!store.delete_all("missing").unwrap());
        assert!(!store.delete_all("missing").unwrap());
        assert!(store.load_config("other").unwrap().is_some());
        assert_eq!(kv.key_count(), 1);
    }

    #[test]
    fn test_delete_all_retries_transient_failures() {
        let (kv, mut store) = store();
        store.save_config(&config("s1")).unwrap();

        // load_config succeeds, first delete fails, retry succeeds
        kv.fail_after(1, 1);
        assert!(store.delete_all("s1").unwrap());
        assert!(store.load_config("s1").unwrap().is_none());
    }

    #[test]
    fn test_delete_all_reports_persistent_failure() {
        let (kv, mut store) = store();
        store.save_config(&config("s1")).unwrap();

        kv.fail_after(1, 10);
        assert!(store.delete_all("s1").is_err());
        kv.fail_after(0, 0);
        assert!(store.load_config("s1").unwrap().is_some());
    }
}
