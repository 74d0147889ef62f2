//! In-process `KvStore` with Redis string/list semantics.
//!
//! Clones share the same data, so a test can keep a handle for inspection
//! and fault injection while the pipeline owns another.

use super::KvStore;
use crate::error::{StoreError, StoreResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
enum Entry {
    Value(String),
    List(VecDeque<String>),
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    ops: u64,
    /// Operations left to succeed before failures start
    ok_budget: Option<u64>,
    /// Operations left to fail once the budget is spent
    failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `ok` operations through, then fail the next `fail` operations.
    pub fn fail_after(&self, ok: u64, fail: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.ok_budget = if fail == 0 { None } else { Some(ok) };
            state.failures = fail;
        }
    }

    /// Number of operations attempted so far
    pub fn op_count(&self) -> u64 {
        self.state.lock().map(|s| s.ops).unwrap_or(0)
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn len_of(&self, key: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| match s.entries.get(key) {
                Some(Entry::List(list)) => Some(list.len()),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn begin(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("Failed to acquire memory store lock".to_string()))?;
        state.ops += 1;

        let budget = state.ok_budget;
        match budget {
            Some(0) if state.failures > 0 => {
                state.failures -= 1;
                if state.failures == 0 {
                    state.ok_budget = None;
                }
                Err(StoreError::Backend("injected failure".to_string()))
            }
            Some(n) if n > 0 => {
                state.ok_budget = Some(n - 1);
                Ok(state)
            }
            _ => Ok(state),
        }
    }
}

/// Redis-style inclusive range, negatives count from the tail
fn resolve_range(start: isize, end: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        None
    } else {
        Some((start as usize, end as usize))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

impl KvStore for MemoryStore {
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.begin()?;
        state
            .entries
            .insert(key.to_string(), Entry::Value(value.to_string()));
        Ok(())
    }

    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        let state = self.begin()?;
        match state.entries.get(key) {
            Some(Entry::Value(v)) => Ok(Some(v.clone())),
            Some(Entry::List(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn list_push_front(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.begin()?;
        match state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(list) => {
                list.push_front(value.to_string());
                Ok(())
            }
            Entry::Value(_) => Err(wrong_type(key)),
        }
    }

    fn list_trim(&mut self, key: &str, start: isize, end: isize) -> StoreResult<()> {
        let mut state = self.begin()?;
        let keep = match state.entries.get_mut(key) {
            Some(Entry::List(list)) => match resolve_range(start, end, list.len()) {
                Some((s, e)) => {
                    list.truncate(e + 1);
                    list.drain(..s);
                    true
                }
                None => false,
            },
            Some(Entry::Value(_)) => return Err(wrong_type(key)),
            None => return Ok(()),
        };
        if !keep {
            state.entries.remove(key);
        }
        Ok(())
    }

    fn list_range(&mut self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        let state = self.begin()?;
        match state.entries.get(key) {
            Some(Entry::List(list)) => Ok(match resolve_range(start, end, list.len()) {
                Some((s, e)) => list.range(s..=e).cloned().collect(),
                None => Vec::new(),
            }),
            Some(Entry::Value(_)) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    fn list_len(&mut self, key: &str) -> StoreResult<usize> {
        let state = self.begin()?;
        match state.entries.get(key) {
            Some(Entry::List(list)) => Ok(list.len()),
            Some(Entry::Value(_)) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    fn delete(&mut self, keys: &[String]) -> StoreResult<usize> {
        let mut state = self.begin()?;
        Ok(keys
            .iter()
            .filter(|k| state.entries.remove(k.as_str()).is_some())
            .count())
    }
}
