//! Local persistence for runs and unclaimed rewards.
//!
//! [`KvStore`] is the port; [`RunStore`] layers the run/reward key layout on
//! top of it and degrades to an in-memory map when the backend fails, so the
//! controller keeps working for the rest of the process life.

use crate::run::{Run, UnclaimedReward};
use folkhart_protocol::RunKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};

const LAST_LOGIN_KEY: &str = "session:lastLogin";
const CLEARED_VALUE: &str = "null";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("{e:#}"))
    }
}

/// Minimal key-value capability a run store needs.
pub trait KvStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store. An optional byte quota makes writes fail once the total
/// size of stored values would exceed it.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if used + value.len() > quota {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

impl<T: KvStore + Sync + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }
}

pub fn run_key(kind: RunKind) -> String {
    format!("activeRun:{}", kind.as_str())
}

pub fn reward_key(kind: RunKind) -> String {
    format!("unclaimedReward:{}", kind.as_str())
}

pub struct RunStore {
    backend: Box<dyn KvStore>,
    fallback: MemoryKv,
    /// Keys deleted while degraded; the backend may still hold them.
    cleared: HashSet<String>,
    degraded: bool,
}

impl RunStore {
    pub fn new(backend: impl KvStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            fallback: MemoryKv::new(),
            cleared: HashSet::new(),
            degraded: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryKv::new())
    }

    /// True once a backend write has failed. Writes then stay in memory;
    /// reads still see what the backend held before.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn save(&mut self, run: &Run) {
        self.put(&run_key(run.kind), run);
    }

    pub fn load(&self, kind: RunKind) -> Option<Run> {
        self.fetch(&run_key(kind))
    }

    /// Returns false when the backend still holds the run afterwards.
    pub fn clear(&mut self, kind: RunKind) -> bool {
        self.remove(&run_key(kind))
    }

    pub fn save_reward(&mut self, kind: RunKind, reward: &UnclaimedReward) {
        self.put(&reward_key(kind), reward);
    }

    pub fn load_reward(&self, kind: RunKind) -> Option<UnclaimedReward> {
        self.fetch(&reward_key(kind))
    }

    pub fn clear_reward(&mut self, kind: RunKind) -> bool {
        self.remove(&reward_key(kind))
    }

    pub fn last_login(&self) -> Option<i64> {
        self.fetch(LAST_LOGIN_KEY)
    }

    pub fn record_login(&mut self, at_ms: i64) {
        self.put(LAST_LOGIN_KEY, &at_ms);
    }

    pub fn clear_login(&mut self) {
        self.remove(LAST_LOGIN_KEY);
    }

    fn put<T: Serialize>(&mut self, key: &str, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "failed to encode stored value");
                return;
            }
        };
        if !self.degraded {
            match self.backend.set(key, &json) {
                Ok(()) => return,
                Err(e) => {
                    warn!(key, error = %e, "local storage unavailable; keeping state in memory");
                    self.degraded = true;
                }
            }
        }
        self.cleared.remove(key);
        let _ = self.fallback.set(key, &json);
    }

    fn fetch<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let local = if self.degraded {
            self.fallback.get(key).ok().flatten()
        } else {
            None
        };
        let raw = match local {
            Some(raw) => raw,
            None if self.cleared.contains(key) => return None,
            // Values written before degrading still live in the backend.
            None => match self.backend.get(key) {
                Ok(raw) => raw?,
                Err(e) => {
                    debug!(key, error = %e, "storage read failed; treating as absent");
                    return None;
                }
            },
        };
        if raw == CLEARED_VALUE {
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, error = %e, "ignoring unreadable stored value");
                None
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        let _ = self.fallback.delete(key);
        if self.degraded {
            self.cleared.insert(key.to_string());
        }
        match self.backend.delete(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to delete stored value; blanking it");
                // A blanked value loads as absent.
                self.backend.set(key, CLEARED_VALUE).is_ok()
            }
        }
    }
}
