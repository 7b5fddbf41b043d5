//! Trial State Store: the four `trial_*` keys in local persistent storage.
//!
//! Writes are not atomic across keys; a crash between two `set` calls can leave
//! partial state behind, which [`StoredTrialState`] can represent. Every
//! successful `save`/`clear` is pushed to subscribers through a `watch` channel.

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::state::{StoredTrialState, TrialState};

pub const KEY_ACTIVE: &str = "trial_active";
pub const KEY_STARTED_AT: &str = "trial_started_at";
pub const KEY_EXPIRES_AT: &str = "trial_expires_at";
pub const KEY_PLAN_LIMITS_FROM: &str = "trial_plan_limits_from";

pub const TRIAL_KEYS: [&str; 4] = [KEY_ACTIVE, KEY_STARTED_AT, KEY_EXPIRES_AT, KEY_PLAN_LIMITS_FROM];

const DEFAULT_STORE_PATH: &str = "./data/trialsync";

/// String key/value storage in the shape of browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Sled-backed storage on the host filesystem.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open at `path`, or `./data/trialsync` when none is given.
    pub fn open(path: Option<impl AsRef<Path>>) -> Result<Self, StoreError> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(DEFAULT_STORE_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(v) => String::from_utf8(v.to_vec())
                .map(Some)
                .map_err(|_| StoreError::NotUtf8 { key: key.to_string() }),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }
}

/// In-process storage, one per "tab".
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }
}

/// Persists and observes the cached [`TrialState`].
pub struct TrialStore {
    backend: Arc<dyn KeyValueStore>,
    tx: watch::Sender<StoredTrialState>,
}

impl TrialStore {
    /// Wraps `backend`; subscribers start from whatever it already holds.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        let initial = read_all(backend.as_ref()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "trial store unreadable at startup; starting empty");
            StoredTrialState::default()
        });
        let (tx, _rx) = watch::channel(initial);
        Self { backend, tx }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Writes all four fields as strings.
    pub fn save(&self, state: &TrialState) -> Result<(), StoreError> {
        let stored = StoredTrialState::from(state);
        let active = if state.active { "true" } else { "false" };
        self.backend.set(KEY_ACTIVE, active)?;
        if let Some(v) = stored.started_at.as_deref() {
            self.backend.set(KEY_STARTED_AT, v)?;
        }
        if let Some(v) = stored.expires_at.as_deref() {
            self.backend.set(KEY_EXPIRES_AT, v)?;
        }
        if let Some(v) = stored.plan_limits_from.as_deref() {
            self.backend.set(KEY_PLAN_LIMITS_FROM, v)?;
        }
        tracing::debug!(expires_at = ?stored.expires_at, "trial state saved");
        self.tx.send_replace(stored);
        Ok(())
    }

    /// Whatever is present, including partially missing state.
    pub fn load(&self) -> Result<StoredTrialState, StoreError> {
        read_all(self.backend.as_ref())
    }

    /// Removes all four keys.
    pub fn clear(&self) -> Result<(), StoreError> {
        for key in TRIAL_KEYS {
            self.backend.remove(key)?;
        }
        tracing::debug!("trial state cleared");
        self.tx.send_replace(StoredTrialState::default());
        Ok(())
    }

    /// Receives the stored state after every successful save or clear.
    pub fn subscribe(&self) -> watch::Receiver<StoredTrialState> {
        self.tx.subscribe()
    }
}

fn read_all(backend: &dyn KeyValueStore) -> Result<StoredTrialState, StoreError> {
    Ok(StoredTrialState {
        active: backend.get(KEY_ACTIVE)?.map(|v| v.trim() == "true"),
        started_at: backend.get(KEY_STARTED_AT)?,
        expires_at: backend.get(KEY_EXPIRES_AT)?,
        plan_limits_from: backend.get(KEY_PLAN_LIMITS_FROM)?,
    })
}
