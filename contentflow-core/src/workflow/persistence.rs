//! Session persistence
//!
//! `SessionStore` is the durable hand-off point between state transitions:
//! one record per session, looked up by id or listed by user.

use crate::models::workflow::WorkflowSession;
use anyhow::{Context, Result};
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Key-value store for workflow sessions
pub trait SessionStore: Send + Sync {
    /// Insert or replace the full session record
    fn put(&self, session: &WorkflowSession) -> Result<()>;

    fn get(&self, session_id: Uuid) -> Result<Option<WorkflowSession>>;

    /// Sessions of one user, oldest first
    fn list_by_user(&self, user_id: &str) -> Result<Vec<WorkflowSession>>;

    /// Sessions that have not reached a terminal status
    fn list_incomplete(&self) -> Result<Vec<WorkflowSession>>;

    fn delete(&self, session_id: Uuid) -> Result<bool>;
}

/// Root JSON document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonStore {
    pub sessions: BTreeMap<Uuid, WorkflowSession>,
}

struct JsonState {
    store: JsonStore,
    by_user: HashMap<String, BTreeSet<Uuid>>,
}

impl JsonState {
    fn new(store: JsonStore) -> Self {
        let mut by_user: HashMap<String, BTreeSet<Uuid>> = HashMap::new();
        for session in store.sessions.values() {
            by_user
                .entry(session.user_id.clone())
                .or_default()
                .insert(session.id);
        }
        Self { store, by_user }
    }
}

/// Session store backed by a single JSON file
///
/// Every write rewrites a temporary file and renames it over the store, so a
/// crash mid-write leaves the previous contents intact.
pub struct JsonSessionStore {
    store_path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<JsonState>,
}

impl JsonSessionStore {
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session store directory")?;
        }

        let lock_path = store_path.with_extension("lock");
        let store = if store_path.exists() {
            Self::load_store(&store_path, &lock_path)?
        } else {
            JsonStore::default()
        };

        Ok(Self {
            store_path,
            lock_path,
            state: Mutex::new(JsonState::new(store)),
        })
    }

    fn lock_file(lock_path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .context("Failed to open session store lock file")
    }

    fn load_store(path: &Path, lock_path: &Path) -> Result<JsonStore> {
        let lock = Self::lock_file(lock_path)?;
        lock.lock_shared()
            .context("Failed to acquire read lock on session store")?;

        let mut contents = String::new();
        File::open(path)
            .context("Failed to open session store file")?
            .read_to_string(&mut contents)
            .context("Failed to read session store")?;
        drop(lock);

        if contents.trim().is_empty() {
            return Ok(JsonStore::default());
        }

        serde_json::from_str(&contents).context("Failed to parse session store JSON")
    }

    fn state(&self) -> MutexGuard<'_, JsonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_store(&self, store: &JsonStore) -> Result<()> {
        let lock = Self::lock_file(&self.lock_path)?;
        lock.lock_exclusive()
            .context("Failed to acquire write lock on session store")?;

        let json =
            serde_json::to_string_pretty(store).context("Failed to serialize session store")?;

        let tmp_path = self.store_path.with_extension("json.tmp");
        let mut writer = std::io::BufWriter::new(
            File::create(&tmp_path).context("Failed to create temporary session store")?,
        );
        writer
            .write_all(json.as_bytes())
            .context("Failed to write session store")?;
        let file = writer
            .into_inner()
            .context("Failed to flush session store")?;
        file.sync_all()
            .context("Failed to sync session store to disk")?;

        std::fs::rename(&tmp_path, &self.store_path)
            .context("Failed to replace session store file")?;
        Ok(())
    }
}

impl SessionStore for JsonSessionStore {
    fn put(&self, session: &WorkflowSession) -> Result<()> {
        let mut state = self.state();
        let previous = state.store.sessions.insert(session.id, session.clone());
        state
            .by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id);

        if let Err(e) = self.save_store(&state.store) {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => {
                    state.store.sessions.insert(session.id, previous);
                }
                None => {
                    state.store.sessions.remove(&session.id);
                    if let Some(ids) = state.by_user.get_mut(&session.user_id) {
                        ids.remove(&session.id);
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, session_id: Uuid) -> Result<Option<WorkflowSession>> {
        Ok(self.state().store.sessions.get(&session_id).cloned())
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<WorkflowSession>> {
        let state = self.state();
        let mut sessions: Vec<_> = state
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.store.sessions.get(id).cloned())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn list_incomplete(&self) -> Result<Vec<WorkflowSession>> {
        Ok(self
            .state()
            .store
            .sessions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect())
    }

    fn delete(&self, session_id: Uuid) -> Result<bool> {
        let mut state = self.state();
        let Some(removed) = state.store.sessions.remove(&session_id) else {
            return Ok(false);
        };
        if let Some(ids) = state.by_user.get_mut(&removed.user_id) {
            ids.remove(&session_id);
        }

        if let Err(e) = self.save_store(&state.store) {
            state
                .by_user
                .entry(removed.user_id.clone())
                .or_default()
                .insert(session_id);
            state.store.sessions.insert(session_id, removed);
            return Err(e);
        }
        Ok(true)
    }
}

/// Volatile session store for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, WorkflowSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, session: &WorkflowSession) -> Result<()> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get(&self, session_id: Uuid) -> Result<Option<WorkflowSession>> {
        Ok(self.sessions.get(&session_id).map(|entry| entry.clone()))
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<WorkflowSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn list_incomplete(&self) -> Result<Vec<WorkflowSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.clone())
            .collect())
    }

    fn delete(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.sessions.remove(&session_id).is_some())
    }
}
