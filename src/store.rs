//! Persistent session store
//!
//! Maps a session identifier to the state needed to resume it after a
//! restart: the owning chat, the update that started the conversation, the
//! step index and the opaque user data. All records live in memory; every
//! mutation rewrites the whole table through a [`StateMedium`].

mod medium;
mod sqlite;

pub use medium::{FileMedium, MemoryMedium, StateMedium};
pub use sqlite::SqliteMedium;

use crate::update::{ChatId, SessionId, Update};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize session table: {0}")]
    Serialization(String),
    #[error("cannot deserialize session table: {0}")]
    Deserialization(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no record for session {0}")]
    NotFound(SessionId),
    #[error("session store is sealed, mutations are not persisted")]
    Sealed,
    #[error("session store is already sealed")]
    AlreadySealed,
}

impl StoreError {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Resumable state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub chat_id: ChatId,
    /// The update that started the current conversation
    pub first_event: Update,
    /// Index of the step to run (or re-run) on resume
    pub step: usize,
    /// Serialized user data of the step machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub started_at: DateTime<Utc>,
}

/// Step index and user data of a session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Checkpoint {
    pub step: usize,
    pub data: Option<Value>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    sessions: &'a BTreeMap<SessionId, SessionRecord>,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    sessions: BTreeMap<SessionId, SessionRecord>,
}

/// Thread-safe session table backed by a durable medium
pub struct SessionStore {
    records: RwLock<BTreeMap<SessionId, SessionRecord>>,
    /// Serializes "mutate in memory, then write the snapshot"
    write_lock: Mutex<()>,
    medium: Box<dyn StateMedium>,
    sealed: AtomicBool,
}

impl SessionStore {
    #[must_use]
    pub fn new(medium: impl StateMedium + 'static) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
            medium: Box::new(medium),
            sealed: AtomicBool::new(false),
        }
    }

    /// Store without durable backing (tests, no state file configured)
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryMedium::new())
    }

    /// Replace the in-memory table with the medium's snapshot.
    ///
    /// Returns the number of loaded records. A medium with no snapshot yet
    /// loads as an empty table.
    ///
    /// # Errors
    ///
    /// `Io`, `Sqlite` or `Deserialization` when the medium cannot be read
    /// or holds a snapshot that does not parse. The table is left untouched.
    pub fn load_all(&self) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(bytes) = self.medium.load()? else {
            tracing::debug!(medium = %self.medium.describe(), "No session snapshot yet");
            return Ok(0);
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let count = snapshot.sessions.len();
        *self.write_records() = snapshot.sessions;
        tracing::info!(medium = %self.medium.describe(), sessions = count, "Loaded session snapshot");
        Ok(count)
    }

    /// Step index and data of a session, `(0, None)` when absent
    #[must_use]
    pub fn get(&self, id: SessionId) -> Checkpoint {
        self.read_records()
            .get(&id)
            .map(|r| Checkpoint {
                step: r.step,
                data: r.data.clone(),
            })
            .unwrap_or_default()
    }

    /// Full record of a session
    #[must_use]
    pub fn record(&self, id: SessionId) -> Option<SessionRecord> {
        self.read_records().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.read_records().contains_key(&id)
    }

    /// Open a record for a conversation started by `event`
    ///
    /// # Errors
    ///
    /// `Sealed` after [`SessionStore::close`], or the medium's error when the
    /// snapshot cannot be written.
    pub fn start_with_event(&self, id: SessionId, chat_id: ChatId, event: &Update) -> StoreResult<()> {
        self.mutate(|records| {
            records.insert(
                id,
                SessionRecord {
                    chat_id,
                    first_event: event.clone(),
                    step: 0,
                    data: None,
                    started_at: Utc::now(),
                },
            );
            Ok(())
        })
    }

    /// Checkpoint the step index and user data of an open record
    ///
    /// # Errors
    ///
    /// `NotFound` without an open record, `Sealed` after
    /// [`SessionStore::close`], or the medium's error.
    pub fn save_step_and_data(&self, id: SessionId, step: usize, data: Value) -> StoreResult<()> {
        self.mutate(|records| {
            let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            record.step = step;
            record.data = Some(data);
            Ok(())
        })
    }

    /// Drop the record of a session; fails when there is none
    ///
    /// # Errors
    ///
    /// `NotFound` without a record, `Sealed` after [`SessionStore::close`],
    /// or the medium's error.
    pub fn remove(&self, id: SessionId) -> StoreResult<()> {
        self.mutate(|records| {
            records.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
        })
    }

    /// Sessions to resume, one per chat.
    ///
    /// If two records reference the same chat, only the most recent one
    /// (highest identifier) is listed.
    #[must_use]
    pub fn list_session_ids(&self) -> Vec<SessionId> {
        let records = self.read_records();
        let mut latest: HashMap<ChatId, SessionId> = HashMap::new();
        for (&id, record) in records.iter() {
            latest
                .entry(record.chat_id)
                .and_modify(|current| *current = (*current).max(id))
                .or_insert(id);
        }
        let mut ids: Vec<SessionId> = latest.into_values().collect();
        ids.sort_unstable();
        ids
    }

    /// Every stored identifier, including superseded ones
    #[must_use]
    pub fn all_session_ids(&self) -> Vec<SessionId> {
        self.read_records().keys().copied().collect()
    }

    #[must_use]
    pub fn max_session_id(&self) -> Option<SessionId> {
        self.read_records().keys().next_back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Refuse all further mutations so the last snapshot survives shutdown
    ///
    /// # Errors
    ///
    /// `AlreadySealed` on a second call.
    pub fn close(&self) -> StoreResult<()> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::AlreadySealed);
        }
        tracing::info!(medium = %self.medium.describe(), "Session store sealed");
        Ok(())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut BTreeMap<SessionId, SessionRecord>) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(StoreError::Sealed);
        }
        apply(&mut self.write_records())?;
        self.persist()
    }

    /// Serialize the whole table and hand it to the medium.
    /// Caller holds `write_lock`.
    fn persist(&self) -> StoreResult<()> {
        let bytes = {
            let records = self.read_records();
            serde_json::to_vec_pretty(&SnapshotRef {
                sessions: &records,
            })
            .map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        self.medium.save(&bytes)
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SessionId, SessionRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SessionId, SessionRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store_with_medium() -> (SessionStore, Arc<MemoryMedium>) {
        let medium = Arc::new(MemoryMedium::new());
        (SessionStore::new(medium.clone()), medium)
    }

    #[test]
    fn test_get_defaults_when_absent() {
        let store = SessionStore::in_memory();
        assert_eq!(store.get(42), Checkpoint::default());
        assert!(store.record(42).is_none());
    }

    #[test]
    fn test_start_then_checkpoint() {
        let (store, medium) = store_with_medium();
        let event = Update::text_message(1, 10, "/order");
        store.start_with_event(5, 10, &event).unwrap();
        store.save_step_and_data(5, 2, json!({"item": "tea"})).unwrap();

        assert_eq!(
            store.get(5),
            Checkpoint {
                step: 2,
                data: Some(json!({"item": "tea"})),
            }
        );
        let record = store.record(5).unwrap();
        assert_eq!(record.chat_id, 10);
        assert_eq!(record.first_event, event);
        assert_eq!(medium.save_count(), 2);
    }

    #[test]
    fn test_checkpoint_without_record_fails() {
        let store = SessionStore::in_memory();
        assert!(matches!(
            store.save_step_and_data(1, 0, Value::Null),
            Err(StoreError::NotFound(1))
        ));
    }

    #[test]
    fn test_remove_requires_record() {
        let store = SessionStore::in_memory();
        store.start_with_event(1, 1, &Update::text_message(1, 1, "a")).unwrap();
        store.remove(1).unwrap();
        assert!(matches!(store.remove(1), Err(StoreError::NotFound(1))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_reload_from_medium() {
        let medium = Arc::new(MemoryMedium::new());
        {
            let store = SessionStore::new(medium.clone());
            store.start_with_event(3, 30, &Update::text_message(1, 30, "x")).unwrap();
            store.save_step_and_data(3, 1, json!([1, 2])).unwrap();
        }
        let reloaded = SessionStore::new(medium);
        assert_eq!(reloaded.load_all().unwrap(), 1);
        assert_eq!(reloaded.get(3).step, 1);
        assert_eq!(reloaded.max_session_id(), Some(3));
    }

    #[test]
    fn test_load_garbage_fails() {
        let medium = MemoryMedium::with_contents(b"not json".to_vec());
        let store = SessionStore::new(medium);
        assert!(matches!(store.load_all(), Err(StoreError::Deserialization(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_keeps_latest_per_chat() {
        let store = SessionStore::in_memory();
        let event = Update::text_message(1, 7, "hi");
        store.start_with_event(1, 7, &event).unwrap();
        store.start_with_event(4, 7, &event).unwrap();
        store.start_with_event(2, 8, &event).unwrap();
        assert_eq!(store.list_session_ids(), vec![2, 4]);
        assert_eq!(store.all_session_ids(), vec![1, 2, 4]);
    }

    #[test]
    fn test_sealed_store_rejects_mutations() {
        let (store, medium) = store_with_medium();
        store.start_with_event(1, 1, &Update::text_message(1, 1, "a")).unwrap();
        store.close().unwrap();
        assert!(matches!(store.remove(1), Err(StoreError::Sealed)));
        assert!(store.contains(1));
        assert_eq!(medium.save_count(), 1);
        assert!(matches!(store.close(), Err(StoreError::AlreadySealed)));
    }

    #[test]
    fn test_save_failure_is_surfaced() {
        let (store, medium) = store_with_medium();
        medium.fail_saves(true);
        let result = store.start_with_event(1, 1, &Update::text_message(1, 1, "a"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
        // the in-memory table still reflects the mutation
        assert!(store.contains(1));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(n.into())),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn checkpoint_round_trips(id in 0u64..1000, step in 0usize..64, data in arb_json()) {
            let store = SessionStore::in_memory();
            store.start_with_event(id, 1, &Update::text_message(1, 1, "go")).unwrap();
            store.save_step_and_data(id, step, data.clone()).unwrap();
            prop_assert_eq!(store.get(id), Checkpoint { step, data: Some(data) });
        }

        #[test]
        fn listing_has_one_session_per_chat(entries in proptest::collection::vec((0u64..200, 0i64..8), 0..30)) {
            let store = SessionStore::in_memory();
            for (id, chat) in &entries {
                store.start_with_event(*id, *chat, &Update::text_message(1, *chat, "x")).unwrap();
            }
            let listed = store.list_session_ids();
            let mut chats: Vec<ChatId> = listed
                .iter()
                .map(|id| store.record(*id).unwrap().chat_id)
                .collect();
            let before = chats.len();
            chats.sort_unstable();
            chats.dedup();
            prop_assert_eq!(before, chats.len());
            for id in &listed {
                let chat = store.record(*id).unwrap().chat_id;
                let newest = store
                    .all_session_ids()
                    .into_iter()
                    .filter(|other| store.record(*other).unwrap().chat_id == chat)
                    .max();
                prop_assert_eq!(newest, Some(*id));
            }
        }
    }
}
