use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::confirm::ConfirmToken;
use crate::dispatch::TaskRecord;

/// Storage seam for confirmation tokens.
///
/// Deliberately narrow (get / put / remove / sweep) so a multi-instance
/// deployment can swap in a shared key-value store without touching the
/// confirmation logic. `remove` is the atomic delete-on-read primitive:
/// of two concurrent redeems, exactly one observes the token.
pub trait ConfirmTokenStore: Send + Sync {
    fn get(&self, token: &str) -> Option<ConfirmToken>;
    fn put(&self, token: ConfirmToken);
    fn remove(&self, token: &str) -> Option<ConfirmToken>;
    /// Removes expired tokens; returns how many were dropped.
    fn sweep_expired(&self, now: DateTime<Utc>) -> usize;
}

/// Storage seam for task records.
///
/// All lease mutations go through single-key compare-and-swap on the
/// record version — no cross-key transactions exist, so a shared store
/// only needs per-key CAS to preserve the protocol's invariants.
pub trait TaskStore: Send + Sync {
    fn get(&self, execution_id: &Uuid) -> Option<TaskRecord>;
    /// Inserts a new record at version 1. Returns false if the id exists.
    fn insert(&self, record: TaskRecord) -> bool;
    /// Replaces the record only if its current version equals
    /// `expected_version`; the stored version is bumped on success.
    fn compare_and_swap(&self, expected_version: u64, record: TaskRecord) -> bool;
    fn list(&self) -> Vec<TaskRecord>;
    fn remove(&self, execution_id: &Uuid) -> Option<TaskRecord>;
}

/// In-process token store: a mutex-guarded map.
#[derive(Default)]
pub struct MemoryConfirmTokenStore {
    inner: Mutex<HashMap<String, ConfirmToken>>,
}

impl ConfirmTokenStore for MemoryConfirmTokenStore {
    fn get(&self, token: &str) -> Option<ConfirmToken> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(token).cloned()
    }

    fn put(&self, token: ConfirmToken) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(token.token.clone(), token);
    }

    fn remove(&self, token: &str) -> Option<ConfirmToken> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(token)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, token| token.expires_at > now);
        before - map.len()
    }
}

/// In-process task store: a mutex-guarded map with versioned records.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<HashMap<Uuid, TaskRecord>>,
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, execution_id: &Uuid) -> Option<TaskRecord> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(execution_id).cloned()
    }

    fn insert(&self, mut record: TaskRecord) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&record.execution_id) {
            return false;
        }
        record.version = 1;
        map.insert(record.execution_id, record);
        true
    }

    fn compare_and_swap(&self, expected_version: u64, mut record: TaskRecord) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&record.execution_id) {
            Some(current) if current.version == expected_version => {
                record.version = expected_version + 1;
                map.insert(record.execution_id, record);
                true
            }
            _ => false,
        }
    }

    fn list(&self) -> Vec<TaskRecord> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }

    fn remove(&self, execution_id: &Uuid) -> Option<TaskRecord> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TaskRecord;
    use relay_core::dispatch::TaskStatus;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new_pending(Uuid::now_v7(), "notes.search".to_string(), json!({}))
    }

    #[test]
    fn insert_rejects_duplicate_execution_ids() {
        let store = MemoryTaskStore::default();
        let rec = record();
        assert!(store.insert(rec.clone()));
        assert!(!store.insert(rec));
    }

    #[test]
    fn compare_and_swap_requires_matching_version() {
        let store = MemoryTaskStore::default();
        let rec = record();
        let id = rec.execution_id;
        store.insert(rec);

        let mut current = store.get(&id).unwrap();
        assert_eq!(current.version, 1);
        current.status = TaskStatus::Reserved;

        assert!(store.compare_and_swap(1, current.clone()));
        assert_eq!(store.get(&id).unwrap().version, 2);

        // Stale writer loses.
        assert!(!store.compare_and_swap(1, current));
    }

    #[test]
    fn token_sweep_drops_only_expired_entries() {
        use crate::confirm::ConfirmToken;
        let store = MemoryConfirmTokenStore::default();
        let now = Utc::now();
        store.put(ConfirmToken {
            token: "live".to_string(),
            workspace_id: Uuid::now_v7(),
            tool_name: "relay_run_notes_delete_archive".to_string(),
            action_preview: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        });
        store.put(ConfirmToken {
            token: "dead".to_string(),
            workspace_id: Uuid::now_v7(),
            tool_name: "relay_run_notes_delete_archive".to_string(),
            action_preview: None,
            created_at: now - chrono::Duration::seconds(600),
            expires_at: now - chrono::Duration::seconds(300),
        });

        assert_eq!(store.sweep_expired(now), 1);
        assert!(store.get("live").is_some());
        assert!(store.get("dead").is_none());
    }
}
