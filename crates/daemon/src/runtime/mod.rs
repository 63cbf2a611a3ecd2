// Shared editor runtime state: fencing locks, cooldown gates and
// force-save tracking.
//
// The in-memory implementation is the stand-in for a shared external
// store in multi-instance deployments; everything goes through the
// `EditorData` trait so a networked key-value implementation can be
// substituted without touching callers. Instances are injected, never
// ambient.

pub mod fencing;
pub mod force_save;

use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub use fencing::{LockName, UnlockOutcome};
pub use force_save::ForceSaveRequest;

use fencing::LockTable;
use force_save::ForceSaveTable;

/// Runtime state store shared by all sessions of one server instance.
///
/// All operations are per-key atomic check-and-set; contention is scoped
/// to one document/lock-name pair and callers retry by calling again.
pub trait EditorData: Send + Sync {
    fn try_lock(
        &self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        ttl_sec: u32,
        now: DateTime<Utc>,
    ) -> bool;

    fn try_unlock(
        &self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        now: DateTime<Utc>,
    ) -> UnlockOutcome;

    fn try_acquire_cooldown(&self, key: &str, ttl_sec: u32, now: DateTime<Utc>) -> bool;

    fn set_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        base_url: &str,
        change_info: Option<serde_json::Value>,
        convert_info: Option<serde_json::Value>,
    );

    fn force_save(&self, doc_id: &str) -> Option<ForceSaveRequest>;

    fn claim_force_save_start(&self, doc_id: &str) -> Option<ForceSaveRequest>;

    fn report_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        started: bool,
        ended: bool,
        convert_info: Option<serde_json::Value>,
    ) -> Option<ForceSaveRequest>;

    fn remove_force_save(&self, doc_id: &str);

    fn schedule_force_save_timer(&self, doc_id: &str, expire_at: DateTime<Utc>);

    fn expired_force_save_timers(&self, now: DateTime<Utc>) -> Vec<String>;

    /// Drop all runtime state for a document when its last session closes.
    fn clean_document(&self, doc_id: &str);
}

/// In-memory `EditorData` for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryEditorData {
    locks: Mutex<LockTable>,
    force_saves: Mutex<ForceSaveTable>,
}

impl MemoryEditorData {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.locks.lock().expect("lock table mutex should not be poisoned")
    }

    fn force_saves(&self) -> std::sync::MutexGuard<'_, ForceSaveTable> {
        self.force_saves.lock().expect("force-save table mutex should not be poisoned")
    }
}

impl EditorData for MemoryEditorData {
    fn try_lock(
        &self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        ttl_sec: u32,
        now: DateTime<Utc>,
    ) -> bool {
        self.locks().try_lock(doc_id, name, fencing_token, ttl_sec, now)
    }

    fn try_unlock(
        &self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        now: DateTime<Utc>,
    ) -> UnlockOutcome {
        self.locks().try_unlock(doc_id, name, fencing_token, now)
    }

    fn try_acquire_cooldown(&self, key: &str, ttl_sec: u32, now: DateTime<Utc>) -> bool {
        self.locks().try_acquire_cooldown(key, ttl_sec, now)
    }

    fn set_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        base_url: &str,
        change_info: Option<serde_json::Value>,
        convert_info: Option<serde_json::Value>,
    ) {
        self.force_saves().set(doc_id, time, index, base_url, change_info, convert_info);
    }

    fn force_save(&self, doc_id: &str) -> Option<ForceSaveRequest> {
        self.force_saves().get(doc_id)
    }

    fn claim_force_save_start(&self, doc_id: &str) -> Option<ForceSaveRequest> {
        self.force_saves().claim_start(doc_id)
    }

    fn report_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        started: bool,
        ended: bool,
        convert_info: Option<serde_json::Value>,
    ) -> Option<ForceSaveRequest> {
        self.force_saves().report(doc_id, time, index, started, ended, convert_info)
    }

    fn remove_force_save(&self, doc_id: &str) {
        self.force_saves().remove(doc_id);
    }

    fn schedule_force_save_timer(&self, doc_id: &str, expire_at: DateTime<Utc>) {
        self.force_saves().schedule_timer(doc_id, expire_at);
    }

    fn expired_force_save_timers(&self, now: DateTime<Utc>) -> Vec<String> {
        self.force_saves().expired_timers(now)
    }

    fn clean_document(&self, doc_id: &str) {
        self.locks().clean_document(doc_id);
        self.force_saves().clean_document(doc_id);
    }
}
