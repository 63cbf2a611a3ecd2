// External collaborator interfaces: the relational task-record store and
// the document storage backend.
//
// Both are consumed behind traits; the real backends live outside this
// crate. The in-memory implementations here serve single-instance
// deployments and tests. All mutation is append-or-upsert — history is
// never edited in place, so concurrent readers never observe a partially
// written callback log.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persisted processing status of a document's task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Open and editable.
    Ok,
    /// A save of the current version is in flight.
    SaveVersion,
    /// A background version update is pending; the cache may be stale.
    UpdateVersion,
    /// The document is in an error state.
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::SaveVersion => "save_version",
            Self::UpdateVersion => "update_version",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "save_version" => Some(Self::SaveVersion),
            "update_version" => Some(Self::UpdateVersion),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One document's metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub doc_id: String,
    pub status: TaskStatus,
    /// Bumped on every open; the optimistic-concurrency guard for purges.
    pub last_open_at: DateTime<Utc>,
    /// Session counter; the index handed to the next session's log entry.
    pub user_index: i64,
    /// Opaque callback log column (see charta_common::callback_log).
    pub callback_log: Option<String>,
    pub base_url: Option<String>,
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_insert: bool,
    /// The session index assigned to this open.
    pub user_index: i64,
}

/// The relational task-record store (external collaborator).
pub trait TaskStore: Send + Sync {
    fn select(&self, doc_id: &str) -> Result<Option<TaskRecord>>;

    /// Insert a fresh record, or bump `user_index` and `last_open_at` on an
    /// existing one. `status` and `base_url` apply to the insert case only;
    /// an existing record keeps its status.
    fn upsert(
        &self,
        doc_id: &str,
        status: TaskStatus,
        base_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Concatenate a pre-serialized log fragment onto the callback column.
    fn append_callback(&self, doc_id: &str, fragment: &str) -> Result<bool>;

    fn update_status(&self, doc_id: &str, status: TaskStatus) -> Result<bool>;

    /// Guarded delete: removes the record only while `last_open_at` still
    /// matches, so a concurrent re-open that already repopulated the record
    /// is not destroyed. Returns whether a row was removed.
    fn delete_if_open_at(&self, doc_id: &str, last_open_at: DateTime<Utc>) -> Result<bool>;
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.records.lock().expect("task store mutex should not be poisoned")
    }
}

impl TaskStore for MemoryTaskStore {
    fn select(&self, doc_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records().get(doc_id).cloned())
    }

    fn upsert(
        &self,
        doc_id: &str,
        status: TaskStatus,
        base_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut records = self.records();
        if let Some(record) = records.get_mut(doc_id) {
            record.user_index += 1;
            record.last_open_at = now;
            return Ok(UpsertOutcome { is_insert: false, user_index: record.user_index });
        }
        records.insert(
            doc_id.to_string(),
            TaskRecord {
                doc_id: doc_id.to_string(),
                status,
                last_open_at: now,
                user_index: 1,
                callback_log: None,
                base_url: base_url.map(str::to_string),
            },
        );
        Ok(UpsertOutcome { is_insert: true, user_index: 1 })
    }

    fn append_callback(&self, doc_id: &str, fragment: &str) -> Result<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(doc_id) else {
            return Ok(false);
        };
        match &mut record.callback_log {
            Some(log) => log.push_str(fragment),
            None => record.callback_log = Some(fragment.to_string()),
        }
        Ok(true)
    }

    fn update_status(&self, doc_id: &str, status: TaskStatus) -> Result<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(doc_id) else {
            return Ok(false);
        };
        record.status = status;
        Ok(true)
    }

    fn delete_if_open_at(&self, doc_id: &str, last_open_at: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records();
        let matches = records
            .get(doc_id)
            .map(|record| record.last_open_at == last_open_at)
            .unwrap_or(false);
        if matches {
            records.remove(doc_id);
        }
        Ok(matches)
    }
}

/// TTL class for signed storage URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlTtl {
    /// Short-lived editor download links.
    Standard,
    /// Long-lived links embedded in callbacks.
    Long,
}

/// The document storage backend (external collaborator).
#[async_trait]
pub trait DocStorage: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn put(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Remove every object under `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
    async fn sign_url(&self, path: &str, ttl: UrlTtl) -> Result<String>;
}

/// In-memory document storage.
#[derive(Debug, Default)]
pub struct MemoryDocStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDocStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().expect("storage mutex should not be poisoned")
    }
}

#[async_trait]
impl DocStorage for MemoryDocStorage {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.objects().get(path).cloned().ok_or_else(|| anyhow!("no object at `{path}`"))
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> =
            self.objects().keys().filter(|path| path.starts_with(prefix)).cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut objects = self.objects();
        let before = objects.len();
        objects.retain(|path, _| !path.starts_with(prefix));
        Ok(before - objects.len())
    }

    async fn sign_url(&self, path: &str, ttl: UrlTtl) -> Result<String> {
        let ttl_tag = match ttl {
            UrlTtl::Standard => "standard",
            UrlTtl::Long => "long",
        };
        Ok(format!("memory://{path}?ttl={ttl_tag}"))
    }
}
