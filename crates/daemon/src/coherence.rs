// Cache coherence: decides on every re-open whether the locally cached
// document state is still valid against the host's authoritative
// version, and which lock id the new session should use.
//
// The rules: a record created by another protocol is refused outright; a
// clean unlock by a prior session or a pending version update arms a
// staleness check; the check compares the cached version/timestamp
// against the fresh snapshot and only a real difference purges the
// cache. The purge is guarded by the record's last-open timestamp so a
// concurrent fresh open that already repopulated the cache is not
// destroyed.

use anyhow::Result;
use tracing::{debug, warn};

use charta_common::callback_log;
use charta_common::types::FileInfoSnapshot;

use crate::store::{DocStorage, TaskStatus, TaskStore};

/// Outcome of the coherence check for one open request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDecision {
    /// Whether the cached document state may be reused as-is.
    pub reusable: bool,
    /// The lock id the session should join; `None` means establish a
    /// brand-new lock.
    pub lock_id: Option<String>,
    /// The record was not created for this protocol; the caller must
    /// refuse to treat it as a coherent cache.
    pub record_is_foreign: bool,
}

impl CacheDecision {
    fn fresh_open() -> Self {
        Self::default()
    }

    fn foreign() -> Self {
        Self { record_is_foreign: true, ..Self::default() }
    }

    fn reuse(lock_id: String) -> Self {
        Self { reusable: true, lock_id: Some(lock_id), record_is_foreign: false }
    }
}

/// Validate the cached state of `doc_id` against a fresh host snapshot.
pub async fn resolve(
    tasks: &dyn TaskStore,
    storage: &dyn DocStorage,
    doc_id: &str,
    fresh: &FileInfoSnapshot,
) -> Result<CacheDecision> {
    let Some(record) = tasks.select(doc_id)? else {
        // Nothing cached; the caller proceeds as a fresh open.
        return Ok(CacheDecision::fresh_open());
    };
    let Some(log) = record.callback_log.as_deref() else {
        return Ok(CacheDecision::fresh_open());
    };

    let common = match callback_log::common_info(log) {
        Ok(Some(common)) => common,
        Ok(None) => {
            warn!(doc_id, "attempt to open a record not created for this protocol");
            return Ok(CacheDecision::foreign());
        }
        Err(log_error) => {
            warn!(doc_id, error = %log_error, "callback log did not parse; treating record as foreign");
            return Ok(CacheDecision::foreign());
        }
    };
    let lock_id = common.lock_id.clone();
    debug!(doc_id, %lock_id, "cached lock id");

    let has_unlock_marker = callback_log::has_unlock_marker(log, &lock_id)?;
    let update_pending = record.status == TaskStatus::UpdateVersion;
    debug!(doc_id, has_unlock_marker, update_pending, "coherence triggers");

    if !has_unlock_marker && !update_pending {
        // An active collaboration holds the lock; rejoin it.
        return Ok(CacheDecision::reuse(lock_id));
    }

    let cached = &common.file_info;
    debug!(
        doc_id,
        cached_version = ?cached.version,
        fresh_version = ?fresh.version,
        cached_modified = ?cached.last_modified_time,
        fresh_modified = ?fresh.last_modified_time,
        "coherence comparison"
    );
    if cached.version == fresh.version && cached.last_modified_time == fresh.last_modified_time {
        // The trigger fired spuriously (e.g. a clean unlock with no
        // intervening host change); the cache is still good.
        return Ok(CacheDecision::reuse(lock_id));
    }

    // Stale: purge, guarded by the last-open timestamp read above. A false
    // result means a simultaneous open repopulated the record; that is
    // fine, the new session still starts from a fresh lock id.
    let purged = tasks.delete_if_open_at(doc_id, record.last_open_at)?;
    if purged {
        let removed = storage.delete_prefix(&format!("{doc_id}/")).await?;
        debug!(doc_id, removed, "stale cache purged");
    } else {
        debug!(doc_id, "purge skipped; record was repopulated concurrently");
    }

    Ok(CacheDecision { reusable: false, lock_id: None, record_is_foreign: false })
}
