// Force-save request tracking per document.
//
// One live request per document; `(time, index)` is its identity. A new
// request always supersedes the in-flight one, and a completion report
// for a superseded identity is dropped. A parallel timer map drives
// timeout-based saves: first registration wins, the sweep returns and
// removes everything past its deadline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The live force-save request for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceSaveRequest {
    /// Request timestamp (milliseconds); half of the request identity.
    pub time: i64,
    /// Change-set index at request time; the other half of the identity.
    pub index: i64,
    /// Callback base URL the save result is reported against.
    pub base_url: String,
    /// Opaque description of the change that triggered the request.
    pub change_info: Option<serde_json::Value>,
    /// Opaque conversion state carried across retries.
    pub convert_info: Option<serde_json::Value>,
    pub started: bool,
    pub ended: bool,
}

/// In-memory force-save state for one store instance.
#[derive(Debug, Default)]
pub struct ForceSaveTable {
    requests: HashMap<String, ForceSaveRequest>,
    timers: HashMap<String, DateTime<Utc>>,
}

impl ForceSaveTable {
    /// Register a request. Always overwrites — the latest request wins.
    pub fn set(
        &mut self,
        doc_id: &str,
        time: i64,
        index: i64,
        base_url: &str,
        change_info: Option<serde_json::Value>,
        convert_info: Option<serde_json::Value>,
    ) {
        self.requests.insert(
            doc_id.to_string(),
            ForceSaveRequest {
                time,
                index,
                base_url: base_url.to_string(),
                change_info,
                convert_info,
                started: false,
                ended: false,
            },
        );
    }

    pub fn get(&self, doc_id: &str) -> Option<ForceSaveRequest> {
        self.requests.get(doc_id).cloned()
    }

    /// Claim the live request for execution.
    ///
    /// Returns it and marks it started only if it has not been started yet,
    /// so concurrent workers cannot run the same save twice.
    pub fn claim_start(&mut self, doc_id: &str) -> Option<ForceSaveRequest> {
        let request = self.requests.get_mut(doc_id)?;
        if request.started {
            return None;
        }
        request.started = true;
        request.ended = false;
        Some(request.clone())
    }

    /// Apply a completion report, but only if `(time, index)` still
    /// identifies the live request. A report for a superseded request is a
    /// no-op returning `None`.
    pub fn report(
        &mut self,
        doc_id: &str,
        time: i64,
        index: i64,
        started: bool,
        ended: bool,
        convert_info: Option<serde_json::Value>,
    ) -> Option<ForceSaveRequest> {
        let request = self.requests.get_mut(doc_id)?;
        if request.time != time || request.index != index {
            return None;
        }
        request.started = started;
        request.ended = ended;
        request.convert_info = convert_info;
        Some(request.clone())
    }

    pub fn remove(&mut self, doc_id: &str) {
        self.requests.remove(doc_id);
    }

    /// Register a timeout deadline for a document. First registration wins;
    /// later calls while a deadline is pending do not move it.
    pub fn schedule_timer(&mut self, doc_id: &str, expire_at: DateTime<Utc>) {
        self.timers.entry(doc_id.to_string()).or_insert(expire_at);
    }

    /// Return and remove every document whose deadline has passed.
    pub fn expired_timers(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = self
            .timers
            .iter()
            .filter(|(_, expire_at)| **expire_at < now)
            .map(|(doc_id, _)| doc_id.clone())
            .collect();
        for doc_id in &due {
            self.timers.remove(doc_id);
        }
        due
    }

    /// Drop all force-save state for a document.
    pub fn clean_document(&mut self, doc_id: &str) {
        self.requests.remove(doc_id);
        self.timers.remove(doc_id);
    }
}
