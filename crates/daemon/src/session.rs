// Document session orchestration: open, save, close and force-save.
//
// Ties the pieces together: an open request first runs the coherence
// check, then joins or establishes the host lock; saves commit bytes to
// the host under the save fencing lock; a close releases the host lock
// and leaves an unlock marker for the next open's coherence check; the
// force-save sweep drives timeout saves through the coordinator.
//
// Whatever goes wrong, the end user sees one opaque "document
// unavailable" status — the distinctions live in logs and in the typed
// error consumed by the transport layer.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use charta_common::callback_log::{self, LogEntry, LogPayload, COMMON_INFO_INDEX};
use charta_common::types::{
    CommonInfo, FileInfoSnapshot, ModifiedMarker, SessionMode, UnlockMarker, UserAuth, WopiParams,
};

use crate::coherence;
use crate::config::WopiConfig;
use crate::runtime::{EditorData, LockName};
use crate::store::{DocStorage, TaskStatus, TaskStore, UrlTtl};
use crate::wopi::transport::WopiTransport;
use crate::wopi::{LockCommand, WopiClient};

const DOC_ID_MAX_LENGTH: usize = 128;

// ── Errors ──────────────────────────────────────────────────────────

/// Failure of a session operation. All variants render identically to
/// the end user; the variant is for the transport layer and the logs.
#[derive(Debug)]
pub enum SessionError {
    /// The host did not answer (or answered garbage).
    HostUnavailable,
    /// The metadata record was not created for this protocol; trusting it
    /// could corrupt another protocol's data.
    ForeignRecord,
    /// The host refused the lock.
    LockRefused,
    /// A store failure.
    Internal(anyhow::Error),
}

impl SessionError {
    /// The only message an end user ever sees.
    pub fn user_message(&self) -> &'static str {
        "document unavailable"
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostUnavailable => write!(f, "host unavailable"),
            Self::ForeignRecord => write!(f, "record belongs to another protocol"),
            Self::LockRefused => write!(f, "host refused the lock"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

fn internal<E: Into<anyhow::Error>>(error: E) -> SessionError {
    SessionError::Internal(error.into())
}

// ── Requests and outcomes ───────────────────────────────────────────

/// Parameters of an inbound open request, as the host action URL and
/// body deliver them.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub file_id: String,
    pub wopi_src: String,
    pub access_token: String,
    pub access_token_ttl: i64,
    pub host_session_id: Option<String>,
    pub session_context: Option<String>,
    pub mode: SessionMode,
    pub base_url: String,
}

/// What the session handler gets back from a successful open.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub doc_id: String,
    /// The host lock id this session joined or established. `None` for
    /// view sessions.
    pub lock_id: Option<String>,
    pub file_info: FileInfoSnapshot,
    /// Whether the cached document state was reused.
    pub reusable: bool,
    /// This session's slot in the callback log.
    pub user_index: i64,
    /// The credentials to pass back into save/close calls.
    pub user_auth: UserAuth,
    /// Signed URL of the cached document bytes, when reusable.
    pub document_url: Option<String>,
}

/// Flags carried on a save.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveFlags {
    pub is_modified_by_user: bool,
    pub is_autosave: bool,
    pub is_exit_save: bool,
}

/// Result of a save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save holds the fencing lock; retry after its TTL.
    Busy,
}

/// Session-layer tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub save_lock_ttl_sec: u32,
    pub auth_lock_ttl_sec: u32,
    pub force_save_delay_sec: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { save_lock_ttl_sec: 60, auth_lock_ttl_sec: 60, force_save_delay_sec: 5 }
    }
}

impl SessionOptions {
    pub fn from_config(config: &WopiConfig) -> Self {
        Self {
            save_lock_ttl_sec: config.save_lock_ttl_sec,
            auth_lock_ttl_sec: config.auth_lock_ttl_sec,
            force_save_delay_sec: config.force_save_delay_sec,
        }
    }
}

// ── The manager ─────────────────────────────────────────────────────

/// Orchestrates document sessions against one host protocol client and
/// one set of injected stores.
pub struct DocumentManager<T: WopiTransport> {
    client: WopiClient<T>,
    runtime: Arc<dyn EditorData>,
    tasks: Arc<dyn TaskStore>,
    storage: Arc<dyn DocStorage>,
    options: SessionOptions,
}

impl<T: WopiTransport> DocumentManager<T> {
    pub fn new(
        client: WopiClient<T>,
        runtime: Arc<dyn EditorData>,
        tasks: Arc<dyn TaskStore>,
        storage: Arc<dyn DocStorage>,
        options: SessionOptions,
    ) -> Self {
        Self { client, runtime, tasks, storage, options }
    }

    // ── Open ────────────────────────────────────────────────────────

    pub async fn open_document(&self, request: OpenRequest) -> Result<OpenOutcome, SessionError> {
        let correlation_id = Uuid::new_v4();
        info!(%correlation_id, file_id = %request.file_id, "open_document start");
        let result = self.open_inner(&request, correlation_id).await;
        match &result {
            Ok(outcome) => {
                info!(%correlation_id, doc_id = %outcome.doc_id, reusable = outcome.reusable, "open_document end");
            }
            Err(session_error) => {
                warn!(%correlation_id, error = %session_error, "open_document failed");
            }
        }
        result
    }

    async fn open_inner(
        &self,
        request: &OpenRequest,
        correlation_id: Uuid,
    ) -> Result<OpenOutcome, SessionError> {
        let Some(file_info) = self
            .client
            .check_file_info(
                &request.wopi_src,
                &request.access_token,
                request.session_context.as_deref(),
            )
            .await
        else {
            return Err(SessionError::HostUnavailable);
        };

        let mut mode = request.mode;
        if !file_info.user_can_write {
            mode = SessionMode::View;
        }
        let doc_id = derive_doc_id(&request.file_id, mode, &file_info);
        debug!(%doc_id, ?mode, "derived document id");

        let user_auth = UserAuth {
            wopi_src: request.wopi_src.clone(),
            access_token: request.access_token.clone(),
            access_token_ttl: request.access_token_ttl,
            host_session_id: request.host_session_id.clone(),
            user_session_id: Some(doc_id.clone()),
            mode: Some(mode),
        };

        let decision =
            coherence::resolve(self.tasks.as_ref(), self.storage.as_ref(), &doc_id, &file_info)
                .await?;
        if decision.record_is_foreign {
            return Err(SessionError::ForeignRecord);
        }

        let now = Utc::now();
        let upserted =
            self.tasks.upsert(&doc_id, TaskStatus::Ok, Some(&request.base_url), now)?;
        debug!(
            %doc_id,
            is_insert = upserted.is_insert,
            user_index = upserted.user_index,
            "task record upserted"
        );

        let lock_id = match decision.lock_id.clone() {
            Some(lock_id) => lock_id,
            None => {
                // Deterministic lock id (the doc id itself) so orphaned
                // host locks can be recovered after integrator failures.
                let lock_id = doc_id.clone();
                let guard_token = correlation_id.to_string();
                if self.runtime.try_lock(
                    &doc_id,
                    LockName::Auth,
                    &guard_token,
                    self.options.auth_lock_ttl_sec,
                    now,
                ) {
                    let common = CommonInfo { lock_id: lock_id.clone(), file_info: file_info.clone() };
                    let entry = LogEntry::new(COMMON_INFO_INDEX, LogPayload::CommonInfo(common));
                    let fragment = entry.to_stored().map_err(internal)?;
                    self.tasks.append_callback(&doc_id, &fragment)?;
                    self.runtime.try_unlock(&doc_id, LockName::Auth, &guard_token, Utc::now());
                } else {
                    // A simultaneous open is registering the document; the
                    // lock id is deterministic, so just use it.
                    debug!(%doc_id, "another session is registering the document");
                }
                lock_id
            }
        };

        if mode == SessionMode::Edit && file_info.supports_locks {
            let locked = self
                .client
                .lock(LockCommand::Lock, &lock_id, &file_info, Some(&user_auth))
                .await;
            if !locked {
                return Err(SessionError::LockRefused);
            }
        }

        let document_url = if decision.reusable {
            self.storage.sign_url(&latest_path(&doc_id), UrlTtl::Standard).await.ok()
        } else {
            None
        };

        Ok(OpenOutcome {
            lock_id: (mode == SessionMode::Edit).then_some(lock_id),
            doc_id,
            file_info,
            reusable: decision.reusable,
            user_index: upserted.user_index,
            user_auth,
            document_url,
        })
    }

    // ── Save ────────────────────────────────────────────────────────

    pub async fn save_document(
        &self,
        doc_id: &str,
        payload: &[u8],
        editor_id: &str,
        user_auth: &UserAuth,
        user_index: i64,
        flags: SaveFlags,
    ) -> Result<SaveOutcome, SessionError> {
        info!(doc_id, editor_id, size = payload.len(), "save_document start");
        let now = Utc::now();
        if !self.runtime.try_lock(
            doc_id,
            LockName::Save,
            editor_id,
            self.options.save_lock_ttl_sec,
            now,
        ) {
            info!(doc_id, "save already in flight");
            return Ok(SaveOutcome::Busy);
        }

        let result = self.save_inner(doc_id, payload, editor_id, user_auth, user_index, flags).await;
        self.runtime.try_unlock(doc_id, LockName::Save, editor_id, Utc::now());
        info!(doc_id, ok = result.is_ok(), "save_document end");
        result
    }

    async fn save_inner(
        &self,
        doc_id: &str,
        payload: &[u8],
        editor_id: &str,
        user_auth: &UserAuth,
        user_index: i64,
        flags: SaveFlags,
    ) -> Result<SaveOutcome, SessionError> {
        let params = self.wopi_params(doc_id, user_auth)?;
        if params.common_info.is_none() {
            return Err(SessionError::ForeignRecord);
        }

        // Refresh the local cache first; the host commit works from the
        // same bytes on a later timeout save.
        self.storage.put(&latest_path(doc_id), payload).await?;

        let response = self
            .client
            .put_file(
                &params,
                payload,
                editor_id,
                flags.is_modified_by_user,
                flags.is_autosave,
                flags.is_exit_save,
            )
            .await;
        let Some(outcome) = response else {
            return Err(SessionError::HostUnavailable);
        };

        if let Some(modified) = outcome.last_modified_time {
            self.append_modified_marker(doc_id, user_index, &modified, user_auth)?;
        }
        self.tasks.update_status(doc_id, TaskStatus::Ok)?;
        Ok(SaveOutcome::Saved)
    }

    // ── Close ───────────────────────────────────────────────────────

    pub async fn close_document(
        &self,
        doc_id: &str,
        user_auth: &UserAuth,
        user_index: i64,
    ) -> Result<(), SessionError> {
        info!(doc_id, "close_document start");
        let params = self.wopi_params(doc_id, user_auth)?;
        match &params.common_info {
            Some(common) => {
                if self.client.unlock(&params).await {
                    // Record the clean release; the next open's coherence
                    // check consumes it.
                    let marker = UnlockMarker {
                        unlock_id: common.lock_id.clone(),
                        user_auth: user_auth.clone(),
                    };
                    let entry = LogEntry::new(user_index, LogPayload::Unlock(marker));
                    let fragment = entry.to_stored().map_err(internal)?;
                    self.tasks.append_callback(doc_id, &fragment)?;
                } else {
                    // Host kept the lock (or is down); the next open simply
                    // rejoins it.
                    warn!(doc_id, "host unlock did not complete; lock left in place");
                }
            }
            None => debug!(doc_id, "close without common info; nothing to release"),
        }

        self.runtime.clean_document(doc_id);
        info!(doc_id, "close_document end");
        Ok(())
    }

    // ── Force save ──────────────────────────────────────────────────

    /// Register a force-save request and arm its timeout. The latest
    /// request per document wins.
    pub fn request_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        base_url: &str,
        user_auth: &UserAuth,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let change_info = serde_json::to_value(user_auth).map_err(internal)?;
        self.runtime.set_force_save(doc_id, time, index, base_url, Some(change_info), None);
        self.runtime.schedule_force_save_timer(
            doc_id,
            now + Duration::seconds(i64::from(self.options.force_save_delay_sec)),
        );
        debug!(doc_id, time, index, "force save requested");
        Ok(())
    }

    /// Drive every due force-save once. Returns `(doc_id, saved)` pairs
    /// for the documents that were attempted.
    pub async fn sweep_force_saves(&self, now: DateTime<Utc>) -> Vec<(String, bool)> {
        let due = self.runtime.expired_force_save_timers(now);
        let mut attempted = Vec::with_capacity(due.len());
        for doc_id in due {
            let Some(request) = self.runtime.claim_force_save_start(&doc_id) else {
                // Already claimed by a concurrent sweep.
                debug!(%doc_id, "force save already started elsewhere");
                continue;
            };
            let saved = self.run_force_save(&doc_id, request.time, request.index, &request).await;
            attempted.push((doc_id, saved));
        }
        attempted
    }

    async fn run_force_save(
        &self,
        doc_id: &str,
        time: i64,
        index: i64,
        request: &crate::runtime::ForceSaveRequest,
    ) -> bool {
        info!(doc_id, time, index, "force save start");
        let user_auth: Option<UserAuth> = request
            .change_info
            .clone()
            .and_then(|value| serde_json::from_value(value).ok());
        let Some(user_auth) = user_auth else {
            warn!(doc_id, "force save request carries no usable credentials");
            self.report_force_save(doc_id, time, index, false, false);
            return false;
        };

        let params = match self.wopi_params(doc_id, &user_auth) {
            Ok(params) if params.common_info.is_some() => params,
            Ok(_) => {
                warn!(doc_id, "force save without common info");
                self.report_force_save(doc_id, time, index, false, false);
                return false;
            }
            Err(session_error) => {
                warn!(doc_id, error = %session_error, "force save could not load params");
                self.report_force_save(doc_id, time, index, false, false);
                return false;
            }
        };

        let payload = match self.storage.get(&latest_path(doc_id)).await {
            Ok(payload) => payload,
            Err(storage_error) => {
                warn!(doc_id, error = format!("{storage_error:#}"), "no cached bytes to force-save");
                self.report_force_save(doc_id, time, index, false, false);
                return false;
            }
        };

        let response = self.client.put_file(&params, &payload, "autosave", false, true, false).await;
        let saved = response.is_some();
        if saved {
            self.report_force_save(doc_id, time, index, true, true);
        } else {
            // Reset so a later sweep can retry the same request.
            self.report_force_save(doc_id, time, index, false, false);
        }
        info!(doc_id, saved, "force save end");
        saved
    }

    fn report_force_save(&self, doc_id: &str, time: i64, index: i64, started: bool, ended: bool) {
        if self
            .runtime
            .report_force_save(doc_id, time, index, started, ended, None)
            .is_none()
        {
            debug!(doc_id, time, index, "stale force-save completion dropped");
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// Reconstruct the host-operation parameters for a document from the
    /// caller's credentials plus the stored callback log.
    fn wopi_params(&self, doc_id: &str, user_auth: &UserAuth) -> Result<WopiParams, SessionError> {
        let record = self.tasks.select(doc_id)?;
        let log = record.as_ref().and_then(|r| r.callback_log.as_deref());

        let (common_info, last_modified_time) = match log {
            Some(log) => {
                let common = callback_log::common_info(log).map_err(internal)?;
                let from_markers = callback_log::last_modified_time(log).map_err(internal)?;
                let last_modified = from_markers.or_else(|| {
                    common.as_ref().and_then(|c| c.file_info.last_modified_time.clone())
                });
                (common, last_modified)
            }
            None => (None, None),
        };

        Ok(WopiParams {
            common_info,
            user_auth: Some(user_auth.clone()),
            last_modified_time,
        })
    }

    fn append_modified_marker(
        &self,
        doc_id: &str,
        user_index: i64,
        last_modified_time: &str,
        user_auth: &UserAuth,
    ) -> Result<(), SessionError> {
        let marker = ModifiedMarker {
            last_modified_time: last_modified_time.to_string(),
            user_auth: user_auth.clone(),
        };
        let entry = LogEntry::new(user_index, LogPayload::Modified(marker));
        let fragment = entry.to_stored().map_err(internal)?;
        self.tasks.append_callback(doc_id, &fragment)?;
        Ok(())
    }
}

// ── Doc id derivation ───────────────────────────────────────────────

fn latest_path(doc_id: &str) -> String {
    format!("{doc_id}/latest.bin")
}

/// Edit sessions cache under the host file id; view sessions get a
/// revision-scoped id so viewers of different revisions never share a
/// cache entry.
fn derive_doc_id(file_id: &str, mode: SessionMode, file_info: &FileInfoSnapshot) -> String {
    let raw = match mode {
        SessionMode::Edit => file_id.to_string(),
        SessionMode::View => match (&file_info.last_modified_time, &file_info.version) {
            (Some(modified), _) => format!("view.{file_id}.{modified}"),
            (None, Some(version)) => format!("view.{file_id}.{}", version_label(version)),
            (None, None) => format!("view.{file_id}"),
        },
    };
    sanitize_doc_id(&raw)
}

fn version_label(version: &Value) -> String {
    match version {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sanitize_doc_id(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_' | '=') {
                ch
            } else {
                '_'
            }
        })
        .take(DOC_ID_MAX_LENGTH)
        .collect()
}
