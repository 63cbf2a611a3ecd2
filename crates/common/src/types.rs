// Core domain types shared across all Charta crates.
//
// Wire names follow the host protocol: file-info fields are PascalCase
// exactly as WOPI-style hosts emit them, user-auth fields keep the
// query-parameter names they arrive under.

use serde::{Deserialize, Serialize};

/// File metadata snapshot as reported by the host's CheckFileInfo.
///
/// Hosts disagree on the shape of `Version` (string vs number), so it is
/// kept as raw JSON and compared by value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FileInfoSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_friendly_name: Option<String>,
    pub user_can_write: bool,
    pub supports_locks: bool,
    pub supports_get_lock: bool,
    pub supports_update: bool,
    pub supports_rename: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name_max_length: Option<u32>,
    /// Direct download URL provided by the host; used exactly as given and
    /// never signed (it does not necessarily embed the access token the
    /// proof would be computed over).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_source: Option<String>,
}

impl FileInfoSnapshot {
    /// Lowercased file type: `FileExtension` when present, else the suffix
    /// of `BaseFileName`.
    pub fn file_type(&self) -> String {
        if let Some(ext) = &self.file_extension {
            return ext.trim_start_matches('.').to_lowercase();
        }
        self.base_file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default()
    }
}

/// Session mode requested by the host action URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Edit,
    View,
}

/// Per-request host credentials. Passed through a request's lifetime,
/// never persisted on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAuth {
    pub wopi_src: String,
    #[serde(rename = "access_token")]
    pub access_token: String,
    #[serde(rename = "access_token_ttl")]
    pub access_token_ttl: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
}

/// Shared snapshot of a hosted file as last observed by this server:
/// the host-side lock id plus the file info it was taken against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonInfo {
    pub lock_id: String,
    pub file_info: FileInfoSnapshot,
}

/// Appended when a session cleanly releases its host lock. The next open
/// uses it as a staleness trigger for cache coherence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockMarker {
    pub unlock_id: String,
    pub user_auth: UserAuth,
}

/// Appended when the host reports a new modification time for the file
/// (e.g. in a PutFile response body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedMarker {
    pub last_modified_time: String,
    pub user_auth: UserAuth,
}

/// Everything a host-facing operation needs about an open document:
/// the cached common info, the caller's credentials, and the newest
/// modification time the log has recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct WopiParams {
    pub common_info: Option<CommonInfo>,
    pub user_auth: Option<UserAuth>,
    pub last_modified_time: Option<String>,
}
