// The callback log: several logical values multiplexed into one opaque
// text column of the task record.
//
// Storage format: each entry is the delimiter character followed by its
// JSON form, concatenated in append order. A stored string that does not
// begin with the delimiter is legacy data — a single raw callback URL —
// and is never parsed as entries.
//
// Entry payloads are a tagged variant type. The entry at user index 1 is
// reserved for the document's shared common info when the document is
// hosted over the WOPI-style protocol; other indices hold per-session
// callback URLs or markers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CommonInfo, ModifiedMarker, UnlockMarker};

/// Separates serialized entries inside the stored string. Control
/// character, so it cannot occur in a URL or in JSON output.
pub const DELIMITER: char = '\u{0005}';

/// User index reserved for the shared common-info entry.
pub const COMMON_INFO_INDEX: i64 = 1;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("callback log entry {index} is not valid JSON: {source}")]
    Entry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Payload of one log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LogPayload {
    /// A plain per-session callback URL.
    RawUrl(String),
    /// The shared common info for a hosted document.
    CommonInfo(CommonInfo),
    /// A clean host-lock release by a prior session.
    Unlock(UnlockMarker),
    /// A host-reported modification time.
    Modified(ModifiedMarker),
}

impl LogPayload {
    pub fn as_raw_url(&self) -> Option<&str> {
        match self {
            Self::RawUrl(url) => Some(url),
            _ => None,
        }
    }

    pub fn as_common_info(&self) -> Option<&CommonInfo> {
        match self {
            Self::CommonInfo(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_unlock_marker(&self) -> Option<&UnlockMarker> {
        match self {
            Self::Unlock(marker) => Some(marker),
            _ => None,
        }
    }

    pub fn as_modified_marker(&self) -> Option<&ModifiedMarker> {
        match self {
            Self::Modified(marker) => Some(marker),
            _ => None,
        }
    }

    /// Whether this payload is a marker rather than a callback URL or the
    /// common info.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Unlock(_) | Self::Modified(_))
    }
}

/// One appended entry: which session slot it belongs to and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub user_index: i64,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn new(user_index: i64, payload: LogPayload) -> Self {
        Self { user_index, payload }
    }

    /// The fragment appended to the stored column: delimiter + JSON.
    pub fn to_stored(&self) -> Result<String, serde_json::Error> {
        let mut fragment = String::from(DELIMITER);
        fragment.push_str(&serde_json::to_string(self)?);
        Ok(fragment)
    }
}

/// True iff the stored string is a legacy single raw URL.
pub fn is_legacy(log: &str) -> bool {
    !log.starts_with(DELIMITER)
}

/// Append `entry` to an existing stored log (or start a fresh one).
pub fn append(existing: Option<&str>, entry: &LogEntry) -> Result<String, serde_json::Error> {
    let mut log = existing.unwrap_or_default().to_string();
    log.push_str(&entry.to_stored()?);
    Ok(log)
}

/// All entries in append order. A legacy log is represented as a single
/// raw-URL entry in the reserved slot.
pub fn entries(log: &str) -> Result<Vec<LogEntry>, LogError> {
    if log.is_empty() {
        return Ok(Vec::new());
    }
    if is_legacy(log) {
        return Ok(vec![LogEntry::new(COMMON_INFO_INDEX, LogPayload::RawUrl(log.to_string()))]);
    }
    log.split(DELIMITER)
        .skip(1)
        .enumerate()
        .map(|(index, chunk)| {
            serde_json::from_str(chunk).map_err(|source| LogError::Entry { index, source })
        })
        .collect()
}

/// All payloads in append order.
pub fn payloads(log: &str) -> Result<Vec<LogPayload>, LogError> {
    Ok(entries(log)?.into_iter().map(|entry| entry.payload).collect())
}

/// Payload of the entry with the given user index.
///
/// Scans in append order; when no entry matches, the payload of the last
/// entry is returned instead. The fallback is long-standing behavior that
/// callers rely on (see DESIGN.md).
pub fn payload_by_index(log: &str, user_index: i64) -> Result<Option<LogPayload>, LogError> {
    let entries = entries(log)?;
    let mut found = None;
    for entry in entries {
        let matched = entry.user_index == user_index;
        found = Some(entry.payload);
        if matched {
            break;
        }
    }
    Ok(found)
}

/// The shared common info, if the reserved slot holds one.
pub fn common_info(log: &str) -> Result<Option<CommonInfo>, LogError> {
    Ok(payload_by_index(log, COMMON_INFO_INDEX)?
        .and_then(|payload| payload.as_common_info().cloned()))
}

/// Whether the log records a clean release of the given host lock id.
pub fn has_unlock_marker(log: &str, lock_id: &str) -> Result<bool, LogError> {
    Ok(entries(log)?
        .iter()
        .filter_map(|entry| entry.payload.as_unlock_marker())
        .any(|marker| marker.unlock_id == lock_id))
}

/// The newest host-reported modification time recorded in the log.
pub fn last_modified_time(log: &str) -> Result<Option<String>, LogError> {
    Ok(entries(log)?
        .iter()
        .rev()
        .find_map(|entry| {
            entry.payload.as_modified_marker().map(|marker| marker.last_modified_time.clone())
        }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::{FileInfoSnapshot, UserAuth};

    fn auth() -> UserAuth {
        UserAuth {
            wopi_src: "https://host.test/wopi/files/42".into(),
            access_token: "tok".into(),
            access_token_ttl: 0,
            host_session_id: None,
            user_session_id: None,
            mode: None,
        }
    }

    fn url_entry(user_index: i64, url: &str) -> LogEntry {
        LogEntry::new(user_index, LogPayload::RawUrl(url.to_string()))
    }

    fn build_log(entries: &[LogEntry]) -> String {
        let mut log: Option<String> = None;
        for entry in entries {
            log = Some(append(log.as_deref(), entry).expect("append should serialize"));
        }
        log.unwrap_or_default()
    }

    #[test]
    fn round_trip_preserves_append_order() {
        let appended = vec![
            url_entry(2, "https://a.test/cb"),
            url_entry(3, "https://b.test/cb"),
            url_entry(4, "https://c.test/cb"),
        ];
        let log = build_log(&appended);

        assert!(!is_legacy(&log));
        assert_eq!(entries(&log).expect("log should parse"), appended);
    }

    #[test]
    fn by_index_returns_matching_entry() {
        let log = build_log(&[url_entry(2, "https://a.test"), url_entry(3, "https://b.test")]);
        let payload = payload_by_index(&log, 2).expect("log should parse").expect("entry");
        assert_eq!(payload.as_raw_url(), Some("https://a.test"));
    }

    #[test]
    fn by_index_falls_back_to_last_entry_on_miss() {
        let log = build_log(&[url_entry(2, "https://a.test"), url_entry(3, "https://b.test")]);
        let payload = payload_by_index(&log, 99).expect("log should parse").expect("entry");
        assert_eq!(payload.as_raw_url(), Some("https://b.test"));
    }

    #[test]
    fn by_index_on_empty_log_is_none() {
        assert!(payload_by_index("", 1).expect("empty log should parse").is_none());
    }

    #[test]
    fn legacy_raw_url_is_returned_unchanged() {
        let log = "https://legacy.test/callback?doc=1";
        assert!(is_legacy(log));

        let all = payloads(log).expect("legacy log should parse");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].as_raw_url(), Some(log));

        // Index lookups on a legacy log always resolve to the raw URL.
        let payload = payload_by_index(log, 7).expect("legacy log should parse").expect("entry");
        assert_eq!(payload.as_raw_url(), Some(log));
    }

    #[test]
    fn legacy_log_has_no_common_info() {
        assert!(common_info("https://legacy.test/cb").expect("legacy log should parse").is_none());
    }

    #[test]
    fn common_info_reads_reserved_slot() {
        let info = CommonInfo {
            lock_id: "doc-42".into(),
            file_info: FileInfoSnapshot {
                version: Some(serde_json::json!("5")),
                ..Default::default()
            },
        };
        let log = build_log(&[
            LogEntry::new(COMMON_INFO_INDEX, LogPayload::CommonInfo(info.clone())),
            url_entry(2, "https://a.test"),
        ]);

        assert_eq!(common_info(&log).expect("log should parse"), Some(info));
    }

    #[test]
    fn common_info_requires_the_common_info_variant() {
        // A raw URL sitting in slot 1 is not common info.
        let log = build_log(&[url_entry(COMMON_INFO_INDEX, "https://a.test")]);
        assert!(common_info(&log).expect("log should parse").is_none());
    }

    #[test]
    fn unlock_marker_is_found_by_lock_id() {
        let marker = UnlockMarker { unlock_id: "doc-42".into(), user_auth: auth() };
        let log = build_log(&[
            url_entry(2, "https://a.test"),
            LogEntry::new(2, LogPayload::Unlock(marker)),
        ]);

        assert!(has_unlock_marker(&log, "doc-42").expect("log should parse"));
        assert!(!has_unlock_marker(&log, "other-lock").expect("log should parse"));
    }

    #[test]
    fn newest_modified_marker_wins() {
        let log = build_log(&[
            LogEntry::new(
                2,
                LogPayload::Modified(ModifiedMarker {
                    last_modified_time: "2026-01-01T00:00:00Z".into(),
                    user_auth: auth(),
                }),
            ),
            url_entry(3, "https://a.test"),
            LogEntry::new(
                3,
                LogPayload::Modified(ModifiedMarker {
                    last_modified_time: "2026-02-02T00:00:00Z".into(),
                    user_auth: auth(),
                }),
            ),
        ]);

        assert_eq!(
            last_modified_time(&log).expect("log should parse").as_deref(),
            Some("2026-02-02T00:00:00Z")
        );
    }

    #[test]
    fn marker_classification() {
        let unlock = LogPayload::Unlock(UnlockMarker { unlock_id: "l".into(), user_auth: auth() });
        let modified = LogPayload::Modified(ModifiedMarker {
            last_modified_time: "t".into(),
            user_auth: auth(),
        });
        let url = LogPayload::RawUrl("https://a.test".into());

        assert!(unlock.is_marker());
        assert!(modified.is_marker());
        assert!(!url.is_marker());
        assert!(unlock.as_unlock_marker().is_some());
        assert!(modified.as_modified_marker().is_some());
        assert!(url.as_raw_url().is_some());
    }

    #[test]
    fn corrupt_entry_reports_its_position() {
        let good = url_entry(2, "https://a.test").to_stored().expect("entry should serialize");
        let log = format!("{good}{DELIMITER}not-json");

        let error = entries(&log).expect_err("corrupt entry should fail parsing");
        assert!(matches!(error, LogError::Entry { index: 1, .. }));
    }

    proptest! {
        #[test]
        fn any_appended_sequence_reads_back_in_order(
            urls in proptest::collection::vec(("[a-z0-9./:-]{1,24}", 2i64..40), 0..12)
        ) {
            let appended: Vec<LogEntry> =
                urls.iter().map(|(url, index)| url_entry(*index, url)).collect();
            let log = build_log(&appended);

            let parsed = entries(&log).expect("log should parse");
            prop_assert_eq!(parsed, appended);
        }
    }
}
