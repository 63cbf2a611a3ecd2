// End-to-end lifecycle against a scripted host: open, save, close,
// reopen. Exercises the public API only — the same surface the session
// handlers consume.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use url::Url;

use charta_common::types::SessionMode;
use charta_daemon::runtime::{EditorData, MemoryEditorData};
use charta_daemon::session::{
    DocumentManager, OpenRequest, SaveFlags, SaveOutcome, SessionOptions,
};
use charta_daemon::store::{DocStorage, MemoryDocStorage, MemoryTaskStore, TaskStore};
use charta_daemon::wopi::filter::HostFilter;
use charta_daemon::wopi::transport::{WireResponse, WopiTransport};
use charta_daemon::wopi::{ClientOptions, WopiClient};

#[derive(Default)]
struct Inner {
    responses: Mutex<VecDeque<Result<WireResponse>>>,
    overrides: Mutex<Vec<Option<String>>>,
}

/// Scripted host: responses are served in order; the override header of
/// every request is recorded.
#[derive(Clone, Default)]
struct ScriptedHost {
    inner: Arc<Inner>,
}

impl ScriptedHost {
    fn queue_ok(&self, body: &str) {
        self.inner
            .responses
            .lock()
            .expect("mock mutex should not be poisoned")
            .push_back(Ok(WireResponse { status: 200, body: body.as_bytes().to_vec() }));
    }

    fn queue_error(&self, message: &str) {
        self.inner
            .responses
            .lock()
            .expect("mock mutex should not be poisoned")
            .push_back(Err(anyhow!("{message}")));
    }

    fn overrides(&self) -> Vec<Option<String>> {
        self.inner.overrides.lock().expect("mock mutex should not be poisoned").clone()
    }

    fn answer(&self, headers: &[(String, String)]) -> Result<WireResponse> {
        let override_header = headers
            .iter()
            .find(|(name, _)| name == "X-WOPI-Override")
            .map(|(_, value)| value.clone());
        self.inner
            .overrides
            .lock()
            .expect("mock mutex should not be poisoned")
            .push(override_header);
        self.inner
            .responses
            .lock()
            .expect("mock mutex should not be poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no response queued")))
    }
}

#[async_trait]
impl WopiTransport for ScriptedHost {
    async fn get(
        &self,
        _url: &Url,
        headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<WireResponse> {
        self.answer(headers)
    }

    async fn post(
        &self,
        _url: &Url,
        headers: &[(String, String)],
        _body: Option<Vec<u8>>,
        _timeout: Duration,
    ) -> Result<WireResponse> {
        self.answer(headers)
    }
}

fn file_info_body(version: &str, modified: &str) -> String {
    format!(
        r#"{{"BaseFileName":"report.docx","Version":"{version}","LastModifiedTime":"{modified}","UserCanWrite":true,"SupportsLocks":true,"SupportsUpdate":true}}"#
    )
}

fn open_request() -> OpenRequest {
    OpenRequest {
        file_id: "42".into(),
        wopi_src: "https://host.test/wopi/files/42".into(),
        access_token: "tok".into(),
        access_token_ttl: 1_700_000_000_000,
        host_session_id: Some("hs-1".into()),
        session_context: None,
        mode: SessionMode::Edit,
        base_url: "https://charta.test".into(),
    }
}

fn manager(host: &ScriptedHost) -> DocumentManager<ScriptedHost> {
    let client =
        WopiClient::new(host.clone(), HostFilter::default(), ClientOptions::default());
    DocumentManager::new(
        client,
        Arc::new(MemoryEditorData::new()) as Arc<dyn EditorData>,
        Arc::new(MemoryTaskStore::new()) as Arc<dyn TaskStore>,
        Arc::new(MemoryDocStorage::new()) as Arc<dyn DocStorage>,
        SessionOptions::default(),
    )
}

#[tokio::test]
async fn full_session_lifecycle() {
    let host = ScriptedHost::default();
    let manager = manager(&host);

    // Open: CheckFileInfo + LOCK.
    host.queue_ok(&file_info_body("5", "2026-01-02T03:04:05Z"));
    host.queue_ok("");
    let opened = manager.open_document(open_request()).await.expect("open should succeed");
    assert_eq!(opened.lock_id.as_deref(), Some("42"));
    assert!(!opened.reusable);

    // Save: PUT, acknowledged with an empty body (the common case).
    host.queue_ok("");
    let saved = manager
        .save_document(
            &opened.doc_id,
            b"new-bytes",
            "editor-1",
            &opened.user_auth,
            opened.user_index,
            SaveFlags { is_modified_by_user: true, ..Default::default() },
        )
        .await
        .expect("save should succeed");
    assert_eq!(saved, SaveOutcome::Saved);

    // Close: UNLOCK + unlock marker.
    host.queue_ok("");
    manager
        .close_document(&opened.doc_id, &opened.user_auth, opened.user_index)
        .await
        .expect("close should succeed");

    // Reopen with the host unchanged since the close: the cache is
    // reusable and the session rejoins the same lock id.
    host.queue_ok(&file_info_body("5", "2026-01-02T03:04:05Z"));
    host.queue_ok("");
    let reopened = manager.open_document(open_request()).await.expect("reopen should succeed");
    assert!(reopened.reusable);
    assert_eq!(reopened.lock_id.as_deref(), Some("42"));
    assert_eq!(reopened.user_index, 2);

    assert_eq!(
        host.overrides(),
        vec![
            None,                       // CheckFileInfo
            Some("LOCK".to_string()),   // first open
            Some("PUT".to_string()),    // save
            Some("UNLOCK".to_string()), // close
            None,                       // CheckFileInfo (reopen)
            Some("LOCK".to_string()),   // rejoin
        ]
    );
}

#[tokio::test]
async fn host_version_change_invalidates_the_cache_across_sessions() {
    let host = ScriptedHost::default();
    let manager = manager(&host);

    host.queue_ok(&file_info_body("5", "2026-01-02T03:04:05Z"));
    host.queue_ok("");
    let opened = manager.open_document(open_request()).await.expect("open should succeed");

    host.queue_ok("");
    manager
        .close_document(&opened.doc_id, &opened.user_auth, opened.user_index)
        .await
        .expect("close should succeed");

    // The host advanced to version 6 while the document sat unlocked.
    host.queue_ok(&file_info_body("6", "2026-02-02T00:00:00Z"));
    host.queue_ok("");
    let reopened = manager.open_document(open_request()).await.expect("reopen should succeed");
    assert!(!reopened.reusable);
    assert_eq!(reopened.user_index, 1, "the purged record restarted the session counter");
}

#[tokio::test]
async fn unavailable_host_fails_the_open_without_side_effects() {
    let host = ScriptedHost::default();
    let manager = manager(&host);

    host.queue_error("connection refused");
    let result = manager.open_document(open_request()).await;
    let error = result.expect_err("open should fail");
    assert_eq!(error.user_message(), "document unavailable");
}
