// Outbound protocol client for WOPI-style hosts.
//
// Every operation filters the destination before any network I/O, signs
// its headers with the proof key pair, logs start/end, and swallows
// failures into a bool/None result — a failed call means "host
// unavailable" to the caller, never a propagated error, and the verbs are
// idempotent so repeating a call is always safe.

pub mod filter;
pub mod proof;
pub mod transport;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use charta_common::types::{FileInfoSnapshot, UserAuth, WopiParams};

use filter::HostFilter;
use proof::ProofKeys;
use transport::{WireResponse, WopiTransport};

const HEADER_AUTHORIZATION: &str = "Authorization";
const HEADER_OVERRIDE: &str = "X-WOPI-Override";
const HEADER_LOCK: &str = "X-WOPI-Lock";
const HEADER_EDITORS: &str = "X-WOPI-Editors";
const HEADER_SUGGESTED_TARGET: &str = "X-WOPI-SuggestedTarget";
const HEADER_REQUESTED_NAME: &str = "X-WOPI-RequestedName";
const HEADER_FILE_CONVERSION: &str = "X-WOPI-FileConversion";
const HEADER_SESSION_CONTEXT: &str = "X-WOPI-SessionContext";
const HEADER_MAX_EXPECTED_SIZE: &str = "X-WOPI-MaxExpectedSize";
const HEADER_PROOF: &str = "X-WOPI-Proof";
const HEADER_PROOF_OLD: &str = "X-WOPI-ProofOld";
const HEADER_TIMESTAMP: &str = "X-WOPI-TimeStamp";
const HEADER_CLIENT_VERSION: &str = "X-WOPI-ClientVersion";
const HEADER_CONTENT_TYPE: &str = "Content-Type";
// Collabora/Nextcloud extension headers carried on PutFile.
const HEADER_IS_MODIFIED_BY_USER: &str = "X-LOOL-WOPI-IsModifiedByUser";
const HEADER_IS_AUTOSAVE: &str = "X-LOOL-WOPI-IsAutosave";
const HEADER_IS_EXIT_SAVE: &str = "X-LOOL-WOPI-IsExitSave";
const HEADER_HOST_TIMESTAMP: &str = "X-LOOL-WOPI-Timestamp";

const DEFAULT_FILE_NAME_MAX_LENGTH: usize = 255;

/// Lock-family verbs sent in the override header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    Lock,
    Unlock,
    RefreshLock,
    GetLock,
}

impl LockCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Unlock => "UNLOCK",
            Self::RefreshLock => "REFRESH_LOCK",
            Self::GetLock => "GET_LOCK",
        }
    }
}

/// Optional structured body of a PutFile response. Most hosts return an
/// empty body; Collabora/Nextcloud report the new modification time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PutFileOutcome {
    pub last_modified_time: Option<String>,
    pub name: Option<String>,
}

/// Descriptor of the file created by PutRelativeFile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PutRelativeOutcome {
    pub name: Option<String>,
    pub url: Option<String>,
}

/// Result of RenameFile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct RenameBody {
    name: Option<String>,
}

/// Client tuning; proof keys are optional so a deployment without host
/// key verification still works.
pub struct ClientOptions {
    pub proof_keys: Option<ProofKeys>,
    pub client_version: String,
    pub request_timeout: Duration,
    pub file_info_timeout: Duration,
    pub max_expected_size: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proof_keys: None,
            client_version: "1.0.0".to_string(),
            request_timeout: Duration::from_secs(60),
            file_info_timeout: Duration::from_secs(60),
            max_expected_size: 104_857_600,
        }
    }
}

/// The outbound protocol client.
pub struct WopiClient<T: WopiTransport> {
    transport: T,
    filter: HostFilter,
    options: ClientOptions,
}

impl<T: WopiTransport> WopiClient<T> {
    pub fn new(transport: T, filter: HostFilter, options: ClientOptions) -> Self {
        Self { transport, filter, options }
    }

    /// Fetch the host's file info snapshot. Any transport or parse failure
    /// surfaces as `None` — the caller treats the host as unavailable.
    pub async fn check_file_info(
        &self,
        wopi_src: &str,
        access_token: &str,
        session_context: Option<&str>,
    ) -> Option<FileInfoSnapshot> {
        info!(wopi_src, "wopi check_file_info start");
        let mut headers =
            vec![(HEADER_MAX_EXPECTED_SIZE.to_string(), self.options.max_expected_size.to_string())];
        if let Some(context) = session_context {
            headers.push((HEADER_SESSION_CONTEXT.to_string(), context.to_string()));
        }

        let result = match self.signed_destination(wopi_src, access_token, &mut headers) {
            Some(url) => {
                match self.transport.get(&url, &headers, self.options.file_info_timeout).await {
                    Ok(response) => {
                        debug!(body = %response.body_str(), "wopi check_file_info response");
                        match serde_json::from_slice::<FileInfoSnapshot>(&response.body) {
                            Ok(info) => Some(info),
                            Err(parse_error) => {
                                error!(error = %parse_error, "wopi check_file_info body did not parse");
                                None
                            }
                        }
                    }
                    Err(transport_error) => {
                        error!(error = format!("{transport_error:#}"), "wopi check_file_info failed");
                        None
                    }
                }
            }
            None => None,
        };
        info!(ok = result.is_some(), "wopi check_file_info end");
        result
    }

    /// Send a lock-family verb. Returns true on any non-error response,
    /// false on missing capability, missing credentials or transport error.
    pub async fn lock(
        &self,
        command: LockCommand,
        lock_id: &str,
        file_info: &FileInfoSnapshot,
        user_auth: Option<&UserAuth>,
    ) -> bool {
        let verb = command.as_str();
        info!(command = verb, "wopi lock start");
        let ok = self.lock_inner(verb, lock_id, file_info, user_auth).await;
        info!(command = verb, ok, "wopi lock end");
        ok
    }

    async fn lock_inner(
        &self,
        verb: &str,
        lock_id: &str,
        file_info: &FileInfoSnapshot,
        user_auth: Option<&UserAuth>,
    ) -> bool {
        if !file_info.supports_locks {
            info!(command = verb, "host does not support locks");
            return false;
        }
        let Some(auth) = user_auth else {
            warn!(command = verb, "lock requested without user auth");
            return false;
        };

        let mut headers = vec![
            (HEADER_OVERRIDE.to_string(), verb.to_string()),
            (HEADER_LOCK.to_string(), lock_id.to_string()),
        ];
        let Some(url) = self.signed_destination(&auth.wopi_src, &auth.access_token, &mut headers)
        else {
            return false;
        };

        match self.transport.post(&url, &headers, None, self.options.request_timeout).await {
            Ok(response) => {
                debug!(status = response.status, "wopi lock response");
                true
            }
            Err(transport_error) => {
                error!(command = verb, error = format!("{transport_error:#}"), "wopi lock failed");
                false
            }
        }
    }

    /// Release the host lock recorded in the document's common info.
    pub async fn unlock(&self, params: &WopiParams) -> bool {
        info!("wopi unlock start");
        let ok = self.unlock_inner(params).await;
        info!(ok, "wopi unlock end");
        ok
    }

    async fn unlock_inner(&self, params: &WopiParams) -> bool {
        let (Some(common), Some(auth)) = (&params.common_info, &params.user_auth) else {
            warn!("unlock requested without common info or user auth");
            return false;
        };
        if !common.file_info.supports_locks {
            info!("host does not support locks");
            return false;
        }

        let mut headers = vec![
            (HEADER_OVERRIDE.to_string(), LockCommand::Unlock.as_str().to_string()),
            (HEADER_LOCK.to_string(), common.lock_id.clone()),
        ];
        let Some(url) = self.signed_destination(&auth.wopi_src, &auth.access_token, &mut headers)
        else {
            return false;
        };

        match self.transport.post(&url, &headers, None, self.options.request_timeout).await {
            Ok(response) => {
                debug!(status = response.status, "wopi unlock response");
                true
            }
            Err(transport_error) => {
                error!(error = format!("{transport_error:#}"), "wopi unlock failed");
                false
            }
        }
    }

    /// Commit document bytes to the host.
    pub async fn put_file(
        &self,
        params: &WopiParams,
        payload: &[u8],
        last_editor_id: &str,
        is_modified_by_user: bool,
        is_autosave: bool,
        is_exit_save: bool,
    ) -> Option<PutFileOutcome> {
        info!(size = payload.len(), "wopi put_file start");
        let result = self
            .put_file_inner(
                params,
                payload,
                last_editor_id,
                is_modified_by_user,
                is_autosave,
                is_exit_save,
            )
            .await;
        info!(ok = result.is_some(), "wopi put_file end");
        result
    }

    async fn put_file_inner(
        &self,
        params: &WopiParams,
        payload: &[u8],
        last_editor_id: &str,
        is_modified_by_user: bool,
        is_autosave: bool,
        is_exit_save: bool,
    ) -> Option<PutFileOutcome> {
        let (Some(common), Some(auth)) = (&params.common_info, &params.user_auth) else {
            warn!("put_file requested without common info or user auth");
            return None;
        };
        // Some connectors only ever set UserCanWrite.
        if !(common.file_info.supports_update || common.file_info.user_can_write) {
            warn!("host supports neither update nor user write");
            return None;
        }

        let mut headers = vec![
            (HEADER_OVERRIDE.to_string(), "PUT".to_string()),
            (HEADER_LOCK.to_string(), common.lock_id.clone()),
            (HEADER_EDITORS.to_string(), last_editor_id.to_string()),
        ];
        let Some(url) =
            self.signed_contents_destination(&auth.wopi_src, &auth.access_token, &mut headers)
        else {
            return None;
        };
        headers.push((HEADER_IS_MODIFIED_BY_USER.to_string(), is_modified_by_user.to_string()));
        headers.push((HEADER_IS_AUTOSAVE.to_string(), is_autosave.to_string()));
        headers.push((HEADER_IS_EXIT_SAVE.to_string(), is_exit_save.to_string()));
        if let Some(last_modified) = &params.last_modified_time {
            // Variant hosts use it for their own optimistic-concurrency check.
            headers.push((HEADER_HOST_TIMESTAMP.to_string(), last_modified.clone()));
        }
        headers.push((HEADER_CONTENT_TYPE.to_string(), "application/octet-stream".to_string()));

        match self
            .transport
            .post(&url, &headers, Some(payload.to_vec()), self.options.request_timeout)
            .await
        {
            Ok(response) => Some(parse_put_file_response(&response)),
            Err(transport_error) => {
                error!(error = format!("{transport_error:#}"), "wopi put_file failed");
                None
            }
        }
    }

    /// Create a sibling file on the host — used when there is no existing
    /// lock context, e.g. a format conversion producing a new file.
    pub async fn put_relative_file(
        &self,
        wopi_src: &str,
        access_token: &str,
        payload: &[u8],
        suggested_target: &str,
        is_file_conversion: bool,
    ) -> Option<PutRelativeOutcome> {
        info!(suggested_target, "wopi put_relative_file start");
        let mut headers = vec![
            (HEADER_OVERRIDE.to_string(), "PUT_RELATIVE".to_string()),
            (HEADER_SUGGESTED_TARGET.to_string(), encode_utf7(suggested_target)),
        ];
        if is_file_conversion {
            headers.push((HEADER_FILE_CONVERSION.to_string(), "true".to_string()));
        }

        let result = match self.signed_destination(wopi_src, access_token, &mut headers) {
            Some(url) => {
                headers.push((
                    HEADER_CONTENT_TYPE.to_string(),
                    "application/octet-stream".to_string(),
                ));
                match self
                    .transport
                    .post(&url, &headers, Some(payload.to_vec()), self.options.request_timeout)
                    .await
                {
                    Ok(response) => {
                        debug!(body = %response.body_str(), "wopi put_relative_file response");
                        match serde_json::from_slice::<PutRelativeOutcome>(&response.body) {
                            Ok(outcome) => Some(outcome),
                            Err(parse_error) => {
                                error!(error = %parse_error, "wopi put_relative_file body did not parse");
                                None
                            }
                        }
                    }
                    Err(transport_error) => {
                        error!(
                            error = format!("{transport_error:#}"),
                            "wopi put_relative_file failed"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        info!(ok = result.is_some(), "wopi put_relative_file end");
        result
    }

    /// Rename the hosted file. The requested name is truncated to the
    /// host-declared maximum; an empty response body means the host
    /// accepted the name as sent.
    pub async fn rename_file(&self, params: &WopiParams, new_name: &str) -> Option<RenameOutcome> {
        info!(new_name, "wopi rename_file start");
        let result = self.rename_file_inner(params, new_name).await;
        info!(ok = result.is_some(), "wopi rename_file end");
        result
    }

    async fn rename_file_inner(
        &self,
        params: &WopiParams,
        new_name: &str,
    ) -> Option<RenameOutcome> {
        let (Some(common), Some(auth)) = (&params.common_info, &params.user_auth) else {
            warn!("rename_file requested without common info or user auth");
            return None;
        };
        if !common.file_info.supports_rename {
            info!("host does not support rename");
            return None;
        }

        let max_length = common
            .file_info
            .file_name_max_length
            .map(|length| length as usize)
            .unwrap_or(DEFAULT_FILE_NAME_MAX_LENGTH);
        let requested: String = new_name.chars().take(max_length).collect();

        let mut headers = vec![
            (HEADER_OVERRIDE.to_string(), "RENAME_FILE".to_string()),
            (HEADER_LOCK.to_string(), common.lock_id.clone()),
            (HEADER_REQUESTED_NAME.to_string(), encode_utf7(&requested)),
        ];
        let Some(url) = self.signed_destination(&auth.wopi_src, &auth.access_token, &mut headers)
        else {
            return None;
        };

        match self.transport.post(&url, &headers, None, self.options.request_timeout).await {
            Ok(response) if response.body.is_empty() => {
                // Some hosts acknowledge with an empty body.
                Some(RenameOutcome { name: requested })
            }
            Ok(response) => {
                debug!(body = %response.body_str(), "wopi rename_file response");
                match serde_json::from_slice::<RenameBody>(&response.body) {
                    Ok(body) => Some(RenameOutcome { name: body.name.unwrap_or(requested) }),
                    Err(parse_error) => {
                        error!(error = %parse_error, "wopi rename_file body did not parse");
                        None
                    }
                }
            }
            Err(transport_error) => {
                error!(error = format!("{transport_error:#}"), "wopi rename_file failed");
                None
            }
        }
    }

    /// Resolve where to download the document bytes from, with the
    /// headers the request must carry.
    ///
    /// A host-provided `FileUrl` is used exactly as given and never
    /// signed — it does not necessarily embed the access token the proof
    /// would be computed over. `TemplateSource` likewise. Only the
    /// fallback contents endpoint gets the standard signed headers.
    pub fn file_download(
        &self,
        file_info: &FileInfoSnapshot,
        user_auth: Option<&UserAuth>,
    ) -> Option<(Url, Vec<(String, String)>)> {
        let mut headers =
            vec![(HEADER_MAX_EXPECTED_SIZE.to_string(), self.options.max_expected_size.to_string())];

        if let Some(file_url) = &file_info.file_url {
            let url = self.parsed_and_checked(file_url)?;
            return Some((url, headers));
        }
        if let Some(template_source) = &file_info.template_source {
            let url = self.parsed_and_checked(template_source)?;
            return Some((url, headers));
        }
        let auth = user_auth?;
        let url = self.signed_contents_destination(&auth.wopi_src, &auth.access_token, &mut headers)?;
        debug!(url = %url, "file download resolved to contents endpoint");
        Some((url, headers))
    }

    fn parsed_and_checked(&self, raw: &str) -> Option<Url> {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(parse_error) => {
                warn!(url = raw, error = %parse_error, "invalid host-provided URL");
                return None;
            }
        };
        if let Err(refused) = self.filter.check(&url) {
            warn!(error = %refused, "wopi destination refused");
            return None;
        }
        Some(url)
    }

    /// Parse + filter + sign against `wopi_src?access_token=...`.
    fn signed_destination(
        &self,
        wopi_src: &str,
        access_token: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Option<Url> {
        let mut url = match Url::parse(wopi_src) {
            Ok(url) => url,
            Err(parse_error) => {
                warn!(wopi_src, error = %parse_error, "invalid wopiSrc");
                return None;
            }
        };
        url.query_pairs_mut().append_pair("access_token", access_token);
        self.check_and_sign(url, access_token, headers)
    }

    /// Like `signed_destination`, but against the file contents endpoint.
    fn signed_contents_destination(
        &self,
        wopi_src: &str,
        access_token: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Option<Url> {
        let mut url = match Url::parse(wopi_src) {
            Ok(url) => url,
            Err(parse_error) => {
                warn!(wopi_src, error = %parse_error, "invalid wopiSrc");
                return None;
            }
        };
        if url.path_segments_mut().map(|mut segments| { segments.push("contents"); }).is_err() {
            warn!(wopi_src, "wopiSrc cannot carry a contents path");
            return None;
        }
        url.query_pairs_mut().append_pair("access_token", access_token);
        self.check_and_sign(url, access_token, headers)
    }

    fn check_and_sign(
        &self,
        url: Url,
        access_token: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Option<Url> {
        if let Err(refused) = self.filter.check(&url) {
            warn!(error = %refused, "wopi destination refused");
            return None;
        }
        self.fill_standard_headers(headers, &url, access_token);
        Some(url)
    }

    /// Proof signature pair, timestamp, client version and bearer token.
    /// The proof is computed over the exact URL the request is sent to.
    fn fill_standard_headers(
        &self,
        headers: &mut Vec<(String, String)>,
        url: &Url,
        access_token: &str,
    ) {
        if let Some(keys) = &self.options.proof_keys {
            let ticks = proof::datetime_ticks(Utc::now());
            let pair = keys.sign_pair(url.as_str(), access_token, ticks);
            headers.push((HEADER_PROOF.to_string(), pair.proof));
            headers.push((HEADER_PROOF_OLD.to_string(), pair.proof_old));
            headers.push((HEADER_TIMESTAMP.to_string(), ticks.to_string()));
            headers.push((HEADER_CLIENT_VERSION.to_string(), self.options.client_version.clone()));
        }
        headers.push((HEADER_AUTHORIZATION.to_string(), format!("Bearer {access_token}")));
    }
}

fn parse_put_file_response(response: &WireResponse) -> PutFileOutcome {
    if response.body.is_empty() {
        return PutFileOutcome::default();
    }
    match serde_json::from_slice(&response.body) {
        Ok(outcome) => outcome,
        Err(parse_error) => {
            debug!(error = %parse_error, "wopi put_file body is not structured");
            PutFileOutcome::default()
        }
    }
}

/// RFC 2152-style UTF-7 for name headers: printable ASCII passes through,
/// `+` escapes to `+-`, anything else becomes `+<base64 UTF-16BE>-`.
fn encode_utf7(value: &str) -> String {
    fn flush(pending: &mut Vec<u16>, out: &mut String) {
        if pending.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(pending.len() * 2);
        for unit in pending.drain(..) {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        out.push('+');
        out.push_str(&STANDARD_NO_PAD.encode(bytes));
        out.push('-');
    }

    let mut out = String::with_capacity(value.len());
    let mut pending: Vec<u16> = Vec::new();
    let mut units = [0u16; 2];
    for ch in value.chars() {
        if ch == '+' {
            flush(&mut pending, &mut out);
            out.push_str("+-");
        } else if (' '..='~').contains(&ch) {
            flush(&mut pending, &mut out);
            out.push(ch);
        } else {
            pending.extend_from_slice(ch.encode_utf16(&mut units));
        }
    }
    flush(&mut pending, &mut out);
    out
}
