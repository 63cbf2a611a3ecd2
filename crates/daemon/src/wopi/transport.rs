// HTTP transport abstraction for host-facing calls.
//
// Production uses reqwest; tests substitute a recording mock. A non-2xx
// status is a transport error — the protocol layer never inspects failed
// responses, it only logs and reports them.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use url::Url;

/// A successful (2xx) host response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Signed GET/POST against the host, with a caller-supplied bounded
/// timeout. Implementations must not retry internally.
#[async_trait]
pub trait WopiTransport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<WireResponse>;

    async fn post(
        &self,
        url: &Url,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<WireResponse>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build host-facing HTTP client")?;
        Ok(Self { client })
    }
}

impl ReqwestTransport {
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<WireResponse> {
        let response = request.send().await.context("host request failed")?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("failed to read host response body")?
            .to_vec();
        if !status.is_success() {
            bail!("host returned status {status}");
        }
        Ok(WireResponse { status: status.as_u16(), body })
    }
}

#[async_trait]
impl WopiTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<WireResponse> {
        let mut request = self.client.get(url.clone()).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        self.execute(request).await
    }

    async fn post(
        &self,
        url: &Url,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<WireResponse> {
        let mut request = self.client.post(url.clone()).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        self.execute(request).await
    }
}
