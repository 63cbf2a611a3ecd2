// Process bootstrap: tracing subscriber and manager assembly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::WopiConfig;
use crate::runtime::EditorData;
use crate::session::{DocumentManager, SessionOptions};
use crate::store::{DocStorage, TaskStore};
use crate::wopi::filter::HostFilter;
use crate::wopi::transport::ReqwestTransport;
use crate::wopi::WopiClient;

/// Install the global tracing subscriber (env-filter controlled).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Assemble a document manager from config and injected stores.
pub fn build_manager(
    config: &WopiConfig,
    runtime: Arc<dyn EditorData>,
    tasks: Arc<dyn TaskStore>,
    storage: Arc<dyn DocStorage>,
) -> Result<DocumentManager<ReqwestTransport>> {
    let transport = ReqwestTransport::new().context("failed to build host transport")?;
    let client = WopiClient::new(
        transport,
        HostFilter::new(config.destination.clone()),
        config.client_options().context("invalid client configuration")?,
    );
    info!(
        signing = config.proof.private_key_pem.is_some() && config.proof.old_private_key_pem.is_some(),
        "document manager ready"
    );
    Ok(DocumentManager::new(client, runtime, tasks, storage, SessionOptions::from_config(config)))
}
