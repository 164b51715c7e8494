use std::sync::Arc;

use anyhow::{Context, Result};
use tender_session::{HttpSessionPersistence, HttpSessionPersistenceConfig};
use tender_stream::{HttpStreamTransport, HttpStreamTransportConfig};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::Cli;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    // stdout carries streamed text only.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub(crate) fn build_stream_transport(cli: &Cli) -> Result<Arc<HttpStreamTransport>> {
    let transport = HttpStreamTransport::new(HttpStreamTransportConfig {
        api_base: cli.api_base.clone(),
        api_key: cli.api_key.clone(),
        connect_timeout_ms: cli.connect_timeout_ms,
    })
    .context("failed to build stream transport")?;
    Ok(Arc::new(transport))
}

pub(crate) fn build_persistence(cli: &Cli) -> Result<Arc<HttpSessionPersistence>> {
    let persistence = HttpSessionPersistence::new(HttpSessionPersistenceConfig {
        api_base: cli
            .persistence_base
            .clone()
            .unwrap_or_else(|| cli.api_base.clone()),
        api_key: cli.api_key.clone(),
        ..HttpSessionPersistenceConfig::default()
    })
    .context("failed to build session store client")?;
    Ok(Arc::new(persistence))
}
