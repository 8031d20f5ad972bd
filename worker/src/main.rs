use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

mod client;
mod lang;
mod runner;
mod util;

#[cfg(test)]
mod test;

use client::config::{SharedWorkerData, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = WorkerConfig::from_env().context("reading worker configuration")?;

    let docker = bollard::Docker::connect_with_local_defaults()
        .context("connecting to the container daemon")?;
    docker
        .ping()
        .await
        .context("pinging the container daemon")?;

    let languages =
        lang::LanguageRegistry::parse(&cfg.supported_languages).context("building language registry")?;
    languages
        .preload_images(&docker)
        .await
        .context("preloading language images")?;
    tracing::info!(languages = languages.len(), "language registry ready");

    let cache = client::cache::SubmissionCache::connect(&cfg)
        .await
        .context("connecting to the submission cache")?;

    // A worker that died mid-case may have left scratch volumes behind.
    runner::volume::sweep_leaked_volumes(&docker).await;

    let data = Arc::new(SharedWorkerData::new(cfg, docker, cache, languages));
    client::consume(data).await
}
