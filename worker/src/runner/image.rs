use anyhow::Context;
use bollard::{image::CreateImageOptions, Docker};
use tokio_stream::StreamExt;

/// Pull an image from its registry, draining the progress stream. Fails on
/// the first reported error.
pub async fn pull_image(docker: &Docker, tag: &str) -> anyhow::Result<()> {
    tracing::info!(image = %tag, "pulling language image");
    let mut pulling = docker.create_image(
        Some(CreateImageOptions {
            from_image: tag,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(progress) = pulling.next().await {
        progress.with_context(|| format!("pulling image {tag}"))?;
    }

    tracing::info!(image = %tag, "language image ready");
    Ok(())
}
