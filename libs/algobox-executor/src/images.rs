use crate::error::ExecutorError;
use crate::runtime::{ContainerRuntime, RuntimeError};
use algobox_common::AlgorithmImage;
use bytes::Bytes;
use tracing::{debug, info};

/// Digests compare equal with or without the `sha256:` prefix
fn same_digest(a: &str, b: &str) -> bool {
    a.trim_start_matches("sha256:") == b.trim_start_matches("sha256:")
}

async fn is_known(runtime: &dyn ContainerRuntime, digest: &str) -> Result<bool, RuntimeError> {
    let ids = runtime.image_ids().await?;
    Ok(ids.iter().any(|id| same_digest(id, digest)))
}

/// Make sure both images of a job are available to the runtime.
///
/// The helper image is pulled every time (cheap when already present). The
/// algorithm image is loaded from its archive only when its digest is unknown.
pub async fn ensure_images(
    runtime: &dyn ContainerRuntime,
    helper_image: &str,
    image: &AlgorithmImage,
) -> Result<(), ExecutorError> {
    runtime
        .pull_image(helper_image)
        .await
        .map_err(ExecutorError::setup(format!("pulling helper image {}", helper_image)))?;

    let known = is_known(runtime, &image.digest)
        .await
        .map_err(ExecutorError::setup("listing images"))?;
    if known {
        debug!(digest = %image.digest, "Algorithm image already loaded");
        return Ok(());
    }

    let archive = tokio::fs::read(&image.archive).await.map_err(|e| {
        ExecutorError::setup(format!("reading image archive {}", image.archive.display()))(e.into())
    })?;

    info!(
        digest = %image.digest,
        archive_bytes = archive.len(),
        "Loading algorithm image"
    );
    runtime
        .load_image(Bytes::from(archive))
        .await
        .map_err(ExecutorError::setup("loading algorithm image"))?;

    let loaded = is_known(runtime, &image.digest)
        .await
        .map_err(ExecutorError::setup("listing images"))?;
    if !loaded {
        return Err(ExecutorError::Setup {
            context: "loading algorithm image".to_string(),
            source: RuntimeError::Other(format!(
                "archive {} does not contain image {}",
                image.archive.display(),
                image.digest
            )),
        });
    }

    Ok(())
}
