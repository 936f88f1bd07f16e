//! Input Stager
//!
//! Copies the job's input files into the input volume through a short-lived
//! helper container. Each file travels as its own single-entry tar archive,
//! which the engine unpacks at the mount point.
//!
//! The helper container is released here, on every path, instead of being
//! left for teardown.

use crate::error::ExecutorError;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use algobox_common::labels::INPUT_MOUNT;
use algobox_common::types::InputSource;
use algobox_common::{InputFile, JobId, ResourceEnvelope};
use bytes::Bytes;
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Build an in-memory tar archive holding exactly one regular file
pub fn single_file_archive(entry_name: &str, contents: &[u8]) -> Result<Vec<u8>, RuntimeError> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, entry_name, contents)
        .map_err(|e| RuntimeError::Archive(format!("adding {}: {}", entry_name, e)))?;
    builder
        .into_inner()
        .map_err(|e| RuntimeError::Archive(format!("finishing archive: {}", e)))
}

async fn read_input(file: &InputFile) -> Result<Cow<'_, [u8]>, RuntimeError> {
    let contents = match file.source() {
        InputSource::Path(path) => Cow::Owned(tokio::fs::read(path).await?),
        InputSource::Memory(bytes) => Cow::Borrowed(bytes.as_slice()),
    };
    if contents.len() as u64 != file.size() {
        return Err(RuntimeError::Archive(format!(
            "{} is {} bytes but was declared as {}",
            file.name(),
            contents.len(),
            file.size()
        )));
    }
    Ok(contents)
}

async fn copy_inputs(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    files: &[InputFile],
) -> Result<(), ExecutorError> {
    for file in files {
        let entry_name = file.entry_name().ok_or_else(|| ExecutorError::Stage {
            context: format!("naming input {:?}", file.name()),
            source: RuntimeError::Archive("input has no usable file name".to_string()),
        })?;

        let contents = read_input(file)
            .await
            .map_err(ExecutorError::stage(format!("reading {}", file.name())))?;
        let archive = single_file_archive(entry_name, &contents)
            .map_err(ExecutorError::stage(format!("archiving {}", entry_name)))?;

        runtime
            .put_archive(container_id, INPUT_MOUNT, Bytes::from(archive))
            .await
            .map_err(ExecutorError::stage(format!("uploading {}", entry_name)))?;

        debug!(
            container_id = %container_id,
            file = %entry_name,
            bytes = file.size(),
            "Staged input file"
        );
    }
    Ok(())
}

/// Stop and force-remove the staging container.
/// A successful forced removal wins over a failed stop.
async fn release(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<(), RuntimeError> {
    if let Err(e) = runtime.stop_container(container_id).await {
        warn!(container_id = %container_id, error = %e, "Failed to stop staging container");
    }
    runtime.remove_container(container_id, true).await
}

/// Copy `files`, in order and one at a time, into `input_volume`.
pub async fn stage_inputs(
    runtime: &dyn ContainerRuntime,
    helper_image: &str,
    job_id: &JobId,
    resources: ResourceEnvelope,
    input_volume: &str,
    files: &[InputFile],
) -> Result<(), ExecutorError> {
    let spec = ContainerSpec::for_job(helper_image, job_id, resources)
        .mount(input_volume, INPUT_MOUNT, false)
        .tty();

    let container_id = runtime
        .start_detached(&spec)
        .await
        .map_err(ExecutorError::stage("starting staging container"))?;

    info!(
        job_id = %job_id,
        container_id = %container_id,
        files = files.len(),
        "Staging input files"
    );

    let copied = copy_inputs(runtime, &container_id, files).await;
    let released = release(runtime, &container_id).await;

    match (copied, released) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(source)) => Err(ExecutorError::Stage {
            context: "removing staging container".to_string(),
            source,
        }),
        (Err(e), Err(release_err)) => {
            warn!(
                container_id = %container_id,
                error = %release_err,
                "Failed to remove staging container after staging error"
            );
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
