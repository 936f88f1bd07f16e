use crate::error::ExecutorError;
use crate::runtime::ContainerRuntime;
use algobox_common::labels;
use algobox_common::JobId;
use tracing::debug;

/// Create the empty, labeled input and output volumes of a job.
///
/// A name collision means the job id was reused, which is a caller bug, so
/// nothing is retried.
pub async fn create_volumes(
    runtime: &dyn ContainerRuntime,
    job_id: &JobId,
) -> Result<(String, String), ExecutorError> {
    let job_labels = labels::job_labels(job_id);
    let input = labels::input_volume(job_id);
    let output = labels::output_volume(job_id);

    for volume in [&input, &output] {
        runtime
            .create_volume(volume, &job_labels)
            .await
            .map_err(ExecutorError::setup(format!("creating volume {}", volume)))?;
        debug!(job_id = %job_id, volume = %volume, "Created volume");
    }

    Ok((input, output))
}
