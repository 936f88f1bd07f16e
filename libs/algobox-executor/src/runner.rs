use crate::error::ExecutorError;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use algobox_common::labels::{self, INPUT_MOUNT, OUTPUT_MOUNT};
use algobox_common::{JobId, ResourceEnvelope};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stop whatever is still running under the job label
async fn stop_job_containers(runtime: &dyn ContainerRuntime, job_id: &JobId) {
    let filter = labels::label_filter(job_id);
    match runtime.list_running(&filter).await {
        Ok(ids) => {
            for id in ids {
                if let Err(e) = runtime.stop_container(&id).await {
                    warn!(job_id = %job_id, container_id = %id, error = %e, "Failed to stop container");
                }
            }
        }
        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to list running containers"),
    }
}

/// Run the algorithm image against the job volumes and wait for it to exit.
///
/// Both volumes are mounted read-write. A non-zero exit is the algorithm's
/// failure and carries its stderr; runtime errors are infrastructure failures.
pub async fn run_algorithm(
    runtime: &dyn ContainerRuntime,
    algorithm_digest: &str,
    job_id: &JobId,
    resources: ResourceEnvelope,
    input_volume: &str,
    output_volume: &str,
    timeout: Option<Duration>,
) -> Result<(), ExecutorError> {
    let spec = ContainerSpec::for_job(algorithm_digest, job_id, resources)
        .mount(input_volume, INPUT_MOUNT, false)
        .mount(output_volume, OUTPUT_MOUNT, false)
        .discard_stdout();

    info!(job_id = %job_id, image = %algorithm_digest, "Running algorithm container");
    let start_time = Instant::now();

    let run = runtime.run_to_completion(&spec);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %job_id, limit_secs = limit.as_secs(), "Algorithm timed out");
                stop_job_containers(runtime, job_id).await;
                return Err(ExecutorError::TimedOut { limit });
            }
        },
        None => run.await,
    };
    let output = result.map_err(ExecutorError::infrastructure("running algorithm container"))?;

    let execution_time_ms = start_time.elapsed().as_millis() as u64;
    info!(
        job_id = %job_id,
        exit_code = output.exit_code,
        execution_time_ms,
        "Algorithm container exited"
    );

    if output.exit_code != 0 {
        return Err(ExecutorError::Algorithm {
            exit_code: output.exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeError;
    use crate::testing::{Call, FakeRuntime, RunScript};
    use algobox_common::FailureKind;

    const DIGEST: &str = "sha256:0123abcd";

    #[tokio::test]
    async fn test_successful_run() {
        let runtime = FakeRuntime::new();
        let job_id = JobId::new();

        run_algorithm(
            &runtime,
            DIGEST,
            &job_id,
            ResourceEnvelope::default(),
            "in",
            "out",
            None,
        )
        .await
        .unwrap();

        let spec = match &runtime.calls()[0] {
            Call::Run(spec) => spec.clone(),
            other => panic!("expected run, got {:?}", other),
        };
        assert_eq!(spec.image, DIGEST);
        assert!(spec.cmd.is_none());
        assert!(!spec.capture_stdout);
        assert!(spec.resources.network_disabled);
        assert_eq!(spec.labels["job_id"], job_id.to_string());
        let targets: Vec<_> = spec
            .mounts
            .iter()
            .map(|m| (m.volume.as_str(), m.target.as_str(), m.read_only))
            .collect();
        assert_eq!(
            targets,
            vec![("in", "/input/", false), ("out", "/output/", false)]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_algorithm_failure() {
        let runtime = FakeRuntime::new();
        runtime.push_run(RunScript::exit(1, "boom"));

        let err = run_algorithm(
            &runtime,
            DIGEST,
            &JobId::new(),
            ResourceEnvelope::default(),
            "in",
            "out",
            None,
        )
        .await
        .unwrap_err();

        match err {
            ExecutorError::Algorithm { exit_code, stderr } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected algorithm failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_runtime_error_is_infrastructure_failure() {
        let runtime = FakeRuntime::new();
        runtime.push_run(RunScript::Fail(RuntimeError::Api {
            status: 404,
            message: "No such image".to_string(),
        }));

        let err = run_algorithm(
            &runtime,
            DIGEST,
            &JobId::new(),
            ResourceEnvelope::default(),
            "in",
            "out",
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Infrastructure);
    }

    #[tokio::test]
    async fn test_timeout_stops_container() {
        let runtime = FakeRuntime::new();
        let job_id = JobId::new();
        runtime.push_run(RunScript::Hang);

        let err = run_algorithm(
            &runtime,
            DIGEST,
            &job_id,
            ResourceEnvelope::default(),
            "in",
            "out",
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExecutorError::TimedOut { .. }));
        assert_eq!(err.kind(), FailureKind::TimedOut);
        assert_eq!(runtime.count(|c| matches!(c, Call::Stop(_))), 1);
        assert_eq!(runtime.running_count(), 0);
    }
}
