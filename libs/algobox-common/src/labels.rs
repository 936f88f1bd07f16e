use crate::types::JobId;
use std::collections::HashMap;

/// Runtime naming semantics - defines only names, not runtime logic
/// Every container and volume of a job carries `job_id=<id>`; that label is
/// the only key used to find and tear down what a job created.

pub const JOB_LABEL: &str = "job_id";
pub const INPUT_MOUNT: &str = "/input/";
pub const OUTPUT_MOUNT: &str = "/output/";

/// Labels attached to every container and volume of a job
pub fn job_labels(job_id: &JobId) -> HashMap<String, String> {
    HashMap::from([(JOB_LABEL.to_string(), job_id.to_string())])
}

/// Runtime filter selecting everything labeled for a job
pub fn label_filter(job_id: &JobId) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("{}={}", JOB_LABEL, job_id)],
    )])
}

pub fn input_volume(job_id: &JobId) -> String {
    format!("{}-input", job_id)
}

pub fn output_volume(job_id: &JobId) -> String {
    format!("{}-output", job_id)
}
