use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Job identifier
/// Doubles as the runtime label value, so it must never repeat across jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        JobId(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of an input file live on the host
#[derive(Debug, Clone)]
pub enum InputSource {
    Path(PathBuf),
    Memory(Vec<u8>),
}

/// Input File (already validated by the caller)
#[derive(Debug, Clone)]
pub struct InputFile {
    name: String,
    size: u64,
    source: InputSource,
}

impl InputFile {
    /// Reference a file on disk; the size is taken from its metadata
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            name: path.to_string_lossy().into_owned(),
            size,
            source: InputSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            source: InputSource::Memory(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    /// Name the file gets inside the container: the last component of the
    /// logical name. `None` for names like `..` or `/`.
    pub fn entry_name(&self) -> Option<&str> {
        Path::new(&self.name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
    }
}

/// Algorithm image archive on disk plus its content digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmImage {
    pub archive: PathBuf,
    pub digest: String,
}

/// Job Context (Immutable)
/// Everything one execution needs; built once by the caller
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub inputs: Vec<InputFile>,
    pub image: AlgorithmImage,
    /// Absolute path of the result file inside the output volume
    pub result_path: PathBuf,
}

/// Coarse outcome shown to whoever asked for the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    /// The algorithm or its output is at fault
    Failed,
    /// The executor or the container runtime is at fault
    Errored,
}

/// Distinguishable failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Setup,
    Stage,
    Algorithm,
    TimedOut,
    Infrastructure,
    ResultFormat,
    Teardown,
}

impl FailureKind {
    /// Job-level failures are reported to the submitter; the rest go to an operator
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            FailureKind::Algorithm | FailureKind::TimedOut | FailureKind::ResultFormat
        )
    }

    pub fn status(&self) -> JobStatus {
        if self.is_job_failure() {
            JobStatus::Failed
        } else {
            JobStatus::Errored
        }
    }
}

/// Job Report
/// Final outcome of one execution as handed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobReport {
    pub fn succeeded(job_id: JobId, result: serde_json::Value) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            failure: None,
            detail: None,
            result: Some(result),
        }
    }

    pub fn failed(job_id: JobId, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            job_id,
            status: kind.status(),
            failure: Some(kind),
            detail: Some(detail.into()),
            result: None,
        }
    }
}
