pub mod types;
pub mod labels;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{AlgorithmImage, FailureKind, InputFile, JobContext, JobId, JobReport, JobStatus};
pub use config::{ExecutorConfig, ResourceEnvelope, RetryPolicy};
