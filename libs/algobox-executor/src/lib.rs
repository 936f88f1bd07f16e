//! Single-job container executor.
//!
//! An [`Executor`] takes one algorithm image and a set of input files, runs the
//! algorithm in an isolated container against labeled volumes, decodes the JSON
//! result it leaves behind and removes everything it created.

pub mod docker;
pub mod error;
pub mod executor;
pub mod extract;
pub mod images;
pub mod reaper;
pub mod runner;
pub mod runtime;
pub mod staging;
pub mod volumes;

#[cfg(test)]
mod testing;

pub use docker::DockerRuntime;
pub use error::{report, ExecutorError};
pub use executor::Executor;
pub use reaper::{PruneTarget, Reaper, TeardownError};
pub use runtime::{ContainerRuntime, RuntimeError};
