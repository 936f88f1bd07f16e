//! Result Extractor
//!
//! **Core Responsibility:**
//! Read the result file the algorithm left in the output volume and decode it
//! into a JSON value.
//!
//! **Critical Properties:**
//! - The output volume is mounted read-only into the helper container
//! - The non-finite constants `NaN`, `Infinity` and `-Infinity` decode to
//!   `null`; they are rewritten before any number is parsed
//! - Nothing larger than `MAX_RESULT_BYTES` is held in memory

use crate::error::ExecutorError;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use algobox_common::labels::OUTPUT_MOUNT;
use algobox_common::{JobId, ResourceEnvelope};
use futures_util::StreamExt;
use serde_json::Value;
use std::borrow::Cow;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Ceiling for any single file read back from a container
pub const MAX_RESULT_BYTES: u64 = 2_000_000_000;

/// Tar framing around a single file: headers, padding and end-of-archive blocks
const ARCHIVE_OVERHEAD: u64 = 64 * 1024;

const TAR_BLOCK: usize = 512;

/// Ordered so `-Infinity` is tried before `Infinity`
const NON_FINITE: [&str; 3] = ["-Infinity", "Infinity", "NaN"];

fn too_big(path: &Path, size: u64) -> ExecutorError {
    ExecutorError::ResultFormat(format!(
        "{} is {} bytes, larger than the {} byte limit",
        path.display(),
        size,
        MAX_RESULT_BYTES
    ))
}

/// Replace bare non-finite constants outside string literals with `null`
fn neutralize_constants(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut copied_until = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }
        if let Some(token) = NON_FINITE
            .iter()
            .find(|t| bytes[i..].starts_with(t.as_bytes()))
        {
            let out = out.get_or_insert_with(|| String::with_capacity(text.len()));
            out.push_str(&text[copied_until..i]);
            out.push_str("null");
            i += token.len();
            copied_until = i;
            continue;
        }
        i += 1;
    }

    match out {
        Some(mut out) => {
            out.push_str(&text[copied_until..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(text),
    }
}

/// Decode a result payload.
///
/// Numbers outside the f64 range are rejected by the parser like any other
/// malformed payload.
pub fn parse_result(payload: &[u8]) -> Result<Value, ExecutorError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ExecutorError::ResultFormat(format!("result is not UTF-8: {}", e)))?;
    serde_json::from_str(&neutralize_constants(text))
        .map_err(|e| ExecutorError::ResultFormat(e.to_string()))
}

/// Run the helper image over the output volume and decode `result_path`.
pub async fn extract_result(
    runtime: &dyn ContainerRuntime,
    helper_image: &str,
    job_id: &JobId,
    resources: ResourceEnvelope,
    output_volume: &str,
    result_path: &Path,
) -> Result<Value, ExecutorError> {
    let path = result_path.to_string_lossy();
    let spec = ContainerSpec::for_job(helper_image, job_id, resources)
        .mount(output_volume, OUTPUT_MOUNT, true)
        .cmd(["cat", &*path])
        .output_limit(MAX_RESULT_BYTES);

    let output = match runtime.run_to_completion(&spec).await {
        Ok(output) => output,
        Err(RuntimeError::OutputTooLarge { .. }) => {
            return Err(ExecutorError::ResultFormat(format!(
                "{} is larger than the {} byte limit",
                path, MAX_RESULT_BYTES
            )));
        }
        Err(e) => return Err(ExecutorError::infrastructure("reading result file")(e)),
    };

    if output.exit_code != 0 {
        return Err(ExecutorError::ResultFormat(format!(
            "could not read {}: {}",
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if output.stdout.len() as u64 > MAX_RESULT_BYTES {
        return Err(too_big(result_path, output.stdout.len() as u64));
    }

    let value = parse_result(&output.stdout)?;
    info!(job_id = %job_id, bytes = output.stdout.len(), "Extracted result");
    Ok(value)
}

/// Download a single file from a container, refusing anything over
/// `MAX_RESULT_BYTES` before it is fully in memory.
pub async fn fetch_file(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    path: &Path,
) -> Result<Vec<u8>, ExecutorError> {
    let download = runtime
        .get_archive(container_id, path)
        .await
        .map_err(ExecutorError::infrastructure(format!("downloading {}", path.display())))?;

    if let Some(size) = download.declared_size {
        if size > MAX_RESULT_BYTES {
            return Err(too_big(path, size));
        }
    }

    let mut body = download.body;
    let mut buffer: Vec<u8> = Vec::new();
    let mut header_checked = false;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                return Err(ExecutorError::infrastructure(format!(
                    "downloading {}",
                    path.display()
                ))(e))
            }
        };
        buffer.extend_from_slice(&chunk);

        if !header_checked && buffer.len() >= TAR_BLOCK {
            let header = tar::Header::from_byte_slice(&buffer[..TAR_BLOCK]);
            let size = header
                .entry_size()
                .map_err(|e| ExecutorError::ResultFormat(format!("bad archive header: {}", e)))?;
            if size > MAX_RESULT_BYTES {
                return Err(too_big(path, size));
            }
            header_checked = true;
        }
        if buffer.len() as u64 > MAX_RESULT_BYTES + ARCHIVE_OVERHEAD {
            return Err(too_big(path, buffer.len() as u64));
        }
    }
    debug!(container_id = %container_id, archive_bytes = buffer.len(), "Downloaded archive");

    let wanted = path
        .file_name()
        .ok_or_else(|| ExecutorError::ResultFormat(format!("{} names no file", path.display())))?;
    let bad_archive = |e: std::io::Error| ExecutorError::ResultFormat(format!("bad archive: {}", e));

    let mut archive = tar::Archive::new(buffer.as_slice());
    for entry in archive.entries().map_err(bad_archive)? {
        let mut entry = entry.map_err(bad_archive)?;
        let size = entry.size();
        if size > MAX_RESULT_BYTES || size > buffer.len() as u64 {
            return Err(too_big(path, size));
        }
        let is_wanted = entry.path().map_err(bad_archive)?.file_name() == Some(wanted);
        if is_wanted {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(bad_archive)?;
            return Ok(contents);
        }
    }

    Err(ExecutorError::ResultFormat(format!(
        "{} not found in archive",
        path.display()
    )))
}
