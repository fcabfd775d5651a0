//! Exit codes following sysexits.h conventions.
//!
//! These codes give scripts a way to tell a bad invocation from an outage
//! or a model that produced garbage.

use lumen_core::hash::ParseContentHashError;
use lumen_core::{LockError, LumenError, StoreError};

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// General error (catch-all, including "nothing cached").
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (invalid arguments).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// Model output failed validation.
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Cannot open input file.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// Service unavailable (image origin, model provider, lock backend).
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const UNAVAILABLE: i32 = 69;

/// Local I/O error (scratch storage).
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Timed out generating or waiting for another generation; retry later.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TEMP_FAILURE: i32 = 75;

/// Missing or invalid configuration.
/// Maps to EX_CONFIG from sysexits.h.
pub const CONFIG_ERROR: i32 = 78;

/// Interrupted by the user.
pub const INTERRUPTED: i32 = 130;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(classify)
            .unwrap_or(GENERAL_ERROR);

        Self {
            code,
            message: Some(format!("{err:#}")),
        }
    }
}

/// Exit code for the first error in the chain we know how to classify.
fn classify(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    if let Some(err) = err.downcast_ref::<LumenError>() {
        return Some(match err {
            LumenError::FetchFailed { .. } | LumenError::Generation(_) => UNAVAILABLE,
            LumenError::Cancelled { .. } => INTERRUPTED,
            LumenError::CoalesceTimeout { .. } | LumenError::GenerationTimeout { .. } => TEMP_FAILURE,
            LumenError::Validation(_) => DATA_ERROR,
            LumenError::Io(_) => IO_ERROR,
            LumenError::Config(_) => CONFIG_ERROR,
        });
    }
    if err.downcast_ref::<ParseContentHashError>().is_some() {
        return Some(USAGE_ERROR);
    }
    if err.downcast_ref::<LockError>().is_some() || err.downcast_ref::<StoreError>().is_some() {
        return Some(UNAVAILABLE);
    }
    if let Some(err) = err.downcast_ref::<std::io::Error>() {
        return Some(match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => INPUT_ERROR,
            _ => IO_ERROR,
        });
    }
    None
}
