//! Error types for the edgequake-docconv library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`] is **fatal**: the job cannot produce a result at all
//!   (input missing, every strategy exhausted, job cancelled, bad config).
//!   Returned as `Err(ConvertError)` from [`crate::service::ConversionService`]
//!   and stored as the terminal failure of a job.
//!
//! * [`StrategyError`] is **non-fatal**: one strategy failed (subprocess
//!   crashed, produced nothing, ran out of time) but the next candidate may
//!   still succeed. The executor swallows it into the job's attempt trail
//!   ([`crate::output::StrategyAttempt`]) and moves on.

use crate::output::{AttemptOutcome, StrategyAttempt};
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docconv library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    // ── Job-level failures ────────────────────────────────────────────────
    /// The input is larger than every registered strategy accepts (or no
    /// strategy handles the requested route). No strategy was attempted.
    #[error("No strategy can convert {kind} → {target} at {size_bytes} bytes (largest accepted: {largest_limit} bytes)")]
    NoFeasibleStrategy {
        kind: String,
        target: String,
        size_bytes: u64,
        largest_limit: u64,
    },

    /// Every feasible strategy was skipped or failed.
    #[error("All {} strategies exhausted:\n{}", attempts.len(), format_trail(attempts))]
    AllStrategiesExhausted { attempts: Vec<StrategyAttempt> },

    /// The caller cancelled the job; no further strategies were tried.
    #[error("Conversion cancelled after {} attempt(s):\n{}", attempts.len(), format_trail(attempts))]
    Cancelled { attempts: Vec<StrategyAttempt> },

    /// Unknown (or already purged) job id.
    #[error("Job '{id}' not found")]
    JobNotFound { id: String },

    // ── Catalog errors ────────────────────────────────────────────────────
    /// Two strategies were registered under the same name.
    #[error("Strategy '{name}' is already registered")]
    DuplicateStrategyName { name: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not prepare a staging directory or move artifacts into place.
    #[error("Artifact storage failed at '{path}': {source}")]
    ArtifactStorage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// The attempt trail carried by job-level failures, if any.
    pub fn attempts(&self) -> &[StrategyAttempt] {
        match self {
            ConvertError::AllStrategiesExhausted { attempts }
            | ConvertError::Cancelled { attempts } => attempts,
            _ => &[],
        }
    }
}

/// A non-fatal error raised by a single strategy run.
///
/// Recorded as the `error_detail` of a [`StrategyAttempt`]; never aborts
/// the fallback chain on its own.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The external program could not be started at all.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program exited unsuccessfully.
    #[error("'{program}' exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The strategy ran but produced zero artifacts.
    #[error("strategy produced no output")]
    EmptyOutput,

    /// The input could not be read or parsed by this backend.
    #[error("unreadable input: {0}")]
    UnreadableInput(String),

    /// Rendering or encoding of a specific page failed.
    #[error("page {page}: {detail}")]
    PageFailed { page: usize, detail: String },

    /// The strategy noticed cancellation and stopped early.
    #[error("stopped on request")]
    Stopped,

    /// Filesystem error while writing output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Render an attempt trail as one line per attempt.
///
/// Used by the job-level error messages so a user never sees a bare
/// "conversion failed".
pub fn format_trail(attempts: &[StrategyAttempt]) -> String {
    let mut out = String::new();
    for a in attempts {
        let outcome = match &a.outcome {
            AttemptOutcome::Success => "success".to_string(),
            AttemptOutcome::Failure => "failed".to_string(),
            AttemptOutcome::Timeout => "timed out".to_string(),
            AttemptOutcome::Skipped { reason } => format!("skipped ({reason})"),
        };
        let _ = write!(out, "  - {} [p{}]: {}", a.strategy_name, a.priority, outcome);
        if let Some(ref detail) = a.error_detail {
            let _ = write!(out, ": {detail}");
        }
        out.push('\n');
    }
    out
}
