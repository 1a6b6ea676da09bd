//! Priority-ordered fallback execution of strategies for one job.
//!
//! ```text
//! catalog.candidates_for(size) ─► route filter ─► for each candidate:
//!     capability missing?  ─► Skipped, next (cancellable while probing)
//!     run under deadline   ─► Success: stop, return artifacts
//!                          ─► Failure / Timeout: next
//!     job cancelled?       ─► Timeout ("cancelled by caller"), stop
//! ```
//!
//! Each attempt writes into its own staging directory. A failed attempt's
//! directory is deleted before the next candidate runs, so a later
//! strategy never sees (or ships) a predecessor's partial output.

use crate::catalog::{Strategy, StrategyCatalog, StrategyContext};
use crate::config::{ConversionOptions, TargetFormat};
use crate::error::{ConvertError, StrategyError};
use crate::output::{ArtifactRef, AttemptOutcome, InputRef, JobId, StrategyAttempt};
use crate::probe::CapabilityProbe;
use crate::progress::ProgressReporter;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable description of one conversion job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    pub input: InputRef,
    pub target: TargetFormat,
    pub options: ConversionOptions,
}

/// What [`FallbackExecutor::execute`] produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    /// Artifacts of the winning attempt, still inside `output_dir`.
    pub artifacts: Vec<ArtifactRef>,
    pub attempts: Vec<StrategyAttempt>,
    /// Staging directory of the winning attempt.
    pub output_dir: Option<PathBuf>,
    /// Number of strategies that were size- and route-feasible.
    pub feasible: usize,
    pub cancelled: bool,
}

impl ExecutionOutcome {
    /// Collapse into the job-level result.
    pub fn into_result(self) -> Result<Vec<ArtifactRef>, ConvertError> {
        if self.succeeded {
            Ok(self.artifacts)
        } else if self.cancelled {
            Err(ConvertError::Cancelled {
                attempts: self.attempts,
            })
        } else {
            Err(ConvertError::AllStrategiesExhausted {
                attempts: self.attempts,
            })
        }
    }
}

enum RunEnd {
    Produced(Vec<ArtifactRef>),
    Errored(StrategyError),
    Deadline(Duration),
    Cancelled,
}

/// Runs the feasible strategies of a job in priority order until one succeeds.
pub struct FallbackExecutor {
    catalog: Arc<StrategyCatalog>,
    probe: Arc<CapabilityProbe>,
    default_timeout: Duration,
    staging_root: PathBuf,
}

impl FallbackExecutor {
    pub fn new(
        catalog: Arc<StrategyCatalog>,
        probe: Arc<CapabilityProbe>,
        default_timeout: Duration,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            probe,
            default_timeout,
            staging_root: staging_root.into(),
        }
    }

    /// Size- and route-feasible strategies for a job, by ascending priority.
    pub fn feasible(&self, job: &JobRequest) -> Vec<Arc<dyn Strategy>> {
        self.catalog
            .candidates_for(job.input.size_bytes)
            .into_iter()
            .filter(|s| s.handles(job.input.kind, job.target))
            .collect()
    }

    /// [`feasible`](Self::feasible), or [`ConvertError::NoFeasibleStrategy`]
    /// when that is empty. Touches neither the input nor any capability.
    pub fn plan(&self, job: &JobRequest) -> Result<Vec<Arc<dyn Strategy>>, ConvertError> {
        let feasible = self.feasible(job);
        if feasible.is_empty() {
            return Err(ConvertError::NoFeasibleStrategy {
                kind: job.input.kind.to_string(),
                target: job.target.to_string(),
                size_bytes: job.input.size_bytes,
                largest_limit: self.catalog.largest_limit(job.input.kind, job.target),
            });
        }
        Ok(feasible)
    }

    /// Run the fallback chain.
    ///
    /// Fails only with [`ConvertError::NoFeasibleStrategy`], before any
    /// attempt. Every other outcome, including exhaustion and cancellation,
    /// is reported through [`ExecutionOutcome`].
    pub async fn execute(
        &self,
        job: &JobRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ConvertError> {
        let feasible = self.plan(job)?;

        info!(
            "Job {}: {} feasible strategies for {} → {} ({} bytes)",
            job.job_id,
            feasible.len(),
            job.input.kind,
            job.target,
            job.input.size_bytes
        );

        let job_staging = self.staging_root.join(job.job_id.as_str());
        let mut outcome = ExecutionOutcome {
            succeeded: false,
            artifacts: Vec::new(),
            attempts: Vec::with_capacity(feasible.len()),
            output_dir: None,
            feasible: feasible.len(),
            cancelled: false,
        };

        for (idx, strategy) in feasible.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let started_at = Utc::now();
            let record = |outcome_kind: AttemptOutcome, detail: Option<String>| StrategyAttempt {
                strategy_name: strategy.name().to_string(),
                priority: strategy.priority(),
                started_at,
                ended_at: Utc::now(),
                outcome: outcome_kind,
                error_detail: detail,
            };

            // ── Capability gate ──────────────────────────────────────────
            let gate = async {
                for cap in strategy.required_capabilities() {
                    let probe = self.probe.check(&cap).await;
                    if !probe.available {
                        return Some((cap, probe.detail));
                    }
                }
                None
            };
            let missing = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let attempt = record(AttemptOutcome::Timeout, Some("cancelled by caller".into()));
                    reporter.record_attempt(attempt.clone());
                    outcome.attempts.push(attempt);
                    outcome.cancelled = true;
                    break;
                }
                missing = gate => missing,
            };
            if let Some((cap, detail)) = missing {
                debug!("Job {}: skipping '{}': {} unavailable", job.job_id, strategy.name(), cap);
                let attempt = record(
                    AttemptOutcome::Skipped {
                        reason: format!("missing capability: {cap}"),
                    },
                    Some(detail),
                );
                reporter.record_attempt(attempt.clone());
                outcome.attempts.push(attempt);
                continue;
            }

            // ── Run ──────────────────────────────────────────────────────
            let output_dir = job_staging.join(format!("{:02}-{}", idx, strategy.name()));
            if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
                let attempt = record(
                    AttemptOutcome::Failure,
                    Some(format!("cannot create staging dir {}: {e}", output_dir.display())),
                );
                reporter.record_attempt(attempt.clone());
                outcome.attempts.push(attempt);
                continue;
            }

            info!(
                "Job {}: trying '{}' (priority {})",
                job.job_id,
                strategy.name(),
                strategy.priority()
            );
            reporter.set_strategy(Some(strategy.name()));

            let attempt_token = cancel.child_token();
            let ctx = StrategyContext {
                job_id: job.job_id.clone(),
                input: job.input.clone(),
                output_dir: output_dir.clone(),
                target: job.target,
                options: job.options.clone(),
                reporter: reporter.clone(),
                cancel: attempt_token.clone(),
            };
            let deadline = strategy.timeout().unwrap_or(self.default_timeout);

            let end = tokio::select! {
                biased;
                _ = cancel.cancelled() => RunEnd::Cancelled,
                r = tokio::time::timeout(deadline, strategy.run(&ctx)) => match r {
                    Ok(Ok(artifacts)) => RunEnd::Produced(artifacts),
                    Ok(Err(e)) => RunEnd::Errored(e),
                    Err(_) => RunEnd::Deadline(deadline),
                },
            };
            // The run future is gone (children with kill_on_drop are killed);
            // blocking work still polling the token stops at its next checkpoint.
            attempt_token.cancel();
            reporter.set_strategy(None);

            let attempt = match end {
                RunEnd::Produced(artifacts) if !artifacts.is_empty() => {
                    info!(
                        "Job {}: '{}' succeeded with {} artifact(s)",
                        job.job_id,
                        strategy.name(),
                        artifacts.len()
                    );
                    let attempt = record(AttemptOutcome::Success, None);
                    reporter.record_attempt(attempt.clone());
                    outcome.attempts.push(attempt);
                    outcome.succeeded = true;
                    outcome.artifacts = artifacts;
                    outcome.output_dir = Some(output_dir);
                    break;
                }
                RunEnd::Produced(_) => record(
                    AttemptOutcome::Failure,
                    Some(StrategyError::EmptyOutput.to_string()),
                ),
                RunEnd::Errored(e) => record(AttemptOutcome::Failure, Some(e.to_string())),
                RunEnd::Deadline(d) => record(
                    AttemptOutcome::Timeout,
                    Some(format!("deadline of {}s exceeded", d.as_secs_f64())),
                ),
                RunEnd::Cancelled => {
                    outcome.cancelled = true;
                    record(AttemptOutcome::Timeout, Some("cancelled by caller".into()))
                }
            };

            warn!("Job {}: {}", job.job_id, attempt.summary());
            reporter.record_attempt(attempt.clone());
            outcome.attempts.push(attempt);
            discard(&output_dir).await;

            if outcome.cancelled {
                break;
            }
        }

        if !outcome.succeeded {
            discard(&job_staging).await;
        }
        Ok(outcome)
    }
}

async fn discard(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove staging dir {}: {}", dir.display(), e);
        }
    }
}
