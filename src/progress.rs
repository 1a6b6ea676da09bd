//! Per-job status tracking with live, ordered event streams.
//!
//! Every job owns one record behind its own mutex, so updates to one job
//! never wait on another. The job map itself is only write-locked when a
//! record is inserted or purged.
//!
//! State transitions are applied and published while the record lock is
//! held, so subscribers see events in exactly the order the job moved
//! through them. A new subscriber first receives a
//! [`ProgressEvent::Snapshot`] of the current status, so nothing published
//! before it subscribed is lost.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docconv::{JobId, ProgressBus, JobState};
//!
//! let bus = ProgressBus::new();
//! let job = JobId::new();
//! bus.start(&job, 4);
//! bus.advance(&job, 2);
//! bus.advance(&job, 1); // ignored: progress never goes backwards
//! assert_eq!(bus.snapshot(&job).unwrap().current_page, 2);
//! bus.complete(&job, "4 pages");
//! assert_eq!(bus.snapshot(&job).unwrap().state, JobState::Succeeded);
//! ```

use crate::error::ConvertError;
use crate::output::{JobId, JobState, JobStatus, StrategyAttempt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// A state transition of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Current status at the moment of subscribing.
    Snapshot { status: JobStatus },
    Started { job_id: JobId, total_units: usize },
    StrategyChanged { job_id: JobId, strategy: Option<String> },
    Advanced {
        job_id: JobId,
        current_page: usize,
        total_units: usize,
        percentage: u8,
    },
    Warning { job_id: JobId, message: String },
    Attempt { job_id: JobId, attempt: StrategyAttempt },
    Completed { job_id: JobId, summary: String },
    Failed { job_id: JobId, error: String },
}

impl ProgressEvent {
    /// `true` for the last event a job ever publishes.
    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. } => true,
            ProgressEvent::Snapshot { status } => status.state.is_terminal(),
            _ => false,
        }
    }
}

/// Live event stream of one job. Ends after the terminal event.
pub type ProgressStream = UnboundedReceiverStream<ProgressEvent>;

struct JobRecord {
    status: JobStatus,
    subscribers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    terminal_at: Option<Instant>,
}

impl JobRecord {
    fn new(id: &JobId) -> Self {
        Self {
            status: JobStatus {
                id: id.clone(),
                state: JobState::Created,
                current_page: 0,
                total_units: 1,
                percentage: 0,
                strategy_in_use: None,
                errors: Vec::new(),
                warnings: Vec::new(),
                attempts: Vec::new(),
                summary: None,
                created_at: Utc::now(),
                finished_at: None,
            },
            subscribers: Vec::new(),
            terminal_at: None,
        }
    }

    fn publish(&mut self, event: ProgressEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish(&mut self, state: JobState, event: ProgressEvent) {
        self.status.state = state;
        self.status.strategy_in_use = None;
        self.status.finished_at = Some(Utc::now());
        self.terminal_at = Some(Instant::now());
        self.publish(event);
        // Dropping the senders ends every subscriber's stream.
        self.subscribers.clear();
    }
}

/// Event-sourced status tracker for all jobs.
#[derive(Default)]
pub struct ProgressBus {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job in the `Created` state. No-op if it already exists.
    pub fn create(&self, job_id: &JobId) {
        self.record_or_insert(job_id);
    }

    /// Move a job to `Running` with `total_units` units of work.
    pub fn start(&self, job_id: &JobId, total_units: usize) {
        let record = self.record_or_insert(job_id);
        let mut r = lock(&record);
        if r.status.state.is_terminal() {
            warn!("Job {}: start after terminal state ignored", job_id);
            return;
        }
        r.status.state = JobState::Running;
        r.status.total_units = total_units.max(1);
        let total_units = r.status.total_units;
        r.publish(ProgressEvent::Started {
            job_id: job_id.clone(),
            total_units,
        });
    }

    /// Record which strategy is currently running (`None` between attempts).
    pub fn set_strategy(&self, job_id: &JobId, strategy: Option<&str>) {
        self.update(job_id, |r| {
            r.status.strategy_in_use = strategy.map(String::from);
            Some(ProgressEvent::StrategyChanged {
                job_id: job_id.clone(),
                strategy: r.status.strategy_in_use.clone(),
            })
        });
    }

    /// Set the number of completed units.
    ///
    /// Progress is monotonic: a value below the current one is ignored and
    /// logged. Values are clamped to `total_units`, and the percentage stays
    /// below 100 until [`complete`](Self::complete).
    pub fn advance(&self, job_id: &JobId, completed_units: usize) {
        self.update(job_id, |r| {
            let s = &mut r.status;
            if completed_units < s.current_page {
                warn!(
                    "Job {}: progress went backwards ({} < {}), ignored",
                    job_id, completed_units, s.current_page
                );
                return None;
            }
            let completed = completed_units.min(s.total_units);
            if completed == s.current_page {
                return None;
            }
            s.current_page = completed;
            s.percentage = ((completed * 100) / s.total_units).min(99) as u8;
            Some(ProgressEvent::Advanced {
                job_id: job_id.clone(),
                current_page: s.current_page,
                total_units: s.total_units,
                percentage: s.percentage,
            })
        });
    }

    /// Attach a non-fatal warning to a job.
    pub fn warn(&self, job_id: &JobId, message: impl Into<String>) {
        let message = message.into();
        self.update(job_id, |r| {
            r.status.warnings.push(message.clone());
            Some(ProgressEvent::Warning {
                job_id: job_id.clone(),
                message,
            })
        });
    }

    /// Append an attempt to the job's trail. Unsuccessful attempts also
    /// land in the job's error list.
    pub fn record_attempt(&self, job_id: &JobId, attempt: StrategyAttempt) {
        self.update(job_id, |r| {
            if !attempt.is_success() {
                r.status.errors.push(attempt.summary());
            }
            r.status.attempts.push(attempt.clone());
            Some(ProgressEvent::Attempt {
                job_id: job_id.clone(),
                attempt,
            })
        });
    }

    /// Mark a job `Succeeded`. The percentage reaches 100 here and only here.
    pub fn complete(&self, job_id: &JobId, summary: impl Into<String>) {
        let summary = summary.into();
        let Some(record) = self.record(job_id) else {
            warn!("Job {}: complete for unknown job", job_id);
            return;
        };
        let mut r = lock(&record);
        if r.status.state.is_terminal() {
            warn!("Job {}: already terminal, complete ignored", job_id);
            return;
        }
        r.status.current_page = r.status.total_units;
        r.status.percentage = 100;
        r.status.summary = Some(summary.clone());
        r.finish(
            JobState::Succeeded,
            ProgressEvent::Completed {
                job_id: job_id.clone(),
                summary,
            },
        );
        debug!("Job {} succeeded", job_id);
    }

    /// Mark a job `Failed` with a full diagnostic message.
    pub fn fail(&self, job_id: &JobId, error: impl Into<String>) {
        let error = error.into();
        let record = self.record_or_insert(job_id);
        let mut r = lock(&record);
        if r.status.state.is_terminal() {
            warn!("Job {}: already terminal, fail ignored", job_id);
            return;
        }
        r.status.summary = Some(error.clone());
        r.finish(
            JobState::Failed,
            ProgressEvent::Failed {
                job_id: job_id.clone(),
                error,
            },
        );
        debug!("Job {} failed", job_id);
    }

    /// Current status of a job.
    pub fn snapshot(&self, job_id: &JobId) -> Result<JobStatus, ConvertError> {
        self.record(job_id)
            .map(|record| lock(&record).status.clone())
            .ok_or_else(|| ConvertError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    /// Subscribe to a job's events.
    ///
    /// The stream opens with a snapshot and ends after the terminal event.
    /// Subscribing to a finished job yields just the snapshot.
    pub fn subscribe(&self, job_id: &JobId) -> Result<ProgressStream, ConvertError> {
        let record = self.record(job_id).ok_or_else(|| ConvertError::JobNotFound {
            id: job_id.to_string(),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut r = lock(&record);
        let _ = tx.send(ProgressEvent::Snapshot {
            status: r.status.clone(),
        });
        if !r.status.state.is_terminal() {
            r.subscribers.push(tx);
        }
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Drop terminal jobs older than `retention`. Returns how many were purged.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, record| match lock(record).terminal_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let purged = before - jobs.len();
        if purged > 0 {
            debug!("Purged {} expired job record(s)", purged);
        }
        purged
    }

    /// Jobs not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| !lock(r).status.state.is_terminal())
            .count()
    }

    fn record(&self, job_id: &JobId) -> Option<Arc<Mutex<JobRecord>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    fn record_or_insert(&self, job_id: &JobId) -> Arc<Mutex<JobRecord>> {
        if let Some(r) = self.record(job_id) {
            return r;
        }
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            jobs.entry(job_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(JobRecord::new(job_id)))),
        )
    }

    /// Apply `f` to a non-terminal record and publish what it returns.
    fn update(&self, job_id: &JobId, f: impl FnOnce(&mut JobRecord) -> Option<ProgressEvent>) {
        let Some(record) = self.record(job_id) else {
            warn!("Job {}: update for unknown job ignored", job_id);
            return;
        };
        let mut r = lock(&record);
        if r.status.state.is_terminal() {
            debug!("Job {}: update after terminal state ignored", job_id);
            return;
        }
        if let Some(event) = f(&mut r) {
            r.publish(event);
        }
    }
}

fn lock(record: &Mutex<JobRecord>) -> std::sync::MutexGuard<'_, JobRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A job-scoped handle strategies use to report progress.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<ProgressBus>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn new(bus: Arc<ProgressBus>, job_id: JobId) -> Self {
        Self { bus, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Report `n` units done so far.
    pub fn units_done(&self, n: usize) {
        self.bus.advance(&self.job_id, n);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.bus.warn(&self.job_id, message);
    }

    pub(crate) fn set_strategy(&self, strategy: Option<&str>) {
        self.bus.set_strategy(&self.job_id, strategy);
    }

    pub(crate) fn record_attempt(&self, attempt: StrategyAttempt) {
        self.bus.record_attempt(&self.job_id, attempt);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish()
    }
}
