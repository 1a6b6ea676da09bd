//! The conversion engine's public face.
//!
//! [`ConversionService`] accepts jobs, runs each on its own task behind a
//! FIFO worker pool, and exposes status, results, cancellation and
//! operator controls. Internally:
//!
//! ```text
//! submit ─► ProgressBus.create ─► no feasible strategy? fail now
//!        ─► wait for a worker slot
//!        ─► estimate units ─► ProgressBus.start
//!        ─► FallbackExecutor.execute
//!             ├─ success ─► ResourceJanitor.adopt ─► ProgressBus.complete
//!             └─ failure ─► ProgressBus.fail (with the attempt trail)
//! ```

use crate::catalog::StrategyCatalog;
use crate::config::{ConversionOptions, EngineConfig, TargetFormat};
use crate::error::ConvertError;
use crate::executor::{FallbackExecutor, JobRequest};
use crate::janitor::{MemorySampler, ResourceJanitor, SystemMemorySampler};
use crate::output::{
    ArtifactRef, CleanupSummary, DocumentKind, HealthReport, InputRef, JobId, JobResult,
    JobStatus, StrategyHealth,
};
use crate::probe::CapabilityProbe;
use crate::progress::{ProgressBus, ProgressReporter, ProgressStream};
use crate::strategies::{self, pdf_scan};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct JobEntry {
    cancel: CancellationToken,
    /// `None` until the job is terminal.
    outcome: Option<Result<Vec<ArtifactRef>, String>>,
    finished: Option<Instant>,
}

struct Inner {
    config: EngineConfig,
    catalog: Arc<StrategyCatalog>,
    probe: Arc<CapabilityProbe>,
    executor: FallbackExecutor,
    bus: Arc<ProgressBus>,
    janitor: Arc<ResourceJanitor>,
    slots: Arc<Semaphore>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

/// Orchestrates conversions. Cheap to clone; clones share one engine.
///
/// # Example
///
/// ```rust,no_run
/// use edgequake_docconv::{ConversionService, ConversionOptions, EngineConfig, InputRef, TargetFormat};
///
/// # async fn demo() -> Result<(), edgequake_docconv::ConvertError> {
/// let service = ConversionService::with_defaults(EngineConfig::default())?;
/// let _background = service.start_background();
///
/// let input = InputRef::from_path("report.pdf", Some("application/pdf"))?;
/// let job = service.submit(input, TargetFormat::Png, ConversionOptions::default());
/// let result = service.wait(&job).await?;
/// println!("{result:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConversionService {
    inner: Arc<Inner>,
}

impl ConversionService {
    /// Build a service sampling host memory through `sysinfo`.
    pub fn new(config: EngineConfig, catalog: StrategyCatalog, probe: CapabilityProbe) -> Self {
        Self::with_memory_sampler(config, catalog, probe, Arc::new(SystemMemorySampler::new()))
    }

    /// Build a service with every built-in strategy and capability check.
    pub fn with_defaults(config: EngineConfig) -> Result<Self, ConvertError> {
        let catalog = strategies::default_catalog()?;
        let probe = strategies::default_probe(config.probe_ttl);
        Ok(Self::new(config, catalog, probe))
    }

    pub fn with_memory_sampler(
        config: EngineConfig,
        catalog: StrategyCatalog,
        probe: CapabilityProbe,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let probe = Arc::new(probe);
        let executor = FallbackExecutor::new(
            Arc::clone(&catalog),
            Arc::clone(&probe),
            config.strategy_timeout,
            config.staging_dir(),
        );
        let janitor = Arc::new(ResourceJanitor::new(
            config.janitor.clone(),
            config.artifact_dir(),
            config.extra_watch_dirs.clone(),
            sampler,
        )
        .with_staging_root(config.staging_dir()));
        info!(
            "Conversion service ready: {} strategies, {} worker slot(s), work dir {}",
            catalog.len(),
            config.max_concurrent_jobs,
            config.work_dir.display()
        );
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                config,
                catalog,
                probe,
                executor,
                bus: Arc::new(ProgressBus::new()),
                janitor,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Accept a job and start it in the background.
    ///
    /// Every call creates a new job. Must be called within a Tokio runtime.
    pub fn submit(
        &self,
        input: InputRef,
        target: TargetFormat,
        options: ConversionOptions,
    ) -> JobId {
        let (job, cancel) = self.inner.register(input, target, options);
        let job_id = job.job_id.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = inner.run_job(job, cancel).await;
        });
        job_id
    }

    /// Run a job to completion on the current task and return its artifacts.
    pub async fn convert(
        &self,
        input: InputRef,
        target: TargetFormat,
        options: ConversionOptions,
    ) -> Result<Vec<ArtifactRef>, ConvertError> {
        let (job, cancel) = self.inner.register(input, target, options);
        self.inner.run_job(job, cancel).await
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobStatus, ConvertError> {
        self.inner.bus.snapshot(job_id)
    }

    /// Live event stream of a job; see [`ProgressBus::subscribe`].
    pub fn subscribe(&self, job_id: &JobId) -> Result<ProgressStream, ConvertError> {
        self.inner.bus.subscribe(job_id)
    }

    /// Output of a job. Evicted artifacts are never returned.
    pub fn result(&self, job_id: &JobId) -> Result<JobResult, ConvertError> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.get(job_id).ok_or_else(|| ConvertError::JobNotFound {
            id: job_id.to_string(),
        })?;
        Ok(match &entry.outcome {
            None => JobResult::NotReady,
            Some(Err(detail)) => JobResult::Failed(detail.clone()),
            Some(Ok(artifacts)) => {
                let live: Vec<ArtifactRef> = artifacts
                    .iter()
                    .filter(|a| self.inner.janitor.is_live(a))
                    .cloned()
                    .collect();
                if live.is_empty() {
                    JobResult::Expired
                } else {
                    JobResult::Ready(live)
                }
            }
        })
    }

    /// Wait until the job is terminal, then return its result.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobResult, ConvertError> {
        let mut events = self.subscribe(job_id)?;
        while events.next().await.is_some() {}
        self.result(job_id)
    }

    /// Ask a job to stop. Stops the fallback chain; a queued job fails
    /// without attempting anything. No-op for finished jobs.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), ConvertError> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.get(job_id).ok_or_else(|| ConvertError::JobNotFound {
            id: job_id.to_string(),
        })?;
        if entry.outcome.is_none() {
            info!("Job {}: cancellation requested", job_id);
            entry.cancel.cancel();
        }
        Ok(())
    }

    // ── Operator surface ─────────────────────────────────────────────────

    /// Run a janitor pass now.
    pub async fn cleanup_now(&self) -> Result<CleanupSummary, ConvertError> {
        let janitor = Arc::clone(&self.inner.janitor);
        tokio::task::spawn_blocking(move || janitor.perform_cleanup())
            .await
            .map_err(|e| ConvertError::Internal(format!("cleanup task panicked: {e}")))
    }

    /// Strategy availability, memory, disk and active jobs.
    pub async fn health(&self) -> Result<HealthReport, ConvertError> {
        let mut strategies = Vec::with_capacity(self.inner.catalog.len());
        for s in self.inner.catalog.strategies() {
            let mut missing = Vec::new();
            for cap in s.required_capabilities() {
                if !self.inner.probe.check(&cap).await.available {
                    missing.push(cap.to_string());
                }
            }
            strategies.push(StrategyHealth {
                name: s.name().to_string(),
                priority: s.priority(),
                available: missing.is_empty(),
                max_input_bytes: s.max_input_bytes(),
                missing,
            });
        }

        let janitor = Arc::clone(&self.inner.janitor);
        let (memory, disk) =
            tokio::task::spawn_blocking(move || (janitor.sample_memory(), janitor.disk_usage()))
                .await
                .map_err(|e| ConvertError::Internal(format!("health task panicked: {e}")))?;

        Ok(HealthReport {
            strategies,
            memory,
            disk,
            active_jobs: self.inner.bus.active_count(),
            checked_at: Utc::now(),
        })
    }

    /// Spawn the janitor loops and the retention purge.
    ///
    /// They run until the returned handle is shut down or dropped.
    pub fn start_background(&self) -> BackgroundTasks {
        let token = CancellationToken::new();
        let mut handles = Arc::clone(&self.inner.janitor).spawn(token.child_token());

        let inner = Arc::clone(&self.inner);
        let purge_token = token.child_token();
        let period = (self.inner.config.retention / 10)
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = purge_token.cancelled() => break,
                    _ = interval.tick() => { inner.purge_expired(); }
                }
            }
            debug!("Retention purge loop shutting down");
        }));

        BackgroundTasks { token, handles }
    }

    /// Drop terminal jobs older than the retention window.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// The capability probe, e.g. to invalidate after a redeploy.
    pub fn probe(&self) -> &CapabilityProbe {
        &self.inner.probe
    }

    pub fn janitor(&self) -> &ResourceJanitor {
        &self.inner.janitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl Inner {
    fn register(
        &self,
        input: InputRef,
        target: TargetFormat,
        options: ConversionOptions,
    ) -> (JobRequest, CancellationToken) {
        let job = JobRequest {
            job_id: JobId::new(),
            input,
            target,
            options,
        };
        let cancel = CancellationToken::new();
        self.bus.create(&job.job_id);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job.job_id.clone(),
                JobEntry {
                    cancel: cancel.clone(),
                    outcome: None,
                    finished: None,
                },
            );
        info!(
            "Job {} accepted: {} ({} bytes, {}) → {}",
            job.job_id,
            job.input.path.display(),
            job.input.size_bytes,
            job.input.kind,
            job.target
        );
        (job, cancel)
    }

    async fn run_job(
        &self,
        job: JobRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<ArtifactRef>, ConvertError> {
        let result = self.execute_job(&job, &cancel).await;

        let stored = match &result {
            Ok(artifacts) => Ok(artifacts.clone()),
            Err(e) => Err(e.to_string()),
        };
        if let Some(entry) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&job.job_id)
        {
            entry.outcome = Some(stored);
            entry.finished = Some(Instant::now());
        }

        // Publish only after the outcome is stored, so a waiter woken by
        // the terminal event always finds the result.
        match &result {
            Ok(artifacts) => {
                let strategy = self
                    .bus
                    .snapshot(&job.job_id)
                    .ok()
                    .and_then(|s| s.attempts.last().map(|a| a.strategy_name.clone()))
                    .unwrap_or_default();
                self.bus.complete(
                    &job.job_id,
                    format!("{} artifact(s) via {}", artifacts.len(), strategy),
                );
            }
            Err(e) => {
                error!("Job {} failed: {}", job.job_id, e);
                self.bus.fail(&job.job_id, e.to_string());
            }
        }
        result
    }

    async fn execute_job(
        &self,
        job: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ArtifactRef>, ConvertError> {
        // Rejected before queueing and before the input is read.
        if job.options.pages.is_empty() {
            return Err(ConvertError::InvalidConfig(format!(
                "page selection {:?} names no page",
                job.options.pages
            )));
        }
        self.executor.plan(job)?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConvertError::Cancelled { attempts: Vec::new() });
            }
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map_err(|_| ConvertError::Internal("worker pool closed".into()))?,
        };

        let _claim = self.janitor.claim(&job.job_id);
        let total_units = estimate_units(job).await;
        self.bus.start(&job.job_id, total_units);

        let reporter = ProgressReporter::new(Arc::clone(&self.bus), job.job_id.clone());
        let outcome = self.executor.execute(job, &reporter, cancel).await?;
        let output_dir = outcome.output_dir.clone();
        let artifacts = outcome.into_result()?;

        match output_dir {
            Some(dir) => {
                let adopted = self.janitor.adopt(&job.job_id, &dir, artifacts).await;
                if adopted.is_err() {
                    let job_staging = self.config.staging_dir().join(job.job_id.as_str());
                    let _ = tokio::fs::remove_dir_all(job_staging).await;
                }
                adopted
            }
            None => {
                self.janitor.register(&artifacts);
                Ok(artifacts)
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let retention = self.config.retention;
        let purged = self.bus.purge_expired(retention);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, e| e.finished.map_or(true, |at| at.elapsed() < retention));
        purged
    }
}

/// Units of work for progress: selected pages of a PDF, otherwise 1.
///
/// Only called for jobs some strategy accepts, so the scan is bounded by
/// the largest strategy input limit.
async fn estimate_units(job: &JobRequest) -> usize {
    if job.input.kind != DocumentKind::Pdf || !job.target.is_raster() {
        return 1;
    }
    let path = job.input.path.clone();
    match tokio::task::spawn_blocking(move || pdf_scan::scan_file(&path)).await {
        Ok(Ok(outline)) => job.options.pages.to_indices(outline.pages).len().max(1),
        Ok(Err(e)) => {
            warn!("Job {}: page count unavailable: {}", job.job_id, e);
            1
        }
        Err(e) => {
            warn!("Job {}: page count task failed: {}", job.job_id, e);
            1
        }
    }
}

/// Handle to the background loops started by
/// [`ConversionService::start_background`].
pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
