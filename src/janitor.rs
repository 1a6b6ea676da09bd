//! Disk-footprint and memory-pressure cleanup of artifact directories.
//!
//! The janitor watches the artifact root plus any extra directories (e.g.
//! an upload spool). Three policies apply:
//!
//! | Policy | Trigger | Rule |
//! |--------|---------|------|
//! | age | every pass | delete files older than `max_age` |
//! | quota | every pass | delete oldest-first while a directory exceeds `max_quota_bytes`, stopping at files younger than `grace_period` |
//! | pressure | memory usage > `pressure_threshold` | quota pass against `emergency_quota_bytes`, grace ignored |
//!
//! In-flight work never lives under a watched directory: attempts write to
//! a staging area, and a finished job's directory is moved in with a single
//! rename by [`ResourceJanitor::adopt`]. Names starting with `.` or ending
//! in `.tmp` are spared by the quota and pressure passes, but once older
//! than `max_age` they are leftovers and age eviction removes them.
//!
//! When a staging root is set, each cleanup pass also deletes job staging
//! directories that nothing has touched for `max_age` and that no running
//! job holds a [`StagingClaim`] on.
//!
//! All filesystem work here is blocking; async callers go through
//! `spawn_blocking`.

use crate::config::JanitorConfig;
use crate::error::ConvertError;
use crate::output::{ArtifactRef, CleanupSummary, DiskUsage, JobId, MemoryReport};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Memory sampling ──────────────────────────────────────────────────────

/// Source of host memory figures, in bytes.
pub trait MemorySampler: Send + Sync {
    /// Returns `(used, total)`.
    fn sample(&self) -> (u64, u64);
}

/// [`MemorySampler`] backed by `sysinfo`.
pub struct SystemMemorySampler {
    sys: Mutex<sysinfo::System>,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> (u64, u64) {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        (sys.used_memory(), sys.total_memory())
    }
}

// ── Janitor ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FileEntry {
    path: PathBuf,
    size: u64,
    age: Duration,
    /// Temp-named, or below a temp-named directory.
    in_flight: bool,
}

/// Enforces the eviction policies over the watched directories.
pub struct ResourceJanitor {
    config: JanitorConfig,
    artifact_root: PathBuf,
    watched: Vec<PathBuf>,
    /// Live artifacts and their owning job.
    registry: Mutex<HashMap<PathBuf, JobId>>,
    staging_root: Option<PathBuf>,
    /// Jobs whose staging directory is in use.
    claimed: Mutex<HashSet<JobId>>,
    sampler: Arc<dyn MemorySampler>,
    /// Serialises passes so a timer pass and a manual one never interleave.
    pass: Mutex<()>,
}

impl ResourceJanitor {
    /// `artifact_root` is always watched; `extra` directories are added to it.
    pub fn new(
        config: JanitorConfig,
        artifact_root: impl Into<PathBuf>,
        extra: Vec<PathBuf>,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        let artifact_root = artifact_root.into();
        let mut watched = vec![artifact_root.clone()];
        watched.extend(extra);
        Self {
            config,
            artifact_root,
            watched,
            registry: Mutex::new(HashMap::new()),
            staging_root: None,
            claimed: Mutex::new(HashSet::new()),
            sampler,
            pass: Mutex::new(()),
        }
    }

    /// Also sweep abandoned job directories under `root`.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &JanitorConfig {
        &self.config
    }

    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Run age eviction, then quota eviction, over every watched directory.
    pub fn perform_cleanup(&self) -> CleanupSummary {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = CleanupSummary::default();

        for dir in &self.watched {
            // Age
            let (expired, kept): (Vec<_>, Vec<_>) = scan(dir)
                .into_iter()
                .partition(|f| f.age > self.config.max_age);
            for f in &expired {
                self.evict(f, &mut summary);
            }

            // Quota
            let settled = kept.into_iter().filter(|f| !f.in_flight).collect();
            summary += self.enforce_quota(
                settled,
                self.config.max_quota_bytes,
                Some(self.config.grace_period),
            );
            prune_empty_dirs(dir, self.config.max_age);
        }

        self.sweep_staging(&mut summary);
        self.prune_registry();

        if summary.files_removed > 0 {
            info!(
                "Cleanup removed {} file(s), {} bytes",
                summary.files_removed, summary.bytes_removed
            );
        } else {
            debug!("Cleanup pass: nothing to remove");
        }
        summary
    }

    /// Emergency quota pass that ignores the grace period.
    pub fn relieve_pressure(&self) -> CleanupSummary {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = CleanupSummary::default();
        for dir in &self.watched {
            let settled = scan(dir).into_iter().filter(|f| !f.in_flight).collect();
            summary += self.enforce_quota(settled, self.config.emergency_quota_bytes, None);
            prune_empty_dirs(dir, self.config.max_age);
        }
        warn!(
            "Memory pressure: emergency cleanup removed {} file(s), {} bytes",
            summary.files_removed, summary.bytes_removed
        );
        summary
    }

    /// Sample memory and run the emergency pass when above the threshold.
    pub fn check_pressure(&self) -> Option<CleanupSummary> {
        let report = self.sample_memory();
        if report.under_pressure {
            warn!(
                "Memory usage {:.1}% exceeds threshold {:.1}%",
                report.usage * 100.0,
                self.config.pressure_threshold * 100.0
            );
            Some(self.relieve_pressure())
        } else {
            None
        }
    }

    pub fn sample_memory(&self) -> MemoryReport {
        let (used, total) = self.sampler.sample();
        let usage = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        };
        MemoryReport {
            total_bytes: total,
            used_bytes: used,
            usage,
            under_pressure: usage > self.config.pressure_threshold,
        }
    }

    /// Current footprint of the watched directories.
    pub fn disk_usage(&self) -> DiskUsage {
        let mut usage = DiskUsage {
            directories: self.watched.clone(),
            ..Default::default()
        };
        for dir in &self.watched {
            for f in scan(dir) {
                usage.files += 1;
                usage.bytes += f.size;
            }
        }
        usage
    }

    /// Move a finished attempt's staging directory under the artifact root
    /// and register its artifacts. Returns the artifacts at their new paths.
    pub async fn adopt(
        &self,
        job_id: &JobId,
        staging_dir: &Path,
        artifacts: Vec<ArtifactRef>,
    ) -> Result<Vec<ArtifactRef>, ConvertError> {
        let dest = self.artifact_root.join(job_id.as_str());
        let storage = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ConvertError::ArtifactStorage { path, source }
        };

        tokio::fs::create_dir_all(&self.artifact_root)
            .await
            .map_err(storage(&self.artifact_root))?;
        tokio::fs::rename(staging_dir, &dest)
            .await
            .map_err(storage(&dest))?;

        if let Some(job_staging) = staging_dir.parent() {
            // Only succeeds once the job's staging area is empty.
            let _ = tokio::fs::remove_dir(job_staging).await;
        }

        let moved: Vec<ArtifactRef> = artifacts
            .into_iter()
            .map(|mut a| {
                match a.path.strip_prefix(staging_dir) {
                    Ok(rel) => a.path = dest.join(rel),
                    Err(_) => warn!(
                        "Artifact {} is outside its staging dir; left in place",
                        a.path.display()
                    ),
                }
                a
            })
            .collect();

        self.register(&moved);
        info!(
            "Job {}: {} artifact(s) stored under {}",
            job_id,
            moved.len(),
            dest.display()
        );
        Ok(moved)
    }

    /// Track artifacts so eviction invalidates them.
    pub fn register(&self, artifacts: &[ArtifactRef]) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for a in artifacts {
            registry.insert(a.path.clone(), a.owner_job_id.clone());
        }
    }

    /// `true` while the artifact is registered and still on disk.
    pub fn is_live(&self, artifact: &ArtifactRef) -> bool {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.get(&artifact.path) == Some(&artifact.owner_job_id) && artifact.path.exists()
    }

    /// Keep the sweep away from `job_id`'s staging directory until the
    /// returned claim is dropped.
    pub fn claim(&self, job_id: &JobId) -> StagingClaim<'_> {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone());
        StagingClaim {
            janitor: self,
            job_id: job_id.clone(),
        }
    }

    /// Periodic cleanup and pressure sampling until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let cleanup = {
            let janitor = Arc::clone(&self);
            let token = token.clone();
            let period = self.config.cleanup_interval;
            tokio::spawn(async move {
                run_every(period, token, "cleanup", move || {
                    janitor.perform_cleanup();
                })
                .await
            })
        };
        let pressure = {
            let janitor = Arc::clone(&self);
            let period = self.config.pressure_interval;
            tokio::spawn(async move {
                run_every(period, token, "pressure", move || {
                    janitor.check_pressure();
                })
                .await
            })
        };
        vec![cleanup, pressure]
    }

    fn enforce_quota(
        &self,
        mut files: Vec<FileEntry>,
        quota: u64,
        grace: Option<Duration>,
    ) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        if total <= quota {
            return summary;
        }

        // Oldest first
        files.sort_by(|a, b| b.age.cmp(&a.age));
        for f in &files {
            if total <= quota {
                break;
            }
            if grace.is_some_and(|g| f.age < g) {
                debug!("Quota pass stopped at files inside the grace period");
                break;
            }
            if self.evict(f, &mut summary) {
                total = total.saturating_sub(f.size);
            }
        }
        summary
    }

    fn sweep_staging(&self, summary: &mut CleanupSummary) {
        let Some(root) = &self.staging_root else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(root) else {
            return;
        };
        let now = SystemTime::now();

        for entry in entries.flatten() {
            let path = entry.path();
            let job = JobId::from(entry.file_name().to_string_lossy().as_ref());
            let claimed = self
                .claimed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&job);
            if claimed || !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }

            let files = scan(&path);
            // An empty tree is as old as its directory.
            let idle = match files.iter().map(|f| f.age).min() {
                Some(age) => age,
                None => age_of(&path, now).unwrap_or_default(),
            };
            if idle <= self.config.max_age {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    let bytes: u64 = files.iter().map(|f| f.size).sum();
                    info!(
                        "Removed abandoned staging for {} ({} file(s), {} bytes)",
                        job,
                        files.len(),
                        bytes
                    );
                    summary.files_removed += files.len();
                    summary.bytes_removed += bytes;
                }
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }

    /// Forget artifacts that disappeared without passing through `evict`.
    fn prune_registry(&self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.len();
        registry.retain(|path, _| path.exists());
        if registry.len() < before {
            debug!(
                "Dropped {} registry entries for files removed elsewhere",
                before - registry.len()
            );
        }
    }

    fn evict(&self, f: &FileEntry, summary: &mut CleanupSummary) -> bool {
        match std::fs::remove_file(&f.path) {
            Ok(()) => {
                debug!("Evicted {} ({} bytes)", f.path.display(), f.size);
                summary.files_removed += 1;
                summary.bytes_removed += f.size;
                self.registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&f.path);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} already gone", f.path.display());
                self.registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&f.path);
                false
            }
            Err(e) => {
                warn!("Could not evict {}: {}", f.path.display(), e);
                false
            }
        }
    }
}

/// Held by a running job; see [`ResourceJanitor::claim`].
pub struct StagingClaim<'a> {
    janitor: &'a ResourceJanitor,
    job_id: JobId,
}

impl Drop for StagingClaim<'_> {
    fn drop(&mut self) {
        self.janitor
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

async fn run_every<F>(period: Duration, token: CancellationToken, what: &'static str, task: F)
where
    F: Fn() + Send + Sync + Clone + 'static,
{
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Janitor {} loop shutting down", what);
                break;
            }
            _ = interval.tick() => {
                let task = task.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                    warn!("Janitor {} pass panicked: {}", what, e);
                }
            }
        }
    }
}

fn is_in_flight(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') || n.ends_with(".tmp"))
}

fn age_of(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(now.duration_since(modified).unwrap_or_default())
}

/// Every file under `dir`, recursively. Unreadable entries are skipped.
fn scan(dir: &Path) -> Vec<FileEntry> {
    let now = SystemTime::now();
    let mut out = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), false)];

    while let Some((current, inherited)) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot scan {}: {}", current.display(), e);
                }
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let in_flight = inherited || is_in_flight(&path);
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push((path, in_flight));
            } else if meta.is_file() {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                out.push(FileEntry {
                    path,
                    size: meta.len(),
                    age,
                    in_flight,
                });
            }
        }
    }
    out
}

/// Remove empty subdirectories of `root` (never `root` itself). Temp-named
/// directories go only once untouched for `max_age`.
fn prune_empty_dirs(root: &Path, max_age: Duration) {
    fn prune(dir: &Path, max_age: Duration, now: SystemTime) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut empty = true;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let stale = !is_in_flight(&path) || age_of(&path, now).is_some_and(|a| a > max_age);
            if is_dir && prune(&path, max_age, now) && stale {
                if std::fs::remove_dir(&path).is_ok() {
                    continue;
                }
            }
            empty = false;
        }
        empty
    }
    prune(root, max_age, SystemTime::now());
}
