//! The strategy contract and the registry of available strategies.
//!
//! The catalog is deliberately ignorant of capability probing: it filters
//! by input size only. Capability and route filtering happen in the
//! executor, so catalogs can be exercised with fake strategies and no
//! environment at all.

use crate::config::{ConversionOptions, TargetFormat};
use crate::error::{ConvertError, StrategyError};
use crate::output::{ArtifactRef, DocumentKind, InputRef, JobId};
use crate::probe::CapabilityId;
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a strategy needs for one run.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub job_id: JobId,
    pub input: InputRef,
    /// Private, empty directory for this attempt's output.
    pub output_dir: PathBuf,
    pub target: TargetFormat,
    pub options: ConversionOptions,
    pub reporter: ProgressReporter,
    /// Fires when the deadline passes or the job is cancelled.
    pub cancel: CancellationToken,
}

impl StrategyContext {
    /// Build an [`ArtifactRef`] owned by this job for a file the strategy wrote.
    pub fn artifact(&self, path: impl Into<PathBuf>) -> Result<ArtifactRef, StrategyError> {
        Ok(ArtifactRef::from_path(path, &self.job_id)?)
    }

    /// Path for output file number `index` (0-based) inside `output_dir`.
    pub fn output_path(&self, stem: &str, index: usize) -> PathBuf {
        self.output_dir
            .join(format!("{stem}-{:03}.{}", index + 1, self.target.extension()))
    }

    /// Fail with [`StrategyError::Stopped`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), StrategyError> {
        if self.cancel.is_cancelled() {
            Err(StrategyError::Stopped)
        } else {
            Ok(())
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input.path
    }
}

/// One conversion backend.
///
/// Strategies are registered once and shared across jobs; they must not
/// keep job-specific state. `run` may block on subprocesses or disk I/O and
/// must write only inside `ctx.output_dir`. A run that returns `Ok` with no
/// artifacts counts as a failure.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    fn required_capabilities(&self) -> Vec<CapabilityId>;

    fn max_input_bytes(&self) -> u64;

    /// Per-strategy deadline; `None` uses the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether this strategy converts `source` documents into `target`.
    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        let _ = (source, target);
        true
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError>;
}

/// Registry of strategies, built at startup.
#[derive(Default, Clone)]
pub struct StrategyCatalog {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy. Names must be unique.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<(), ConvertError> {
        if self.strategies.iter().any(|s| s.name() == strategy.name()) {
            return Err(ConvertError::DuplicateStrategyName {
                name: strategy.name().to_string(),
            });
        }
        info!(
            "Registered strategy '{}' (priority {}, max {} bytes)",
            strategy.name(),
            strategy.priority(),
            strategy.max_input_bytes()
        );
        self.strategies.push(strategy);
        // Stable sort keeps registration order among equal priorities.
        self.strategies.sort_by_key(|s| s.priority());
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, strategy: impl Strategy + 'static) -> Result<Self, ConvertError> {
        self.register(Arc::new(strategy))?;
        Ok(self)
    }

    /// Strategies accepting an input of `input_size_bytes`, by ascending priority.
    pub fn candidates_for(&self, input_size_bytes: u64) -> Vec<Arc<dyn Strategy>> {
        self.strategies
            .iter()
            .filter(|s| input_size_bytes <= s.max_input_bytes())
            .cloned()
            .collect()
    }

    /// All registered strategies, by ascending priority.
    pub fn strategies(&self) -> &[Arc<dyn Strategy>] {
        &self.strategies
    }

    /// Largest `max_input_bytes` of any strategy handling the route.
    pub fn largest_limit(&self, source: DocumentKind, target: TargetFormat) -> u64 {
        self.strategies
            .iter()
            .filter(|s| s.handles(source, target))
            .map(|s| s.max_input_bytes())
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl fmt::Debug for StrategyCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| (s.name(), s.priority())))
            .finish()
    }
}
