//! # edgequake-docconv
//!
//! Convert documents (PDF, images, Word) into images or PDF by falling back across
//! interchangeable conversion backends.
//!
//! ## Why this crate?
//!
//! No single converter works everywhere. Ghostscript gives the best raster
//! output but is often not installed; pdfium needs a shared library;
//! ImageMagick delegates to Ghostscript anyway; LibreOffice is huge. This
//! crate registers each backend as a *strategy* with its dependencies and
//! size limit, probes which dependencies are present, and runs the feasible
//! strategies in priority order until one produces output. Callers never
//! need to know which backend ran; when every one fails they get the full
//! trail of what was tried and why it failed.
//!
//! ## Engine Overview
//!
//! ```text
//! submit(input, target, options)
//!  │
//!  ├─ 1. Catalog   strategies whose size limit admits the input, by priority
//!  ├─ 2. Probe     skip strategies whose capabilities are missing (TTL cache)
//!  ├─ 3. Execute   run under a deadline; first success wins
//!  ├─ 4. Progress  live per-job events, snapshots kept for a retention window
//!  └─ 5. Janitor   adopt artifacts; evict by age, quota and memory pressure
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docconv::{ConversionOptions, ConversionService, EngineConfig, InputRef, JobResult, TargetFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ConversionService::with_defaults(EngineConfig::default())?;
//!     let _background = service.start_background();
//!
//!     let input = InputRef::from_path("document.pdf", None)?;
//!     let job = service.submit(input, TargetFormat::Png, ConversionOptions::default());
//!     match service.wait(&job).await? {
//!         JobResult::Ready(artifacts) => {
//!             for a in artifacts {
//!                 println!("{}", a.path.display());
//!             }
//!         }
//!         other => eprintln!("{other:?}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docconv` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docconv = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod janitor;
pub mod output;
pub mod probe;
pub mod progress;
pub mod service;
pub mod strategies;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use catalog::{Strategy, StrategyCatalog, StrategyContext};
pub use config::{
    ConversionOptions, EngineConfig, EngineConfigBuilder, JanitorConfig, PageSelection,
    QualityTier, TargetFormat,
};
pub use error::{ConvertError, StrategyError};
pub use executor::{ExecutionOutcome, FallbackExecutor, JobRequest};
pub use janitor::{MemorySampler, ResourceJanitor, StagingClaim, SystemMemorySampler};
pub use output::{
    ArtifactRef, AttemptOutcome, CleanupSummary, DiskUsage, DocumentKind, HealthReport, InputRef,
    JobId, JobResult, JobState, JobStatus, MemoryReport, StrategyAttempt, StrategyHealth,
};
pub use probe::{CapabilityCheck, CapabilityId, CapabilityProbe, CheckOutcome, CommandCheck, ProbeResult};
pub use progress::{ProgressBus, ProgressEvent, ProgressReporter, ProgressStream};
pub use service::{BackgroundTasks, ConversionService};
