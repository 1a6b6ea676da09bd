//! Configuration types for the conversion engine.
//!
//! Engine-wide behaviour is controlled through [`EngineConfig`], built via
//! its [`EngineConfigBuilder`]; per-job knobs live in [`ConversionOptions`].
//! Every field has a documented default so callers set only what they care
//! about.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Memory budgeted for one in-flight rasterisation when sizing the pool.
const BYTES_PER_WORKER: u64 = 512 * 1024 * 1024;

/// Engine-wide configuration.
///
/// # Example
/// ```rust
/// use edgequake_docconv::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::builder()
///     .work_dir("/var/lib/docconv")
///     .strategy_timeout(Duration::from_secs(60))
///     .max_concurrent_jobs(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root under which staging and artifact directories are created.
    /// Default: `$TMPDIR/docconv`.
    ///
    /// Staging (`.staging/`) and artifacts (`outputs/`) must share a
    /// filesystem so the hand-off is a single atomic rename.
    pub work_dir: PathBuf,

    /// Additional directories the janitor keeps clean (e.g. an upload
    /// directory owned by the HTTP layer). Default: none.
    pub extra_watch_dirs: Vec<PathBuf>,

    /// How long a capability probe result stays valid. Default: 5 minutes.
    pub probe_ttl: Duration,

    /// Deadline for a single strategy run unless the strategy overrides it.
    /// Default: 120 s.
    pub strategy_timeout: Duration,

    /// How long a terminal job stays queryable. Default: 30 minutes.
    pub retention: Duration,

    /// Jobs allowed to run at once; further submissions queue FIFO.
    /// Default: min(CPU count, total memory / 512 MiB), at least 1.
    pub max_concurrent_jobs: usize,

    /// Disk-footprint policy.
    pub janitor: JanitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("docconv"),
            extra_watch_dirs: Vec::new(),
            probe_ttl: Duration::from_secs(5 * 60),
            strategy_timeout: Duration::from_secs(120),
            retention: Duration::from_secs(30 * 60),
            max_concurrent_jobs: default_worker_slots(),
            janitor: JanitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding finished, janitor-managed artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.work_dir.join("outputs")
    }

    /// Directory holding in-flight attempt output. Never scanned by the janitor.
    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join(".staging")
    }

    /// Every directory the janitor watches.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.artifact_dir()];
        dirs.extend(self.extra_watch_dirs.iter().cloned());
        dirs
    }
}

/// Size the worker pool from CPU count and total memory.
fn default_worker_slots() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let by_memory = (sys.total_memory() / BYTES_PER_WORKER) as usize;

    // total_memory() is 0 on platforms sysinfo does not support
    let slots = if by_memory == 0 { cpus } else { cpus.min(by_memory) };
    slots.max(1)
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.extra_watch_dirs.push(dir.into());
        self
    }

    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.config.probe_ttl = ttl;
        self
    }

    pub fn strategy_timeout(mut self, timeout: Duration) -> Self {
        self.config.strategy_timeout = timeout;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn janitor(mut self, janitor: JanitorConfig) -> Self {
        self.config.janitor = janitor;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, ConvertError> {
        let c = &self.config;
        if c.strategy_timeout.is_zero() {
            return Err(ConvertError::InvalidConfig(
                "Strategy timeout must be > 0".into(),
            ));
        }
        if c.max_concurrent_jobs == 0 {
            return Err(ConvertError::InvalidConfig(
                "Max concurrent jobs must be ≥ 1".into(),
            ));
        }
        c.janitor.validate()?;
        Ok(self.config)
    }
}

// ── Janitor policy ───────────────────────────────────────────────────────

/// Eviction policy for watched directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Files older than this are deleted unconditionally. Default: 30 minutes.
    pub max_age: Duration,

    /// Per-directory size limit enforced oldest-first. Default: 500 MiB.
    pub max_quota_bytes: u64,

    /// Files younger than this survive quota eviction. Default: 5 minutes.
    pub grace_period: Duration,

    /// Quota applied (ignoring the grace period) under memory pressure.
    /// Default: 100 MiB.
    pub emergency_quota_bytes: u64,

    /// System memory fraction that counts as pressure. Range: 0.05–1.0.
    /// Default: 0.8.
    pub pressure_threshold: f64,

    /// Period of the age + quota pass. Default: 10 minutes.
    pub cleanup_interval: Duration,

    /// Period of the memory-pressure sample. Default: 30 s.
    pub pressure_interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_quota_bytes: 500 * 1024 * 1024,
            grace_period: Duration::from_secs(5 * 60),
            emergency_quota_bytes: 100 * 1024 * 1024,
            pressure_threshold: 0.8,
            cleanup_interval: Duration::from_secs(10 * 60),
            pressure_interval: Duration::from_secs(30),
        }
    }
}

impl JanitorConfig {
    fn validate(&self) -> Result<(), ConvertError> {
        if !(0.05..=1.0).contains(&self.pressure_threshold) {
            return Err(ConvertError::InvalidConfig(format!(
                "Pressure threshold must be 0.05–1.0, got {}",
                self.pressure_threshold
            )));
        }
        if self.emergency_quota_bytes > self.max_quota_bytes {
            return Err(ConvertError::InvalidConfig(format!(
                "Emergency quota ({} bytes) exceeds regular quota ({} bytes)",
                self.emergency_quota_bytes, self.max_quota_bytes
            )));
        }
        if self.cleanup_interval.is_zero() || self.pressure_interval.is_zero() {
            return Err(ConvertError::InvalidConfig(
                "Janitor intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ── Per-job options ──────────────────────────────────────────────────────

/// Format-specific knobs for one conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// Rendering density tier. Default: [`QualityTier::High`].
    pub quality: QualityTier,
    /// Page selection. Default: all pages.
    pub pages: PageSelection,
    /// JPEG quality 1–100. Default: 85.
    pub compression: u8,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            quality: QualityTier::default(),
            pages: PageSelection::default(),
            compression: 85,
        }
    }
}

impl ConversionOptions {
    pub fn quality(mut self, tier: QualityTier) -> Self {
        self.quality = tier;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.pages = selection;
        self
    }

    pub fn compression(mut self, q: u8) -> Self {
        self.compression = q.clamp(1, 100);
        self
    }
}

/// Output format requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Jpeg,
    Png,
    Pdf,
}

impl TargetFormat {
    /// File extension used for produced artifacts.
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Jpeg => "jpg",
            TargetFormat::Png => "png",
            TargetFormat::Pdf => "pdf",
        }
    }

    pub fn is_raster(self) -> bool {
        matches!(self, TargetFormat::Jpeg | TargetFormat::Png)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(TargetFormat::Jpeg),
            "png" => Ok(TargetFormat::Png),
            "pdf" => Ok(TargetFormat::Pdf),
            other => Err(ConvertError::InvalidConfig(format!(
                "Unsupported target format '{other}' (expected jpg, png or pdf)"
            ))),
        }
    }
}

/// Rendering density tier.
///
/// | Tier | DPI |
/// |------|-----|
/// | low | 150 |
/// | medium | 200 |
/// | high | 300 (default) |
/// | ultra | 600 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl QualityTier {
    pub fn density(self) -> u32 {
        match self {
            QualityTier::Low => 150,
            QualityTier::Medium => 200,
            QualityTier::High => 300,
            QualityTier::Ultra => 600,
        }
    }
}

/// Specifies which pages of a paged document to convert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// `true` when no page number could ever match: page 0, an inverted
    /// range, or a set without a valid page.
    pub fn is_empty(&self) -> bool {
        match self {
            PageSelection::All => false,
            PageSelection::Single(p) => *p == 0,
            PageSelection::Range(s, e) => *e < (*s).max(1),
            PageSelection::Set(pages) => pages.iter().all(|&p| p == 0),
        }
    }

    /// Render as a 1-indexed page list (`"3"`, `"2-5"`, `"1,3,5"`). This is
    /// the syntax Ghostscript's `-sPageList` accepts.
    ///
    /// `None` for all pages and for an [empty](Self::is_empty) selection;
    /// callers must reject the latter rather than render everything.
    pub fn to_page_list(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        match self {
            PageSelection::All => None,
            PageSelection::Single(p) => Some(p.to_string()),
            PageSelection::Range(s, e) => Some(format!("{}-{}", (*s).max(1), e)),
            PageSelection::Set(pages) => {
                let mut pages: Vec<usize> = pages.iter().copied().filter(|&p| p >= 1).collect();
                pages.sort_unstable();
                pages.dedup();
                Some(
                    pages
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).to_indices(5),
            vec![0, 2]
        );
    }

    #[test]
    fn page_list_syntax() {
        assert_eq!(PageSelection::All.to_page_list(), None);
        assert_eq!(PageSelection::Single(4).to_page_list().as_deref(), Some("4"));
        assert_eq!(PageSelection::Range(2, 5).to_page_list().as_deref(), Some("2-5"));
        assert_eq!(
            PageSelection::Set(vec![5, 1, 3, 1]).to_page_list().as_deref(),
            Some("1,3,5")
        );
    }

    #[test]
    fn empty_selections_have_no_page_list() {
        for empty in [
            PageSelection::Set(vec![0]),
            PageSelection::Set(Vec::new()),
            PageSelection::Range(5, 2),
            PageSelection::Range(0, 0),
            PageSelection::Single(0),
        ] {
            assert!(empty.is_empty(), "{empty:?}");
            assert_eq!(empty.to_page_list(), None, "{empty:?}");
        }
        assert!(!PageSelection::All.is_empty());
        assert!(!PageSelection::Range(3, 3).is_empty());
        assert_eq!(PageSelection::Range(0, 2).to_page_list().as_deref(), Some("1-2"));
    }

    #[test]
    fn quality_densities() {
        assert_eq!(QualityTier::Low.density(), 150);
        assert_eq!(QualityTier::default().density(), 300);
        assert_eq!(QualityTier::Ultra.density(), 600);
    }

    #[test]
    fn target_format_parse() {
        assert_eq!("JPEG".parse::<TargetFormat>().unwrap(), TargetFormat::Jpeg);
        assert_eq!("jpg".parse::<TargetFormat>().unwrap(), TargetFormat::Jpeg);
        assert_eq!("png".parse::<TargetFormat>().unwrap(), TargetFormat::Png);
        assert!("tiff".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn builder_clamps_and_validates() {
        let c = EngineConfig::builder().max_concurrent_jobs(0).build().unwrap();
        assert_eq!(c.max_concurrent_jobs, 1);

        let err = EngineConfig::builder()
            .strategy_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));

        let janitor = JanitorConfig {
            emergency_quota_bytes: 10,
            max_quota_bytes: 5,
            ..Default::default()
        };
        assert!(EngineConfig::builder().janitor(janitor).build().is_err());
    }

    #[test]
    fn directories_derive_from_work_dir() {
        let c = EngineConfig::builder()
            .work_dir("/srv/conv")
            .watch_dir("/srv/uploads")
            .build()
            .unwrap();
        assert_eq!(c.artifact_dir(), PathBuf::from("/srv/conv/outputs"));
        assert_eq!(c.staging_dir(), PathBuf::from("/srv/conv/.staging"));
        assert_eq!(
            c.watched_dirs(),
            vec![PathBuf::from("/srv/conv/outputs"), PathBuf::from("/srv/uploads")]
        );
    }

    #[test]
    fn compression_is_clamped() {
        assert_eq!(ConversionOptions::default().compression(0).compression, 1);
        assert_eq!(ConversionOptions::default().compression(250).compression, 100);
    }
}
