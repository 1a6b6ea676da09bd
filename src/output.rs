//! Data model shared by every engine component.
//!
//! Everything here is plain data: serialisable, cloneable and free of
//! behaviour beyond small constructors. Components hand these values to each
//! other (and to callers) by value, so no component can mutate another's
//! bookkeeping behind its back.

use crate::error::ConvertError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

// ── Job identity ─────────────────────────────────────────────────────────

/// Caller-opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(format!("conv-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Input ────────────────────────────────────────────────────────────────

/// Broad family of an input document, used for route matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Word,
    Image,
    Unknown,
}

impl DocumentKind {
    /// Identify a document from its leading bytes, falling back to the
    /// declared MIME type and then the file extension.
    pub fn sniff(magic: &[u8], declared_mime: Option<&str>, path: &Path) -> Self {
        if magic.starts_with(b"%PDF") {
            return DocumentKind::Pdf;
        }
        if magic.starts_with(&[0xFF, 0xD8, 0xFF]) || magic.starts_with(b"\x89PNG") {
            return DocumentKind::Image;
        }
        // OLE2 compound file (legacy .doc)
        if magic.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
            return DocumentKind::Word;
        }

        if let Some(kind) = declared_mime.and_then(Self::from_mime) {
            return kind;
        }

        // Zip containers are only trusted as Word when the extension agrees.
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => DocumentKind::Pdf,
            Some("docx") | Some("doc") => DocumentKind::Word,
            Some("jpg") | Some("jpeg") | Some("png") => DocumentKind::Image,
            _ => DocumentKind::Unknown,
        }
    }

    /// Map a MIME type onto a document kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(DocumentKind::Pdf),
            "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(DocumentKind::Word)
            }
            "image/jpeg" | "image/jpg" | "image/png" => Some(DocumentKind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Word => "word",
            DocumentKind::Image => "image",
            DocumentKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A reference to the document being converted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRef {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// MIME type as declared by the caller (e.g. the upload's content type).
    pub declared_mime: Option<String>,
    pub kind: DocumentKind,
}

impl InputRef {
    /// Stat and sniff a local file.
    ///
    /// Fails only when the file is missing or unreadable; an unrecognised
    /// format yields [`DocumentKind::Unknown`] and is left to route matching.
    pub fn from_path(
        path: impl Into<PathBuf>,
        declared_mime: Option<&str>,
    ) -> Result<Self, ConvertError> {
        let path = path.into();

        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ConvertError::PermissionDenied { path });
            }
            Err(_) => return Err(ConvertError::InputNotFound { path }),
        };

        let size_bytes = file
            .metadata()
            .map_err(|_| ConvertError::InputNotFound { path: path.clone() })?
            .len();

        let mut magic = [0u8; 8];
        let n = file.read(&mut magic).unwrap_or(0);
        let kind = DocumentKind::sniff(&magic[..n], declared_mime, &path);

        debug!("Resolved input {} ({} bytes, {})", path.display(), size_bytes, kind);

        Ok(Self {
            path,
            size_bytes,
            declared_mime: declared_mime.map(String::from),
            kind,
        })
    }
}

// ── Artifacts ────────────────────────────────────────────────────────────

/// A file produced by a successful strategy run.
///
/// Owned by exactly one job. Once the janitor evicts the file the ref is
/// dead and is never handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub owner_job_id: JobId,
}

impl ArtifactRef {
    /// Build a ref for an existing file, reading its size from disk.
    pub fn from_path(path: impl Into<PathBuf>, owner: &JobId) -> std::io::Result<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            size_bytes,
            created_at: Utc::now(),
            owner_job_id: owner.clone(),
        })
    }
}

// ── Attempts ─────────────────────────────────────────────────────────────

/// How a single strategy attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// Deadline exceeded, or the job was cancelled while this attempt ran.
    Timeout,
    /// Never executed: a required capability was unavailable.
    Skipped { reason: String },
}

/// One entry of a job's audit trail. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy_name: String,
    pub priority: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

impl StrategyAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }

    /// One-line human summary used in status error lists.
    pub fn summary(&self) -> String {
        match (&self.outcome, &self.error_detail) {
            (AttemptOutcome::Skipped { reason }, _) => {
                format!("{}: skipped ({})", self.strategy_name, reason)
            }
            (AttemptOutcome::Success, _) => format!("{}: success", self.strategy_name),
            (AttemptOutcome::Failure, d) => format!(
                "{}: failed: {}",
                self.strategy_name,
                d.as_deref().unwrap_or("unknown error")
            ),
            (AttemptOutcome::Timeout, d) => format!(
                "{}: timed out: {}",
                self.strategy_name,
                d.as_deref().unwrap_or("deadline exceeded")
            ),
        }
    }
}

// ── Job status ───────────────────────────────────────────────────────────

/// Lifecycle state of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a worker slot.
    Created,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Read-only snapshot of a job, as exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub current_page: usize,
    pub total_units: usize,
    /// 0–100. Reaches 100 exactly once, when the job completes.
    pub percentage: u8,
    pub strategy_in_use: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub attempts: Vec<StrategyAttempt>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Answer to "can I have the output of job X yet?".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum JobResult {
    /// Live artifacts, in the order the strategy produced them.
    Ready(Vec<ArtifactRef>),
    NotReady,
    /// Terminal failure, with the full diagnostic message.
    Failed(String),
    /// The job succeeded but the janitor has since evicted its artifacts.
    Expired,
}

// ── Janitor / health reports ─────────────────────────────────────────────

/// Totals of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub files_removed: usize,
    pub bytes_removed: u64,
}

impl std::ops::AddAssign for CleanupSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.files_removed += rhs.files_removed;
        self.bytes_removed += rhs.bytes_removed;
    }
}

/// Availability of one registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyHealth {
    pub name: String,
    pub priority: u32,
    pub available: bool,
    pub max_input_bytes: u64,
    /// Capabilities that are currently unavailable.
    pub missing: Vec<String>,
}

/// Host memory as seen by the janitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryReport {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// `used / total`, 0.0–1.0.
    pub usage: f64,
    /// `usage` exceeds the configured pressure threshold.
    pub under_pressure: bool,
}

/// Footprint of the watched directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskUsage {
    pub directories: Vec<PathBuf>,
    pub files: usize,
    pub bytes: u64,
}

/// Aggregated engine health for an operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub strategies: Vec<StrategyHealth>,
    pub memory: MemoryReport,
    pub disk: DiskUsage,
    pub active_jobs: usize,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sniff_prefers_magic_bytes() {
        let p = Path::new("report.docx");
        assert_eq!(DocumentKind::sniff(b"%PDF-1.7", None, p), DocumentKind::Pdf);
        assert_eq!(
            DocumentKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0], None, p),
            DocumentKind::Image
        );
        assert_eq!(DocumentKind::sniff(b"\x89PNG\r\n", None, p), DocumentKind::Image);
    }

    #[test]
    fn sniff_falls_back_to_mime_then_extension() {
        let zip = b"PK\x03\x04";
        assert_eq!(
            DocumentKind::sniff(zip, Some("application/msword"), Path::new("x.bin")),
            DocumentKind::Word
        );
        assert_eq!(
            DocumentKind::sniff(zip, None, Path::new("letter.DOCX")),
            DocumentKind::Word
        );
        assert_eq!(
            DocumentKind::sniff(zip, None, Path::new("archive.zip")),
            DocumentKind::Unknown
        );
    }

    #[test]
    fn input_ref_stats_file() {
        let mut tmp = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        tmp.write_all(b"%PDF-1.4\n%%EOF\n").unwrap();
        let input = InputRef::from_path(tmp.path(), None).unwrap();
        assert_eq!(input.size_bytes, 15);
        assert_eq!(input.kind, DocumentKind::Pdf);
    }

    #[test]
    fn input_ref_missing_file() {
        let err = InputRef::from_path("/definitely/not/here.pdf", None).unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert!(JobId::new().as_str().starts_with("conv-"));
    }

    #[test]
    fn cleanup_summary_accumulates() {
        let mut s = CleanupSummary::default();
        s += CleanupSummary {
            files_removed: 2,
            bytes_removed: 10,
        };
        s += CleanupSummary {
            files_removed: 1,
            bytes_removed: 5,
        };
        assert_eq!(s.files_removed, 3);
        assert_eq!(s.bytes_removed, 15);
    }
}
