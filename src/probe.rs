//! Capability probing: "is external dependency X usable right now?"
//!
//! Probing usually means spawning a process (`gs --version`) or binding a
//! shared library, so results are cached per capability for a TTL. Each
//! capability has its own slot guarded by an async mutex: a caller that
//! finds the cache stale runs the check while holding the slot, and any
//! concurrent caller for the same capability waits on the slot and then
//! reads the fresh value (single-flight). Unrelated capabilities never
//! contend.
//!
//! Checks are blocking and run on `spawn_blocking`. They never fail: a
//! check that cannot determine availability reports `available = false`
//! with a `detail` explaining why.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ── Capability identity ──────────────────────────────────────────────────

/// Opaque name of an external dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(Cow<'static, str>);

impl CapabilityId {
    pub const fn from_static(s: &'static str) -> Self {
        Self(Cow::Borrowed(s))
    }

    pub fn new(s: impl Into<String>) -> Self {
        Self(Cow::Owned(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Ghostscript interpreter (`gs` / `gswin64c`).
pub const GHOSTSCRIPT: CapabilityId = CapabilityId::from_static("ghostscript");
/// ImageMagick `convert`.
pub const IMAGEMAGICK: CapabilityId = CapabilityId::from_static("imagemagick");
/// LibreOffice in headless mode (`soffice`).
pub const OFFICE_CONVERTER: CapabilityId = CapabilityId::from_static("office-converter");
/// A loadable pdfium shared library.
pub const PDFIUM: CapabilityId = CapabilityId::from_static("pdfium");

// ── Results ──────────────────────────────────────────────────────────────

/// What a check reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub available: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn available(detail: impl Into<String>) -> Self {
        Self {
            available: true,
            detail: detail.into(),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            available: false,
            detail: detail.into(),
        }
    }
}

/// A cached probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub available: bool,
    pub probed_at: DateTime<Utc>,
    pub detail: String,
}

/// An environment-specific availability check.
///
/// Implementations may block (spawn a process, touch the filesystem). They
/// must not panic on a missing dependency; report it instead.
pub trait CapabilityCheck: Send + Sync {
    fn run(&self) -> CheckOutcome;
}

impl<F> CapabilityCheck for F
where
    F: Fn() -> CheckOutcome + Send + Sync,
{
    fn run(&self) -> CheckOutcome {
        self()
    }
}

// ── Probe ────────────────────────────────────────────────────────────────

struct Cached {
    result: ProbeResult,
    at: Instant,
    epoch: u64,
}

#[derive(Default)]
struct Slot {
    /// Bumped by `invalidate`; a cached value from an older epoch is stale.
    epoch: AtomicU64,
    cached: tokio::sync::Mutex<Option<Cached>>,
}

/// TTL-bounded, single-flight cache of capability checks.
pub struct CapabilityProbe {
    ttl: Duration,
    checks: RwLock<HashMap<CapabilityId, Arc<dyn CapabilityCheck>>>,
    slots: Mutex<HashMap<CapabilityId, Arc<Slot>>>,
}

impl CapabilityProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            checks: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the check behind a capability.
    ///
    /// Replacing a check invalidates any cached result for it.
    pub fn register(&self, id: CapabilityId, check: impl CapabilityCheck + 'static) {
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(check));
        self.invalidate(&id);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_check(self, id: CapabilityId, check: impl CapabilityCheck + 'static) -> Self {
        self.register(id, check);
        self
    }

    /// Capabilities with a registered check.
    pub fn known(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<_> = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Availability of `id`, from cache when younger than the TTL.
    ///
    /// Never fails. An id without a registered check is unavailable.
    pub async fn check(&self, id: &CapabilityId) -> ProbeResult {
        let slot = self.slot(id);
        let mut cached = slot.cached.lock().await;
        let epoch = slot.epoch.load(Ordering::Acquire);

        if let Some(c) = cached.as_ref() {
            if c.epoch == epoch && c.at.elapsed() < self.ttl {
                return c.result.clone();
            }
        }

        let check = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();

        let outcome = match check {
            None => CheckOutcome::unavailable(format!("no check registered for '{id}'")),
            Some(check) => tokio::task::spawn_blocking(move || check.run())
                .await
                .unwrap_or_else(|e| CheckOutcome::unavailable(format!("probe panicked: {e}"))),
        };

        debug!(
            "Probed '{}': available={} ({})",
            id, outcome.available, outcome.detail
        );

        let result = ProbeResult {
            available: outcome.available,
            probed_at: Utc::now(),
            detail: outcome.detail,
        };
        *cached = Some(Cached {
            result: result.clone(),
            at: Instant::now(),
            epoch,
        });
        result
    }

    /// Force a re-probe of `id` on the next [`check`](Self::check).
    ///
    /// Does not wait for an in-flight probe; its result is simply
    /// discarded at the next check.
    pub fn invalidate(&self, id: &CapabilityId) {
        self.slot(id).epoch.fetch_add(1, Ordering::AcqRel);
        info!("Invalidated capability '{}'", id);
    }

    /// Invalidate every capability, e.g. after a redeploy.
    pub fn invalidate_all(&self) {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values() {
            slot.epoch.fetch_add(1, Ordering::AcqRel);
        }
        info!("Invalidated {} capabilities", slots.len());
    }

    fn slot(&self, id: &CapabilityId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(id.clone()).or_default())
    }
}

// ── Built-in checks ──────────────────────────────────────────────────────

static RE_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)+").unwrap());

/// Available when `program args…` starts and exits successfully within
/// its time limit. A hung program is killed and reported unavailable.
///
/// The detail carries the first version-looking token of the output.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

const COMMAND_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const COMMAND_CHECK_POLL: Duration = Duration::from_millis(20);

impl CommandCheck {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: COMMAND_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CapabilityCheck for CommandCheck {
    fn run(&self) -> CheckOutcome {
        let spawned = std::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CheckOutcome::unavailable(format!("'{}' not found on PATH", self.program));
            }
            Err(e) => {
                return CheckOutcome::unavailable(format!(
                    "'{}' failed to start: {e}",
                    self.program
                ));
            }
        };

        // Drained on its own thread so a chatty child never blocks on a full pipe.
        let (tx, rx) = std::sync::mpsc::channel();
        if let Some(mut stdout) = child.stdout.take() {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = std::io::Read::read_to_end(&mut stdout, &mut buf);
                let _ = tx.send(buf);
            });
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return CheckOutcome::unavailable(format!(
                        "'{}' timed out after {:.1}s",
                        self.program,
                        self.timeout.as_secs_f64()
                    ));
                }
                Ok(None) => std::thread::sleep(COMMAND_CHECK_POLL),
                Err(e) => {
                    let _ = child.kill();
                    return CheckOutcome::unavailable(format!(
                        "'{}' could not be waited on: {e}",
                        self.program
                    ));
                }
            }
        };

        if !status.success() {
            return CheckOutcome::unavailable(format!(
                "'{}' exited with {}",
                self.program, status
            ));
        }
        let stdout = rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()) + COMMAND_CHECK_POLL)
            .unwrap_or_default();
        let text = String::from_utf8_lossy(&stdout);
        let version = RE_VERSION
            .find(&text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "unknown version".to_string());
        CheckOutcome::available(format!("{} {}", self.program, version))
    }
}
