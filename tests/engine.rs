//! Hermetic integration tests for the conversion engine.
//!
//! Every strategy, capability check and memory sampler here is a fake, so
//! these run anywhere without Ghostscript, pdfium or LibreOffice installed.
//!
//! Run with:
//!   cargo test --test engine

use async_trait::async_trait;
use edgequake_docconv::{
    ArtifactRef, AttemptOutcome, CapabilityId, CapabilityProbe, CheckOutcome, ConversionOptions,
    ConversionService, ConvertError, EngineConfig, InputRef, JanitorConfig, JobResult, JobState,
    MemorySampler, ProgressEvent, Strategy, StrategyCatalog, StrategyContext, StrategyError,
    TargetFormat,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Script {
    /// Write `n` pages, reporting progress after each.
    Pages(usize),
    Fail,
    Hang,
}

struct Scripted {
    name: &'static str,
    priority: u32,
    needs: Option<&'static str>,
    max: u64,
    script: Script,
}

impl Scripted {
    fn new(name: &'static str, priority: u32, script: Script) -> Self {
        Self {
            name,
            priority,
            needs: None,
            max: 100 * 1024 * 1024,
            script,
        }
    }

    fn needs(mut self, cap: &'static str) -> Self {
        self.needs = Some(cap);
        self
    }

    fn max(mut self, bytes: u64) -> Self {
        self.max = bytes;
        self
    }
}

#[async_trait]
impl Strategy for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        self.needs.map(CapabilityId::new).into_iter().collect()
    }

    fn max_input_bytes(&self) -> u64 {
        self.max
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        match self.script {
            Script::Pages(n) => {
                let mut out = Vec::with_capacity(n);
                for i in 0..n {
                    ctx.checkpoint()?;
                    let path = ctx.output_path("page", i);
                    tokio::fs::write(&path, vec![0u8; 64]).await?;
                    out.push(ctx.artifact(path)?);
                    ctx.reporter.units_done(i + 1);
                }
                Ok(out)
            }
            Script::Fail => Err(StrategyError::ProcessFailed {
                program: self.name.to_string(),
                status: "exit status: 1".into(),
                stderr: "boom".into(),
            }),
            Script::Hang => {
                ctx.cancel.cancelled().await;
                Err(StrategyError::Stopped)
            }
        }
    }
}

struct Idle;

impl MemorySampler for Idle {
    fn sample(&self) -> (u64, u64) {
        (10, 100)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Engine {
    dir: TempDir,
    service: ConversionService,
}

fn engine(
    strategies: Vec<Scripted>,
    probe: CapabilityProbe,
    tune: impl FnOnce(edgequake_docconv::EngineConfigBuilder) -> edgequake_docconv::EngineConfigBuilder,
) -> Engine {
    let dir = TempDir::new().unwrap();
    let mut catalog = StrategyCatalog::new();
    for s in strategies {
        catalog.register(Arc::new(s)).unwrap();
    }
    let config = tune(
        EngineConfig::builder()
            .work_dir(dir.path())
            .strategy_timeout(Duration::from_secs(5))
            .max_concurrent_jobs(4),
    )
    .build()
    .unwrap();
    let service = ConversionService::with_memory_sampler(config, catalog, probe, Arc::new(Idle));
    Engine { dir, service }
}

/// A three-page PDF, just enough for page counting.
fn pdf_input(dir: &TempDir) -> InputRef {
    let mut body = String::from("%PDF-1.4\n1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    body.push_str("2 0 obj << /Type /Pages /Kids [3 0 R 4 0 R 5 0 R] /Count 3 >> endobj\n");
    for id in 3..=5 {
        body.push_str(&format!(
            "{id} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n"
        ));
    }
    body.push_str("%%EOF\n");
    let path = dir.path().join("input.pdf");
    std::fs::write(&path, body).unwrap();
    InputRef::from_path(&path, None).unwrap()
}

fn probe_with(caps: &[(&'static str, bool)]) -> CapabilityProbe {
    let probe = CapabilityProbe::new(Duration::from_secs(60));
    for &(id, ok) in caps {
        probe.register(CapabilityId::from_static(id), move || {
            if ok {
                CheckOutcome::available("found")
            } else {
                CheckOutcome::unavailable("not installed")
            }
        });
    }
    probe
}

fn kinds(attempts: &[edgequake_docconv::StrategyAttempt]) -> Vec<(&str, &'static str)> {
    attempts
        .iter()
        .map(|a| {
            let kind = match a.outcome {
                AttemptOutcome::Success => "success",
                AttemptOutcome::Failure => "failure",
                AttemptOutcome::Timeout => "timeout",
                AttemptOutcome::Skipped { .. } => "skipped",
            };
            (a.strategy_name.as_str(), kind)
        })
        .collect()
}

// ── Fallback ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn skips_missing_capability_then_falls_past_failure() {
    let e = engine(
        vec![
            Scripted::new("alpha", 1, Script::Pages(3)).needs("alpha-tool"),
            Scripted::new("beta", 2, Script::Fail),
            Scripted::new("gamma", 3, Script::Pages(3)),
        ],
        probe_with(&[("alpha-tool", false)]),
        |b| b,
    );

    let job = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    let JobResult::Ready(artifacts) = e.service.wait(&job).await.unwrap() else {
        panic!("job should succeed");
    };

    assert_eq!(artifacts.len(), 3);
    let job_dir = e.dir.path().join("outputs").join(job.as_str());
    for a in &artifacts {
        assert!(a.path.starts_with(&job_dir), "{}", a.path.display());
        assert!(a.path.exists());
        assert_eq!(a.owner_job_id, job);
    }

    let status = e.service.status(&job).unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(
        kinds(&status.attempts),
        vec![("alpha", "skipped"), ("beta", "failure"), ("gamma", "success")]
    );
    assert_eq!(status.errors.len(), 2);
    assert!(status.errors[0].contains("alpha-tool"));
    assert!(status.errors[1].contains("boom"));
    assert_eq!(status.percentage, 100);
    assert_eq!(status.total_units, 3);

    // Nothing is left behind in staging.
    let staging = e.dir.path().join(".staging");
    let leftovers = std::fs::read_dir(&staging).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn exhaustion_reports_every_attempt() {
    let e = engine(
        vec![
            Scripted::new("alpha", 1, Script::Fail),
            Scripted::new("beta", 2, Script::Pages(1)).needs("beta-tool"),
        ],
        probe_with(&[("beta-tool", false)]),
        |b| b,
    );

    let err = e
        .service
        .convert(pdf_input(&e.dir), TargetFormat::Jpeg, ConversionOptions::default())
        .await
        .unwrap_err();

    let ConvertError::AllStrategiesExhausted { ref attempts } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(
        kinds(attempts),
        vec![("alpha", "failure"), ("beta", "skipped")]
    );
    let message = err.to_string();
    assert!(message.contains("alpha"));
    assert!(message.contains("beta-tool"));
}

#[tokio::test]
async fn failed_job_result_carries_diagnostics() {
    let e = engine(vec![Scripted::new("alpha", 1, Script::Fail)], probe_with(&[]), |b| b);

    let job = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    match e.service.wait(&job).await.unwrap() {
        JobResult::Failed(detail) => assert!(detail.contains("boom"), "{detail}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(e.service.status(&job).unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn oversized_input_attempts_nothing() {
    let e = engine(
        vec![
            Scripted::new("small", 1, Script::Pages(1)).max(10),
            Scripted::new("smaller", 2, Script::Pages(1)).max(5),
        ],
        probe_with(&[]),
        |b| b,
    );

    let err = e
        .service
        .convert(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default())
        .await
        .unwrap_err();
    match err {
        ConvertError::NoFeasibleStrategy { largest_limit, .. } => assert_eq!(largest_limit, 10),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn infeasible_job_fails_without_waiting_for_a_slot() {
    let e = engine(
        vec![Scripted::new("alpha", 1, Script::Hang).max(1024 * 1024)],
        probe_with(&[]),
        |b| b.max_concurrent_jobs(1).strategy_timeout(Duration::from_secs(60)),
    );

    let running = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    let mut events = e.service.subscribe(&running).unwrap();
    while let Some(event) = events.next().await {
        if matches!(event, ProgressEvent::Started { .. }) {
            break;
        }
    }

    let mut huge = pdf_input(&e.dir);
    huge.size_bytes = 10 * 1024 * 1024;
    let job = e
        .service
        .submit(huge, TargetFormat::Png, ConversionOptions::default());
    let result = tokio::time::timeout(Duration::from_secs(2), e.service.wait(&job))
        .await
        .expect("an infeasible job must not queue behind the running one")
        .unwrap();
    match result {
        JobResult::Failed(detail) => assert!(detail.contains("No strategy"), "{detail}"),
        other => panic!("expected failure, got {other:?}"),
    }
    let status = e.service.status(&job).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.attempts.is_empty());

    e.service.cancel(&running).unwrap();
    e.service.wait(&running).await.unwrap();
}

// ── Probing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_jobs_probe_each_capability_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let probe = CapabilityProbe::new(Duration::from_secs(60));
    {
        let calls = Arc::clone(&calls);
        probe.register(CapabilityId::from_static("slow-tool"), move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            CheckOutcome::available("found")
        });
    }
    let e = engine(
        vec![Scripted::new("alpha", 1, Script::Pages(1)).needs("slow-tool")],
        probe,
        |b| b,
    );

    let jobs: Vec<_> = (0..4)
        .map(|_| {
            e.service
                .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default())
        })
        .collect();
    for job in &jobs {
        assert!(matches!(
            e.service.wait(job).await.unwrap(),
            JobResult::Ready(_)
        ));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Progress ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_are_ordered_and_monotonic() {
    let e = engine(
        vec![
            Scripted::new("alpha", 1, Script::Fail),
            Scripted::new("beta", 2, Script::Pages(3)),
        ],
        probe_with(&[]),
        |b| b,
    );

    let job = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    let events: Vec<ProgressEvent> = e.service.subscribe(&job).unwrap().collect().await;

    assert!(matches!(events.first(), Some(ProgressEvent::Snapshot { .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::Completed { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let mut last = 0;
    for event in &events {
        if let ProgressEvent::Advanced {
            current_page,
            percentage,
            ..
        } = event
        {
            assert!(*current_page >= last);
            assert!(*percentage < 100);
            last = *current_page;
        }
    }
    assert_eq!(last, 3);

    let attempts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Attempt { attempt, .. } => Some(attempt.strategy_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn late_subscriber_gets_terminal_snapshot() {
    let e = engine(vec![Scripted::new("alpha", 1, Script::Pages(1))], probe_with(&[]), |b| b);
    let artifacts = e
        .service
        .convert(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default())
        .await
        .unwrap();
    let job = artifacts[0].owner_job_id.clone();

    let events: Vec<ProgressEvent> = e.service.subscribe(&job).unwrap().collect().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        ProgressEvent::Snapshot { status } => {
            assert_eq!(status.state, JobState::Succeeded);
            assert_eq!(status.percentage, 100);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_a_queued_job_attempts_nothing() {
    let e = engine(
        vec![Scripted::new("alpha", 1, Script::Hang)],
        probe_with(&[]),
        |b| b.max_concurrent_jobs(1).strategy_timeout(Duration::from_secs(60)),
    );

    let running = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    let mut events = e.service.subscribe(&running).unwrap();
    while let Some(event) = events.next().await {
        if matches!(event, ProgressEvent::Started { .. }) {
            break;
        }
    }

    let queued = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    e.service.cancel(&queued).unwrap();
    match e.service.wait(&queued).await.unwrap() {
        JobResult::Failed(detail) => assert!(detail.contains("cancelled"), "{detail}"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(e.service.status(&queued).unwrap().attempts.is_empty());

    e.service.cancel(&running).unwrap();
    assert!(matches!(
        e.service.wait(&running).await.unwrap(),
        JobResult::Failed(_)
    ));
    let status = e.service.status(&running).unwrap();
    assert_eq!(kinds(&status.attempts), vec![("alpha", "timeout")]);
}

#[tokio::test]
async fn hung_strategy_times_out_and_chain_continues() {
    let e = engine(
        vec![
            Scripted::new("alpha", 1, Script::Hang),
            Scripted::new("beta", 2, Script::Pages(1)),
        ],
        probe_with(&[]),
        |b| b.strategy_timeout(Duration::from_millis(100)),
    );

    let artifacts = e
        .service
        .convert(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default())
        .await
        .unwrap();
    let status = e.service.status(&artifacts[0].owner_job_id).unwrap();
    assert_eq!(
        kinds(&status.attempts),
        vec![("alpha", "timeout"), ("beta", "success")]
    );
}

// ── Janitor ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn evicted_artifacts_are_never_handed_out() {
    let janitor = JanitorConfig {
        max_age: Duration::from_millis(1),
        ..JanitorConfig::default()
    };
    let e = engine(
        vec![Scripted::new("alpha", 1, Script::Pages(2))],
        probe_with(&[]),
        |b| b.janitor(janitor),
    );

    let job = e
        .service
        .submit(pdf_input(&e.dir), TargetFormat::Png, ConversionOptions::default());
    assert!(matches!(
        e.service.wait(&job).await.unwrap(),
        JobResult::Ready(_)
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = e.service.cleanup_now().await.unwrap();
    assert_eq!(summary.files_removed, 2);
    assert_eq!(summary.bytes_removed, 128);

    assert!(matches!(
        e.service.result(&job).unwrap(),
        JobResult::Expired
    ));
}

#[tokio::test]
async fn stale_files_in_watched_dirs_are_removed() {
    let e = engine(vec![Scripted::new("alpha", 1, Script::Pages(1))], probe_with(&[]), |b| {
        b.janitor(JanitorConfig {
            max_age: Duration::from_millis(1),
            ..JanitorConfig::default()
        })
    });
    let outputs = e.dir.path().join("outputs").join("old-job");
    std::fs::create_dir_all(&outputs).unwrap();
    for i in 0..10 {
        std::fs::write(outputs.join(format!("page-{i:03}.png")), [0u8; 10]).unwrap();
    }
    // Leftovers of a crashed run: a half-written page and an abandoned staging tree.
    std::fs::write(outputs.join(".page-011.png.tmp"), [0u8; 10]).unwrap();
    let crashed = e.dir.path().join(".staging/conv-crashed/00-alpha");
    std::fs::create_dir_all(&crashed).unwrap();
    std::fs::write(crashed.join("page-001.png"), [0u8; 10]).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = e.service.cleanup_now().await.unwrap();
    assert_eq!(summary.files_removed, 12);
    assert_eq!(summary.bytes_removed, 120);
    assert!(!outputs.exists());
    assert!(!e.dir.path().join(".staging/conv-crashed").exists());
}

#[tokio::test]
async fn health_lists_strategy_availability() {
    let e = engine(
        vec![
            Scripted::new("alpha", 1, Script::Pages(1)).needs("alpha-tool"),
            Scripted::new("beta", 2, Script::Pages(1)),
        ],
        probe_with(&[("alpha-tool", false)]),
        |b| b,
    );

    let report = e.service.health().await.unwrap();
    let names: Vec<(&str, bool)> = report
        .strategies
        .iter()
        .map(|s| (s.name.as_str(), s.available))
        .collect();
    assert_eq!(names, vec![("alpha", false), ("beta", true)]);
    assert_eq!(report.strategies[0].missing, vec!["alpha-tool".to_string()]);
    assert!((report.memory.usage - 0.1).abs() < 1e-9);
    assert!(!report.memory.under_pressure);
}
