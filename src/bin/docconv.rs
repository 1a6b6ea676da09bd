//! CLI binary for edgequake-docconv.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `EngineConfig` / `ConversionOptions`, follows the job's progress events
//! and copies the produced files where the user asked.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docconv::{
    AttemptOutcome, ConversionOptions, ConversionService, EngineConfig, HealthReport, InputRef,
    JobId, JobResult, PageSelection, ProgressEvent, QualityTier, TargetFormat,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress display ─────────────────────────────────────────────────────────

/// Terminal progress bar fed by a job's event stream.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Queued");
        bar.set_message("waiting for a worker…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.set_message("");
    }

    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Snapshot { .. } => {}
            ProgressEvent::Started { total_units, .. } => {
                self.activate_bar(*total_units);
                self.bar.println(format!(
                    "{} {}",
                    cyan("◆"),
                    bold(&format!("Starting conversion of {total_units} unit(s)…"))
                ));
            }
            ProgressEvent::StrategyChanged { strategy, .. } => {
                self.bar.set_message(strategy.clone().unwrap_or_default());
            }
            ProgressEvent::Advanced { current_page, .. } => {
                self.bar.set_position(*current_page as u64);
            }
            ProgressEvent::Warning { message, .. } => {
                self.bar.println(format!("  {} {}", yellow("⚠"), message));
            }
            ProgressEvent::Attempt { attempt, .. } => {
                let elapsed = (attempt.ended_at - attempt.started_at)
                    .to_std()
                    .unwrap_or_default();
                let mark = match attempt.outcome {
                    AttemptOutcome::Success => green("✓"),
                    AttemptOutcome::Skipped { .. } => dim("–"),
                    _ => red("✗"),
                };
                let mut line = attempt.summary();
                if line.len() > 100 {
                    let cut = line
                        .char_indices()
                        .nth(99)
                        .map(|(i, _)| i)
                        .unwrap_or(line.len());
                    line.truncate(cut);
                    line.push('\u{2026}');
                }
                self.bar.println(format!(
                    "  {} {:<48}  {}",
                    mark,
                    line,
                    dim(&format!("{:.1}s", elapsed.as_secs_f64())),
                ));
            }
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. } => {
                self.bar.finish_and_clear();
            }
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # First three pages of a PDF as PNG, copied into out/
  docconv report.pdf --to png --pages 1-3 -o out/

  # Small JPEGs
  docconv slides.pdf --to jpg --quality low --compression 70 -o thumbs/

  # Word → PDF (needs LibreOffice)
  docconv letter.docx --to pdf -o out/

  # Photo → single A4 PDF page (works without external tools)
  docconv scan.png --to pdf -o out/

  # Which backends work on this machine?
  docconv --health

  # Reclaim disk used by old conversions
  docconv --cleanup

  # Machine-readable status and artifact list
  docconv report.pdf --json > result.json

STRATEGIES (tried in priority order, first success wins):
  Priority  Strategy                 Needs                 Max input  Route
  ────────  ───────────────────────  ────────────────────  ─────────  ─────────────────
  1         ghostscript              gs / gswin64c         100 MiB    PDF → JPEG/PNG
  2         pdfium                   libpdfium             50 MiB     PDF → JPEG/PNG
  3         imagemagick              convert               30 MiB     PDF → JPEG/PNG
                                                                      image → PDF
  4         placeholder              nothing (blank pages) 10 MiB     PDF → JPEG/PNG
  1         libreoffice              soffice               100 MiB    Word → PDF
  2         libreoffice-ghostscript  soffice + gs          100 MiB    Word → JPEG/PNG
  4         image-pdf                nothing               20 MiB     image → PDF

QUALITY TIERS:
  low 150 DPI · medium 200 DPI · high 300 DPI (default) · ultra 600 DPI

ENVIRONMENT VARIABLES:
  DOCCONV_*          Every flag has a DOCCONV_<FLAG> equivalent
  PDFIUM_LIB_PATH    Path to an existing libpdfium
  RUST_LOG           Override the log filter (e.g. edgequake_docconv=debug)
"#;

/// Convert documents by falling back across conversion backends.
#[derive(Parser, Debug)]
#[command(
    name = "docconv",
    version,
    about = "Convert PDF and Word documents to images or PDF, falling back across backends",
    long_about = "Convert documents by trying Ghostscript, pdfium, ImageMagick, LibreOffice \
and a last-resort placeholder renderer in priority order, skipping any backend whose tools are \
not installed. Every failed attempt is reported with its reason.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Document to convert.
    #[arg(required_unless_present_any = ["health", "cleanup"])]
    input: Option<PathBuf>,

    /// Copy produced files into this directory.
    #[arg(short, long, env = "DOCCONV_OUTPUT")]
    output: Option<PathBuf>,

    /// Target format.
    #[arg(long = "to", env = "DOCCONV_TO", value_enum, default_value = "png")]
    to: TargetArg,

    /// Rendering quality tier.
    #[arg(long, env = "DOCCONV_QUALITY", value_enum, default_value = "high")]
    quality: QualityArg,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "DOCCONV_PAGES", default_value = "all")]
    pages: String,

    /// JPEG quality (1–100).
    #[arg(long, env = "DOCCONV_COMPRESSION", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    compression: u8,

    /// Declared MIME type of the input (overrides extension-based detection).
    #[arg(long, env = "DOCCONV_MIME")]
    mime: Option<String>,

    /// Working directory for staging and managed artifacts.
    #[arg(long, env = "DOCCONV_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Per-strategy timeout in seconds.
    #[arg(long, env = "DOCCONV_STRATEGY_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Print backend availability, memory and disk usage, then exit.
    #[arg(long)]
    health: bool,

    /// Run a cleanup pass over the working directory, then exit.
    #[arg(long)]
    cleanup: bool,

    /// Output structured JSON instead of text.
    #[arg(long, env = "DOCCONV_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCCONV_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCCONV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCCONV_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TargetArg {
    Jpg,
    Png,
    Pdf,
}

impl From<TargetArg> for TargetFormat {
    fn from(v: TargetArg) -> Self {
        match v {
            TargetArg::Jpg => TargetFormat::Jpeg,
            TargetArg::Png => TargetFormat::Png,
            TargetArg::Pdf => TargetFormat::Pdf,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Low,
    Medium,
    High,
    Ultra,
}

impl From<QualityArg> for QualityTier {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Low => QualityTier::Low,
            QualityArg::Medium => QualityTier::Medium,
            QualityArg::High => QualityTier::High,
            QualityArg::Ultra => QualityTier::Ultra,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && cli.input.is_some();
    let filter = if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let filter = if cli.verbose { "debug" } else { filter };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let service = ConversionService::with_defaults(config).context("Failed to set up strategies")?;

    // ── Operator modes ───────────────────────────────────────────────────
    if cli.health {
        let report = service.health().await.context("Health check failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialise report")?
            );
        } else {
            print_health(&report);
        }
        return Ok(());
    }

    if cli.cleanup {
        let summary = service.cleanup_now().await.context("Cleanup failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
            );
        } else if !cli.quiet {
            eprintln!(
                "{} removed {} file(s), {} bytes",
                green("✔"),
                bold(&summary.files_removed.to_string()),
                summary.bytes_removed
            );
        }
        return Ok(());
    }

    // ── Conversion ───────────────────────────────────────────────────────
    let input_path = cli
        .input
        .as_deref()
        .context("An input document is required")?;
    let input = InputRef::from_path(input_path, cli.mime.as_deref())
        .with_context(|| format!("Cannot read {}", input_path.display()))?;

    let options = ConversionOptions::default()
        .quality(cli.quality.into())
        .pages(parse_pages(&cli.pages)?)
        .compression(cli.compression);

    let job = service.submit(input, cli.to.into(), options);
    follow(&service, &job, show_progress).await?;

    let status = service.status(&job).context("Job status unavailable")?;
    let artifacts = match service.result(&job).context("Job result unavailable")? {
        JobResult::Ready(artifacts) => artifacts,
        JobResult::Failed(detail) => anyhow::bail!("Conversion failed: {detail}"),
        JobResult::Expired => anyhow::bail!("Artifacts were evicted before they could be read"),
        JobResult::NotReady => anyhow::bail!("Job {job} did not finish"),
    };

    let produced: Vec<PathBuf> = artifacts.into_iter().map(|a| a.path).collect();
    let delivered = match cli.output {
        Some(ref dir) => copy_artifacts(&produced, dir).await?,
        None => produced,
    };

    if cli.json {
        let json = serde_json::json!({
            "status": status,
            "files": delivered,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise output")?
        );
    } else {
        for path in &delivered {
            println!("{}", path.display());
        }
        if !cli.quiet {
            eprintln!(
                "{}  {} file(s)  {}",
                green("✔"),
                delivered.len(),
                dim(status.summary.as_deref().unwrap_or_default()),
            );
            for w in &status.warnings {
                eprintln!("  {} {}", yellow("⚠"), w);
            }
        }
    }

    Ok(())
}

/// Map CLI args to `EngineConfig`.
fn build_config(cli: &Cli) -> Result<EngineConfig> {
    let mut builder = EngineConfig::builder().strategy_timeout(Duration::from_secs(cli.timeout));
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_dir(dir);
    }
    builder.build().context("Invalid configuration")
}

/// Drain the job's events, drawing the progress bar when enabled.
async fn follow(service: &ConversionService, job: &JobId, show_progress: bool) -> Result<()> {
    let mut events = service.subscribe(job).context("Job vanished")?;
    let progress = show_progress.then(CliProgress::new);
    while let Some(event) = events.next().await {
        if let Some(ref p) = progress {
            p.on_event(&event);
        }
    }
    Ok(())
}

async fn copy_artifacts(paths: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut out = Vec::with_capacity(paths.len());
    for src in paths {
        let name = src
            .file_name()
            .with_context(|| format!("Artifact without a file name: {}", src.display()))?;
        let dest = dir.join(name);
        tokio::fs::copy(src, &dest)
            .await
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        out.push(dest);
    }
    Ok(out)
}

fn print_health(report: &HealthReport) {
    println!("{}", bold("Strategies"));
    for s in &report.strategies {
        let mark = if s.available { green("✓") } else { red("✗") };
        let missing = if s.missing.is_empty() {
            String::new()
        } else {
            dim(&format!("missing: {}", s.missing.join(", ")))
        };
        println!(
            "  {} p{} {:<12} ≤ {:>4} MiB  {}",
            mark,
            s.priority,
            s.name,
            s.max_input_bytes / (1024 * 1024),
            missing
        );
    }

    let m = &report.memory;
    let usage = format!("{:.1}%", m.usage * 100.0);
    println!(
        "{}  {} / {} MiB  ({})",
        bold("Memory"),
        m.used_bytes / (1024 * 1024),
        m.total_bytes / (1024 * 1024),
        if m.under_pressure { red(&usage) } else { usage },
    );
    println!(
        "{}    {} file(s), {} bytes in {}",
        bold("Disk"),
        report.disk.files,
        report.disk.bytes,
        report
            .disk
            .directories
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("{}    {}", bold("Jobs"), report.active_jobs);
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(PageSelection::Set(pages));
    }

    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_syntax() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages(" 4 ").unwrap(), PageSelection::Single(4));
        assert_eq!(parse_pages("2-5").unwrap(), PageSelection::Range(2, 5));
        assert_eq!(parse_pages("1,3,5").unwrap(), PageSelection::Set(vec![1, 3, 5]));
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("5-2").is_err());
        assert!(parse_pages("1,x").is_err());
    }

    #[test]
    fn cli_parses_operator_modes_without_input() {
        let cli = Cli::try_parse_from(["docconv", "--health"]).unwrap();
        assert!(cli.health && cli.input.is_none());
        assert!(Cli::try_parse_from(["docconv", "--json"]).is_err());
    }
}
