//! Strategies that shell out to an external converter.
//!
//! Children are spawned with `kill_on_drop`, so when the executor drops a
//! run (deadline or cancellation) the process is killed and reaped by the
//! runtime instead of being left behind.

use crate::catalog::{Strategy, StrategyContext};
use crate::config::{PageSelection, TargetFormat};
use crate::error::StrategyError;
use crate::output::{ArtifactRef, DocumentKind};
use crate::probe::{self, CapabilityId};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// Keep at most this much of a failing tool's stderr.
const STDERR_TAIL: usize = 600;

/// Ghostscript binary name for this platform.
pub fn ghostscript_binary() -> &'static str {
    if cfg!(windows) {
        "gswin64c"
    } else {
        "gs"
    }
}

/// Run `program args…` to completion, failing on a non-zero exit.
pub(crate) async fn run_tool(
    program: &str,
    args: &[OsString],
    ctx: &StrategyContext,
) -> Result<(), StrategyError> {
    debug!("Running {} {:?}", program, args);
    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StrategyError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(StrategyError::Stopped),
        out = child.wait_with_output() => out?,
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail_start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    Err(StrategyError::ProcessFailed {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr: stderr[tail_start..].to_string(),
    })
}

/// Files in `dir` with the target's extension, sorted by name.
pub(crate) async fn collect_outputs(
    ctx: &StrategyContext,
    dir: &Path,
) -> Result<Vec<ArtifactRef>, StrategyError> {
    let ext = ctx.target.extension();
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let visible = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'));
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        if visible && matches && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    paths.into_iter().map(|p| ctx.artifact(p)).collect()
}

// ── Ghostscript ──────────────────────────────────────────────────────────

/// PDF → JPEG/PNG through Ghostscript. Best quality, needs `gs`.
pub struct GhostscriptStrategy;

impl GhostscriptStrategy {
    pub const NAME: &'static str = "ghostscript";

    fn args_for(ctx: &StrategyContext, pdf: &Path) -> Vec<OsString> {
        let device = match ctx.target {
            TargetFormat::Jpeg => "jpeg",
            _ => "png16m",
        };
        let mut args: Vec<OsString> = vec![
            "-dNOPAUSE".into(),
            "-dBATCH".into(),
            "-dSAFER".into(),
            "-dQUIET".into(),
            format!("-sDEVICE={device}").into(),
            format!("-r{}", ctx.options.quality.density()).into(),
            "-dTextAlphaBits=4".into(),
            "-dGraphicsAlphaBits=4".into(),
        ];
        if ctx.target == TargetFormat::Jpeg {
            args.push(format!("-dJPEGQ={}", ctx.options.compression).into());
        }
        if let Some(list) = ctx.options.pages.to_page_list() {
            args.push(format!("-sPageList={list}").into());
        }
        let mut out = OsString::from("-sOutputFile=");
        out.push(ctx.output_dir.join(format!("page-%03d.{}", ctx.target.extension())));
        args.push(out);
        args.push("-f".into());
        args.push(pdf.as_os_str().to_os_string());
        args
    }

    /// Rasterise `pdf` into the attempt's output directory.
    pub(crate) async fn render(ctx: &StrategyContext, pdf: &Path) -> Result<(), StrategyError> {
        if ctx.options.pages.is_empty() {
            return Err(StrategyError::Other(format!(
                "page selection {:?} names no page",
                ctx.options.pages
            )));
        }
        run_tool(ghostscript_binary(), &Self::args_for(ctx, pdf), ctx).await
    }
}

#[async_trait]
impl Strategy for GhostscriptStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        1
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        vec![probe::GHOSTSCRIPT]
    }

    fn max_input_bytes(&self) -> u64 {
        100 * MIB
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Pdf && target.is_raster()
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        Self::render(ctx, &ctx.input.path).await?;
        let artifacts = collect_outputs(ctx, &ctx.output_dir).await?;
        ctx.reporter.units_done(artifacts.len());
        Ok(artifacts)
    }
}

// ── ImageMagick ──────────────────────────────────────────────────────────

/// PDF → JPEG/PNG and image → PDF through ImageMagick's `convert` (which
/// delegates PDF reading to gs).
pub struct ImageMagickStrategy;

impl ImageMagickStrategy {
    pub const NAME: &'static str = "imagemagick";

    /// `[0,2]`-style 0-based frame selector appended to the input path.
    fn frames(pages: &PageSelection) -> Option<String> {
        match pages {
            PageSelection::All => None,
            PageSelection::Single(p) => Some(format!("[{}]", p.saturating_sub(1))),
            PageSelection::Range(s, e) => Some(format!(
                "[{}-{}]",
                s.max(&1) - 1,
                e.saturating_sub(1)
            )),
            PageSelection::Set(set) => {
                let mut set: Vec<usize> = set.iter().filter(|&&p| p >= 1).map(|p| p - 1).collect();
                set.sort_unstable();
                set.dedup();
                let list: Vec<String> = set.iter().map(|p| p.to_string()).collect();
                Some(format!("[{}]", list.join(",")))
            }
        }
    }

    fn args(ctx: &StrategyContext) -> Vec<OsString> {
        if ctx.input.kind == DocumentKind::Image {
            return vec![
                ctx.input.path.clone().into_os_string(),
                "-units".into(),
                "PixelsPerInch".into(),
                "-density".into(),
                ctx.options.quality.density().to_string().into(),
                "-quality".into(),
                ctx.options.compression.to_string().into(),
                ctx.output_dir.join("document.pdf").into_os_string(),
            ];
        }

        let mut input = ctx.input.path.clone().into_os_string();
        if let Some(frames) = Self::frames(&ctx.options.pages) {
            input.push(frames);
        }
        vec![
            "-density".into(),
            ctx.options.quality.density().to_string().into(),
            input,
            "-quality".into(),
            ctx.options.compression.to_string().into(),
            ctx.output_dir
                .join(format!("page-%03d.{}", ctx.target.extension()))
                .into_os_string(),
        ]
    }
}

#[async_trait]
impl Strategy for ImageMagickStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        3
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        vec![probe::IMAGEMAGICK]
    }

    fn max_input_bytes(&self) -> u64 {
        30 * MIB
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        match source {
            DocumentKind::Pdf => target.is_raster(),
            DocumentKind::Image => target == TargetFormat::Pdf,
            _ => false,
        }
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        run_tool("convert", &Self::args(ctx), ctx).await?;
        let artifacts = collect_outputs(ctx, &ctx.output_dir).await?;
        ctx.reporter.units_done(artifacts.len());
        Ok(artifacts)
    }
}

// ── LibreOffice ──────────────────────────────────────────────────────────

/// Word → PDF through headless LibreOffice.
pub struct LibreOfficeStrategy;

impl LibreOfficeStrategy {
    pub const NAME: &'static str = "libreoffice";

    /// `file://` URL of `profile`, resolved against the working directory.
    fn profile_url(profile: &Path) -> std::io::Result<OsString> {
        let mut url = OsString::from("file://");
        url.push(std::path::absolute(profile)?);
        Ok(url)
    }

    fn args(ctx: &StrategyContext, profile_url: OsString, outdir: &Path) -> Vec<OsString> {
        // A private profile lets several conversions run side by side.
        let mut user_install = OsString::from("-env:UserInstallation=");
        user_install.push(profile_url);
        vec![
            user_install,
            "--headless".into(),
            "--norestore".into(),
            "--convert-to".into(),
            "pdf".into(),
            "--outdir".into(),
            outdir.as_os_str().to_os_string(),
            ctx.input.path.clone().into_os_string(),
        ]
    }

    /// Convert the input to PDF inside `outdir`, with a throwaway profile.
    pub(crate) async fn to_pdf(ctx: &StrategyContext, outdir: &Path) -> Result<(), StrategyError> {
        let profile = ctx.output_dir.join(".lo-profile");
        let url = Self::profile_url(&profile)?;
        let result = run_tool("soffice", &Self::args(ctx, url, outdir), ctx).await;
        let _ = tokio::fs::remove_dir_all(&profile).await;
        result
    }
}

#[async_trait]
impl Strategy for LibreOfficeStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        1
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        vec![probe::OFFICE_CONVERTER]
    }

    fn max_input_bytes(&self) -> u64 {
        100 * MIB
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Word && target == TargetFormat::Pdf
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        Self::to_pdf(ctx, &ctx.output_dir).await?;
        let artifacts = collect_outputs(ctx, &ctx.output_dir).await?;
        ctx.reporter.units_done(1);
        Ok(artifacts)
    }
}

// ── LibreOffice, then Ghostscript ────────────────────────────────────────

/// Word → JPEG/PNG: LibreOffice to an intermediate PDF, then Ghostscript.
pub struct OfficeRasterStrategy;

impl OfficeRasterStrategy {
    pub const NAME: &'static str = "libreoffice-ghostscript";

    async fn first_pdf(dir: &Path) -> Result<PathBuf, StrategyError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
            {
                return Ok(path);
            }
        }
        Err(StrategyError::EmptyOutput)
    }
}

#[async_trait]
impl Strategy for OfficeRasterStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        2
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        vec![probe::OFFICE_CONVERTER, probe::GHOSTSCRIPT]
    }

    fn max_input_bytes(&self) -> u64 {
        100 * MIB
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Word && target.is_raster()
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        let pdf_dir = ctx.output_dir.join(".office-pdf");
        tokio::fs::create_dir_all(&pdf_dir).await?;
        let result = async {
            LibreOfficeStrategy::to_pdf(ctx, &pdf_dir).await?;
            let pdf = Self::first_pdf(&pdf_dir).await?;
            GhostscriptStrategy::render(ctx, &pdf).await
        }
        .await;
        let _ = tokio::fs::remove_dir_all(&pdf_dir).await;
        result?;

        let artifacts = collect_outputs(ctx, &ctx.output_dir).await?;
        ctx.reporter.units_done(artifacts.len());
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConversionOptions, QualityTier};
    use crate::output::{InputRef, JobId};
    use crate::progress::{ProgressBus, ProgressReporter};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(target: TargetFormat, options: ConversionOptions) -> StrategyContext {
        let job_id = JobId::from("conv-test");
        StrategyContext {
            job_id: job_id.clone(),
            input: InputRef {
                path: PathBuf::from("/in/doc.pdf"),
                size_bytes: 10,
                declared_mime: None,
                kind: DocumentKind::Pdf,
            },
            output_dir: PathBuf::from("/out"),
            target,
            options,
            reporter: ProgressReporter::new(Arc::new(ProgressBus::new()), job_id),
            cancel: CancellationToken::new(),
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn ghostscript_args() {
        let options = ConversionOptions::default()
            .quality(QualityTier::Medium)
            .pages(PageSelection::Range(2, 4))
            .compression(70);
        let c = ctx(TargetFormat::Jpeg, options);
        let args = strings(GhostscriptStrategy::args_for(&c, &c.input.path));
        assert!(args.contains(&"-sDEVICE=jpeg".to_string()));
        assert!(args.contains(&"-r200".to_string()));
        assert!(args.contains(&"-dJPEGQ=70".to_string()));
        assert!(args.contains(&"-sPageList=2-4".to_string()));
        assert!(args.contains(&"-sOutputFile=/out/page-%03d.jpg".to_string()));
        assert_eq!(args.last().unwrap(), "/in/doc.pdf");

        let c = ctx(TargetFormat::Png, ConversionOptions::default());
        let png = strings(GhostscriptStrategy::args_for(&c, &c.input.path));
        assert!(png.contains(&"-sDEVICE=png16m".to_string()));
        assert!(!png.iter().any(|a| a.starts_with("-dJPEGQ") || a.starts_with("-sPageList")));
    }

    #[test]
    fn imagemagick_frames() {
        assert_eq!(ImageMagickStrategy::frames(&PageSelection::All), None);
        assert_eq!(
            ImageMagickStrategy::frames(&PageSelection::Single(3)).as_deref(),
            Some("[2]")
        );
        assert_eq!(
            ImageMagickStrategy::frames(&PageSelection::Range(1, 3)).as_deref(),
            Some("[0-2]")
        );
        assert_eq!(
            ImageMagickStrategy::frames(&PageSelection::Set(vec![5, 1, 5])).as_deref(),
            Some("[0,4]")
        );
        let args = strings(ImageMagickStrategy::args(&ctx(
            TargetFormat::Png,
            ConversionOptions::default().pages(PageSelection::Single(1)),
        )));
        assert_eq!(args[2], "/in/doc.pdf[0]");
    }

    #[test]
    fn routes() {
        assert!(GhostscriptStrategy.handles(DocumentKind::Pdf, TargetFormat::Png));
        assert!(!GhostscriptStrategy.handles(DocumentKind::Word, TargetFormat::Pdf));
        assert!(LibreOfficeStrategy.handles(DocumentKind::Word, TargetFormat::Pdf));
        assert!(!LibreOfficeStrategy.handles(DocumentKind::Pdf, TargetFormat::Png));
        assert!(ImageMagickStrategy.handles(DocumentKind::Image, TargetFormat::Pdf));
        assert!(!ImageMagickStrategy.handles(DocumentKind::Image, TargetFormat::Png));
        assert!(OfficeRasterStrategy.handles(DocumentKind::Word, TargetFormat::Jpeg));
        assert!(!OfficeRasterStrategy.handles(DocumentKind::Word, TargetFormat::Pdf));
    }

    #[test]
    fn imagemagick_image_to_pdf_args() {
        let mut c = ctx(TargetFormat::Pdf, ConversionOptions::default().compression(70));
        c.input.path = PathBuf::from("/in/photo.png");
        c.input.kind = DocumentKind::Image;
        let args = strings(ImageMagickStrategy::args(&c));
        assert_eq!(args[0], "/in/photo.png");
        assert!(args.contains(&"70".to_string()));
        assert_eq!(args.last().unwrap(), "/out/document.pdf");
    }

    #[cfg(unix)]
    #[test]
    fn libreoffice_profile_url_is_absolute() {
        let url = LibreOfficeStrategy::profile_url(Path::new("work/.staging/conv-1/.lo-profile"))
            .unwrap();
        let url = url.to_string_lossy();
        assert!(url.starts_with("file:///"), "{url}");
        assert!(url.ends_with("/work/.staging/conv-1/.lo-profile"), "{url}");

        let c = ctx(TargetFormat::Pdf, ConversionOptions::default());
        let args = strings(LibreOfficeStrategy::args(
            &c,
            LibreOfficeStrategy::profile_url(Path::new("/tmp/p")).unwrap(),
            Path::new("/out"),
        ));
        assert_eq!(args[0], "-env:UserInstallation=file:///tmp/p");
    }

    #[tokio::test]
    async fn empty_page_selection_never_reaches_ghostscript() {
        let c = ctx(
            TargetFormat::Png,
            ConversionOptions::default().pages(PageSelection::Range(5, 2)),
        );
        let err = GhostscriptStrategy::render(&c, Path::new("/in/doc.pdf"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("names no page"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let c = ctx(TargetFormat::Png, ConversionOptions::default());
        let err = run_tool("definitely-not-a-real-binary-42", &[], &c)
            .await
            .unwrap_err();
        assert!(matches!(err, StrategyError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let c = ctx(TargetFormat::Png, ConversionOptions::default());
        let args: Vec<OsString> = vec!["-c".into(), "echo broken pdf >&2; exit 3".into()];
        let err = run_tool("sh", &args, &c).await.unwrap_err();
        match err {
            StrategyError::ProcessFailed { stderr, .. } => assert_eq!(stderr, "broken pdf"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let c = ctx(TargetFormat::Png, ConversionOptions::default());
        c.cancel.cancel();
        let args: Vec<OsString> = vec!["30".into()];
        let err = run_tool("sleep", &args, &c).await.unwrap_err();
        assert!(matches!(err, StrategyError::Stopped));
    }
}
