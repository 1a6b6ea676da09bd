//! In-process PDF rasterisation through pdfium.
//!
//! `pdfium-render` wraps a C++ library with thread-local state, so all
//! pdfium calls happen inside `spawn_blocking`. Pages are rendered and
//! written one at a time to keep at most one page bitmap in memory.

use super::encode::{encode_page, write_atomic};
use super::MAX_EDGE;
use crate::catalog::{Strategy, StrategyContext};
use crate::config::TargetFormat;
use crate::error::StrategyError;
use crate::output::{ArtifactRef, DocumentKind};
use crate::probe::{self, CapabilityCheck, CapabilityId, CheckOutcome};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// Bind the pdfium shared library.
///
/// `PDFIUM_LIB_PATH` wins when set; otherwise a library next to the
/// working directory, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, String> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(path) => Pdfium::bind_to_library(PathBuf::from(path)),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| format!("pdfium library not loadable: {e:?}"))?;
    Ok(Pdfium::new(bindings))
}

/// Available when the pdfium library can be bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfiumCheck;

impl CapabilityCheck for PdfiumCheck {
    fn run(&self) -> CheckOutcome {
        match bind_pdfium() {
            Ok(_) => CheckOutcome::available("pdfium library bound"),
            Err(e) => CheckOutcome::unavailable(e),
        }
    }
}

pub struct PdfiumStrategy;

impl PdfiumStrategy {
    pub const NAME: &'static str = "pdfium";
}

#[async_trait]
impl Strategy for PdfiumStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        2
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        vec![probe::PDFIUM]
    }

    fn max_input_bytes(&self) -> u64 {
        50 * 1024 * 1024
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Pdf && target.is_raster()
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        let blocking_ctx = ctx.clone();
        let paths = tokio::task::spawn_blocking(move || render_blocking(&blocking_ctx))
            .await
            .map_err(|e| StrategyError::Other(format!("render task panicked: {e}")))??;

        paths.into_iter().map(|p| ctx.artifact(p)).collect()
    }
}

fn render_blocking(ctx: &StrategyContext) -> Result<Vec<PathBuf>, StrategyError> {
    let pdfium = bind_pdfium().map_err(StrategyError::Other)?;

    let document = pdfium
        .load_pdf_from_file(ctx.input_path(), None)
        .map_err(|e| StrategyError::UnreadableInput(format!("{e:?}")))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let indices = ctx.options.pages.to_indices(total_pages);
    if indices.is_empty() {
        return Err(StrategyError::Other(format!(
            "page selection matches none of {total_pages} page(s)"
        )));
    }

    let scale = ctx.options.quality.density() as f32 / 72.0;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(MAX_EDGE as i32)
        .set_maximum_height(MAX_EDGE as i32);

    let mut out = Vec::with_capacity(indices.len());
    for (done, &idx) in indices.iter().enumerate() {
        ctx.checkpoint()?;

        let page_failed = |e: PdfiumError| StrategyError::PageFailed {
            page: idx + 1,
            detail: format!("{e:?}"),
        };
        let page = pages.get(idx as u16).map_err(page_failed)?;
        let image = page
            .render_with_config(&render_config)
            .map_err(page_failed)?
            .as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        let bytes = encode_page(&image, ctx.target, ctx.options.compression).map_err(|e| {
            StrategyError::PageFailed {
                page: idx + 1,
                detail: e.to_string(),
            }
        })?;
        let path = ctx.output_path("page", idx);
        write_atomic(&path, &bytes)?;
        out.push(path);
        ctx.reporter.units_done(done + 1);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_pdf_to_raster_route() {
        let s = PdfiumStrategy;
        assert_eq!(s.priority(), 2);
        assert_eq!(s.required_capabilities(), vec![probe::PDFIUM]);
        assert!(s.handles(DocumentKind::Pdf, TargetFormat::Png));
        assert!(!s.handles(DocumentKind::Image, TargetFormat::Png));
    }

    #[test]
    fn check_never_panics() {
        // Outcome depends on the host; only the contract is checked.
        let outcome = PdfiumCheck.run();
        assert!(!outcome.detail.is_empty());
    }
}
