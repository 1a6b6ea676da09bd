//! Zero-dependency last resort: blank white pages of the right size.
//!
//! Keeps a conversion from failing outright on hosts with no rasteriser at
//! all. The output carries no document content, and a warning says so.

use super::encode::{encode_page, page_pixels, write_atomic};
use super::pdf_scan;
use super::MAX_EDGE;
use crate::catalog::{Strategy, StrategyContext};
use crate::config::TargetFormat;
use crate::error::StrategyError;
use crate::output::{ArtifactRef, DocumentKind};
use crate::probe::CapabilityId;
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::PathBuf;
use tracing::warn;

pub struct PlaceholderStrategy {
    max_input_bytes: u64,
}

impl PlaceholderStrategy {
    pub const NAME: &'static str = "placeholder";

    pub fn new() -> Self {
        Self {
            max_input_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for PlaceholderStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for PlaceholderStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u32 {
        4
    }

    fn required_capabilities(&self) -> Vec<CapabilityId> {
        Vec::new()
    }

    fn max_input_bytes(&self) -> u64 {
        self.max_input_bytes
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Pdf && target.is_raster()
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        let blocking_ctx = ctx.clone();
        let paths = tokio::task::spawn_blocking(move || render_blank_pages(&blocking_ctx))
            .await
            .map_err(|e| StrategyError::Other(format!("placeholder task panicked: {e}")))??;

        let msg = format!(
            "{} page(s) rendered as blank placeholders; document content was not rendered",
            paths.len()
        );
        warn!("Job {}: {}", ctx.job_id, msg);
        ctx.reporter.warn(msg);

        paths.into_iter().map(|p| ctx.artifact(p)).collect()
    }
}

fn render_blank_pages(ctx: &StrategyContext) -> Result<Vec<PathBuf>, StrategyError> {
    let outline = pdf_scan::scan_file(ctx.input_path())
        .map_err(|e| StrategyError::UnreadableInput(e.to_string()))?;
    let indices = ctx.options.pages.to_indices(outline.pages);
    if indices.is_empty() {
        return Err(StrategyError::Other(format!(
            "page selection matches none of {} page(s)",
            outline.pages
        )));
    }

    let density = ctx.options.quality.density();
    let mut out = Vec::with_capacity(indices.len());
    for (done, &idx) in indices.iter().enumerate() {
        ctx.checkpoint()?;
        let (w_pt, h_pt) = outline.page_size(idx);
        let (w, h) = page_pixels(w_pt, h_pt, density, MAX_EDGE);
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])));

        let bytes = encode_page(&page, ctx.target, ctx.options.compression).map_err(|e| {
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
