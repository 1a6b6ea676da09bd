//! Image → PDF without external tools.
//!
//! The image is decoded with the `image` crate, re-encoded as JPEG and
//! embedded as a `/DCTDecode` XObject on a single A4 portrait page, fitted
//! inside a 50 pt margin and centred.

use super::encode::{encode_page, write_atomic};
use crate::catalog::{Strategy, StrategyContext};
use crate::config::TargetFormat;
use crate::error::StrategyError;
use crate::output::{ArtifactRef, DocumentKind};
use crate::probe::CapabilityId;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;

/// A4 portrait, in points.
pub const A4: (f32, f32) = (595.28, 841.89);

const MARGIN: f32 = 50.0;

pub struct ImagePdfStrategy;

impl ImagePdfStrategy {
    pub const NAME: &'static str = "image-pdf";
}

#[async_trait]
impl Strategy for ImagePdfStrategy {
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
        20 * 1024 * 1024
    }

    fn handles(&self, source: DocumentKind, target: TargetFormat) -> bool {
        source == DocumentKind::Image && target == TargetFormat::Pdf
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<Vec<ArtifactRef>, StrategyError> {
        let blocking_ctx = ctx.clone();
        let path = tokio::task::spawn_blocking(move || embed_image(&blocking_ctx))
            .await
            .map_err(|e| StrategyError::Other(format!("image-pdf task panicked: {e}")))??;
        ctx.reporter.units_done(1);
        Ok(vec![ctx.artifact(path)?])
    }
}

fn embed_image(ctx: &StrategyContext) -> Result<PathBuf, StrategyError> {
    let img = image::open(ctx.input_path())
        .map_err(|e| StrategyError::UnreadableInput(e.to_string()))?;
    ctx.checkpoint()?;

    let jpeg = encode_page(&img, TargetFormat::Jpeg, ctx.options.compression).map_err(|e| {
        StrategyError::PageFailed {
            page: 1,
            detail: e.to_string(),
        }
    })?;
    let pdf = single_image_pdf(&jpeg, img.width(), img.height())?;
    ctx.checkpoint()?;

    let path = ctx.output_dir.join("document.pdf");
    write_atomic(&path, &pdf)?;
    Ok(path)
}

/// Placement `(x, y, width, height)` of a `w × h` image fitted inside `page`
/// less the margin, preserving aspect ratio.
fn fit(w: u32, h: u32, page: (f32, f32)) -> (f32, f32, f32, f32) {
    let (max_w, max_h) = (page.0 - 2.0 * MARGIN, page.1 - 2.0 * MARGIN);
    let aspect = w as f32 / h.max(1) as f32;
    let (fw, fh) = if aspect > max_w / max_h {
        (max_w, max_w / aspect)
    } else {
        (max_h * aspect, max_h)
    };
    ((page.0 - fw) / 2.0, (page.1 - fh) / 2.0, fw, fh)
}

/// A one-page PDF showing `jpeg` (a baseline RGB JPEG of `w × h` pixels).
pub(crate) fn single_image_pdf(jpeg: &[u8], w: u32, h: u32) -> std::io::Result<Vec<u8>> {
    let (x, y, fw, fh) = fit(w, h, A4);
    let content = format!("q {fw:.2} 0 0 {fh:.2} {x:.2} {y:.2} cm /Im0 Do Q\n");

    let mut out: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(5);

    offsets.push(out.len());
    out.write_all(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n")?;
    offsets.push(out.len());
    out.write_all(b"2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n")?;
    offsets.push(out.len());
    write!(
        out,
        "3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {:.2} {:.2}] \
         /Resources << /XObject << /Im0 4 0 R >> >> /Contents 5 0 R >>\nendobj\n",
        A4.0, A4.1
    )?;
    offsets.push(out.len());
    write!(
        out,
        "4 0 obj\n<< /Type /XObject /Subtype /Image /Width {w} /Height {h} \
         /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /DCTDecode /Length {} >>\nstream\n",
        jpeg.len()
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\nendstream\nendobj\n")?;
    offsets.push(out.len());
    write!(
        out,
        "5 0 obj\n<< /Length {} >>\nstream\n{content}endstream\nendobj\n",
        content.len()
    )?;

    let xref = out.len();
    write!(out, "xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1)?;
    for off in &offsets {
        write!(out, "{off:010} 00000 n \n")?;
    }
    write!(
        out,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
        offsets.len() + 1
    )?;
    Ok(out)
}
