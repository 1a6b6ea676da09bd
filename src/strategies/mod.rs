//! Built-in conversion strategies.
//!
//! | Strategy | Priority | Needs | Max input | Route |
//! |----------|----------|-------|-----------|-------|
//! | [`GhostscriptStrategy`] | 1 | `ghostscript` | 100 MiB | PDF → JPEG/PNG |
//! | [`PdfiumStrategy`] | 2 | `pdfium` | 50 MiB | PDF → JPEG/PNG |
//! | [`ImageMagickStrategy`] | 3 | `imagemagick` | 30 MiB | PDF → JPEG/PNG, image → PDF |
//! | [`PlaceholderStrategy`] | 4 | nothing | 10 MiB | PDF → JPEG/PNG (blank pages) |
//! | [`LibreOfficeStrategy`] | 1 | `office-converter` | 100 MiB | Word → PDF |
//! | [`OfficeRasterStrategy`] | 2 | `office-converter`, `ghostscript` | 100 MiB | Word → JPEG/PNG |
//! | [`ImagePdfStrategy`] | 4 | nothing | 20 MiB | image → PDF |

pub mod command;
pub mod encode;
pub mod image_pdf;
pub mod pdf_scan;
pub mod pdfium;
pub mod placeholder;

pub use command::{
    ghostscript_binary, GhostscriptStrategy, ImageMagickStrategy, LibreOfficeStrategy,
    OfficeRasterStrategy,
};
pub use image_pdf::ImagePdfStrategy;
pub use pdfium::{PdfiumCheck, PdfiumStrategy};
pub use placeholder::PlaceholderStrategy;

use crate::catalog::StrategyCatalog;
use crate::error::ConvertError;
use crate::probe::{self, CapabilityProbe, CommandCheck};
use std::time::Duration;

/// Longest edge, in pixels, of any rendered page.
pub const MAX_EDGE: u32 = 4096;

/// Catalog with every built-in strategy.
pub fn default_catalog() -> Result<StrategyCatalog, ConvertError> {
    StrategyCatalog::new()
        .with(GhostscriptStrategy)?
        .with(PdfiumStrategy)?
        .with(ImageMagickStrategy)?
        .with(PlaceholderStrategy::new())?
        .with(LibreOfficeStrategy)?
        .with(OfficeRasterStrategy)?
        .with(ImagePdfStrategy)
}

/// Probe with checks for every capability the built-in strategies need.
pub fn default_probe(ttl: Duration) -> CapabilityProbe {
    CapabilityProbe::new(ttl)
        .with_check(
            probe::GHOSTSCRIPT,
            CommandCheck::new(ghostscript_binary(), &["--version"]),
        )
        .with_check(probe::IMAGEMAGICK, CommandCheck::new("convert", &["-version"]))
        .with_check(
            probe::OFFICE_CONVERTER,
            CommandCheck::new("soffice", &["--version"]),
        )
        .with_check(probe::PDFIUM, PdfiumCheck)
}
