//! Lightweight PDF structure scan: page count and page sizes without a
//! PDF library.
//!
//! Only uncompressed page objects are visible this way. Documents that
//! store their page tree in compressed object streams fall back to the
//! root `/Count`, and failing that to a single page.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::path::Path;

/// US Letter in points, used when a page declares no `/MediaBox`.
pub const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

static RE_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Type\s*/Page(?-u:\b)").unwrap());
static RE_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Count\s+(\d+)").unwrap());
static RE_MEDIABOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/MediaBox\s*\[\s*(-?[\d.]+)\s+(-?[\d.]+)\s+(-?[\d.]+)\s+(-?[\d.]+)\s*\]").unwrap()
});

/// What the scan could see.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOutline {
    /// Best page-count estimate, at least 1.
    pub pages: usize,
    /// Width × height in points of each `/MediaBox`, in file order.
    pub media_boxes: Vec<(f32, f32)>,
}

impl PdfOutline {
    /// Size of page `index` (0-based), reusing the last known box and
    /// falling back to US Letter.
    pub fn page_size(&self, index: usize) -> (f32, f32) {
        self.media_boxes
            .get(index)
            .or_else(|| self.media_boxes.last())
            .copied()
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

pub fn scan(bytes: &[u8]) -> PdfOutline {
    let page_objects = RE_PAGE.find_iter(bytes).count();
    let root_count = RE_COUNT
        .captures_iter(bytes)
        .filter_map(|c| std::str::from_utf8(&c[1]).ok()?.parse::<usize>().ok())
        .max()
        .unwrap_or(0);

    let media_boxes = RE_MEDIABOX
        .captures_iter(bytes)
        .filter_map(|c| {
            let n = |i: usize| -> Option<f32> { std::str::from_utf8(&c[i]).ok()?.parse().ok() };
            let (x0, y0, x1, y1) = (n(1)?, n(2)?, n(3)?, n(4)?);
            let (w, h) = ((x1 - x0).abs(), (y1 - y0).abs());
            (w >= 1.0 && h >= 1.0).then_some((w, h))
        })
        .collect();

    let pages = if page_objects > 0 {
        page_objects
    } else {
        root_count
    };

    PdfOutline {
        pages: pages.max(1),
        media_boxes,
    }
}

/// Scan a PDF on disk. Blocking.
pub fn scan_file(path: &Path) -> std::io::Result<PdfOutline> {
    Ok(scan(&std::fs::read(path)?))
}

#[cfg(test)]
pub(crate) fn sample_pdf(pages: &[(u32, u32)]) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n".to_vec();
    out.extend_from_slice(
        format!("2 0 obj << /Type /Pages /Count {} /Kids [] >> endobj\n", pages.len()).as_bytes(),
    );
    for (i, (w, h)) in pages.iter().enumerate() {
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] >> endobj\n",
                i + 3,
                w,
                h
            )
            .as_bytes(),
        );
    }
    out.extend_from_slice(b"%%EOF\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_page_objects_not_page_tree() {
        let pdf = sample_pdf(&[(612, 792), (595, 842), (612, 792)]);
        let outline = scan(&pdf);
        assert_eq!(outline.pages, 3);
        assert_eq!(outline.media_boxes.len(), 3);
        assert_eq!(outline.page_size(1), (595.0, 842.0));
        assert_eq!(outline.page_size(9), (612.0, 792.0));
    }

    #[test]
    fn falls_back_to_count_then_one() {
        let compressed = b"%PDF-1.5\n<< /Type /Pages /Count 7 >>\n<< /Type /Pages /Count 3 >>";
        assert_eq!(scan(compressed).pages, 7);
        let opaque = scan(b"%PDF-1.7\nstream...endstream");
        assert_eq!(opaque.pages, 1);
        assert_eq!(opaque.page_size(0), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn mediabox_with_offset_origin() {
        let outline = scan(b"/Type /Page /MediaBox [ 10 20 310.5 420 ] >>");
        assert_eq!(outline.media_boxes, vec![(300.5, 400.0)]);
    }
}
