//! Page image encoding and atomic file output.

use crate::config::TargetFormat;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::debug;

/// Encode a rendered page as JPEG (with the given quality) or PNG.
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_page(
    img: &DynamicImage,
    target: TargetFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match target {
        TargetFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, jpeg_quality))?;
        }
        TargetFormat::Png | TargetFormat::Pdf => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        }
    }
    debug!(
        "Encoded {}x{} page → {} bytes {}",
        img.width(),
        img.height(),
        buf.len(),
        target
    );
    Ok(buf)
}

/// Write `bytes` to a hidden temp file next to `path`, then persist it
/// into place. Readers never observe a partially written page.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".page-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Pixel size of a `width_pt × height_pt` page at `density` DPI, with the
/// longest edge capped at `max_edge`.
pub fn page_pixels(width_pt: f32, height_pt: f32, density: u32, max_edge: u32) -> (u32, u32) {
    let scale = density as f32 / 72.0;
    let (w, h) = (width_pt * scale, height_pt * scale);
    let longest = w.max(h);
    let shrink = if longest > max_edge as f32 {
        max_edge as f32 / longest
    } else {
        1.0
    };
    (
        ((w * shrink).floor() as u32).max(1),
        ((h * shrink).floor() as u32).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_png_and_jpeg() {
        let png = encode_page(&red(), TargetFormat::Png, 85).expect("png encode");
        assert!(png.starts_with(b"\x89PNG"));
        let jpg = encode_page(&red(), TargetFormat::Jpeg, 85).expect("jpeg encode");
        assert!(jpg.starts_with(&[0xFF, 0xD8, 0xFF]));
    }

    #[test]
    fn atomic_write_leaves_no_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("page-001.png");
        write_atomic(&path, b"data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn page_pixels_scale_and_cap() {
        assert_eq!(page_pixels(612.0, 792.0, 72, 4096), (612, 792));
        assert_eq!(page_pixels(612.0, 792.0, 300, 4096), (2550, 3300));
        let (w, h) = page_pixels(612.0, 792.0, 600, 4096);
        assert!((4095..=4096).contains(&h), "h = {h}");
        assert!(w < h);
    }
}
