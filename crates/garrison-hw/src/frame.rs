//! Pixel-format conversion into packed BGR and letterbox resizing.

use garrison_core::{BgrImage, ImageError};
use image::imageops::{self, FilterType};
use image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame buffer rejected: {0}")]
    Image(#[from] ImageError),
    #[error("cannot letterbox {width}x{height} frame")]
    EmptyFrame { width: u32, height: u32 },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to BGR.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair. Full-range BT.601 coefficients.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<BgrImage, FrameError> {
    let pixels = width as usize * height as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut bgr = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            let r = y + 1.402 * v;
            let g = y - 0.344_136 * u - 0.714_136 * v;
            let b = y + 1.772 * u;
            bgr.extend([b, g, r].map(|c| c.round().clamp(0.0, 255.0) as u8));
        }
    }
    // Odd widths leave a trailing half macropixel.
    bgr.truncate(pixels * 3);
    Ok(BgrImage::new(width, height, bgr)?)
}

/// 8-bit grayscale to BGR by channel replication.
pub fn grey_to_bgr(buf: &[u8], width: u32, height: u32) -> Result<BgrImage, FrameError> {
    let pixels = width as usize * height as usize;
    check_len("GREY", buf, pixels)?;
    Ok(BgrImage::from_gray(width, height, &buf[..pixels])?)
}

/// 16-bit little-endian grayscale (typical thermal output) to BGR, keeping
/// the high byte.
pub fn y16_to_bgr(buf: &[u8], width: u32, height: u32) -> Result<BgrImage, FrameError> {
    let pixels = width as usize * height as usize;
    check_len("Y16", buf, pixels * 2)?;
    let gray: Vec<u8> = buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect();
    Ok(BgrImage::from_gray(width, height, &gray)?)
}

/// Scale `frame` to fit inside `width`x`height` keeping its aspect ratio,
/// centred on a black canvas.
pub fn letterbox(frame: &BgrImage, width: u32, height: u32) -> Result<BgrImage, FrameError> {
    if frame.dimensions() == (width, height) {
        return Ok(frame.clone());
    }
    let (src_w, src_h) = frame.dimensions();
    if src_w == 0 || src_h == 0 || width == 0 || height == 0 {
        return Err(FrameError::EmptyFrame {
            width: src_w,
            height: src_h,
        });
    }

    let scale = f64::min(width as f64 / src_w as f64, height as f64 / src_h as f64);
    let new_w = ((src_w as f64 * scale).round() as u32).clamp(1, width);
    let new_h = ((src_h as f64 * scale).round() as u32).clamp(1, height);

    // Channel order is irrelevant to resampling, so BGR rides in an RgbImage.
    let source = RgbImage::from_raw(src_w, src_h, frame.data().to_vec()).ok_or(
        FrameError::EmptyFrame {
            width: src_w,
            height: src_h,
        },
    )?;
    let resized = imageops::resize(&source, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::new(width, height);
    let x = (width - new_w) / 2;
    let y = (height - new_h) / 2;
    imageops::replace(&mut canvas, &resized, x as i64, y as i64);

    Ok(BgrImage::new(width, height, canvas.into_raw())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let img = yuyv_to_bgr(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.data(), &[100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down; blue is unaffected.
        let img = yuyv_to_bgr(&[100, 128, 100, 228], 2, 1).unwrap();
        let px = &img.data()[..3];
        assert_eq!(px[0], 100);
        assert!(px[1] < 100);
        assert!(px[2] > 200);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_bgr(&[100, 128], 2, 1);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { format: "YUYV", expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_replicates() {
        let img = grey_to_bgr(&[7, 9, 0xFF], 2, 1).unwrap();
        assert_eq!(img.data(), &[7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 → 0x12, 0xFF00 → 0xFF
        let img = y16_to_bgr(&[0x34, 0x12, 0x00, 0xFF], 2, 1).unwrap();
        assert_eq!(img.to_gray(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_letterbox_same_size_is_copy() {
        let frame = BgrImage::filled(8, 6, [1, 2, 3]);
        assert_eq!(letterbox(&frame, 8, 6).unwrap(), frame);
    }

    #[test]
    fn test_letterbox_adds_bars() {
        // 8x4 into 8x8: content fills rows 2..6, black above and below.
        let frame = BgrImage::filled(8, 4, [200, 200, 200]);
        let boxed = letterbox(&frame, 8, 8).unwrap();
        assert_eq!(boxed.dimensions(), (8, 8));

        let gray = boxed.to_gray();
        assert!(gray[..16].iter().all(|&v| v == 0));
        assert!(gray[16..48].iter().all(|&v| v == 200));
        assert!(gray[48..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_letterbox_downscales() {
        let frame = BgrImage::filled(1280, 720, [50, 60, 70]);
        let boxed = letterbox(&frame, 640, 480).unwrap();
        assert_eq!(boxed.dimensions(), (640, 480));
        assert!(!boxed.is_blank());
    }
}
