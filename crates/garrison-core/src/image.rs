//! Packed 8-bit BGR frames as delivered by the camera producers.

use crate::types::BoundingBox;
use thiserror::Error;

const BGR_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ImageError {
    #[error("invalid BGR buffer length for {width}x{height}: expected {expected}, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A packed BGR image (`width * height * 3` bytes, row-major).
#[derive(Clone, PartialEq, Eq)]
pub struct BgrImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for BgrImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgrImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl BgrImage {
    /// Wrap an existing BGR buffer, validating its length.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize * BGR_CHANNELS;
        if data.len() != expected {
            return Err(ImageError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    /// An all-black placeholder frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BGR_CHANNELS],
        }
    }

    /// Build a frame where every pixel has the given BGR value.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * BGR_CHANNELS)
            .collect();
        Self { width, height, data }
    }

    /// Expand a single-channel intensity buffer into BGR by replication.
    pub fn from_gray(width: u32, height: u32, gray: &[u8]) -> Result<Self, ImageError> {
        let pixels = width as usize * height as usize;
        if gray.len() != pixels {
            return Err(ImageError::InvalidLength {
                width,
                height,
                expected: pixels,
                actual: gray.len(),
            });
        }
        let data = gray.iter().flat_map(|&v| [v, v, v]).collect();
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True for the all-zero placeholder a feed holds before its first real frame.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Single-channel intensity using BT.601 luma weights.
    pub fn to_gray(&self) -> Vec<u8> {
        self.data
            .chunks_exact(BGR_CHANNELS)
            .map(|px| {
                let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                (0.114 * b + 0.587 * g + 0.299 * r).round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Copy out the part of `region` that lies inside the frame.
    ///
    /// Returns `None` when the clamped region has no pixels.
    pub fn crop(&self, region: &BoundingBox) -> Option<BgrImage> {
        let (left, top, right, bottom) = region.clamped_pixels(self.width, self.height)?;
        let w = (right - left) as usize;
        let h = (bottom - top) as usize;
        let stride = self.width as usize * BGR_CHANNELS;

        let mut data = Vec::with_capacity(w * h * BGR_CHANNELS);
        for y in top as usize..bottom as usize {
            let start = y * stride + left as usize * BGR_CHANNELS;
            data.extend_from_slice(&self.data[start..start + w * BGR_CHANNELS]);
        }

        Some(BgrImage {
            width: w as u32,
            height: h as u32,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_short_buffer() {
        let err = BgrImage::new(2, 2, vec![0; 11]).unwrap_err();
        assert_eq!(
            err,
            ImageError::InvalidLength { width: 2, height: 2, expected: 12, actual: 11 }
        );
    }

    #[test]
    fn test_blank_detection() {
        assert!(BgrImage::blank(4, 4).is_blank());
        assert!(!BgrImage::filled(4, 4, [0, 0, 1]).is_blank());
    }

    #[test]
    fn test_to_gray_uses_luma_weights() {
        // Pure red, pure green, pure blue, white
        let img = BgrImage::new(4, 1, vec![0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255, 255]).unwrap();
        assert_eq!(img.to_gray(), vec![76, 150, 29, 255]);
    }

    #[test]
    fn test_from_gray_replicates_channels() {
        let img = BgrImage::from_gray(2, 1, &[10, 200]).unwrap();
        assert_eq!(img.data(), &[10, 10, 10, 200, 200, 200]);
        assert_eq!(img.to_gray(), vec![10, 200]);
    }

    #[test]
    fn test_crop_inside_frame() {
        let data: Vec<u8> = (0..4 * 3 * 3).map(|i| i as u8).collect();
        let img = BgrImage::new(4, 3, data).unwrap();
        let region = BoundingBox { x: 1.0, y: 1.0, width: 2.0, height: 2.0 };
        let crop = img.crop(&region).unwrap();
        assert_eq!(crop.dimensions(), (2, 2));
        // Row 1, columns 1..3 → byte offsets 15..21
        assert_eq!(&crop.data()[..6], &[15, 16, 17, 18, 19, 20]);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let img = BgrImage::blank(10, 10);
        let region = BoundingBox { x: -5.0, y: 8.0, width: 8.0, height: 10.0 };
        let crop = img.crop(&region).unwrap();
        assert_eq!(crop.dimensions(), (3, 2));
    }

    #[test]
    fn test_crop_outside_frame_is_none() {
        let img = BgrImage::blank(10, 10);
        let region = BoundingBox { x: 20.0, y: 20.0, width: 5.0, height: 5.0 };
        assert!(img.crop(&region).is_none());
    }
}
