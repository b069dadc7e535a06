//! Thermal verification of a matched face.
//!
//! A photo or screen held up to the kiosk sits at ambient temperature: the
//! thermal crop is dim, flat and has no hot spot. A live face shows a warm,
//! textured region with a clear peak.

use crate::image::BgrImage;
use crate::types::{BoundingBox, LivenessVerdict};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEAN_THRESHOLD: f32 = 100.0;
pub const DEFAULT_VARIANCE_THRESHOLD: f32 = 50.0;
pub const DEFAULT_MAX_THRESHOLD: f32 = 150.0;

/// Minimum intensity statistics a thermal crop must reach to count as live.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalThresholds {
    pub mean: f32,
    pub variance: f32,
    pub max: f32,
}

impl Default for ThermalThresholds {
    fn default() -> Self {
        Self {
            mean: DEFAULT_MEAN_THRESHOLD,
            variance: DEFAULT_VARIANCE_THRESHOLD,
            max: DEFAULT_MAX_THRESHOLD,
        }
    }
}

/// Intensity statistics of a single-channel thermal crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalStats {
    pub mean: f32,
    /// Population variance.
    pub variance: f32,
    pub max: f32,
}

impl ThermalStats {
    /// Compute mean, population variance and peak of an intensity buffer.
    pub fn from_gray(gray: &[u8]) -> Option<Self> {
        if gray.is_empty() {
            return None;
        }
        let n = gray.len() as f64;
        let mean = gray.iter().map(|&p| p as f64).sum::<f64>() / n;
        let variance = gray
            .iter()
            .map(|&p| (p as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let max = gray.iter().copied().max().unwrap_or(0);

        Some(Self {
            mean: mean as f32,
            variance: variance as f32,
            max: max as f32,
        })
    }
}

/// Thermal verdict for one face, with the statistics that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalReport {
    pub verdict: LivenessVerdict,
    pub stats: Option<ThermalStats>,
}

impl ThermalReport {
    fn indeterminate() -> Self {
        Self {
            verdict: LivenessVerdict::Indeterminate,
            stats: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThermalVerifier {
    pub thresholds: ThermalThresholds,
}

impl ThermalVerifier {
    pub fn new(thresholds: ThermalThresholds) -> Self {
        Self { thresholds }
    }

    /// `Live` iff every statistic reaches its threshold.
    pub fn classify(&self, stats: &ThermalStats) -> LivenessVerdict {
        let t = &self.thresholds;
        if stats.mean >= t.mean && stats.variance >= t.variance && stats.max >= t.max {
            LivenessVerdict::Live
        } else {
            LivenessVerdict::Spoof
        }
    }

    /// Classify an already-cropped thermal region.
    pub fn verify_thermal(&self, crop: &BgrImage) -> ThermalReport {
        match ThermalStats::from_gray(&crop.to_gray()) {
            Some(stats) => ThermalReport {
                verdict: self.classify(&stats),
                stats: Some(stats),
            },
            None => ThermalReport::indeterminate(),
        }
    }

    /// Crop the thermal frame at the visual face region and classify it.
    ///
    /// Indeterminate when no thermal frame is supplied, when its geometry
    /// differs from the visual frame (the region would not be co-registered),
    /// or when the region falls outside the frame.
    pub fn verify_region(
        &self,
        visual: &BgrImage,
        thermal: Option<&BgrImage>,
        region: &BoundingBox,
    ) -> ThermalReport {
        let Some(thermal) = thermal else {
            return ThermalReport::indeterminate();
        };
        if thermal.dimensions() != visual.dimensions() {
            tracing::warn!(
                visual = ?visual.dimensions(),
                thermal = ?thermal.dimensions(),
                "visual and thermal frames differ in size"
            );
            return ThermalReport::indeterminate();
        }
        match thermal.crop(region) {
            Some(crop) => self.verify_thermal(&crop),
            None => {
                tracing::warn!(?region, "thermal crop is empty");
                ThermalReport::indeterminate()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(mean: f32, variance: f32, max: f32) -> ThermalStats {
        ThermalStats { mean, variance, max }
    }

    /// A gray crop alternating between two intensities.
    fn striped(width: u32, height: u32, low: u8, high: u8) -> BgrImage {
        let gray: Vec<u8> = (0..width * height)
            .map(|i| if i % 2 == 0 { low } else { high })
            .collect();
        BgrImage::from_gray(width, height, &gray).unwrap()
    }

    #[test]
    fn test_classify_mean_below_threshold_is_spoof() {
        let v = ThermalVerifier::default();
        assert_eq!(v.classify(&stats(80.0, 60.0, 160.0)), LivenessVerdict::Spoof);
    }

    #[test]
    fn test_classify_all_above_threshold_is_live() {
        let v = ThermalVerifier::default();
        assert_eq!(v.classify(&stats(120.0, 60.0, 160.0)), LivenessVerdict::Live);
    }

    #[test]
    fn test_classify_flat_or_cold_peak_is_spoof() {
        let v = ThermalVerifier::default();
        assert_eq!(v.classify(&stats(120.0, 10.0, 160.0)), LivenessVerdict::Spoof);
        assert_eq!(v.classify(&stats(120.0, 60.0, 140.0)), LivenessVerdict::Spoof);
    }

    #[test]
    fn test_stats_population_variance() {
        let s = ThermalStats::from_gray(&[100, 200]).unwrap();
        assert_eq!(s.mean, 150.0);
        assert_eq!(s.variance, 2500.0);
        assert_eq!(s.max, 200.0);
    }

    #[test]
    fn test_stats_empty_is_none() {
        assert!(ThermalStats::from_gray(&[]).is_none());
    }

    #[test]
    fn test_verify_warm_textured_crop_is_live() {
        let crop = striped(8, 8, 110, 160);
        let report = ThermalVerifier::default().verify_thermal(&crop);
        assert_eq!(report.verdict, LivenessVerdict::Live);
    }

    #[test]
    fn test_verify_uniform_crop_is_spoof() {
        let crop = BgrImage::from_gray(8, 8, &[180; 64]).unwrap();
        let report = ThermalVerifier::default().verify_thermal(&crop);
        assert_eq!(report.verdict, LivenessVerdict::Spoof);
        assert_eq!(report.stats.unwrap().variance, 0.0);
    }

    #[test]
    fn test_region_without_thermal_frame_is_indeterminate() {
        let visual = BgrImage::blank(16, 16);
        let region = BoundingBox { x: 0.0, y: 0.0, width: 8.0, height: 8.0 };
        let report = ThermalVerifier::default().verify_region(&visual, None, &region);
        assert_eq!(report.verdict, LivenessVerdict::Indeterminate);
    }

    #[test]
    fn test_region_size_mismatch_is_indeterminate() {
        let visual = BgrImage::blank(16, 16);
        let thermal = striped(8, 8, 110, 160);
        let region = BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0 };
        let report = ThermalVerifier::default().verify_region(&visual, Some(&thermal), &region);
        assert_eq!(report.verdict, LivenessVerdict::Indeterminate);
    }

    #[test]
    fn test_region_out_of_bounds_is_indeterminate() {
        let visual = BgrImage::blank(16, 16);
        let thermal = striped(16, 16, 110, 160);
        let region = BoundingBox { x: 40.0, y: 40.0, width: 4.0, height: 4.0 };
        let report = ThermalVerifier::default().verify_region(&visual, Some(&thermal), &region);
        assert_eq!(report.verdict, LivenessVerdict::Indeterminate);
    }

    #[test]
    fn test_region_crop_is_classified() {
        let visual = BgrImage::blank(16, 16);
        let thermal = striped(16, 16, 110, 160);
        let region = BoundingBox { x: 2.0, y: 2.0, width: 6.0, height: 6.0 };
        let report = ThermalVerifier::default().verify_region(&visual, Some(&thermal), &region);
        assert_eq!(report.verdict, LivenessVerdict::Live);
    }
}
