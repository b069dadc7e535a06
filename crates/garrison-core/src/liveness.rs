//! Blink and motion cues for rejecting static spoofs.
//!
//! Both checks are streaming: they look at one frame at a time, and the
//! motion check only remembers the previous frame. A single frame is a weak
//! signal; the pipeline accumulates failures before acting on them.

use crate::image::BgrImage;
use crate::pipeline::AnalyzerError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EAR_THRESHOLD: f32 = 0.22;
pub const DEFAULT_MOTION_THRESHOLD: u64 = 5000;

/// A 2-D landmark position in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Six eye-contour landmarks per eye, in 68-point model order
/// (points 36–41 for the left eye, 42–47 for the right).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: [Point; 6],
    pub right_eye: [Point; 6],
}

impl FaceLandmarks {
    /// Mean eye aspect ratio of both eyes.
    pub fn mean_ear(&self) -> f32 {
        (eye_aspect_ratio(&self.left_eye) + eye_aspect_ratio(&self.right_eye)) / 2.0
    }
}

/// External capability that locates eye landmarks for every face in a frame.
pub trait LandmarkLocator {
    fn locate(&mut self, frame: &BgrImage) -> Result<Vec<FaceLandmarks>, AnalyzerError>;
}

/// Eye aspect ratio `(|p2-p6| + |p3-p5|) / (2·|p1-p4|)`.
///
/// Returns 0.0 for a degenerate eye whose corners coincide.
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> f32 {
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal == 0.0 {
        return 0.0;
    }
    (vertical_a + vertical_b) / (2.0 * horizontal)
}

/// Which cues a matched face must show to count as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LivenessPolicy {
    #[default]
    Blink,
    Motion,
    BlinkOrMotion,
}

impl LivenessPolicy {
    pub fn uses_blink(self) -> bool {
        matches!(self, LivenessPolicy::Blink | LivenessPolicy::BlinkOrMotion)
    }

    pub fn uses_motion(self) -> bool {
        matches!(self, LivenessPolicy::Motion | LivenessPolicy::BlinkOrMotion)
    }
}

impl std::str::FromStr for LivenessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blink" => Ok(LivenessPolicy::Blink),
            "motion" => Ok(LivenessPolicy::Motion),
            "blink-or-motion" | "either" => Ok(LivenessPolicy::BlinkOrMotion),
            other => Err(format!("unknown liveness policy: {other}")),
        }
    }
}

/// Reference frame for motion detection.
struct GrayFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

pub struct LivenessDetector {
    ear_threshold: f32,
    motion_threshold: u64,
    previous: Option<GrayFrame>,
}

impl Default for LivenessDetector {
    fn default() -> Self {
        Self::new(DEFAULT_EAR_THRESHOLD, DEFAULT_MOTION_THRESHOLD)
    }
}

impl LivenessDetector {
    pub fn new(ear_threshold: f32, motion_threshold: u64) -> Self {
        Self {
            ear_threshold,
            motion_threshold,
            previous: None,
        }
    }

    /// True when any face's mean EAR is below the threshold (eyes closing).
    pub fn blink_in(&self, faces: &[FaceLandmarks]) -> bool {
        faces.iter().any(|face| {
            let ear = face.mean_ear();
            tracing::trace!(ear, threshold = self.ear_threshold, "eye aspect ratio");
            ear < self.ear_threshold
        })
    }

    /// Locate landmarks in `frame` and report whether a blink is visible.
    ///
    /// A locator failure counts as "no blink".
    pub fn check_blink(&self, locator: &mut dyn LandmarkLocator, frame: &BgrImage) -> bool {
        match locator.locate(frame) {
            Ok(faces) => self.blink_in(&faces),
            Err(e) => {
                tracing::warn!(error = %e, "landmark location failed; treating as no blink");
                false
            }
        }
    }

    /// Compare `frame` with the previous one; true if the summed absolute
    /// grayscale difference exceeds the motion threshold.
    ///
    /// The first call (or a call after a resolution change) only seeds the
    /// reference frame and returns false.
    pub fn check_motion(&mut self, frame: &BgrImage) -> bool {
        let gray = frame.to_gray();
        let current = GrayFrame {
            width: frame.width(),
            height: frame.height(),
            data: gray,
        };

        let moved = match &self.previous {
            Some(prev) if prev.width == current.width && prev.height == current.height => {
                let score: u64 = prev
                    .data
                    .iter()
                    .zip(current.data.iter())
                    .map(|(&a, &b)| a.abs_diff(b) as u64)
                    .sum();
                tracing::trace!(score, threshold = self.motion_threshold, "motion score");
                score > self.motion_threshold
            }
            _ => false,
        };

        self.previous = Some(current);
        moved
    }

    /// Forget the motion reference frame.
    pub fn reset_motion(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Eye with corners 10px apart and the given lid opening.
    fn eye(opening: f32) -> [Point; 6] {
        [
            Point::new(0.0, 0.0),
            Point::new(3.0, -opening / 2.0),
            Point::new(7.0, -opening / 2.0),
            Point::new(10.0, 0.0),
            Point::new(7.0, opening / 2.0),
            Point::new(3.0, opening / 2.0),
        ]
    }

    fn face(opening: f32) -> FaceLandmarks {
        FaceLandmarks { left_eye: eye(opening), right_eye: eye(opening) }
    }

    struct FixedLocator(Result<Vec<FaceLandmarks>, ()>);

    impl LandmarkLocator for FixedLocator {
        fn locate(&mut self, _frame: &BgrImage) -> Result<Vec<FaceLandmarks>, AnalyzerError> {
            self.0
                .clone()
                .map_err(|_| AnalyzerError::Protocol("locator offline".into()))
        }
    }

    #[test]
    fn test_ear_open_eye() {
        // Opening 3px over 10px width → (3 + 3) / 20 = 0.3
        assert!((eye_aspect_ratio(&eye(3.0)) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_ear_degenerate_eye_is_zero() {
        let p = Point::new(1.0, 1.0);
        assert_eq!(eye_aspect_ratio(&[p; 6]), 0.0);
    }

    #[test]
    fn test_blink_detected_when_eyes_close() {
        let det = LivenessDetector::default();
        assert!(det.blink_in(&[face(1.0)]));
        assert!(!det.blink_in(&[face(3.0)]));
        assert!(!det.blink_in(&[]));
    }

    #[test]
    fn test_blink_averages_both_eyes() {
        // Left 0.1, right 0.3 → mean 0.2 < 0.22
        let f = FaceLandmarks { left_eye: eye(1.0), right_eye: eye(3.0) };
        assert!(LivenessDetector::default().blink_in(&[f]));
    }

    #[test]
    fn test_check_blink_locator_error_is_no_blink() {
        let det = LivenessDetector::default();
        let frame = BgrImage::blank(4, 4);
        assert!(!det.check_blink(&mut FixedLocator(Err(())), &frame));
        assert!(det.check_blink(&mut FixedLocator(Ok(vec![face(1.0)])), &frame));
    }

    #[test]
    fn test_motion_first_frame_seeds_reference() {
        let mut det = LivenessDetector::default();
        assert!(!det.check_motion(&BgrImage::filled(100, 100, [50, 50, 50])));
    }

    #[test]
    fn test_motion_detected_on_change() {
        let mut det = LivenessDetector::default();
        det.check_motion(&BgrImage::filled(100, 100, [50, 50, 50]));
        // 10,000 pixels differing by 10 → score 100,000
        assert!(det.check_motion(&BgrImage::filled(100, 100, [60, 60, 60])));
    }

    #[test]
    fn test_static_scene_has_no_motion() {
        let mut det = LivenessDetector::default();
        let frame = BgrImage::filled(100, 100, [50, 50, 50]);
        det.check_motion(&frame);
        assert!(!det.check_motion(&frame));
    }

    #[test]
    fn test_motion_resolution_change_reseeds() {
        let mut det = LivenessDetector::default();
        det.check_motion(&BgrImage::filled(100, 100, [50, 50, 50]));
        assert!(!det.check_motion(&BgrImage::filled(50, 50, [200, 200, 200])));
        assert!(det.check_motion(&BgrImage::filled(50, 50, [10, 10, 10])));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("blink".parse::<LivenessPolicy>().unwrap(), LivenessPolicy::Blink);
        assert_eq!("Motion".parse::<LivenessPolicy>().unwrap(), LivenessPolicy::Motion);
        assert_eq!(
            "blink-or-motion".parse::<LivenessPolicy>().unwrap(),
            LivenessPolicy::BlinkOrMotion
        );
        assert!("wink".parse::<LivenessPolicy>().is_err());
    }
}
