use crate::identity::{self, Identity, ParseError};
use serde::{Deserialize, Serialize};

/// Default Euclidean tolerance for a positive match (face_recognition scale).
pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.5;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Integer `(left, top, right, bottom)` bounds clamped to a `width`x`height` frame.
    ///
    /// Returns `None` if nothing of the box lies inside the frame.
    pub fn clamped_pixels(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.clamp(0.0, max as f32) as u32;
        let left = clamp(self.x.floor(), width);
        let top = clamp(self.y.floor(), height);
        let right = clamp((self.x + self.width).ceil(), width);
        let bottom = clamp((self.y + self.height).ceil(), height);

        if right <= left || bottom <= top {
            return None;
        }
        Some((left, top, right, bottom))
    }
}

/// Fixed-length face embedding produced by the face analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the embeddings have different dimensions.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// One enrolled face: the raw enrollment label plus its reference embedding.
///
/// The label carries the numeric user ID and display name
/// (`"117 - Jane Doe"`); [`EnrolledIdentity::identity`] parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub label: String,
    pub embedding: Embedding,
}

impl EnrolledIdentity {
    pub fn new(label: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            label: label.into(),
            embedding,
        }
    }

    /// Structured identity (user ID + display name) parsed from the label.
    pub fn identity(&self) -> Result<Identity, ParseError> {
        identity::resolve(&self.label)
    }
}

/// A face found in one frame. Discarded once the frame is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Liveness classification from a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessVerdict {
    Live,
    Spoof,
    /// The signal could not be evaluated (missing or unusable data).
    Indeterminate,
}

/// Kiosk location recorded with every punch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Result of matching a probe embedding against the enrolled set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchResult<'a> {
    Known {
        identity: &'a EnrolledIdentity,
        distance: f32,
    },
    Unknown,
}

impl MatchResult<'_> {
    pub fn is_known(&self) -> bool {
        matches!(self, MatchResult::Known { .. })
    }
}

/// Strategy for comparing a probe embedding against the enrolled set.
pub trait Matcher {
    fn compare<'a>(&self, probe: &Embedding, enrolled: &'a [EnrolledIdentity]) -> MatchResult<'a>;
}

/// Nearest-neighbour matcher with a distance tolerance.
///
/// The closest enrolled embedding wins; it is accepted only if its distance
/// is within `tolerance`. Ties keep the first entry in enrollment order.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare<'a>(&self, probe: &Embedding, enrolled: &'a [EnrolledIdentity]) -> MatchResult<'a> {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in enrolled.iter().enumerate() {
            let Some(distance) = probe.euclidean_distance(&candidate.embedding) else {
                tracing::debug!(
                    label = %candidate.label,
                    probe_dim = probe.values.len(),
                    enrolled_dim = candidate.embedding.values.len(),
                    "skipping enrolled embedding with mismatched dimension"
                );
                continue;
            };
            // Strict comparison keeps the first of equally distant entries.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance <= self.tolerance => MatchResult::Known {
                identity: &enrolled[idx],
                distance,
            },
            _ => MatchResult::Unknown,
        }
    }
}
