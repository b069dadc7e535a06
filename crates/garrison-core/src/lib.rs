//! garrison-core — Decision pipeline for the attendance kiosk.
//!
//! Matches face embeddings against the enrolled set, cross-checks each match
//! against the thermal camera and blink/motion liveness cues, and decides
//! whether an IN/OUT punch may be recorded. Camera I/O, face analysis and
//! persistence are collaborators behind traits; nothing in here touches a
//! device, a file or a database.

pub mod enrollment;
pub mod identity;
pub mod image;
pub mod liveness;
pub mod lockout;
pub mod pipeline;
pub mod punch;
pub mod thermal;
pub mod types;

pub use enrollment::EnrollmentStore;
pub use identity::{resolve, Identity, IdentityResolver, LabelFormat, ParseError};
pub use image::{BgrImage, ImageError};
pub use liveness::{FaceLandmarks, LandmarkLocator, LivenessDetector, LivenessPolicy, Point};
pub use lockout::{FailureOutcome, SpoofLockout};
pub use pipeline::{
    AnalyzerError, AttendanceStore, Collaborators, FaceAnalyzer, FaceOutcome, FrameReport,
    Notifier, PersistenceError, PhotoError, PhotoSink, PipelineConfig, PunchEvent, PunchRecord,
    RecognitionPipeline,
};
pub use punch::{PunchStateMachine, PunchType};
pub use thermal::{ThermalStats, ThermalThresholds, ThermalVerifier};
pub use types::{
    BoundingBox, Embedding, EnrolledIdentity, EuclideanMatcher, FaceObservation, GeoPoint,
    LivenessVerdict, MatchResult, Matcher,
};
