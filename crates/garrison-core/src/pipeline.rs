//! Per-frame recognition pipeline.
//!
//! For every detected face: match → thermal check → liveness (feeding the
//! spoof lockout) → identity resolution → cooldown → punch. All state that
//! changes between frames lives in [`RecognitionPipeline`] and is only ever
//! touched by the single control loop that owns it.

use crate::identity::{Identity, IdentityResolver};
use crate::image::BgrImage;
use crate::liveness::{LandmarkLocator, LivenessDetector, LivenessPolicy};
use crate::lockout::{FailureOutcome, SpoofLockout};
use crate::punch::{PunchStateMachine, PunchType};
use crate::thermal::{ThermalThresholds, ThermalVerifier};
use crate::types::{
    BoundingBox, EnrolledIdentity, EuclideanMatcher, FaceObservation, GeoPoint, LivenessVerdict,
    MatchResult, Matcher,
};
use crate::{liveness, lockout, punch, types};
use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_UNKNOWN_NOTICE_SECS: i64 = 5;

pub const UNKNOWN_LABEL: &str = "Unknown";
pub const FAKE_FACE_LABEL: &str = "Fake Face";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("analyzer I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("analyzer protocol error: {0}")]
    Protocol(String),
    /// The analyzer answered, but refused this frame.
    #[error("analyzer rejected frame: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("photo I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("photo encoding failed: {0}")]
    Encode(String),
}

/// External capability: find faces in a frame and embed each one.
pub trait FaceAnalyzer {
    fn analyze(&mut self, frame: &BgrImage) -> Result<Vec<FaceObservation>, AnalyzerError>;
}

/// Persisted punch history and the sink for new punches.
pub trait AttendanceStore {
    /// Type of the most recent persisted punch for `user_id`, if any.
    fn last_punch_type(&mut self, user_id: i64) -> Result<Option<PunchType>, PersistenceError>;

    fn record_punch(&mut self, record: &PunchRecord) -> Result<(), PersistenceError>;
}

/// Stores the photo taken with a punch; returns a reference to it.
pub trait PhotoSink {
    fn save_photo(
        &mut self,
        frame: &BgrImage,
        identity: &Identity,
        at: DateTime<Local>,
    ) -> Result<String, PhotoError>;
}

/// UI/speech rendering of a processed frame. Fire-and-forget.
pub trait Notifier {
    fn announce(&mut self, report: &FrameReport);
}

/// A punch as handed to the attendance store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunchRecord {
    pub user_id: i64,
    pub punch_type: PunchType,
    pub event_time: DateTime<Local>,
    pub photo_reference: String,
    pub location: GeoPoint,
    pub device_id: i64,
}

/// An accepted punch, reported to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunchEvent {
    pub identity: Identity,
    pub punch_type: PunchType,
    pub timestamp: DateTime<Local>,
    pub photo_reference: String,
}

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceOutcome {
    /// No enrolled identity within tolerance. `notify` is set when the
    /// "not recognized" notice may be shown for this frame.
    Unknown { region: BoundingBox, notify: bool },
    /// Thermal signature does not look like a live face.
    FakeFace { label: String, region: BoundingBox },
    /// Thermal data for the face region was unusable; the face is skipped.
    Unverified { label: String, region: BoundingBox },
    /// Recognition is suspended by the spoof lockout.
    LockedOut { label: String },
    /// No blink/motion cue on this frame.
    LivenessFailed { label: String },
    /// Recognized, but the label carries no user ID.
    Unresolved { label: String },
    /// Recognized and live, but punched too recently.
    CoolingDown { identity: Identity },
    PunchAccepted(PunchEvent),
    /// The punch attempt was lost (history, photo or store failure).
    PunchDropped { identity: Identity, reason: String },
}

impl FaceOutcome {
    /// Text shown next to the face.
    pub fn label(&self) -> &str {
        match self {
            FaceOutcome::Unknown { .. } => UNKNOWN_LABEL,
            FaceOutcome::FakeFace { .. } => FAKE_FACE_LABEL,
            FaceOutcome::Unverified { label, .. }
            | FaceOutcome::LockedOut { label }
            | FaceOutcome::LivenessFailed { label }
            | FaceOutcome::Unresolved { label } => label,
            FaceOutcome::CoolingDown { identity } | FaceOutcome::PunchDropped { identity, .. } => {
                &identity.display_name
            }
            FaceOutcome::PunchAccepted(event) => &event.identity.display_name,
        }
    }
}

/// Everything the pipeline decided for one frame, in detection order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub timestamp: DateTime<Local>,
    pub outcomes: Vec<FaceOutcome>,
    /// Set on the frame whose liveness failure engaged the spoof lockout.
    pub lockout_engaged: Option<DateTime<Local>>,
}

impl FrameReport {
    fn empty(timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            outcomes: Vec::new(),
            lockout_engaged: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.label().to_string()).collect()
    }

    pub fn punches(&self) -> impl Iterator<Item = &PunchEvent> {
        self.outcomes.iter().filter_map(|o| match o {
            FaceOutcome::PunchAccepted(event) => Some(event),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub match_tolerance: f32,
    pub thermal: ThermalThresholds,
    pub ear_threshold: f32,
    pub motion_threshold: u64,
    pub liveness_policy: LivenessPolicy,
    pub punch_cooldown: Duration,
    pub lockout_threshold: u32,
    pub lockout_duration: Duration,
    pub unknown_notice_interval: Duration,
    pub device_id: i64,
    pub location: GeoPoint,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_tolerance: types::DEFAULT_MATCH_TOLERANCE,
            thermal: ThermalThresholds::default(),
            ear_threshold: liveness::DEFAULT_EAR_THRESHOLD,
            motion_threshold: liveness::DEFAULT_MOTION_THRESHOLD,
            liveness_policy: LivenessPolicy::default(),
            punch_cooldown: Duration::seconds(punch::DEFAULT_PUNCH_COOLDOWN_SECS),
            lockout_threshold: lockout::DEFAULT_FAILURE_THRESHOLD,
            lockout_duration: Duration::seconds(lockout::DEFAULT_LOCKOUT_SECS),
            unknown_notice_interval: Duration::seconds(DEFAULT_UNKNOWN_NOTICE_SECS),
            device_id: 1,
            location: GeoPoint {
                longitude: 14.476_31,
                latitude: 35.925_840_6,
            },
        }
    }
}

/// The external collaborators a frame is processed against.
pub struct Collaborators<'a> {
    pub analyzer: &'a mut dyn FaceAnalyzer,
    pub landmarks: &'a mut dyn LandmarkLocator,
    pub store: &'a mut dyn AttendanceStore,
    pub photos: &'a mut dyn PhotoSink,
}

/// Per-frame scratch state shared by every face of the frame.
struct FrameContext {
    blink: Option<bool>,
    motion: bool,
    lockout_engaged: Option<DateTime<Local>>,
}

pub struct RecognitionPipeline {
    matcher: EuclideanMatcher,
    thermal: ThermalVerifier,
    liveness: LivenessDetector,
    policy: LivenessPolicy,
    resolver: IdentityResolver,
    punches: PunchStateMachine,
    lockout: SpoofLockout,
    unknown_notice_interval: Duration,
    unknown_notice_until: Option<DateTime<Local>>,
    device_id: i64,
    location: GeoPoint,
}

impl Default for RecognitionPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl RecognitionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            matcher: EuclideanMatcher::new(config.match_tolerance),
            thermal: ThermalVerifier::new(config.thermal),
            liveness: LivenessDetector::new(config.ear_threshold, config.motion_threshold),
            policy: config.liveness_policy,
            resolver: IdentityResolver::default(),
            punches: PunchStateMachine::new(config.punch_cooldown),
            lockout: SpoofLockout::new(config.lockout_threshold, config.lockout_duration),
            unknown_notice_interval: config.unknown_notice_interval,
            unknown_notice_until: None,
            device_id: config.device_id,
            location: config.location,
        }
    }

    pub fn lockout(&self) -> &SpoofLockout {
        &self.lockout
    }

    pub fn punches(&self) -> &PunchStateMachine {
        &self.punches
    }

    /// Process one visual/thermal frame pair.
    ///
    /// Never fails: analyzer and collaborator errors become log lines or
    /// per-face outcomes, and one face's failure does not affect the others.
    pub fn process_frame(
        &mut self,
        visual: Option<&BgrImage>,
        thermal: Option<&BgrImage>,
        enrolled: &[EnrolledIdentity],
        now: DateTime<Local>,
        collab: &mut Collaborators<'_>,
    ) -> FrameReport {
        let Some(visual) = visual.filter(|f| !f.is_empty() && !f.is_blank()) else {
            tracing::debug!("visual frame unavailable; skipping");
            return FrameReport::empty(now);
        };

        let mut ctx = FrameContext {
            blink: None,
            // Fed once per frame so the reference frame stays one frame old.
            motion: self.policy.uses_motion() && self.liveness.check_motion(visual),
            lockout_engaged: None,
        };

        let faces = match collab.analyzer.analyze(visual) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face analysis failed; skipping frame");
                return FrameReport::empty(now);
            }
        };

        let outcomes = faces
            .iter()
            .map(|face| self.process_face(face, visual, thermal, enrolled, now, &mut ctx, collab))
            .collect();

        FrameReport {
            timestamp: now,
            outcomes,
            lockout_engaged: ctx.lockout_engaged,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_face(
        &mut self,
        face: &FaceObservation,
        visual: &BgrImage,
        thermal: Option<&BgrImage>,
        enrolled: &[EnrolledIdentity],
        now: DateTime<Local>,
        ctx: &mut FrameContext,
        collab: &mut Collaborators<'_>,
    ) -> FaceOutcome {
        let candidate = match self.matcher.compare(&face.embedding, enrolled) {
            MatchResult::Known { identity, distance } => {
                tracing::debug!(label = %identity.label, distance, "face matched");
                identity
            }
            MatchResult::Unknown => {
                return FaceOutcome::Unknown {
                    region: face.region,
                    notify: self.take_unknown_notice(now),
                };
            }
        };
        let label = candidate.label.clone();

        if thermal.is_some() {
            let report = self.thermal.verify_region(visual, thermal, &face.region);
            match report.verdict {
                LivenessVerdict::Live => {
                    tracing::debug!(label = %label, stats = ?report.stats, "thermal signature verified");
                }
                LivenessVerdict::Spoof => {
                    tracing::warn!(label = %label, stats = ?report.stats, "rejected: no valid heat signature");
                    return FaceOutcome::FakeFace {
                        label,
                        region: face.region,
                    };
                }
                LivenessVerdict::Indeterminate => {
                    tracing::warn!(label = %label, "thermal region unusable; skipping face");
                    return FaceOutcome::Unverified {
                        label,
                        region: face.region,
                    };
                }
            }
        }

        if self.lockout.is_locked(now) {
            return FaceOutcome::LockedOut { label };
        }

        if !self.is_live(visual, ctx, collab) {
            match self.lockout.observe_liveness_failure(now) {
                FailureOutcome::Engaged { until } => ctx.lockout_engaged = Some(until),
                FailureOutcome::Counting { consecutive } => {
                    tracing::debug!(label = %label, consecutive, "liveness check failed");
                }
                FailureOutcome::AlreadyLocked => {}
            }
            return FaceOutcome::LivenessFailed { label };
        }
        self.lockout.observe_liveness_success();

        let identity = match self.resolver.resolve(&label) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "recognized label has no user id; not punching");
                return FaceOutcome::Unresolved { label };
            }
        };

        if !self.punches.should_punch(identity.user_id, now) {
            tracing::debug!(user_id = identity.user_id, "punch suppressed by cooldown");
            return FaceOutcome::CoolingDown { identity };
        }
        // The cooldown starts with the attempt, whether or not it persists.
        self.punches.record(identity.user_id, now);

        match self.punch(&identity, visual, now, collab) {
            Ok(event) => {
                tracing::info!(
                    user_id = identity.user_id,
                    name = %identity.display_name,
                    punch_type = %event.punch_type,
                    photo = %event.photo_reference,
                    "attendance punched"
                );
                FaceOutcome::PunchAccepted(event)
            }
            Err(reason) => {
                tracing::warn!(user_id = identity.user_id, %reason, "punch attempt dropped");
                FaceOutcome::PunchDropped { identity, reason }
            }
        }
    }

    fn punch(
        &mut self,
        identity: &Identity,
        visual: &BgrImage,
        now: DateTime<Local>,
        collab: &mut Collaborators<'_>,
    ) -> Result<PunchEvent, String> {
        let photo_reference = collab
            .photos
            .save_photo(visual, identity, now)
            .map_err(|e| format!("photo capture failed: {e}"))?;

        let punch_type = self
            .punches
            .get_punch_type(collab.store, identity.user_id)
            .map_err(|e| format!("punch history unavailable: {e}"))?;

        let record = PunchRecord {
            user_id: identity.user_id,
            punch_type,
            event_time: now,
            photo_reference: photo_reference.clone(),
            location: self.location,
            device_id: self.device_id,
        };
        collab
            .store
            .record_punch(&record)
            .map_err(|e| format!("punch not recorded: {e}"))?;

        Ok(PunchEvent {
            identity: identity.clone(),
            punch_type,
            timestamp: now,
            photo_reference,
        })
    }

    fn is_live(
        &self,
        visual: &BgrImage,
        ctx: &mut FrameContext,
        collab: &mut Collaborators<'_>,
    ) -> bool {
        let motion = ctx.motion;
        let mut blink = || {
            *ctx
                .blink
                .get_or_insert_with(|| self.liveness.check_blink(collab.landmarks, visual))
        };
        match self.policy {
            LivenessPolicy::Blink => blink(),
            LivenessPolicy::Motion => motion,
            LivenessPolicy::BlinkOrMotion => motion || blink(),
        }
    }

    /// At most one "not recognized" notice per interval, kiosk-wide.
    fn take_unknown_notice(&mut self, now: DateTime<Local>) -> bool {
        if self.unknown_notice_until.is_some_and(|until| now < until) {
            return false;
        }
        self.unknown_notice_until = Some(now + self.unknown_notice_interval);
        true
    }
}
