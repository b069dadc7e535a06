use chrono::{DateTime, Local};
use garrison_core::{
    AttendanceStore, Collaborators, EnrollmentStore, FaceAnalyzer, FaceOutcome, FrameReport,
    LandmarkLocator, Notifier, PhotoSink, RecognitionPipeline,
};
use garrison_hw::{Feed, FrameBuffer};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::analyzer::{SharedSidecar, Sidecar};
use crate::sinks::{Announcer, PhotoDirectory};
use crate::store::PunchLog;

/// What the kiosk did most recently, as reported over D-Bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub last_labels: Vec<String>,
    pub faces_seen: u64,
    pub punches_accepted: u64,
    pub punches_dropped: u64,
    pub lockout_remaining_secs: Option<i64>,
    pub last_frame_at: Option<DateTime<Local>>,
    /// Feed the engine is blocked on, if any.
    pub waiting_for: Option<Feed>,
}

#[derive(Default)]
pub struct KioskStatus {
    inner: Mutex<StatusSnapshot>,
}

impl KioskStatus {
    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    fn waiting(&self, feed: Feed) {
        self.lock().waiting_for = Some(feed);
    }

    fn record(&self, report: &FrameReport, lockout_remaining: Option<chrono::Duration>) {
        let mut status = self.lock();
        status.waiting_for = None;
        status.last_frame_at = Some(report.timestamp);
        status.lockout_remaining_secs = lockout_remaining.map(|d| d.num_seconds());
        if report.is_empty() {
            return;
        }
        status.faces_seen += report.outcomes.len() as u64;
        status.last_labels = report.labels();
        for outcome in &report.outcomes {
            match outcome {
                FaceOutcome::PunchAccepted(_) => status.punches_accepted += 1,
                FaceOutcome::PunchDropped { .. } => status.punches_dropped += 1,
                _ => {}
            }
        }
    }
}

/// Drives the recognition pipeline from the shared frame buffer.
pub struct Engine {
    pipeline: RecognitionPipeline,
    analyzer: Box<dyn FaceAnalyzer>,
    landmarks: Box<dyn LandmarkLocator>,
    store: Box<dyn AttendanceStore>,
    photos: Box<dyn PhotoSink>,
    notifier: Box<dyn Notifier>,
    frames: Arc<FrameBuffer>,
    enrollment: Arc<EnrollmentStore>,
    status: Arc<KioskStatus>,
    require_thermal: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: RecognitionPipeline,
        analyzer: Box<dyn FaceAnalyzer>,
        landmarks: Box<dyn LandmarkLocator>,
        store: Box<dyn AttendanceStore>,
        photos: Box<dyn PhotoSink>,
        notifier: Box<dyn Notifier>,
        frames: Arc<FrameBuffer>,
        enrollment: Arc<EnrollmentStore>,
        status: Arc<KioskStatus>,
        require_thermal: bool,
    ) -> Self {
        Self {
            pipeline,
            analyzer,
            landmarks,
            store,
            photos,
            notifier,
            frames,
            enrollment,
            status,
            require_thermal,
        }
    }

    /// Process the newest frame pair. Returns `None` while a required
    /// feed has no frame.
    pub fn tick(&mut self, now: DateTime<Local>) -> Option<FrameReport> {
        let Some(visual) = self.frames.current_visual_frame() else {
            self.status.waiting(Feed::Visual);
            return None;
        };
        let thermal = self.frames.current_thermal_frame();
        if self.require_thermal && thermal.is_none() {
            self.status.waiting(Feed::Thermal);
            return None;
        }

        let enrolled = self.enrollment.current_identities();
        let mut collab = Collaborators {
            analyzer: self.analyzer.as_mut(),
            landmarks: self.landmarks.as_mut(),
            store: self.store.as_mut(),
            photos: self.photos.as_mut(),
        };
        let report = self.pipeline.process_frame(
            Some(&*visual),
            thermal.as_deref(),
            &enrolled,
            now,
            &mut collab,
        );

        self.notifier.announce(&report);
        self.status.record(&report, self.pipeline.lockout().remaining(now));
        for event in report.punches() {
            tracing::info!(
                user_id = event.identity.user_id,
                name = %event.identity.display_name,
                punch = %event.punch_type,
                photo = %event.photo_reference,
                "punch recorded"
            );
        }
        Some(report)
    }
}

/// Everything the engine thread needs. All parts are `Send`; the shared
/// sidecar is assembled on the thread itself.
pub struct EngineParts {
    pub pipeline: RecognitionPipeline,
    pub sidecar: Sidecar,
    pub store: PunchLog,
    pub photos: PhotoDirectory,
    pub announcer: Announcer,
    pub frames: Arc<FrameBuffer>,
    pub enrollment: Arc<EnrollmentStore>,
    pub status: Arc<KioskStatus>,
    pub poll_interval: Duration,
    pub require_thermal: bool,
}

/// Spawn the recognition loop on a dedicated OS thread.
pub fn spawn_engine(parts: EngineParts) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("garrison-engine".into())
        .spawn(move || {
            let poll_interval = parts.poll_interval;
            let sidecar = SharedSidecar::new(parts.sidecar);
            let mut engine = Engine::new(
                parts.pipeline,
                Box::new(sidecar.clone()),
                Box::new(sidecar),
                Box::new(parts.store),
                Box::new(parts.photos),
                Box::new(parts.announcer),
                parts.frames,
                parts.enrollment,
                parts.status,
                parts.require_thermal,
            );
            tracing::info!(poll_ms = poll_interval.as_millis() as u64, "engine thread started");
            loop {
                let started = Instant::now();
                if engine.tick(Local::now()).is_none() {
                    tracing::trace!("waiting for camera frames");
                }
                if let Some(rest) = poll_interval.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
        })
}
