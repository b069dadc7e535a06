use garrison_core::EnrollmentStore;
use garrison_hw::{Feed, FrameBuffer};
use std::sync::Arc;
use zbus::interface;

use crate::engine::KioskStatus;
use crate::enroll::EnrollHandle;
use crate::store;

pub const BUS_NAME: &str = "io.garrison.Kiosk1";
pub const OBJECT_PATH: &str = "/io/garrison/Kiosk1";

const MAX_RECENT_PUNCHES: u32 = 500;

/// Operator interface of the attendance kiosk.
///
/// Bus name: io.garrison.Kiosk1
/// Object path: /io/garrison/Kiosk1
pub struct KioskService {
    pub status: Arc<KioskStatus>,
    pub frames: Arc<FrameBuffer>,
    pub enrollment: Arc<EnrollmentStore>,
    pub enroller: EnrollHandle,
    pub db: tokio_rusqlite::Connection,
}

fn feed_json(frames: &FrameBuffer, feed: Feed) -> serde_json::Value {
    serde_json::json!({
        "status": frames.status(feed),
        "frames": frames.frames_published(feed),
        "age_ms": frames.age(feed).map(|age| age.as_millis() as u64),
    })
}

#[interface(name = "io.garrison.Kiosk1")]
impl KioskService {
    /// Return kiosk status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "visual": feed_json(&self.frames, Feed::Visual),
            "thermal": feed_json(&self.frames, Feed::Thermal),
            "enrolled": self.enrollment.len(),
            "enrollment_generation": self.enrollment.generation(),
            "enrollment_rebuilding": self.enroller.is_running(),
            "engine": self.status.snapshot(),
        })
        .to_string())
    }

    /// Rebuild the enrolled set from the photo directory. Returns false if a
    /// rebuild is already running.
    async fn reload_enrollment(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("enrollment reload requested");
        self.enroller
            .request_reload()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Most recent punches, newest first, as a JSON array.
    async fn recent_punches(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = limit.min(MAX_RECENT_PUNCHES);
        let punches = self
            .db
            .call(move |conn| Ok(store::recent_punches(conn, limit)?))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("punch log: {e}")))?;
        serde_json::to_string(&punches).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
