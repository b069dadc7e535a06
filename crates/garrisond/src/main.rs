use anyhow::{Context, Result};
use garrison_core::{EnrollmentStore, RecognitionPipeline};
use garrison_hw::{Feed, FeedStatus, FrameBuffer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod analyzer;
mod config;
mod dbus_interface;
mod engine;
mod enroll;
mod sinks;
mod store;

use config::Config;
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use engine::{EngineParts, KioskStatus};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "garrisond starting");

    let config = Config::load()?;
    tracing::info!(
        visual = %config.visual_device,
        thermal = config.thermal_device.as_deref().unwrap_or("none"),
        policy = ?config.liveness_policy,
        device_id = config.device_id,
        "configuration loaded"
    );

    // Camera producers
    let frames = Arc::new(FrameBuffer::new());
    if config.thermal_device.is_none() {
        frames.set_status(Feed::Thermal, FeedStatus::Disabled);
        if config.require_thermal {
            tracing::warn!("require_thermal is set but no thermal camera is configured; ignoring");
        }
    }
    for producer in config.producers() {
        garrison_hw::spawn_producer(producer, frames.clone())
            .context("failed to spawn camera producer")?;
    }

    // Enrollment worker and directory watcher
    let enrollment = Arc::new(EnrollmentStore::default());
    let enroller = enroll::spawn_enroller(enroll::Enroller::new(
        &config.enrollment_dir,
        &config.cache_path,
        Box::new(analyzer::Sidecar::new(config.analyzer_command.clone())),
        enrollment.clone(),
    ))
    .context("failed to spawn enrollment worker")?;
    tokio::spawn(enroll::watch_directory(
        config.enrollment_dir.clone(),
        config.watch_interval(),
        enroller.clone(),
    ));

    // Recognition engine
    let punch_log = store::PunchLog::open(&config.db_path)
        .with_context(|| format!("failed to open punch log {}", config.db_path.display()))?;
    let status = Arc::new(KioskStatus::default());
    engine::spawn_engine(EngineParts {
        pipeline: RecognitionPipeline::new(config.pipeline_config()),
        sidecar: analyzer::Sidecar::new(config.analyzer_command.clone()),
        store: punch_log,
        photos: sinks::PhotoDirectory::new(&config.photo_dir, config.photo_url_prefix.clone()),
        announcer: sinks::Announcer::new(config.speech_command.clone(), config.lockout_secs),
        frames: frames.clone(),
        enrollment: enrollment.clone(),
        status: status.clone(),
        poll_interval: config.poll_interval(),
        require_thermal: config.require_thermal && config.thermal_device.is_some(),
    })
    .context("failed to spawn engine thread")?;

    // Operator interface
    let db = tokio_rusqlite::Connection::open(&config.db_path).await?;
    let service = KioskService {
        status,
        frames,
        enrollment,
        enroller,
        db,
    };
    let _conn = match serve_dbus(service, config.dbus_session).await {
        Ok(conn) => {
            tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, session = config.dbus_session, "D-Bus interface registered");
            Some(conn)
        }
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; running without operator interface");
            None
        }
    };

    tracing::info!("garrisond ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("garrisond shutting down");

    Ok(())
}

async fn serve_dbus(service: KioskService, session: bool) -> zbus::Result<zbus::Connection> {
    let builder = if session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}
