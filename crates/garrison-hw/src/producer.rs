//! Per-camera producer threads.
//!
//! Each configured camera gets its own OS thread that connects, streams
//! frames into its slot of the [`FrameBuffer`] and reconnects forever after a
//! loss. A slow or missing camera never delays the other feed.

use crate::buffer::{Feed, FeedStatus, FrameBuffer};
use crate::camera::Camera;
use crate::frame;
use std::fmt::Display;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub feed: Feed,
    pub device: String,
    /// Kiosk resolution every frame is letterboxed into.
    pub width: u32,
    pub height: u32,
    /// Give up a connect attempt after this long and fall back to placeholder frames.
    pub connect_timeout: Duration,
    /// Pause between open attempts inside one connect attempt.
    pub connect_interval: Duration,
    /// Pause after a failed connect attempt or a lost stream.
    pub retry_delay: Duration,
}

impl ProducerConfig {
    pub fn new(feed: Feed, device: impl Into<String>) -> Self {
        Self {
            feed,
            device: device.into(),
            width: 640,
            height: 480,
            connect_timeout: Duration::from_secs(10),
            connect_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Start the producer thread for one camera.
pub fn spawn_producer(
    config: ProducerConfig,
    buffer: Arc<FrameBuffer>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("garrison-{}-camera", config.feed))
        .spawn(move || run_producer(&config, &buffer))
}

fn run_producer(config: &ProducerConfig, buffer: &FrameBuffer) {
    let feed = config.feed;
    tracing::info!(%feed, device = %config.device, "camera producer started");

    loop {
        buffer.set_status(feed, FeedStatus::Connecting);
        let opened = connect_with(
            || Camera::open(&config.device, config.width, config.height),
            config.connect_timeout,
            config.connect_interval,
        );

        match opened {
            Some(camera) => {
                tracing::info!(%feed, device = %config.device, "camera connected");
                let streamed = camera.stream(|raw| {
                    match frame::letterbox(&raw, config.width, config.height) {
                        Ok(frame) => buffer.publish(feed, frame),
                        Err(e) => tracing::debug!(%feed, error = %e, "dropping frame"),
                    }
                    true
                });
                if let Err(e) = streamed {
                    tracing::warn!(%feed, device = %config.device, error = %e, "camera stream lost");
                }
            }
            None => {
                tracing::warn!(
                    %feed,
                    device = %config.device,
                    timeout_secs = config.connect_timeout.as_secs(),
                    "camera did not connect; using placeholder frames"
                );
            }
        }

        buffer.set_status(feed, FeedStatus::Lost);
        std::thread::sleep(config.retry_delay);
    }
}

/// Call `open` every `interval` until it succeeds or `timeout` has passed.
pub fn connect_with<T, E, F>(mut open: F, timeout: Duration, interval: Duration) -> Option<T>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    let deadline = Instant::now() + timeout;
    loop {
        match open() {
            Ok(device) => return Some(device),
            Err(e) => tracing::debug!(error = %e, "camera open attempt failed"),
        }
        if Instant::now() + interval > deadline {
            return None;
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_retries_until_success() {
        let mut attempts = 0;
        let result = connect_with(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err("busy")
                } else {
                    Ok(attempts)
                }
            },
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        assert_eq!(result, Some(3));
    }

    #[test]
    fn test_connect_gives_up_after_timeout() {
        let mut attempts = 0u32;
        let result: Option<()> = connect_with(
            || {
                attempts += 1;
                Err("no such device")
            },
            Duration::from_millis(20),
            Duration::from_millis(5),
        );
        assert!(result.is_none());
        assert!(attempts >= 2);
        assert!(attempts <= 6);
    }

    #[test]
    fn test_default_producer_timings() {
        let config = ProducerConfig::new(Feed::Thermal, "/dev/video2");
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }
}
