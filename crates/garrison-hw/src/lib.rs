//! garrison-hw — Camera acquisition for the attendance kiosk.
//!
//! Provides V4L2-based capture of the visual and thermal cameras, conversion
//! of the negotiated pixel format into packed BGR, and the shared two-slot
//! frame buffer that the per-camera producer threads keep filled.

pub mod buffer;
pub mod camera;
pub mod frame;
pub mod producer;

pub use buffer::{Feed, FeedStatus, FrameBuffer};
pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::FrameError;
pub use producer::{spawn_producer, ProducerConfig};
