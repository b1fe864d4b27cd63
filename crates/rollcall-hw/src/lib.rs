//! rollcall-hw — Hardware abstraction for webcam capture.
//!
//! Provides V4L2-based camera access and conversion of raw YUYV / MJPG
//! buffers into RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, FrameStream, PixelFormat};
pub use frame::Frame;
