//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else {
            None
        }
    }
}

/// Consecutive unconvertible buffers tolerated before the stream counts as lost.
pub const MAX_BAD_FRAMES: usize = 30;

impl CameraError {
    /// A single bad buffer (corrupt MJPG, short YUYV read); the device is
    /// still streaming.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Frame(_))
    }
}

/// Anything that yields frames one at a time. The recognition and enrollment
/// loops only depend on this.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    /// Next frame that converted cleanly. Transient errors are skipped with a
    /// warning; any other error, or `MAX_BAD_FRAMES` transient ones in a row,
    /// is returned.
    fn next_good_frame(&mut self) -> Result<Frame, CameraError> {
        let mut bad = 0;
        loop {
            match self.next_frame() {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_transient() && bad + 1 < MAX_BAD_FRAMES => {
                    bad += 1;
                    tracing::warn!(error = %e, consecutive = bad, "skipping bad frame");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g., "/dev/video0") and negotiate a colour format
    /// close to the requested size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Prefer YUYV; fall back to MJPG, which many USB webcams require at
        // higher resolutions.
        let mut negotiated = None;
        for wanted in [b"YUYV", b"MJPG"] {
            let mut fmt = device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
            fmt.fourcc = FourCC::new(wanted);
            fmt.width = width;
            fmt.height = height;

            let got = device.set_format(&fmt).map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;
            if let Some(pixel_format) = PixelFormat::from_fourcc(got.fourcc) {
                negotiated = Some((got, pixel_format));
                break;
            }
            tracing::debug!(requested = ?FourCC::new(wanted), got = ?got.fourcc, "format rejected");
        }

        let (fmt, pixel_format) = negotiated.ok_or_else(|| {
            CameraError::FormatNegotiationFailed("device offers neither YUYV nor MJPG".into())
        })?;

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            fourcc = ?fmt.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            fourcc: fmt.fourcc,
            pixel_format,
        })
    }

    /// Start streaming. The stream borrows the camera and stops when dropped.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(FrameStream {
            camera: self,
            stream,
        })
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<image::RgbImage, CameraError> {
        let image = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Mjpg => frame::mjpg_to_rgb(buf, self.width, self.height)?,
        };
        Ok(image)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// A running capture stream on an open [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Capture and drop `count` frames so auto-exposure can settle.
    pub fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.next_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };
        let sequence = meta.sequence;
        let image = self.camera.buf_to_rgb(&buf[..used])?;

        Ok(Frame::from_image(image, sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameError;
    use image::RgbImage;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Result<Frame, CameraError>>);

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(CameraError::CaptureFailed("drained".into())))
        }
    }

    fn good(sequence: u32) -> Result<Frame, CameraError> {
        Ok(Frame::from_image(RgbImage::new(4, 2), sequence))
    }

    fn short_read() -> CameraError {
        CameraError::Frame(FrameError::InvalidLength {
            expected: 16,
            actual: 3,
        })
    }

    fn corrupt() -> Result<Frame, CameraError> {
        Err(short_read())
    }

    #[test]
    fn test_bad_frame_is_skipped() {
        let mut source = Scripted(VecDeque::from([good(1), corrupt(), corrupt(), good(4)]));
        assert_eq!(source.next_good_frame().unwrap().sequence, 1);
        assert_eq!(source.next_good_frame().unwrap().sequence, 4);
    }

    #[test]
    fn test_capture_failure_is_not_skipped() {
        let mut source = Scripted(VecDeque::from([
            Err(CameraError::CaptureFailed("dequeue".into())),
            good(2),
        ]));
        assert!(matches!(
            source.next_good_frame(),
            Err(CameraError::CaptureFailed(_))
        ));
    }

    #[test]
    fn test_run_of_bad_frames_is_camera_loss() {
        let mut frames: VecDeque<_> = (0..MAX_BAD_FRAMES).map(|_| corrupt()).collect();
        frames.push_back(good(99));
        let mut source = Scripted(frames);
        assert!(matches!(source.next_good_frame(), Err(CameraError::Frame(_))));
    }

    #[test]
    fn test_only_conversion_errors_are_transient() {
        assert!(short_read().is_transient());
        assert!(!CameraError::DeviceBusy.is_transient());
    }
}
