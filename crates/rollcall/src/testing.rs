//! Test doubles: a scripted face analyzer and an in-memory frame source.
//!
//! Test images are solid colours; the analyzer decides which faces an image
//! "contains" from its mean red value, so the script survives JPEG round
//! trips and resizing.

use image::{Rgb, RgbImage};
use rollcall_hw::frame::FrameError;
use rollcall_hw::{CameraError, Frame, FrameSource};
use rollcall_vision::recognizer::RecognizerError;
use rollcall_vision::{AnalyzerError, BoundingBox, Encoding, FaceAnalyzer};
use std::collections::VecDeque;

const SHADE_TOLERANCE: i32 = 6;

#[derive(Clone)]
pub struct FakeFace {
    pub bbox: BoundingBox,
    pub encoding: Vec<f32>,
}

pub fn face(x: f32, y: f32, encoding: Vec<f32>) -> FakeFace {
    FakeFace {
        bbox: BoundingBox {
            x,
            y,
            width: 20.0,
            height: 20.0,
            confidence: 0.9,
            landmarks: None,
        },
        encoding,
    }
}

pub fn shaded(shade: u8) -> RgbImage {
    RgbImage::from_pixel(64, 48, Rgb([shade, 100, 100]))
}

fn shade_of(image: &RgbImage) -> i32 {
    let n = (image.width() * image.height()).max(1) as u64;
    (image.pixels().map(|p| p[0] as u64).sum::<u64>() / n) as i32
}

#[derive(Default)]
pub struct FakeAnalyzer {
    scripts: Vec<(u8, Vec<FakeFace>)>,
    pub locate_calls: usize,
    pub encode_calls: usize,
}

impl FakeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images of `shade` contain `faces`.
    pub fn script(mut self, shade: u8, faces: Vec<FakeFace>) -> Self {
        self.scripts.push((shade, faces));
        self
    }

    fn faces_in(&self, image: &RgbImage) -> &[FakeFace] {
        let shade = shade_of(image);
        self.scripts
            .iter()
            .filter(|(s, _)| (*s as i32 - shade).abs() <= SHADE_TOLERANCE)
            .min_by_key(|(s, _)| (*s as i32 - shade).abs())
            .map(|(_, faces)| faces.as_slice())
            .unwrap_or(&[])
    }
}

impl FaceAnalyzer for FakeAnalyzer {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        self.locate_calls += 1;
        Ok(self.faces_in(image).iter().map(|f| f.bbox.clone()).collect())
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Encoding, AnalyzerError> {
        self.encode_calls += 1;
        self.faces_in(image)
            .iter()
            .find(|f| f.bbox.x == face.x && f.bbox.y == face.y)
            .map(|f| Encoding {
                values: f.encoding.clone(),
                model_version: Some("fake".into()),
            })
            .ok_or(AnalyzerError::Recognizer(RecognizerError::NoLandmarks))
    }

    fn model_version(&self) -> &str {
        "fake"
    }
}

/// Frames served from a queue; running dry behaves like a lost camera.
pub struct QueuedFrames {
    frames: VecDeque<Option<RgbImage>>,
    sequence: u32,
}

impl QueuedFrames {
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        Self::with_corrupt(frames.into_iter().map(Some))
    }

    /// `None` entries come out as buffers that fail conversion.
    pub fn with_corrupt(frames: impl IntoIterator<Item = Option<RgbImage>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            sequence: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for QueuedFrames {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let next = self
            .frames
            .pop_front()
            .ok_or_else(|| CameraError::CaptureFailed("no more frames".into()))?;
        self.sequence += 1;
        let image = next.ok_or(CameraError::Frame(FrameError::InvalidLength {
            expected: 64 * 48 * 2,
            actual: 3,
        }))?;
        Ok(Frame::from_image(image, self.sequence))
    }
}
