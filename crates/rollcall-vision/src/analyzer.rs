//! The seam between the application and the face engine.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, Encoding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Finds faces in a frame and turns them into encodings.
pub trait FaceAnalyzer {
    /// Locate faces, most confident first.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError>;

    /// Encode one face previously returned by [`locate`](Self::locate).
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Encoding, AnalyzerError>;

    /// Identifier of the encoding model; encodings from different models are
    /// not comparable.
    fn model_version(&self) -> &str;
}

/// SCRFD + ArcFace running on ONNX Runtime.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Encoding, AnalyzerError> {
        Ok(self.recognizer.encode(image, face)?)
    }

    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }
}
