//! rollcall-vision — Face detection and encoding engine.
//!
//! Uses SCRFD for face detection and ArcFace for face encodings, both
//! running via ONNX Runtime for CPU inference. The application talks to it
//! through the [`FaceAnalyzer`] trait.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use types::{BoundingBox, DistanceMatcher, Encoding, KnownFace, MatchResult, Matcher};
