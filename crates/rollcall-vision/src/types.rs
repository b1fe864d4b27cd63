use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Map a box found in a resized image back to the original image.
    ///
    /// `factor` is original size / analysed size.
    pub fn rescaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(x, y)| (x * factor, y * factor))),
        }
    }
}

/// Face encoding vector (512-dimensional for ArcFace, L2-normalised).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub values: Vec<f32>,
    /// Model version that produced this encoding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two encodings.
    ///
    /// For unit-length encodings the result lies in [0, 2]; 0 means identical.
    /// Encodings of different lengths never match: the distance is infinite.
    pub fn distance(&self, other: &Encoding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One reference encoding of an enrolled person.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub name: String,
    /// Where the encoding came from (reference image file name).
    pub source: String,
    pub encoding: Encoding,
}

/// Result of matching a probe encoding against the known faces.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Name of the closest known person, if closer than the threshold.
    pub name: Option<String>,
    /// Distance to the closest known encoding (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        self.name.is_some()
    }
}

/// Strategy for comparing a probe encoding against a gallery of known faces.
pub trait Matcher {
    fn compare(&self, probe: &Encoding, gallery: &[KnownFace], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// A probe is recognised as the closest gallery entry when that distance is
/// strictly below the threshold.
pub struct DistanceMatcher;

impl Matcher for DistanceMatcher {
    fn compare(&self, probe: &Encoding, gallery: &[KnownFace], threshold: f32) -> MatchResult {
        let best = gallery
            .iter()
            .map(|known| (known, probe.distance(&known.encoding)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((known, distance)) if distance < threshold => MatchResult {
                name: Some(known.name.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult {
                name: None,
                distance,
            },
            None => MatchResult {
                name: None,
                distance: f32::INFINITY,
            },
        }
    }
}
