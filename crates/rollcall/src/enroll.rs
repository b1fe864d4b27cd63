//! Guided enrollment: capture one reference image per head pose.
//!
//! Captures go into a hidden staging directory next to the person's final
//! directory and are moved into place only when at least one pose was
//! accepted, so a cancelled or failed enrollment never leaves a partial
//! person behind (or damages an existing one).

use crate::cache::{self, CacheEntry, EncodingCache};
use crate::display::{Annotation, DisplayError, Viewer};
use image::{ImageFormat, RgbImage};
use rollcall_hw::{CameraError, FrameSource};
use rollcall_vision::{AnalyzerError, BoundingBox, FaceAnalyzer};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid name {0:?}: {1}")]
    InvalidName(String, &'static str),
    #[error("{0} is already enrolled; use --force to replace")]
    AlreadyEnrolled(String),
    #[error("no pose could be captured for {0}")]
    NothingCaptured(String),
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face engine error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to encode capture: {0}")]
    Image(#[from] image::ImageError),
    #[error("display error: {0}")]
    Display(#[from] DisplayError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pose {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl Pose {
    pub const ALL: [Pose; 5] = [Pose::Center, Pose::Left, Pose::Right, Pose::Up, Pose::Down];

    pub fn file_stem(self) -> &'static str {
        match self {
            Pose::Center => "center",
            Pose::Left => "left",
            Pose::Right => "right",
            Pose::Up => "up",
            Pose::Down => "down",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            Pose::Center => "Look straight at the camera",
            Pose::Left => "Turn your head slightly left",
            Pose::Right => "Turn your head slightly right",
            Pose::Up => "Tilt your head slightly up",
            Pose::Down => "Tilt your head slightly down",
        }
    }

    fn file_name(self) -> String {
        format!("{}.jpg", self.file_stem())
    }
}

/// Person names double as directory names.
pub fn validate_name(name: &str) -> Result<(), EnrollError> {
    let invalid = |why| Err(EnrollError::InvalidName(name.to_string(), why));
    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if name.trim() != name {
        return invalid("name has leading or trailing whitespace");
    }
    if name == "." || name == ".." {
        return invalid("name is a reserved path component");
    }
    if name.starts_with('.') {
        return invalid("name must not start with '.'");
    }
    if name.contains(RESERVED_CHARS) {
        return invalid("name contains one of < > : \" / \\ | ? *");
    }
    if name.chars().any(char::is_control) {
        return invalid("name contains control characters");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EnrollOptions {
    pub min_confidence: f32,
    /// Frames tried per pose before the pose is given up.
    pub max_attempts: usize,
    /// Time shown between a pose prompt and the first capture attempt.
    pub settle: Duration,
    /// Replace an existing person of the same name.
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct EnrollReport {
    pub name: String,
    pub dir: PathBuf,
    pub captured: Vec<Pose>,
    pub failed: Vec<Pose>,
}

/// Walk `name` through every pose and store the accepted captures under
/// `known_faces_dir/name`.
pub fn enroll<A, S, V>(
    name: &str,
    known_faces_dir: &Path,
    opts: &EnrollOptions,
    analyzer: &mut A,
    frames: &mut S,
    viewer: &mut V,
) -> Result<EnrollReport, EnrollError>
where
    A: FaceAnalyzer + ?Sized,
    S: FrameSource + ?Sized,
    V: Viewer + ?Sized,
{
    validate_name(name)?;

    let target = known_faces_dir.join(name);
    if target.exists() && !opts.overwrite {
        return Err(EnrollError::AlreadyEnrolled(name.to_string()));
    }

    let staging = known_faces_dir.join(format!(".{name}.enrolling"));
    if staging.exists() {
        remove_dir(&staging)?;
    }
    std::fs::create_dir_all(&staging).map_err(|source| EnrollError::Io {
        path: staging.clone(),
        source,
    })?;

    let outcome = capture_poses(&staging, opts, analyzer, frames, viewer)
        .and_then(|(captured, failed)| {
            if captured.is_empty() {
                return Err(EnrollError::NothingCaptured(name.to_string()));
            }
            if target.exists() {
                tracing::info!(name, "replacing existing enrollment");
                remove_dir(&target)?;
            }
            std::fs::rename(&staging, &target).map_err(|source| EnrollError::Io {
                path: target.clone(),
                source,
            })?;
            Ok((captured, failed))
        });

    match outcome {
        Ok((captured, failed)) => {
            tracing::info!(
                name,
                captured = captured.len(),
                failed = failed.len(),
                "enrollment complete"
            );
            Ok(EnrollReport {
                name: name.to_string(),
                dir: target,
                captured,
                failed,
            })
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %staging.display(), error = %cleanup, "cannot remove staging directory");
                }
            }
            Err(e)
        }
    }
}

fn capture_poses<A, S, V>(
    staging: &Path,
    opts: &EnrollOptions,
    analyzer: &mut A,
    frames: &mut S,
    viewer: &mut V,
) -> Result<(Vec<Pose>, Vec<Pose>), EnrollError>
where
    A: FaceAnalyzer + ?Sized,
    S: FrameSource + ?Sized,
    V: Viewer + ?Sized,
{
    let mut cache = EncodingCache::default();
    let mut captured = Vec::new();
    let mut failed = Vec::new();

    for pose in Pose::ALL {
        println!("{}", pose.prompt());

        let settle_until = Instant::now() + opts.settle;
        while Instant::now() < settle_until {
            let frame = frames.next_good_frame()?;
            present(viewer, &frame.image, &[], pose.prompt())?;
        }

        match capture_pose(pose, opts, analyzer, frames, viewer)? {
            Some((image, face)) => match save_capture(staging, pose, &image, &face, analyzer)? {
                Some(entry) => {
                    cache.insert(entry);
                    tracing::info!(pose = pose.file_stem(), confidence = face.confidence, "pose captured");
                    captured.push(pose);
                }
                None => failed.push(pose),
            },
            None => {
                tracing::warn!(
                    pose = pose.file_stem(),
                    attempts = opts.max_attempts,
                    "no usable capture for pose; skipping"
                );
                println!("Could not capture pose '{}', moving on", pose.file_stem());
                failed.push(pose);
            }
        }
    }

    if !captured.is_empty() {
        cache.save(staging).map_err(|source| EnrollError::Io {
            path: staging.join(cache::CACHE_FILE),
            source,
        })?;
    }
    Ok((captured, failed))
}

/// Try up to `max_attempts` frames for one pose. Returns the accepted frame
/// and its face, or `None` when the budget runs out.
fn capture_pose<A, S, V>(
    pose: Pose,
    opts: &EnrollOptions,
    analyzer: &mut A,
    frames: &mut S,
    viewer: &mut V,
) -> Result<Option<(RgbImage, BoundingBox)>, EnrollError>
where
    A: FaceAnalyzer + ?Sized,
    S: FrameSource + ?Sized,
    V: Viewer + ?Sized,
{
    for attempt in 1..=opts.max_attempts {
        let frame = frames.next_good_frame()?;
        if frame.is_dark {
            present(viewer, &frame.image, &[], "too dark")?;
            continue;
        }

        let faces = analyzer.locate(&frame.image)?;
        let status = match faces.as_slice() {
            [] => "no face".to_string(),
            [face] if face.confidence < opts.min_confidence => {
                format!("face unclear ({:.2})", face.confidence)
            }
            [face] => {
                let annotation = Annotation {
                    bbox: face.clone(),
                    label: pose.file_stem().to_string(),
                    known: true,
                };
                present(viewer, &frame.image, &[annotation], "captured")?;
                return Ok(Some((frame.image, face.clone())));
            }
            many => format!("{} faces", many.len()),
        };

        tracing::debug!(pose = pose.file_stem(), attempt, %status, "capture rejected");
        let annotations: Vec<Annotation> = faces
            .into_iter()
            .map(|bbox| Annotation {
                bbox,
                label: status.clone(),
                known: false,
            })
            .collect();
        present(viewer, &frame.image, &annotations, &status)?;
    }
    Ok(None)
}

/// Encode the accepted frame, write `<pose>.jpg` and return its cache entry.
/// `None` if the face could not be encoded.
fn save_capture<A: FaceAnalyzer + ?Sized>(
    staging: &Path,
    pose: Pose,
    image: &RgbImage,
    face: &BoundingBox,
    analyzer: &mut A,
) -> Result<Option<CacheEntry>, EnrollError> {
    let encoding = match analyzer.encode(image, face) {
        Ok(encoding) => encoding,
        Err(e) => {
            tracing::warn!(pose = pose.file_stem(), error = %e, "cannot encode capture; skipping pose");
            return Ok(None);
        }
    };

    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    let path = staging.join(pose.file_name());
    std::fs::write(&path, &bytes).map_err(|source| EnrollError::Io {
        path: path.clone(),
        source,
    })?;

    Ok(Some(CacheEntry {
        image: pose.file_name(),
        sha256: cache::digest(&bytes),
        model_version: analyzer.model_version().to_string(),
        encoding: encoding.values,
    }))
}

fn present<V: Viewer + ?Sized>(
    viewer: &mut V,
    image: &RgbImage,
    annotations: &[Annotation],
    banner: &str,
) -> Result<(), EnrollError> {
    viewer.show(image, annotations, Some(banner))?;
    if viewer.stop_requested() {
        return Err(EnrollError::Cancelled);
    }
    Ok(())
}

fn remove_dir(path: &Path) -> Result<(), EnrollError> {
    std::fs::remove_dir_all(path).map_err(|source| EnrollError::Io {
        path: path.to_path_buf(),
        source,
    })
}
