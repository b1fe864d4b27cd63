//! Known-face registry: every enrolled person's reference encodings,
//! loaded once at startup.

use crate::cache::{self, CacheEntry, EncodingCache};
use image::RgbImage;
use rollcall_vision::{Encoding, FaceAnalyzer, KnownFace};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A person's directory of reference images, as found on disk.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub name: String,
    pub dir: PathBuf,
    pub images: Vec<PathBuf>,
}

pub fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

/// List enrolled people and their reference images without touching the
/// face engine. A missing directory means nobody is enrolled.
pub fn scan(known_faces_dir: &Path) -> Result<Vec<Enrollment>, RegistryError> {
    if !known_faces_dir.exists() {
        return Ok(Vec::new());
    }

    let mut enrollments = Vec::new();
    for dir in read_dir_sorted(known_faces_dir)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            tracing::warn!(path = %dir.display(), "skipping directory with non UTF-8 name");
            continue;
        };
        // Hidden directories include in-progress enrollments.
        if name.starts_with('.') {
            continue;
        }
        let images = match read_dir_sorted(&dir) {
            Ok(paths) => paths
                .into_iter()
                .filter(|p| p.is_file() && is_reference_image(p))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "cannot read person directory; skipping"
                );
                continue;
            }
        };
        enrollments.push(Enrollment { name, dir, images });
    }
    Ok(enrollments)
}

/// Process-wide read-only mapping from person to reference encodings.
#[derive(Debug, Default)]
pub struct Registry {
    faces: Vec<KnownFace>,
}

impl Registry {
    /// Build the registry from `known_faces_dir`, one encoding per usable
    /// reference image. Unusable images and people are skipped with a warning.
    pub fn load<A: FaceAnalyzer + ?Sized>(
        known_faces_dir: &Path,
        analyzer: &mut A,
    ) -> Result<Self, RegistryError> {
        let enrollments = scan(known_faces_dir)?;
        if enrollments.is_empty() {
            tracing::warn!(
                dir = %known_faces_dir.display(),
                "no enrolled people found; enroll someone first"
            );
        }

        let mut faces = Vec::new();
        for enrollment in &enrollments {
            let loaded = load_person(enrollment, analyzer);
            if loaded.is_empty() {
                tracing::warn!(name = %enrollment.name, "no usable reference images; person skipped");
            } else {
                tracing::info!(name = %enrollment.name, encodings = loaded.len(), "loaded person");
            }
            faces.extend(loaded);
        }

        Ok(Self { faces })
    }

    #[cfg(test)]
    pub fn from_faces(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    /// Flat gallery of every known encoding.
    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    /// Number of encodings per person, by name.
    pub fn people(&self) -> BTreeMap<&str, usize> {
        let mut people = BTreeMap::new();
        for face in &self.faces {
            *people.entry(face.name.as_str()).or_insert(0) += 1;
        }
        people
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Reasons a reference image contributes no encoding.
#[derive(Error, Debug)]
enum Rejected {
    #[error("cannot decode image: {0}")]
    Unreadable(String),
    #[error("no face detected")]
    NoFace,
    #[error("{0} faces detected, expected exactly one")]
    MultipleFaces(usize),
    #[error("face engine: {0}")]
    Engine(String),
}

fn load_person<A: FaceAnalyzer + ?Sized>(
    enrollment: &Enrollment,
    analyzer: &mut A,
) -> Vec<KnownFace> {
    let mut cache = EncodingCache::load(&enrollment.dir);
    let mut dirty = false;
    let mut present = HashSet::new();
    let mut faces = Vec::new();

    for path in &enrollment.images {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        present.insert(file_name.clone());

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read reference image; skipping");
                continue;
            }
        };
        let sha256 = cache::digest(&bytes);

        let values = match cache.lookup(&file_name, &sha256, analyzer.model_version()) {
            Some(values) => {
                tracing::debug!(path = %path.display(), "encoding cache hit");
                values.to_vec()
            }
            None => match encode_reference(&bytes, analyzer) {
                Ok(encoding) => {
                    cache.insert(CacheEntry {
                        image: file_name.clone(),
                        sha256,
                        model_version: analyzer.model_version().to_string(),
                        encoding: encoding.values.clone(),
                    });
                    dirty = true;
                    encoding.values
                }
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "unusable reference image; skipping");
                    continue;
                }
            },
        };

        faces.push(KnownFace {
            name: enrollment.name.clone(),
            source: file_name,
            encoding: Encoding {
                values,
                model_version: Some(analyzer.model_version().to_string()),
            },
        });
    }

    if cache.retain_images(&present) {
        dirty = true;
    }
    if dirty {
        if let Err(e) = cache.save(&enrollment.dir) {
            tracing::warn!(dir = %enrollment.dir.display(), error = %e, "cannot write encoding cache");
        }
    }

    faces
}

fn encode_reference<A: FaceAnalyzer + ?Sized>(
    bytes: &[u8],
    analyzer: &mut A,
) -> Result<Encoding, Rejected> {
    let image: RgbImage = image::load_from_memory(bytes)
        .map_err(|e| Rejected::Unreadable(e.to_string()))?
        .to_rgb8();

    let faces = analyzer
        .locate(&image)
        .map_err(|e| Rejected::Engine(e.to_string()))?;
    match faces.as_slice() {
        [] => Err(Rejected::NoFace),
        [face] => analyzer
            .encode(&image, face)
            .map_err(|e| Rejected::Engine(e.to_string())),
        many => Err(Rejected::MultipleFaces(many.len())),
    }
}
