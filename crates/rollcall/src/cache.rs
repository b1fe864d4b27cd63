//! Per-person cache of reference-image encodings (`encodings.json`).
//!
//! An entry is valid only for the exact image bytes (SHA-256) and encoding
//! model it was computed with.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

pub const CACHE_FILE: &str = "encodings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Reference image file name, relative to the person's directory.
    pub image: String,
    pub sha256: String,
    pub model_version: String,
    pub encoding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodingCache {
    entries: Vec<CacheEntry>,
}

/// Hex SHA-256 of an image file's bytes.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl EncodingCache {
    /// Read the cache in `person_dir`. A missing file is an empty cache; an
    /// unreadable one is discarded with a warning and rebuilt.
    pub fn load(person_dir: &Path) -> Self {
        let path = person_dir.join(CACHE_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read encoding cache");
                return Self::default();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "discarding corrupt encoding cache");
            Self::default()
        })
    }

    /// Write the cache next to the images, replacing any previous one.
    pub fn save(&self, person_dir: &Path) -> std::io::Result<()> {
        let path = person_dir.join(CACHE_FILE);
        let tmp = person_dir.join(format!("{CACHE_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn lookup(&self, image: &str, sha256: &str, model_version: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|e| e.image == image && e.sha256 == sha256 && e.model_version == model_version)
            .map(|e| e.encoding.as_slice())
    }

    /// Add or replace the entry for `entry.image`.
    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.retain(|e| e.image != entry.image);
        self.entries.push(entry);
    }

    /// Drop entries for images that no longer exist. Returns true if any were removed.
    pub fn retain_images(&mut self, present: &HashSet<String>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| present.contains(&e.image));
        self.entries.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
