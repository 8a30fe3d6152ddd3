//! Content-addressed blob storage.
//!
//! Primary blobs live in a flat directory named after their SHA-256 hex hash
//! (original extension preserved when known, so OS previews keep working).
//! Derived artifacts (thumbnails, covers, posters) live in a sibling
//! directory under a name that is a deterministic function of
//! `(parent_hash, kind)`, which makes regeneration idempotent.
//!
//! Every write lands in a temp file first and becomes visible via rename,
//! so readers never observe a partially written blob.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob {0} is missing from the content store")]
    MissingBlob(String),
}

/// Kinds of derived artifacts a primary blob can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivedKind {
    ImageThumb,
    PdfCover,
    VideoPoster,
}

impl DerivedKind {
    pub const ALL: [DerivedKind; 3] = [
        DerivedKind::ImageThumb,
        DerivedKind::PdfCover,
        DerivedKind::VideoPoster,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            DerivedKind::ImageThumb => "image-thumb",
            DerivedKind::PdfCover => "pdf-cover",
            DerivedKind::VideoPoster => "video-poster",
        }
    }

    fn ext(&self) -> &'static str {
        match self {
            DerivedKind::ImageThumb | DerivedKind::PdfCover => "webp",
            DerivedKind::VideoPoster => "jpg",
        }
    }

    /// File name of the artifact for a given parent blob.
    pub fn file_name(&self, parent_hash: &str) -> String {
        format!("{parent_hash}-{}.{}", self.suffix(), self.ext())
    }
}

pub struct BlobStore {
    blobs_dir: PathBuf,
    derived_dir: PathBuf,
}

impl BlobStore {
    pub fn open(blobs_dir: PathBuf, derived_dir: PathBuf) -> Result<Self, BlobError> {
        std::fs::create_dir_all(&blobs_dir)?;
        std::fs::create_dir_all(&derived_dir)?;
        Ok(BlobStore {
            blobs_dir,
            derived_dir,
        })
    }

    pub fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Write a blob keyed by the SHA-256 of its contents. A blob that already
    /// exists is not rewritten; both calls return the same hash.
    pub fn put(&self, bytes: &[u8], ext: Option<&str>) -> Result<String, BlobError> {
        let hash = Self::hash_bytes(bytes);

        if self.find_primary(&hash).is_some() {
            return Ok(hash);
        }

        let file_name = match sanitize_ext(ext) {
            Some(ext) => format!("{hash}.{ext}"),
            None => hash.clone(),
        };

        let temp = self.blobs_dir.join(format!("{hash}.tmp-{}", temp_suffix()));
        let result = std::fs::write(&temp, bytes)
            .and_then(|_| std::fs::rename(&temp, self.blobs_dir.join(&file_name)));

        if let Err(err) = result {
            let _ = std::fs::remove_file(&temp);
            return Err(err.into());
        }

        Ok(hash)
    }

    /// Local path of a primary blob. Does not open the file; a missing blob
    /// is a storage corruption event for the caller.
    pub fn path_of(&self, hash: &str) -> Result<PathBuf, BlobError> {
        self.find_primary(hash)
            .ok_or_else(|| BlobError::MissingBlob(hash.to_string()))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.find_primary(hash).is_some()
    }

    /// Write a derived artifact. Repeated generation overwrites in place with
    /// the same name, so the operation is idempotent.
    pub fn put_derived(
        &self,
        parent_hash: &str,
        kind: DerivedKind,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let file_name = kind.file_name(parent_hash);

        let temp = self
            .derived_dir
            .join(format!("{file_name}.tmp-{}", temp_suffix()));
        let result = std::fs::write(&temp, bytes)
            .and_then(|_| std::fs::rename(&temp, self.derived_dir.join(&file_name)));

        if let Err(err) = result {
            let _ = std::fs::remove_file(&temp);
            return Err(err.into());
        }

        Ok(file_name)
    }

    pub fn derived_path(&self, parent_hash: &str, kind: DerivedKind) -> PathBuf {
        self.derived_dir.join(kind.file_name(parent_hash))
    }

    pub fn has_derived(&self, parent_hash: &str, kind: DerivedKind) -> bool {
        self.derived_path(parent_hash, kind).exists()
    }

    /// Remove a blob and all of its derived artifacts. The caller is
    /// responsible for ensuring no item references remain.
    pub fn remove(&self, hash: &str) -> Result<(), BlobError> {
        if let Some(path) = self.find_primary(hash) {
            std::fs::remove_file(path)?;
        }

        for kind in DerivedKind::ALL {
            let path = self.derived_path(hash, kind);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }

        Ok(())
    }

    /// Reclaim primary blobs no item references and derived artifacts whose
    /// parent blob is gone. Returns the number of files removed.
    pub fn sweep(&self, referenced: &HashSet<String>) -> Result<usize, BlobError> {
        let mut removed = 0;
        let mut live_hashes = HashSet::new();

        for entry in std::fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let hash = name.split('.').next().unwrap_or(&name).to_string();

            // leftover temp files from interrupted writes are always orphans
            let is_temp = name.contains(".tmp-");

            if is_temp || !referenced.contains(&hash) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            } else {
                live_hashes.insert(hash);
            }
        }

        for entry in std::fs::read_dir(&self.derived_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let parent = name.split('-').next().unwrap_or("").to_string();

            if name.contains(".tmp-") || !live_hashes.contains(&parent) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn find_primary(&self, hash: &str) -> Option<PathBuf> {
        let bare = self.blobs_dir.join(hash);
        if bare.is_file() {
            return Some(bare);
        }

        let entries = std::fs::read_dir(&self.blobs_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(hash) {
                // exact hash plus an extension; temp files excluded
                if rest.starts_with('.') && !rest.contains("tmp-") && entry.path().is_file() {
                    return Some(entry.path());
                }
            }
        }
        None
    }
}

/// Unique-per-write temp suffix so concurrent writers never share a path.
fn temp_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn sanitize_ext(ext: Option<&str>) -> Option<String> {
    let ext = ext?.trim_start_matches('.').to_lowercase();
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

/// Extension of a path, lowercased.
pub fn ext_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}
