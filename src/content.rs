//! # Content-Addressed Blob Storage
//!
//! The [`ContentStore`] trait is the narrow seam between resolution and
//! whatever holds blob bytes locally; [`BlobStore`] is the on-disk
//! implementation shipped with this crate.
//!
//! ## Storage Model
//!
//! Blobs are stored in a two-level directory structure:
//!
//! ```text
//! <base>/
//! └── sha256/
//!     ├── ab/
//!     │   ├── abcd1234...  (blob content)
//!     │   └── ab9f8e7d...  (blob content)
//!     └── cd/
//!         └── cdef5678...  (blob content)
//! ```
//!
//! The first two hex characters form a "shard" directory to prevent
//! filesystem performance degradation with many files.
//!
//! ## Digest Verification
//!
//! [`BlobStore::put_blob`] computes the content hash and verifies it
//! against the provided digest before storing, so a misbehaving registry
//! or a network fault cannot pollute the store. Writes go through a
//! unique temp file plus an atomic rename, preventing partial blobs on
//! crash.
//!
//! ## Garbage Collection
//!
//! [`BlobStore::gc`] removes blobs not named in the referenced set the
//! caller supplies. The lease manager's protected set
//! ([`crate::lease::MemoryLeaseManager::protected`]) is the usual input,
//! so in-flight resolutions keep their blobs alive.

use crate::error::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A (digest, size, media-type) reference to a content blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Media type.
    pub media_type: String,
}

/// Metadata about a locally stored blob.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Content digest.
    pub digest: String,
    /// Size on disk in bytes.
    pub size: u64,
}

/// Local content-addressable storage consumed by resolution.
///
/// `info` must return [`Error::BlobNotFound`] for absent blobs so callers
/// can distinguish eviction from hard storage failures.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns metadata for a stored blob, or [`Error::BlobNotFound`].
    async fn info(&self, digest: &str) -> Result<BlobInfo>;

    /// Reads a blob's bytes by descriptor.
    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Stores a blob after verifying its content matches the digest.
    async fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()>;
}

/// On-disk content-addressed blob store.
///
/// Thread-safe: each blob operation is independent, and atomic writes
/// prevent corruption from concurrent access to the same blob.
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store at the default path.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("blob store initialized at {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Returns the default storage path.
    fn default_path() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(".ocisource").join("blobs")
        } else {
            PathBuf::from(".ocisource").join("blobs")
        }
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Gets a blob path without reading it.
    ///
    /// Validates the digest format so untrusted digests cannot traverse
    /// outside the store: the algorithm must be sha256/sha384/sha512 and
    /// the hash must be hexadecimal.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // Digest format: sha256:abcd1234...
        // Stored as: <base>/sha256/ab/abcd1234...
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!("invalid digest algorithm '{}', defaulting to sha256", algo);
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(
                "digest hash contained non-hex characters, sanitized: {} -> {}",
                hash, safe_hash
            );
        }

        if safe_hash.is_empty() {
            // A path that won't exist rather than a panic.
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    fn write_verified(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        // Only sha256 digests are accepted so every stored blob is verified.
        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));

        if computed_hash != expected_hash {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected_hash, computed_hash
            )));
        }

        let path = self.blob_path(digest);

        if path.exists() {
            debug!("blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Unique temp file name so concurrent writers of the same blob use
        // different temp files; the final rename is atomic and content is
        // identical either way.
        let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
        let temp_path = path.with_extension(temp_name);
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }

    /// Removes a blob.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Lists all blob digests.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();

        let sha256_dir = self.base_dir.join("sha256");
        if sha256_dir.exists() {
            Self::walk_dir(&sha256_dir, &mut |path| {
                if path.is_file() {
                    if let Some(hash) = path.file_name().and_then(|n| n.to_str()) {
                        digests.push(format!("sha256:{}", hash));
                    }
                }
            })?;
        }

        Ok(digests)
    }

    /// Walks a directory recursively.
    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))? {
            let entry = entry.map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }

        Ok(())
    }

    /// Garbage collects blobs not named in `referenced`.
    ///
    /// Callers must include every digest still in use, typically the
    /// lease manager's protected set.
    pub fn gc(&self, referenced: &[String]) -> Result<GcStats> {
        let all_blobs = self.list_blobs()?;
        let mut removed = 0u64;
        let mut freed = 0u64;

        for digest in all_blobs {
            if !referenced.contains(&digest) {
                let path = self.blob_path(&digest);
                if let Ok(meta) = fs::metadata(&path) {
                    freed += meta.len();
                    removed += 1;
                    let _ = fs::remove_file(&path);
                }
            }
        }

        info!("gc: removed {} blobs, freed {} bytes", removed, freed);
        Ok(GcStats {
            removed_count: removed,
            freed_bytes: freed,
        })
    }
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Number of blobs removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

#[async_trait]
impl ContentStore for BlobStore {
    async fn info(&self, digest: &str) -> Result<BlobInfo> {
        let path = self.blob_path(digest);
        match fs::metadata(&path) {
            Ok(meta) => Ok(BlobInfo {
                digest: digest.to_string(),
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let path = self.blob_path(&desc.digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: desc.digest.clone(),
        })
    }

    async fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        self.write_verified(digest, data)
    }
}
