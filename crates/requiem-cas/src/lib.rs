//! Content-addressed object store (CAS).
//!
//! Objects live in a three-level sharded tree, `<root>/objects/<d[0:2]>/<d[2:4]>/<d>`,
//! keyed by `BLAKE3(bytes)` with no domain prefix, so dedup is purely
//! content-level (`echo-cas`'s hashing policy). Writes are atomic
//! (tempfile + rename); reads that detect a hash mismatch return `None`
//! rather than the wrong bytes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use requiem_hash::{hash_bytes, Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage encoding applied to the on-disk object. Never affects the digest:
/// the key is always the hash of the uncompressed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Stored uncompressed.
    Off,
    /// Stored zstd-compressed.
    Zstd,
}

/// Sidecar metadata stored alongside each object as `<digest>.info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Size of the original (uncompressed) content in bytes.
    pub original_size: u64,
    /// Encoding applied to the stored bytes.
    pub encoding: Encoding,
}

/// CAS-level failures that are not expressed as `Option::None`.
#[derive(Debug, Error)]
pub enum CasError {
    /// Underlying filesystem I/O failure.
    #[error("cas i/o error: {0}")]
    Io(#[from] io::Error),
    /// Sidecar info file was unreadable or malformed.
    #[error("cas info corrupt: {0}")]
    InfoCorrupt(String),
}

/// A content-addressed store rooted at a directory.
///
/// Each tenant should use a distinct root: there is no shared index, so a
/// digest valid in one root is simply absent from another.
pub struct CasStore {
    objects_root: PathBuf,
}

impl CasStore {
    /// Open (creating if needed) a CAS rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let objects_root = root.as_ref().join("objects");
        fs::create_dir_all(&objects_root)?;
        Ok(Self { objects_root })
    }

    fn shard_dir(&self, hex: &str) -> PathBuf {
        self.objects_root.join(&hex[0..2]).join(&hex[2..4])
    }

    fn object_path(&self, hex: &str) -> PathBuf {
        self.shard_dir(hex).join(hex)
    }

    fn info_path(&self, hex: &str) -> PathBuf {
        self.shard_dir(hex).join(format!("{hex}.info"))
    }

    /// Write `bytes`, storing them with the given `encoding`. Returns the
    /// lowercase hex digest.
    ///
    /// Computes `d = hash(bytes)`. If an object already exists at `d`, its
    /// content is re-verified against `d`; on mismatch it is treated as
    /// corrupt and atomically replaced. The actual write is always a
    /// temp-file-then-rename within the target shard directory.
    pub fn put(&self, bytes: &[u8], encoding: Encoding) -> Result<String, CasError> {
        let digest = hash_bytes(bytes);
        let hex = digest.to_hex();
        let dir = self.shard_dir(&hex);
        fs::create_dir_all(&dir)?;

        let path = self.object_path(&hex);
        if path.exists() {
            if let Some(existing) = self.read_verified(&hex) {
                if existing == bytes {
                    tracing::debug!(digest = %hex, "cas put: dedup, object unchanged");
                    return Ok(hex);
                }
            }
            tracing::warn!(digest = %hex, "cas put: replacing corrupt or mismatched object");
        }

        let stored = match encoding {
            Encoding::Off => bytes.to_vec(),
            Encoding::Zstd => zstd::encode_all(bytes, 0).map_err(CasError::Io)?,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&stored)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        let info = ObjectInfo {
            original_size: bytes.len() as u64,
            encoding,
        };
        let info_bytes = serde_json::to_vec(&info)
            .map_err(|e| CasError::InfoCorrupt(e.to_string()))?;
        let mut tmp_info = tempfile::NamedTempFile::new_in(&dir)?;
        tmp_info.write_all(&info_bytes)?;
        tmp_info.flush()?;
        tmp_info
            .persist(self.info_path(&hex))
            .map_err(|e| e.error)?;

        Ok(hex)
    }

    /// Read and verify the object at `digest_hex`, decompressing if needed.
    ///
    /// Returns `None` for an invalid digest form, a missing object, or a
    /// content/digest mismatch (corruption) — never the wrong bytes.
    pub fn get(&self, digest_hex: &str) -> Option<Vec<u8>> {
        let digest = Digest::from_hex(digest_hex)?;
        let hex = digest.to_hex();
        self.read_verified(&hex)
    }

    fn read_verified(&self, hex: &str) -> Option<Vec<u8>> {
        let path = self.object_path(hex);
        let mut raw = Vec::new();
        fs::File::open(&path).ok()?.read_to_end(&mut raw).ok()?;

        let info = self.read_info(hex);
        let decoded = match info.as_ref().map(|i| i.encoding) {
            Some(Encoding::Zstd) => zstd::decode_all(raw.as_slice()).ok()?,
            _ => raw,
        };

        if hash_bytes(&decoded).to_hex() != hex {
            tracing::warn!(digest = %hex, "cas get: content/digest mismatch, reporting as absent");
            return None;
        }
        Some(decoded)
    }

    fn read_info(&self, hex: &str) -> Option<ObjectInfo> {
        let bytes = fs::read(self.info_path(hex)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Existence check only — does not verify content.
    pub fn contains(&self, digest_hex: &str) -> bool {
        match Digest::from_hex(digest_hex) {
            Some(d) => self.object_path(&d.to_hex()).exists(),
            None => false,
        }
    }

    /// Sidecar metadata for a stored object.
    pub fn info(&self, digest_hex: &str) -> Option<ObjectInfo> {
        let d = Digest::from_hex(digest_hex)?;
        self.read_info(&d.to_hex())
    }

    /// Enumerate every digest present in this CAS root.
    pub fn scan_objects(&self) -> io::Result<Vec<String>> {
        let mut out = BTreeSet::new();
        if !self.objects_root.exists() {
            return Ok(Vec::new());
        }
        for level1 in fs::read_dir(&self.objects_root)? {
            let level1 = level1?;
            if !level1.file_type()?.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !level2.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(level2.path())? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.ends_with(".info") {
                        continue;
                    }
                    if Digest::from_hex(&name).is_some() {
                        out.insert(name.into_owned());
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}
