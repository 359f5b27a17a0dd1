//! Domain-separated BLAKE3 hashing.
//!
//! This is the sole hash primitive permitted anywhere a digest participates
//! in a canonical fingerprint: no fallback hash function exists in this
//! crate, and [`runtime_info`] advertises that fact so callers can assert it.
//!
//! Hash Domain Policy: every digest that feeds a request, result, CAS, or
//! trace fingerprint is produced by [`hash_domain`], which prefixes the
//! hashed bytes with a fixed tag. The same bytes hashed under two different
//! tags always produce different digests (domain separation) — see
//! [`DomainTag`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Number of bytes in a raw digest.
pub const DIGEST_LEN: usize = 32;

/// Streaming chunk size used by [`hash_file`].
const CHUNK_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// A 32-byte BLAKE3 digest.
///
/// The binary form is used for internal keying (CAS shard paths, in-memory
/// maps); the lowercase 64-char hex form via [`Digest::to_hex`] is the
/// stable interchange form used at every API and wire boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wrap a raw 32-byte array.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Render as lowercase 64-char hex.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_LEN * 2);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parse a lowercase (or mixed-case) 64-char hex digest.
    ///
    /// Returns `None` for any string that is not exactly 64 hex characters —
    /// callers at the API boundary must reject any other form, per the
    /// digest-format contract.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != DIGEST_LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; DIGEST_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(byte_str, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid digest hex"))
    }
}

// ---------------------------------------------------------------------------
// Domain separation
// ---------------------------------------------------------------------------

/// Fixed domain tags used to separate digests computed over otherwise
/// identical bytes but playing different roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainTag {
    /// Tags a canonical `ExecutionRequest` encoding.
    Request,
    /// Tags a canonical `ExecutionResult` encoding.
    Result,
    /// Tags CAS object content.
    Cas,
    /// Tags an execution trace record.
    Trace,
}

impl DomainTag {
    /// The literal prefix bytes prepended before hashing.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Request => "req:",
            Self::Result => "res:",
            Self::Cas => "cas:",
            Self::Trace => "trace:",
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Raw BLAKE3 over `data`, with no domain prefix.
///
/// Used only for content-only hashing (e.g. CAS keys), where dedup must be
/// purely content-level and tag-free.
pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest(*blake3::hash(data).as_bytes())
}

/// BLAKE3 of `tag.prefix() || data`.
///
/// Different tags on identical `data` always produce different digests.
pub fn hash_domain(tag: DomainTag, data: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag.prefix().as_bytes());
    hasher.update(data);
    Digest(*hasher.finalize().as_bytes())
}

/// Stream-hash a file's contents.
///
/// Returns the lowercase hex digest, or an empty string if the file cannot
/// be opened or read — callers treat an empty string as "no digest".
pub fn hash_file(path: &Path) -> String {
    let Ok(mut f) = std::fs::File::open(path) else {
        return String::new();
    };
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(_) => return String::new(),
        }
    }
    Digest(*hasher.finalize().as_bytes()).to_hex()
}

/// Describes the hash primitive in use, for callers that want to assert no
/// fallback is silently active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Hash primitive name. Always `"blake3"`.
    pub primitive: &'static str,
    /// Implementation backend. Always `"vendored"` — no system library is
    /// ever used.
    pub backend: &'static str,
    /// Version of the `blake3` crate this was built against.
    pub version: &'static str,
    /// Always `false`: a compliant implementation never falls back to a
    /// different hash primitive.
    pub fallback_allowed: bool,
}

/// Returns metadata describing the hash primitive in use.
pub fn runtime_info() -> RuntimeInfo {
    RuntimeInfo {
        primitive: "blake3",
        backend: "vendored",
        version: env!("CARGO_PKG_VERSION"),
        fallback_allowed: false,
    }
}
