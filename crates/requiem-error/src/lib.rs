//! Unified error taxonomy with stable error codes for the Requiem kernel.
//!
//! Every kernel-level failure carries an [`ErrorCode`] (the exhaustive,
//! machine-readable string tag fixed by the execution-kernel contract), a
//! human-readable message, an optional cause chain, and arbitrary key-value
//! context. Use the builder returned by [`RequiemError::new`] to construct
//! errors fluently. [`ErrorCode::as_wire_str`] is the value that ends up in
//! `ExecutionResult.error_code` and protocol `error` frames — it is never a
//! stack trace, a host path, or an env value.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed/oversized input rejected before any work is done.
    Input,
    /// Policy denial: path escape, secret-env rejection in strict mode.
    Policy,
    /// Child-process execution faults: spawn failure, timeout, signal.
    Execution,
    /// CAS corruption detected on read.
    Integrity,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Policy => "policy",
            Self::Execution => "execution",
            Self::Integrity => "integrity",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Variants mirror the exhaustive `error_code` values fixed by the kernel
/// contract. [`ErrorCode::as_wire_str`] gives the exact on-wire string
/// (empty string for success, never capitalized or prefixed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No error; the request executed successfully.
    None,
    /// The executor's wall-clock timeout elapsed before the child exited.
    Timeout,
    /// A resolved path left the workspace root.
    PathEscape,
    /// The child process could not be spawned.
    SpawnFailed,
    /// Ingress payload or resource usage exceeded a configured cap.
    QuotaExceeded,
    /// A CAS read detected a content/digest mismatch.
    CasIntegrityFailed,
    /// The child process was terminated by a signal.
    Signal,
    /// Input bytes were not valid canonical JSON.
    JsonParseError,
    /// Canonical JSON input contained a duplicate object key.
    JsonDuplicateKey,
    /// A canonical field required to be an integer carried another JSON type.
    JsonTypeError,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::None => ErrorCategory::Internal,
            Self::JsonParseError | Self::JsonDuplicateKey | Self::JsonTypeError | Self::QuotaExceeded => {
                ErrorCategory::Input
            }
            Self::PathEscape => ErrorCategory::Policy,
            Self::Timeout | Self::SpawnFailed | Self::Signal => ErrorCategory::Execution,
            Self::CasIntegrityFailed => ErrorCategory::Integrity,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Exact on-wire representation used in `ExecutionResult.error_code` and
    /// protocol `error` frames.
    ///
    /// This is the authoritative spelling fixed by the kernel contract: empty
    /// string for success, lower snake_case for every fault.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Timeout => "timeout",
            Self::PathEscape => "path_escape",
            Self::SpawnFailed => "spawn_failed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::CasIntegrityFailed => "cas_integrity_failed",
            Self::Signal => "signal",
            Self::JsonParseError => "json_parse_error",
            Self::JsonDuplicateKey => "json_duplicate_key",
            Self::JsonTypeError => "json_type_error",
            Self::Internal => "internal",
        }
    }

    /// Parse a wire-format error code string back into an [`ErrorCode`].
    ///
    /// Unknown strings map to [`ErrorCode::Internal`] rather than failing,
    /// since this is used to interpret externally-supplied replay data.
    pub fn from_wire_str(s: &str) -> Self {
        match s {
            "" => Self::None,
            "timeout" => Self::Timeout,
            "path_escape" => Self::PathEscape,
            "spawn_failed" => Self::SpawnFailed,
            "quota_exceeded" => Self::QuotaExceeded,
            "cas_integrity_failed" => Self::CasIntegrityFailed,
            "signal" => Self::Signal,
            "json_parse_error" => Self::JsonParseError,
            "json_duplicate_key" => Self::JsonDuplicateKey,
            "json_type_error" => Self::JsonTypeError,
            _ => Self::Internal,
        }
    }

    /// Whether an execution with this error code is billable, per the
    /// meter's billing rule table (charge iff `error_code == ""`).
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ---------------------------------------------------------------------------
// RequiemError
// ---------------------------------------------------------------------------

/// Unified kernel error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use requiem_error::{RequiemError, ErrorCode};
///
/// let err = RequiemError::new(ErrorCode::Timeout, "timed out after 50 ms")
///     .with_context("timeout_ms", 50);
/// ```
pub struct RequiemError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description. Must never embed secret values.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl RequiemError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for RequiemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RequiemError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for RequiemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_wire_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RequiemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serializable snapshot of a [`RequiemError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequiemErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&RequiemError> for RequiemErrorDto {
    fn from(err: &RequiemError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<RequiemErrorDto> for RequiemError {
    fn from(dto: RequiemErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
