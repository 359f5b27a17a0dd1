// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical encoding and digesting of execution requests and results.
//!
//! Mirrors the canonicalize/compute-hash/verify shape used elsewhere in this
//! lineage for receipt integrity, generalized from a single `Receipt` type to
//! the kernel's `ExecutionRequest`/`ExecutionResult` pair, and from SHA-256 to
//! domain-separated BLAKE3 (`requiem-hash`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use requiem_hash::{hash_domain, Digest, DomainTag};
use requiem_json::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Execution mode controlling how strictly the environment allowlist is
/// enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Only explicitly allowlisted env keys pass.
    Strict,
    /// The secret deny-list is applied, but non-secret keys pass through.
    Permissive,
}

impl PolicyMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Permissive => "permissive",
        }
    }
}

/// Policy fields carried on a request, canonicalized as a sorted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Environment-filtering strictness.
    pub mode: PolicyMode,
    /// Opaque scheduler hint, not interpreted by the kernel.
    pub scheduler_mode: String,
    /// Whether the executor should derive a minimal deterministic env.
    pub deterministic: bool,
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// A request to execute a sandboxed child process.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Opaque caller-supplied tracing id. Sanitized, never digested.
    pub request_id: String,
    /// Opaque tenant id. Used for isolation only, never digested.
    pub tenant_id: String,
    /// Absolute filesystem root all relative paths resolve against.
    pub workspace_root: PathBuf,
    /// Absolute path to the child executable.
    pub command: PathBuf,
    /// Ordered argument list (not including argv[0]).
    pub argv: Vec<String>,
    /// Unordered env mapping; canonicalized sorted by key.
    pub env: BTreeMap<String, String>,
    /// Optional cwd, relative to `workspace_root`.
    pub cwd: Option<String>,
    /// Workspace-relative output paths the caller expects to be produced.
    pub outputs: BTreeSet<String>,
    /// Execution policy.
    pub policy: Policy,
    /// Per-stream output byte cap.
    pub max_output_bytes: u64,
    /// Wall-clock timeout in milliseconds.
    pub timeout_ms: u64,
    /// Caller-supplied nonce; always canonicalized as an integer.
    pub nonce: u64,
}

/// Strip a caller-supplied request id down to `[A-Za-z0-9_-]`.
pub fn sanitize_request_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn string_array(items: impl Iterator<Item = String>) -> Value {
    Value::Array(items.map(Value::String).collect())
}

fn policy_value(policy: &Policy) -> Value {
    Value::Object(vec![
        ("deterministic".into(), Value::Bool(policy.deterministic)),
        ("mode".into(), Value::String(policy.mode.as_str().into())),
        (
            "scheduler_mode".into(),
            Value::String(policy.scheduler_mode.clone()),
        ),
    ])
}

/// Build the canonical JSON value for a request.
///
/// Excludes `tenant_id` and `request_id` per the digest contract: tenant
/// isolation and caller tracing metadata never affect `request_digest`.
pub fn canonicalize_request(req: &ExecutionRequest) -> Value {
    let env_obj = Value::Object(
        req.env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    Value::Object(vec![
        (
            "command".into(),
            Value::String(req.command.to_string_lossy().into_owned()),
        ),
        ("argv".into(), string_array(req.argv.iter().cloned())),
        ("env".into(), env_obj),
        (
            "cwd".into(),
            match &req.cwd {
                Some(c) => Value::String(c.clone()),
                None => Value::Null,
            },
        ),
        (
            "outputs".into(),
            string_array(req.outputs.iter().cloned()),
        ),
        ("policy".into(), policy_value(&req.policy)),
        (
            "max_output_bytes".into(),
            Value::Integer(req.max_output_bytes as i128),
        ),
        ("timeout_ms".into(), Value::Integer(req.timeout_ms as i128)),
        ("nonce".into(), Value::Integer(req.nonce as i128)),
    ])
}

/// `request_digest = hash_domain("req:", canonical_request)`.
pub fn request_digest(req: &ExecutionRequest) -> Digest {
    let bytes = requiem_json::canonical_bytes(&canonicalize_request(req));
    hash_domain(DomainTag::Request, &bytes)
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Record of which environment keys survived policy filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyApplied {
    /// Env keys that passed the deny-list / allowlist filter.
    pub allowed_keys: Vec<String>,
}

/// Outcome of a sandboxed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Whether the process exited 0 with no timeout/signal/spawn fault.
    pub ok: bool,
    /// Raw process exit code (124 on timeout).
    pub exit_code: i32,
    /// One of `""`, `"timeout"`, `"signal"`, `"spawn_failed"`.
    pub termination_reason: String,
    /// Captured stdout, possibly truncated.
    pub stdout_text: String,
    /// Captured stderr, possibly truncated.
    pub stderr_text: String,
    /// Whether stdout hit `max_output_bytes`.
    pub stdout_truncated: bool,
    /// Whether stderr hit `max_output_bytes`.
    pub stderr_truncated: bool,
    /// Digest of the originating canonical request.
    pub request_digest: Digest,
    /// Digest of captured stdout bytes (pre-truncation-marker content).
    pub stdout_digest: Digest,
    /// Digest of captured stderr bytes.
    pub stderr_digest: Digest,
    /// Digest of the canonical trace record.
    pub trace_digest: Digest,
    /// Per-output-path content digests, workspace-relative path -> digest.
    pub output_digests: BTreeMap<String, Digest>,
    /// Which env keys the policy allowed through.
    pub policy_applied: PolicyApplied,
    /// Exhaustive kernel error code; `""` on success.
    pub error_code: String,
}

fn digest_map_value(map: &BTreeMap<String, Digest>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, d)| (k.clone(), Value::String(d.to_hex())))
            .collect(),
    )
}

/// Build the canonical JSON value for a result.
pub fn canonicalize_result(res: &ExecutionResult) -> Value {
    Value::Object(vec![
        ("exit_code".into(), Value::Integer(res.exit_code as i128)),
        ("ok".into(), Value::Bool(res.ok)),
        (
            "output_digests".into(),
            digest_map_value(&res.output_digests),
        ),
        (
            "request_digest".into(),
            Value::String(res.request_digest.to_hex()),
        ),
        (
            "stderr_digest".into(),
            Value::String(res.stderr_digest.to_hex()),
        ),
        (
            "stdout_digest".into(),
            Value::String(res.stdout_digest.to_hex()),
        ),
        (
            "termination_reason".into(),
            Value::String(res.termination_reason.clone()),
        ),
        (
            "trace_digest".into(),
            Value::String(res.trace_digest.to_hex()),
        ),
    ])
}

/// `result_digest = hash_domain("res:", canonical_result)`.
pub fn result_digest(res: &ExecutionResult) -> Digest {
    let bytes = requiem_json::canonical_bytes(&canonicalize_result(res));
    hash_domain(DomainTag::Result, &bytes)
}

/// Canonical record hashed to produce `trace_digest`:
/// `{exit_code, termination_reason, output paths in request order}`.
///
/// Fixed per spec.md §9's resolution of the open question on
/// `trace_digest` composition.
pub fn trace_digest(exit_code: i32, termination_reason: &str, output_paths_in_order: &[String]) -> Digest {
    let value = Value::Object(vec![
        ("exit_code".into(), Value::Integer(exit_code as i128)),
        (
            "output_paths".into(),
            Value::Array(
                output_paths_in_order
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        ),
        (
            "termination_reason".into(),
            Value::String(termination_reason.into()),
        ),
    ]);
    hash_domain(DomainTag::Trace, &requiem_json::canonical_bytes(&value))
}

/// `deterministic_digest` — convenience alias used by replay/meter callers
/// that only care about "the" digest identifying a result, without needing
/// to know it's specifically the result digest.
pub fn deterministic_digest(res: &ExecutionResult) -> Digest {
    result_digest(res)
}

/// Errors surfaced while validating a canonical request/result pair.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonError {
    /// A digest embedded in the result did not match recomputation.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        /// Digest recorded in the result.
        expected: String,
        /// Digest recomputed from canonical bytes.
        computed: String,
    },
}

impl CanonError {
    /// Maps this error onto the kernel-wide error taxonomy. A digest
    /// mismatch at the canon layer always indicates storage or transport
    /// corruption, never a policy or input problem.
    pub fn error_code(&self) -> requiem_error::ErrorCode {
        match self {
            CanonError::DigestMismatch { .. } => requiem_error::ErrorCode::CasIntegrityFailed,
        }
    }
}

/// Verify that a result's embedded `result_digest` matches a fresh
/// recomputation from its own fields.
pub fn verify_result_digest(res: &ExecutionResult, claimed: Digest) -> Result<(), CanonError> {
    let computed = result_digest(res);
    if computed != claimed {
        return Err(CanonError::DigestMismatch {
            expected: claimed.to_hex(),
            computed: computed.to_hex(),
        });
    }
    Ok(())
}
