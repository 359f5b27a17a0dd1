//! Replay verification: re-executing a stored request on the current host
//! and confirming the fresh result reproduces what was recorded.
//!
//! Drives an explicit state machine (`initial -> running -> {verified |
//! mismatch | error}`) rather than returning a bare bool, so callers can
//! distinguish "we checked and it matched" from "we checked and it didn't"
//! from "we couldn't check". Verification is read-only with respect to
//! billing: it never re-charges a meter, though it may opportunistically
//! write newly-derived bytes into a CAS (itself dedup-safe).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::path::Path;

use requiem_canon::{ExecutionRequest, ExecutionResult};
use requiem_cas::CasStore;
use requiem_error::{ErrorCode, RequiemError};
use requiem_exec::execute_sandboxed;
use requiem_hash::Digest;
use requiem_policy::{check_path_containment, derive_environment, PolicyMode as SandboxPolicyMode};
use serde::{Deserialize, Serialize};

/// State of a single replay verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    /// No verification has started.
    Initial,
    /// Verification is in progress.
    Running,
    /// All checked digests matched.
    Verified,
    /// At least one checked digest did not match.
    Mismatch,
    /// Verification could not complete (e.g. a required CAS object is absent).
    Error,
}

/// Outcome of a replay verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    /// Final state reached.
    pub state: ReplayState,
    /// Human-readable detail, empty when `state == Verified`.
    pub detail: String,
}

impl ReplayOutcome {
    fn verified() -> Self {
        Self {
            state: ReplayState::Verified,
            detail: String::new(),
        }
    }

    fn mismatch(detail: impl Into<String>) -> Self {
        Self {
            state: ReplayState::Mismatch,
            detail: detail.into(),
        }
    }

    fn error(detail: impl Into<String>) -> Self {
        Self {
            state: ReplayState::Error,
            detail: detail.into(),
        }
    }

    /// Convenience accessor used by callers that only care about pass/fail.
    pub fn is_verified(&self) -> bool {
        self.state == ReplayState::Verified
    }
}

fn to_sandbox_mode(mode: requiem_canon::PolicyMode) -> SandboxPolicyMode {
    match mode {
        requiem_canon::PolicyMode::Strict => SandboxPolicyMode::Strict,
        requiem_canon::PolicyMode::Permissive => SandboxPolicyMode::Permissive,
    }
}

/// Returns `false` if `rel` escapes a workspace root lexically — an absolute
/// path or any `..` component — without touching the filesystem. Mirrors
/// `requiem-kernel`'s own lexical check so a replayed output list is
/// rejected the same way it would have been on the original run.
fn output_path_is_lexically_contained(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && !path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

/// Re-run `req` on the current host and assemble a fresh [`ExecutionResult`]
/// from the outcome, following the same canonicalize -> sandbox-policy ->
/// spawn -> hash pipeline `requiem-kernel::Kernel::execute_inner` uses for a
/// primary run. `env_allowlist` plays the same role as the kernel's own
/// configured allowlist; it is not part of `ExecutionRequest` itself, so
/// replay callers must supply whatever allowlist the original run used.
///
/// No CAS or meter side effects: replay never bills and never persists
/// output bytes on its own (callers using [`validate_replay_with_cas`] pass
/// an explicit `cas` for that).
async fn reexecute(
    req: &ExecutionRequest,
    env_allowlist: &BTreeSet<String>,
) -> Result<ExecutionResult, RequiemError> {
    for out in &req.outputs {
        if !output_path_is_lexically_contained(out) {
            return Err(RequiemError::new(
                ErrorCode::PathEscape,
                format!("declared output '{out}' escapes the workspace root"),
            ));
        }
    }

    let rel_cwd = req.cwd.as_deref().unwrap_or(".");
    let resolved_cwd = check_path_containment(&req.workspace_root, Path::new(rel_cwd))?;
    let workspace_root = std::fs::canonicalize(&req.workspace_root).map_err(|e| {
        RequiemError::new(ErrorCode::PathEscape, format!("workspace root unusable: {e}"))
    })?;

    let sandbox_mode = to_sandbox_mode(req.policy.mode);
    let (env, sandbox_applied) = derive_environment(sandbox_mode, &req.env, env_allowlist);

    let raw = execute_sandboxed(
        &req.command,
        &req.argv,
        &resolved_cwd,
        &env,
        req.max_output_bytes,
        req.timeout_ms,
    )
    .await?;

    let stdout_digest = requiem_hash::hash_bytes(&raw.stdout.bytes);
    let stderr_digest = requiem_hash::hash_bytes(&raw.stderr.bytes);

    let mut output_digests = std::collections::BTreeMap::new();
    let mut output_paths_in_order = Vec::with_capacity(req.outputs.len());
    for out in &req.outputs {
        output_paths_in_order.push(out.clone());
        let Ok(abs) = check_path_containment(&workspace_root, Path::new(out)) else {
            continue;
        };
        let Ok(bytes) = std::fs::read(&abs) else {
            continue;
        };
        output_digests.insert(out.clone(), requiem_hash::hash_bytes(&bytes));
    }

    let t_digest = requiem_canon::trace_digest(raw.exit_code, &raw.termination_reason, &output_paths_in_order);

    Ok(ExecutionResult {
        ok: raw.ok(),
        exit_code: raw.exit_code,
        termination_reason: raw.termination_reason,
        stdout_text: String::from_utf8_lossy(&raw.stdout.bytes).into_owned(),
        stderr_text: String::from_utf8_lossy(&raw.stderr.bytes).into_owned(),
        stdout_truncated: raw.stdout.truncated,
        stderr_truncated: raw.stderr.truncated,
        request_digest: requiem_canon::request_digest(req),
        stdout_digest,
        stderr_digest,
        trace_digest: t_digest,
        output_digests,
        policy_applied: requiem_canon::PolicyApplied {
            allowed_keys: sandbox_applied.allowed_keys,
        },
        error_code: String::new(),
    })
}

/// Re-execute `req` on the current host and compare the freshly produced
/// result's canonical digest against `res`'s.
///
/// This is the cheap, CAS-free check: it re-runs the command and confirms
/// the new run reproduces the recorded outcome, without touching stored
/// output bytes. `env_allowlist` must match whatever allowlist the original
/// run used (strict-mode env filtering depends on it).
pub async fn validate_replay(
    req: &ExecutionRequest,
    res: &ExecutionResult,
    env_allowlist: &BTreeSet<String>,
) -> ReplayOutcome {
    tracing::debug!(state = ?ReplayState::Running, request_id = %req.request_id, "replay: re-executing request");

    let recomputed_request_digest = requiem_canon::request_digest(req);
    if recomputed_request_digest != res.request_digest {
        return ReplayOutcome::mismatch(format!(
            "request_digest mismatch: recorded {}, recomputed {}",
            res.request_digest.to_hex(),
            recomputed_request_digest.to_hex()
        ));
    }

    let fresh = match reexecute(req, env_allowlist).await {
        Ok(fresh) => fresh,
        Err(e) => return ReplayOutcome::error(format!("re-execution failed: {e}")),
    };

    let recorded_digest = requiem_canon::result_digest(res);
    let fresh_digest = requiem_canon::result_digest(&fresh);
    if fresh_digest != recorded_digest {
        return ReplayOutcome::mismatch(format!(
            "result_digest mismatch: recorded {}, re-executed {}",
            recorded_digest.to_hex(),
            fresh_digest.to_hex()
        ));
    }

    ReplayOutcome::verified()
}

/// Full replay verification: everything [`validate_replay`] checks, plus
/// confirming every digest in `res.output_digests` (and stdout/stderr) is
/// actually retrievable and verifies against its content in `cas`.
pub async fn validate_replay_with_cas(
    req: &ExecutionRequest,
    res: &ExecutionResult,
    cas: &CasStore,
    env_allowlist: &BTreeSet<String>,
) -> Result<ReplayOutcome, RequiemError> {
    let self_consistent = validate_replay(req, res, env_allowlist).await;
    if !self_consistent.is_verified() {
        return Ok(self_consistent);
    }

    for (path, digest) in &res.output_digests {
        if !digest_present_and_verified(cas, *digest) {
            return Ok(ReplayOutcome::error(format!(
                "output '{path}' (digest {}) missing or corrupt in cas",
                digest.to_hex()
            )));
        }
    }

    if !res.stdout_text.is_empty() && !digest_present_and_verified(cas, res.stdout_digest) {
        return Err(RequiemError::new(
            ErrorCode::CasIntegrityFailed,
            "stdout digest not retrievable from cas",
        ));
    }
    if !res.stderr_text.is_empty() && !digest_present_and_verified(cas, res.stderr_digest) {
        return Err(RequiemError::new(
            ErrorCode::CasIntegrityFailed,
            "stderr digest not retrievable from cas",
        ));
    }

    Ok(ReplayOutcome::verified())
}

fn digest_present_and_verified(cas: &CasStore, digest: Digest) -> bool {
    cas.get(&digest.to_hex()).is_some()
}
