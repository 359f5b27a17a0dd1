//! The execution kernel: wires canonicalization, sandbox policy, the
//! executor, content-addressed storage, and metering into a single
//! `execute(ExecutionRequest) -> ExecutionResult` entry point.
//!
//! Control flow for a primary request, mirroring the pipeline shape used
//! throughout this lineage for sequential, short-circuiting stages with a
//! tracing span per stage: canonicalize → `request_digest` → sandbox policy
//! derivation → spawn + capture → result canonicalization → `result_digest`
//! → CAS writes (stdout/stderr/outputs) → meter emit. Every failure at any
//! stage is converted into a terminal [`ExecutionResult`] or, for faults the
//! canon layer cannot express on its own (malformed ingress JSON), a
//! [`requiem_error::RequiemError`] returned before a request even exists.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use requiem_canon::{
    canonicalize_request, request_digest as canon_request_digest, trace_digest, ExecutionRequest,
    ExecutionResult, Policy as CanonPolicy, PolicyApplied as CanonPolicyApplied,
    PolicyMode as CanonPolicyMode,
};
use requiem_cas::{CasStore, Encoding};
use requiem_error::{ErrorCode, RequiemError};
use requiem_exec::execute_sandboxed;
use requiem_hash::Digest;
use requiem_meter::{MeterError, MeterEvent, MeterLedger};
use requiem_policy::{
    check_path_containment, derive_environment, validate_resource_limits,
    PolicyMode as SandboxPolicyMode,
};

pub use requiem_canon::{canonicalize_result, deterministic_digest, result_digest};
pub use requiem_cas::CasStore as Cas;
pub use requiem_replay::{validate_replay, validate_replay_with_cas, ReplayOutcome, ReplayState};

/// Exit code reported for a policy denial (path escape) where no child is
/// ever spawned, fixed by the kernel contract.
pub const PATH_ESCAPE_EXIT_CODE: i32 = 2;

/// Generic exit code used for faults that have no more specific convention
/// (spawn failure, internal error). Never produced by a child process itself.
const FAULT_EXIT_CODE: i32 = 1;

fn empty_digest() -> Digest {
    requiem_hash::hash_bytes(b"")
}

/// Returns `false` if `rel` escapes a workspace root lexically — an absolute
/// path or any `..` component — without touching the filesystem.
///
/// Declared output paths are checked against this before a child ever spawns,
/// since the file usually does not exist yet and a full symlink-resolving
/// [`check_path_containment`] would fail to even canonicalize it.
fn output_path_is_lexically_contained(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && !path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

fn to_sandbox_mode(mode: CanonPolicyMode) -> SandboxPolicyMode {
    match mode {
        CanonPolicyMode::Strict => SandboxPolicyMode::Strict,
        CanonPolicyMode::Permissive => SandboxPolicyMode::Permissive,
    }
}

/// The execution kernel.
///
/// Owns one CAS root and one in-process metering ledger. A deployment with
/// multiple tenants sharing a kernel instance relies on `tenant_id` for
/// billing separation only — CAS isolation instead comes from giving each
/// tenant its own [`Kernel`] (and thus its own CAS root), per the filesystem
/// layout contract.
pub struct Kernel {
    cas: CasStore,
    meter: Mutex<MeterLedger>,
    meter_root: Option<PathBuf>,
    env_allowlist: std::collections::BTreeSet<String>,
}

impl Kernel {
    /// Open a kernel rooted at `cas_root`, optionally persisting meter
    /// events under `meter_root` as `<meter_root>/<tenant_id>.log`.
    pub fn new(
        cas_root: impl AsRef<Path>,
        meter_root: Option<PathBuf>,
        env_allowlist: std::collections::BTreeSet<String>,
    ) -> std::io::Result<Self> {
        let cas = CasStore::new(cas_root)?;
        if let Some(root) = &meter_root {
            std::fs::create_dir_all(root)?;
        }
        Ok(Self {
            cas,
            meter: Mutex::new(MeterLedger::new()),
            meter_root,
            env_allowlist,
        })
    }

    /// Build a kernel from a loaded [`requiem_config::RequiemConfig`] plus an
    /// explicit CAS root (the config's `cas_root`/`meter_root` are strings,
    /// not yet resolved against any particular filesystem view — the caller
    /// decides how to turn them into paths).
    pub fn from_config(
        config: &requiem_config::RequiemConfig,
        cas_root: impl AsRef<Path>,
    ) -> std::io::Result<Self> {
        let meter_root = config.meter_root.as_ref().map(PathBuf::from);
        Self::new(cas_root, meter_root, config.deterministic_env_allowlist.clone())
    }

    /// Read-only access to the underlying CAS, e.g. for a caller fetching a
    /// previously produced output by digest.
    pub fn cas(&self) -> &CasStore {
        &self.cas
    }

    /// Primary entry point: canonicalize, enforce sandbox policy, execute,
    /// hash, store, and meter `req`. Always returns a complete
    /// [`ExecutionResult`] — faults are embedded via `ok`/`error_code`/
    /// `termination_reason` rather than propagated as an `Err`.
    pub async fn execute(&self, req: &ExecutionRequest) -> ExecutionResult {
        self.run(req, false).await
    }

    /// Shadow execution: runs the identical pipeline (including child spawn
    /// and CAS writes, which are dedup-safe) but the meter only counts it in
    /// [`MeterLedger::shadow_attempts`] — never persisted, never billed.
    pub async fn execute_shadow(&self, req: &ExecutionRequest) -> ExecutionResult {
        self.run(req, true).await
    }

    async fn run(&self, req: &ExecutionRequest, is_shadow: bool) -> ExecutionResult {
        match self.execute_inner(req).await {
            Ok(result) => {
                self.record_meter(req, result.request_digest, &result.error_code, is_shadow);
                result
            }
            Err(err) => {
                let result = self.fault_result(req, err);
                self.record_meter(req, result.request_digest, &result.error_code, is_shadow);
                result
            }
        }
    }

    async fn execute_inner(&self, req: &ExecutionRequest) -> Result<ExecutionResult, RequiemError> {
        let canonical = canonicalize_request(req);
        let request_len = requiem_json::canonical_bytes(&canonical).len() as u64;
        validate_resource_limits(req.timeout_ms, req.max_output_bytes, request_len)?;

        let req_digest = canon_request_digest(req);

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
        let (env, sandbox_applied) = derive_environment(sandbox_mode, &req.env, &self.env_allowlist);

        let raw = execute_sandboxed(
            &req.command,
            &req.argv,
            &resolved_cwd,
            &env,
            req.max_output_bytes,
            req.timeout_ms,
        )
        .await?;

        let stdout_hex = self
            .cas
            .put(&raw.stdout.bytes, Encoding::Off)
            .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("cas put stdout: {e}")))?;
        let stderr_hex = self
            .cas
            .put(&raw.stderr.bytes, Encoding::Off)
            .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("cas put stderr: {e}")))?;
        let stdout_digest = Digest::from_hex(&stdout_hex).expect("cas returns valid hex digest");
        let stderr_digest = Digest::from_hex(&stderr_hex).expect("cas returns valid hex digest");

        let mut output_digests = BTreeMap::new();
        let mut output_paths_in_order = Vec::with_capacity(req.outputs.len());
        for out in &req.outputs {
            output_paths_in_order.push(out.clone());
            let Ok(abs) = check_path_containment(&workspace_root, Path::new(out)) else {
                // Runtime symlink escape introduced by the child: treated the
                // same as a missing output, never hashed.
                continue;
            };
            let Ok(bytes) = std::fs::read(&abs) else {
                continue;
            };
            match self.cas.put(&bytes, Encoding::Off) {
                Ok(hex) => {
                    if let Some(d) = Digest::from_hex(&hex) {
                        output_digests.insert(out.clone(), d);
                    }
                }
                Err(e) => {
                    tracing::warn!(output = %out, error = %e, "failed to store declared output in cas");
                }
            }
        }

        let t_digest = trace_digest(raw.exit_code, &raw.termination_reason, &output_paths_in_order);
        let error_code = error_code_for_termination(&raw.termination_reason);

        Ok(ExecutionResult {
            ok: raw.ok(),
            exit_code: raw.exit_code,
            termination_reason: raw.termination_reason,
            stdout_text: String::from_utf8_lossy(&raw.stdout.bytes).into_owned(),
            stderr_text: String::from_utf8_lossy(&raw.stderr.bytes).into_owned(),
            stdout_truncated: raw.stdout.truncated,
            stderr_truncated: raw.stderr.truncated,
            request_digest: req_digest,
            stdout_digest,
            stderr_digest,
            trace_digest: t_digest,
            output_digests,
            policy_applied: CanonPolicyApplied {
                allowed_keys: sandbox_applied.allowed_keys,
            },
            error_code: error_code.as_wire_str().to_string(),
        })
    }

    /// Convert a pre-execution fault (quota, path escape, spawn failure,
    /// internal error) into a terminal [`ExecutionResult`]. No child ever ran
    /// and no output was hashed, so every digest here is of empty content.
    fn fault_result(&self, req: &ExecutionRequest, err: RequiemError) -> ExecutionResult {
        let req_digest = canon_request_digest(req);
        let exit_code = match err.code {
            ErrorCode::PathEscape => PATH_ESCAPE_EXIT_CODE,
            _ => FAULT_EXIT_CODE,
        };
        let t_digest = trace_digest(exit_code, err.code.as_wire_str(), &[]);
        ExecutionResult {
            ok: false,
            exit_code,
            termination_reason: err.code.as_wire_str().to_string(),
            stdout_text: String::new(),
            stderr_text: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            request_digest: req_digest,
            stdout_digest: empty_digest(),
            stderr_digest: empty_digest(),
            trace_digest: t_digest,
            output_digests: BTreeMap::new(),
            policy_applied: CanonPolicyApplied::default(),
            error_code: err.code.as_wire_str().to_string(),
        }
    }

    fn record_meter(&self, req: &ExecutionRequest, digest: Digest, error_code: &str, is_shadow: bool) {
        let recorded_at = Utc::now();
        let emit_result = {
            let mut ledger = self.meter.lock().expect("meter ledger mutex poisoned");
            ledger.emit(&req.tenant_id, digest, error_code, is_shadow, recorded_at)
        };
        match emit_result {
            Ok(()) => {
                if !is_shadow {
                    let event = MeterEvent {
                        tenant_id: req.tenant_id.clone(),
                        request_digest: digest,
                        error_code: error_code.to_string(),
                        charged: ErrorCode::from_wire_str(error_code).is_billable(),
                        recorded_at,
                    };
                    self.append_meter_log(&event);
                }
            }
            Err(MeterError::DuplicateRequest { tenant_id, request_digest }) => {
                tracing::warn!(tenant_id, request_digest, "duplicate meter event suppressed");
            }
        }
    }

    fn append_meter_log(&self, event: &MeterEvent) {
        let Some(root) = &self.meter_root else {
            return;
        };
        let path = root.join(format!("{}.log", event.tenant_id));
        let Ok(line) = serde_json::to_string(event) else {
            tracing::warn!("failed to serialize meter event for append");
            return;
        };
        use std::io::Write;
        let opened = std::fs::OpenOptions::new().create(true).append(true).open(&path);
        match opened {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    tracing::warn!(error = %e, path = %path.display(), "failed to append meter log");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to open meter log");
            }
        }
    }
}

fn error_code_for_termination(termination_reason: &str) -> ErrorCode {
    match termination_reason {
        "timeout" => ErrorCode::Timeout,
        "signal" => ErrorCode::Signal,
        _ => ErrorCode::None,
    }
}

/// Parse a raw JSON request body into an [`ExecutionRequest`].
///
/// Lives here rather than in `requiem-canon` because it is an ingress
/// concern (mapping untyped wire bytes onto the typed request), not a
/// canonicalization one. Malformed JSON, duplicate keys, and non-integer
/// `nonce`/`max_output_bytes`/`timeout_ms` are rejected before any policy or
/// executor stage runs, per the input-fault contract.
pub fn parse_request_json(
    tenant_id: impl Into<String>,
    request_id: impl Into<String>,
    workspace_root: PathBuf,
    bytes: &str,
) -> Result<ExecutionRequest, RequiemError> {
    let value = requiem_json::parse(bytes).map_err(|e| RequiemError::new(e.error_code(), e.to_string()))?;

    let command = value
        .get("command")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RequiemError::new(ErrorCode::JsonTypeError, "missing or non-string `command`"))?;

    let argv = value
        .get("argv")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let env = value
        .get("env")
        .and_then(|v| v.as_object())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<std::collections::BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    let cwd = value.get("cwd").and_then(|v| v.as_str()).map(str::to_string);

    let outputs = value
        .get("outputs")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<std::collections::BTreeSet<_>>()
        })
        .unwrap_or_default();

    let policy_value = value.get("policy");
    let mode = match policy_value.and_then(|p| p.get("mode")).and_then(|v| v.as_str()) {
        Some("permissive") => CanonPolicyMode::Permissive,
        _ => CanonPolicyMode::Strict,
    };
    let scheduler_mode = policy_value
        .and_then(|p| p.get("scheduler_mode"))
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string();
    let deterministic = matches!(
        policy_value.and_then(|p| p.get("deterministic")),
        Some(requiem_json::Value::Bool(true))
    );

    let max_output_bytes = value
        .get("max_output_bytes")
        .map(|v| v.require_u64("max_output_bytes"))
        .transpose()
        .map_err(|e| RequiemError::new(e.error_code(), e.to_string()))?
        .unwrap_or(1_048_576);

    let timeout_ms = value
        .get("timeout_ms")
        .map(|v| v.require_u64("timeout_ms"))
        .transpose()
        .map_err(|e| RequiemError::new(e.error_code(), e.to_string()))?
        .unwrap_or(30_000);

    let nonce = value
        .get("nonce")
        .map(|v| v.require_u64("nonce"))
        .transpose()
        .map_err(|e| RequiemError::new(e.error_code(), e.to_string()))?
        .unwrap_or(0);

    Ok(ExecutionRequest {
        request_id: requiem_canon::sanitize_request_id(&request_id.into()),
        tenant_id: tenant_id.into(),
        workspace_root,
        command: PathBuf::from(command),
        argv,
        env,
        cwd,
        outputs,
        policy: CanonPolicy {
            mode,
            scheduler_mode,
            deterministic,
        },
        max_output_bytes,
        timeout_ms,
        nonce,
    })
}
