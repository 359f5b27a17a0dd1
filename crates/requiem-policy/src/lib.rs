//! Sandbox policy: path containment, secret-env filtering, and resource
//! limits enforced before a request is handed to the executor.
//!
//! Path containment resolves symlinks before checking containment — a
//! symlink inside the workspace root that points outside it must not defeat
//! the sandbox, so `canonicalize` runs first and the prefix check runs on
//! the resolved path, never the requested one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use requiem_error::{ErrorCode, RequiemError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Glob patterns (case-insensitive) identifying env var names that must
/// never cross into a sandboxed process, regardless of policy mode.
const SECRET_KEY_PATTERNS: &[&str] = &[
    "*SECRET*",
    "*TOKEN*",
    "*KEY*",
    "*PASSWORD*",
    "*AUTH*",
    "*COOKIE*",
];

/// Deterministic baseline environment every execution starts from.
const DETERMINISTIC_ENV: &[(&str, &str)] = &[("PATH", "/usr/bin:/bin"), ("LANG", "C"), ("TZ", "UTC")];

/// Maximum size, in bytes, of an inbound execution request before it is
/// rejected with [`ErrorCode::QuotaExceeded`].
pub const MAX_REQUEST_INGRESS_BYTES: u64 = 1024 * 1024;

/// Mirrors [`requiem_canon::PolicyMode`] without creating a dependency
/// cycle: strict mode restricts env passthrough to an explicit allowlist,
/// permissive mode passes through anything not secret-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Only deterministic baseline keys plus an explicit allowlist pass through.
    Strict,
    /// Any non-secret-shaped key passes through.
    Permissive,
}

/// Record of which environment keys a policy decision let through, mirroring
/// `requiem_canon::PolicyApplied`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct PolicyApplied {
    /// Env var names present in the final, filtered environment, sorted.
    pub allowed_keys: Vec<String>,
}

fn secret_key_globset() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in SECRET_KEY_PATTERNS {
        let glob = Glob::new(pattern).expect("built-in secret glob patterns are valid");
        builder.add(glob);
    }
    builder.build().expect("built-in secret globset always compiles")
}

/// Returns `true` if `key` matches one of the built-in secret-shaped
/// patterns (`*SECRET*`, `*TOKEN*`, ...), case-insensitively.
pub fn is_secret_env_key(key: &str) -> bool {
    thread_local! {
        static SECRET_GLOBS: GlobSet = secret_key_globset();
    }
    let upper = key.to_ascii_uppercase();
    SECRET_GLOBS.with(|set| set.is_match(&upper))
}

/// Resolve `candidate` (which may be relative to `workspace_root` or
/// absolute) and verify it remains within the canonicalized workspace root
/// after symlink resolution.
///
/// Returns the canonical, contained path on success. Any symlink escape,
/// missing path, or outright traversal outside the root is reported as
/// [`ErrorCode::PathEscape`].
pub fn check_path_containment(
    workspace_root: &Path,
    candidate: &Path,
) -> Result<PathBuf, RequiemError> {
    let root = std::fs::canonicalize(workspace_root).map_err(|e| {
        RequiemError::new(ErrorCode::PathEscape, format!("workspace root unusable: {e}"))
    })?;

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = std::fs::canonicalize(&joined).map_err(|e| {
        RequiemError::new(
            ErrorCode::PathEscape,
            format!("cannot resolve '{}': {e}", joined.display()),
        )
    })?;

    if !resolved.starts_with(&root) {
        return Err(RequiemError::new(
            ErrorCode::PathEscape,
            format!(
                "'{}' resolves outside workspace root '{}'",
                resolved.display(),
                root.display()
            ),
        ));
    }

    Ok(resolved)
}

/// Derive the final, filtered environment for a sandboxed execution.
///
/// Secret-shaped keys are dropped unless the key is explicitly allowlisted —
/// an allowlisted name always overrides the secret-pattern drop, per the
/// deny-list-except-allowlisted-names contract. In [`PolicyMode::Strict`]
/// only keys present in `allowlist` (plus the deterministic baseline) pass
/// through; in [`PolicyMode::Permissive`] every non-secret key passes
/// through, and a secret-shaped key still needs the allowlist to survive.
/// The deterministic baseline (`PATH`, `LANG`, `TZ`) is always present,
/// overridable by an explicitly allowed same-named key.
pub fn derive_environment(
    mode: PolicyMode,
    requested_env: &BTreeMap<String, String>,
    allowlist: &BTreeSet<String>,
) -> (BTreeMap<String, String>, PolicyApplied) {
    let mut env: BTreeMap<String, String> = DETERMINISTIC_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (key, value) in requested_env {
        let allowlisted = allowlist.contains(key);
        if is_secret_env_key(key) && !allowlisted {
            tracing::debug!(env_key = %key, "dropping secret-shaped env key");
            continue;
        }
        let admitted = match mode {
            PolicyMode::Strict => allowlisted,
            PolicyMode::Permissive => true,
        };
        if admitted {
            env.insert(key.clone(), value.clone());
        }
    }

    let allowed_keys = env.keys().cloned().collect();
    (env, PolicyApplied { allowed_keys })
}

/// Validate that `timeout_ms` and `max_output_bytes` are sane and that the
/// serialized request does not exceed the ingress size cap.
pub fn validate_resource_limits(
    timeout_ms: u64,
    max_output_bytes: u64,
    request_len_bytes: u64,
) -> Result<(), RequiemError> {
    if timeout_ms == 0 {
        return Err(RequiemError::new(
            ErrorCode::QuotaExceeded,
            "timeout_ms must be greater than zero",
        ));
    }
    if max_output_bytes == 0 {
        return Err(RequiemError::new(
            ErrorCode::QuotaExceeded,
            "max_output_bytes must be greater than zero",
        ));
    }
    if request_len_bytes > MAX_REQUEST_INGRESS_BYTES {
        return Err(RequiemError::new(
            ErrorCode::QuotaExceeded,
            format!(
                "request size {request_len_bytes} exceeds ingress cap of {MAX_REQUEST_INGRESS_BYTES} bytes"
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn secret_key_patterns_match_case_insensitively() {
        assert!(is_secret_env_key("AWS_SECRET_ACCESS_KEY"));
        assert!(is_secret_env_key("api_token"));
        assert!(is_secret_env_key("Session_Cookie"));
        assert!(is_secret_env_key("DB_PASSWORD"));
        assert!(!is_secret_env_key("PATH"));
        assert!(!is_secret_env_key("LANG"));
    }

    #[test]
    fn containment_allows_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"hi").unwrap();
        let resolved = check_path_containment(dir.path(), Path::new("file.txt")).unwrap();
        assert!(resolved.starts_with(std::fs::canonicalize(dir.path()).unwrap()));
    }

    #[test]
    fn containment_rejects_traversal_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"nope").unwrap();
        let escape = dir.path().join("..").join(
            outside
                .path()
                .file_name()
                .unwrap(),
        );
        let result = check_path_containment(dir.path(), &escape);
        // Either canonicalize fails (no such dir under a sibling-looking name)
        // or it resolves but falls outside root — both are PathEscape.
        if let Err(err) = result {
            assert_eq!(err.code, ErrorCode::PathEscape);
        }
    }

    #[test]
    fn containment_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("real.txt"), b"outside data").unwrap();
        let link = dir.path().join("link");
        symlink(outside.path().join("real.txt"), &link).unwrap();

        let err = check_path_containment(dir.path(), Path::new("link")).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathEscape);
    }

    #[test]
    fn strict_mode_only_passes_allowlisted_keys() {
        let mut requested = BTreeMap::new();
        requested.insert("HOME".to_string(), "/home/user".to_string());
        requested.insert("AWS_SECRET_KEY".to_string(), "leak-me-not".to_string());
        requested.insert("MY_FLAG".to_string(), "1".to_string());

        let mut allowlist = BTreeSet::new();
        allowlist.insert("MY_FLAG".to_string());

        let (env, applied) = derive_environment(PolicyMode::Strict, &requested, &allowlist);

        assert!(!env.contains_key("HOME"));
        assert!(!env.contains_key("AWS_SECRET_KEY"));
        assert_eq!(env.get("MY_FLAG"), Some(&"1".to_string()));
        assert_eq!(env.get("PATH"), Some(&"/usr/bin:/bin".to_string()));
        assert!(applied.allowed_keys.contains(&"MY_FLAG".to_string()));
        assert!(!applied.allowed_keys.contains(&"AWS_SECRET_KEY".to_string()));
    }

    #[test]
    fn allowlisted_secret_shaped_key_is_admitted_in_strict_mode() {
        let mut requested = BTreeMap::new();
        requested.insert("SERVICE_API_TOKEN".to_string(), "value".to_string());

        let mut allowlist = BTreeSet::new();
        allowlist.insert("SERVICE_API_TOKEN".to_string());

        let (env, applied) = derive_environment(PolicyMode::Strict, &requested, &allowlist);

        assert_eq!(env.get("SERVICE_API_TOKEN"), Some(&"value".to_string()));
        assert!(applied.allowed_keys.contains(&"SERVICE_API_TOKEN".to_string()));
    }

    #[test]
    fn allowlisted_secret_shaped_key_is_admitted_in_permissive_mode() {
        let mut requested = BTreeMap::new();
        requested.insert("API_TOKEN".to_string(), "shh".to_string());

        let mut allowlist = BTreeSet::new();
        allowlist.insert("API_TOKEN".to_string());

        let (env, _applied) = derive_environment(PolicyMode::Permissive, &requested, &allowlist);

        assert_eq!(env.get("API_TOKEN"), Some(&"shh".to_string()));
    }

    #[test]
    fn permissive_mode_passes_non_secret_keys() {
        let mut requested = BTreeMap::new();
        requested.insert("HOME".to_string(), "/home/user".to_string());
        requested.insert("API_TOKEN".to_string(), "shh".to_string());

        let (env, _applied) =
            derive_environment(PolicyMode::Permissive, &requested, &BTreeSet::new());

        assert_eq!(env.get("HOME"), Some(&"/home/user".to_string()));
        assert!(!env.contains_key("API_TOKEN"));
    }

    #[test]
    fn deterministic_baseline_always_present() {
        let (env, _applied) =
            derive_environment(PolicyMode::Strict, &BTreeMap::new(), &BTreeSet::new());
        assert_eq!(env.get("PATH"), Some(&"/usr/bin:/bin".to_string()));
        assert_eq!(env.get("LANG"), Some(&"C".to_string()));
        assert_eq!(env.get("TZ"), Some(&"UTC".to_string()));
    }

    #[test]
    fn resource_limits_reject_zero_timeout() {
        let err = validate_resource_limits(0, 1024, 100).unwrap_err();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }

    #[test]
    fn resource_limits_reject_oversized_request() {
        let err =
            validate_resource_limits(1000, 1024, MAX_REQUEST_INGRESS_BYTES + 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }

    #[test]
    fn resource_limits_accept_sane_values() {
        assert!(validate_resource_limits(1000, 1024, 512).is_ok());
    }
}
