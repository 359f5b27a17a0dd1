// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the execution kernel.
//!
//! This crate provides [`RequiemConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A default timeout is unusually large.
    LargeTimeout {
        /// Timeout value in milliseconds.
        timeout_ms: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTimeout { timeout_ms } => {
                write!(f, "default_timeout_ms is unusually large ({timeout_ms}ms)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the execution kernel.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RequiemConfig {
    /// Root directory for the content-addressed object store. When absent,
    /// callers must supply one explicitly at kernel construction time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_root: Option<String>,

    /// Root directory for the append-only metering ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_root: Option<String>,

    /// Default `max_output_bytes` applied when a request does not specify one.
    #[serde(default = "default_max_output_bytes")]
    pub default_max_output_bytes: u64,

    /// Default `timeout_ms` applied when a request does not specify one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Env var names admitted in strict policy mode in addition to the
    /// deterministic baseline, unless a request overrides it.
    #[serde(default)]
    pub deterministic_env_allowlist: BTreeSet<String>,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for RequiemConfig {
    fn default() -> Self {
        Self {
            cas_root: None,
            meter_root: None,
            default_max_output_bytes: default_max_output_bytes(),
            default_timeout_ms: default_timeout_ms(),
            deterministic_env_allowlist: BTreeSet::new(),
            log_level: Some("info".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum allowed `default_timeout_ms` (24 hours).
const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Threshold above which a default timeout generates a warning (1 hour).
const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Maximum allowed `default_max_output_bytes` (1 GiB).
const MAX_OUTPUT_BYTES_CEILING: u64 = 1024 * 1024 * 1024;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`RequiemConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`RequiemConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<RequiemConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => RequiemConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`RequiemConfig`].
pub fn parse_toml(content: &str) -> Result<RequiemConfig, ConfigError> {
    toml::from_str::<RequiemConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `REQUIEM_CAS_ROOT`
/// - `REQUIEM_METER_ROOT`
/// - `REQUIEM_LOG_LEVEL`
/// - `REQUIEM_DEFAULT_TIMEOUT_MS`
/// - `REQUIEM_DEFAULT_MAX_OUTPUT_BYTES`
pub fn apply_env_overrides(config: &mut RequiemConfig) {
    if let Ok(val) = std::env::var("REQUIEM_CAS_ROOT") {
        config.cas_root = Some(val);
    }
    if let Ok(val) = std::env::var("REQUIEM_METER_ROOT") {
        config.meter_root = Some(val);
    }
    if let Ok(val) = std::env::var("REQUIEM_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("REQUIEM_DEFAULT_TIMEOUT_MS")
        && let Ok(parsed) = val.parse::<u64>()
    {
        config.default_timeout_ms = parsed;
    }
    if let Ok(val) = std::env::var("REQUIEM_DEFAULT_MAX_OUTPUT_BYTES")
        && let Ok(parsed) = val.parse::<u64>()
    {
        config.default_max_output_bytes = parsed;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, out-of-range timeouts, zero output caps)
/// are returned as a [`ConfigError::ValidationError`]; soft issues come back
/// as warnings.
pub fn validate_config(config: &RequiemConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.default_timeout_ms == 0 || config.default_timeout_ms > MAX_TIMEOUT_MS {
        errors.push(format!(
            "default_timeout_ms {} out of range (1..{MAX_TIMEOUT_MS})",
            config.default_timeout_ms
        ));
    } else if config.default_timeout_ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            timeout_ms: config.default_timeout_ms,
        });
    }

    if config.default_max_output_bytes == 0 || config.default_max_output_bytes > MAX_OUTPUT_BYTES_CEILING
    {
        errors.push(format!(
            "default_max_output_bytes {} out of range (1..{MAX_OUTPUT_BYTES_CEILING})",
            config.default_max_output_bytes
        ));
    }

    if config.cas_root.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "cas_root".into(),
            hint: "callers must supply a cas root explicitly".into(),
        });
    }
    if config.meter_root.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "meter_root".into(),
            hint: "metering will not be persisted to disk".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
///
/// `deterministic_env_allowlist` sets are unioned rather than replaced.
pub fn merge_configs(base: RequiemConfig, overlay: RequiemConfig) -> RequiemConfig {
    let mut deterministic_env_allowlist = base.deterministic_env_allowlist;
    deterministic_env_allowlist.extend(overlay.deterministic_env_allowlist);

    RequiemConfig {
        cas_root: overlay.cas_root.or(base.cas_root),
        meter_root: overlay.meter_root.or(base.meter_root),
        default_max_output_bytes: if overlay.default_max_output_bytes != default_max_output_bytes() {
            overlay.default_max_output_bytes
        } else {
            base.default_max_output_bytes
        },
        default_timeout_ms: if overlay.default_timeout_ms != default_timeout_ms() {
            overlay.default_timeout_ms
        } else {
            base.default_timeout_ms
        },
        deterministic_env_allowlist,
        log_level: overlay.log_level.or(base.log_level),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = RequiemConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(!warnings.is_empty(), "should have advisory warnings");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = RequiemConfig::default();
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
        assert_eq!(cfg.default_max_output_bytes, 1024 * 1024);
        assert_eq!(cfg.default_timeout_ms, 30_000);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            cas_root = "/var/requiem/cas"
            meter_root = "/var/requiem/meter"
            log_level = "debug"
            default_timeout_ms = 5000
            default_max_output_bytes = 2048
            deterministic_env_allowlist = ["HOME", "USER"]
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.cas_root.as_deref(), Some("/var/requiem/cas"));
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.default_timeout_ms, 5000);
        assert!(cfg.deterministic_env_allowlist.contains("HOME"));
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = RequiemConfig {
            log_level: Some("verbose".into()),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_timeout() {
        let cfg = RequiemConfig {
            default_timeout_ms: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_timeout_exceeding_max() {
        let cfg = RequiemConfig {
            default_timeout_ms: MAX_TIMEOUT_MS + 1,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_max_output_bytes() {
        let cfg = RequiemConfig {
            default_max_output_bytes: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn large_timeout_produces_warning() {
        let cfg = RequiemConfig {
            cas_root: Some("/c".into()),
            meter_root: Some("/m".into()),
            default_timeout_ms: 7_200_000,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = RequiemConfig {
            cas_root: Some("/old".into()),
            log_level: Some("info".into()),
            ..Default::default()
        };
        let overlay = RequiemConfig {
            cas_root: Some("/new".into()),
            log_level: None,
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.cas_root.as_deref(), Some("/new"));
        assert_eq!(merged.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn merge_unions_env_allowlist() {
        let base = RequiemConfig {
            deterministic_env_allowlist: BTreeSet::from(["HOME".to_string()]),
            ..Default::default()
        };
        let overlay = RequiemConfig {
            deterministic_env_allowlist: BTreeSet::from(["USER".to_string()]),
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert!(merged.deterministic_env_allowlist.contains("HOME"));
        assert!(merged.deterministic_env_allowlist.contains("USER"));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = RequiemConfig {
            cas_root: Some("/c".into()),
            meter_root: Some("/m".into()),
            log_level: Some("debug".into()),
            default_timeout_ms: 1000,
            default_max_output_bytes: 4096,
            deterministic_env_allowlist: BTreeSet::from(["HOME".to_string()]),
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: RequiemConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requiem.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "cas_root = \"/data/cas\"\nlog_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.cas_root.as_deref(), Some("/data/cas"));
        assert_eq!(cfg.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/requiem.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn empty_string_toml_parses_to_defaults() {
        let cfg = parse_toml("").unwrap();
        assert_eq!(cfg.cas_root, None);
        assert_eq!(cfg.default_timeout_ms, 30_000);
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::MissingOptionalField {
            field: "cas_root".into(),
            hint: "h".into(),
        };
        assert!(w.to_string().contains("cas_root"));

        let w = ConfigWarning::LargeTimeout { timeout_ms: 9999 };
        assert!(w.to_string().contains("9999"));
    }
}
