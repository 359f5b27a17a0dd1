//! Append-only metering ledger.
//!
//! Exactly-once per `(tenant_id, request_digest)`: a second `emit` for a
//! pair already recorded is rejected rather than silently re-billed, the
//! same shape as the duplicate-rejecting `seen` set used for receipt-chain
//! dedup elsewhere in this lineage, generalized from a hash-chain to a flat
//! append-only log. Billing follows one rule — charge iff `error_code ==
//! ""` — and shadow runs are never persisted or charged at all.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use requiem_error::ErrorCode;
use requiem_hash::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One recorded primary (non-shadow) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterEvent {
    /// Tenant the execution was billed to.
    pub tenant_id: String,
    /// Canonical request digest identifying the billed execution.
    pub request_digest: Digest,
    /// Wire-format error code recorded on the result (`""` on success).
    pub error_code: String,
    /// Whether this event is billable, per the rule `error_code == ""`.
    pub charged: bool,
    /// Wall-clock time the event was appended.
    pub recorded_at: DateTime<Utc>,
}

/// One discrepancy surfaced by [`MeterLedger::verify_parity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParityDiagnostic {
    /// The ledger's billable-event count did not match an externally
    /// tracked expectation.
    CountMismatch {
        /// Count the caller expected.
        expected: usize,
        /// Count actually recorded by this ledger.
        actual: usize,
    },
    /// A `(tenant_id, request_digest)` pair appears more than once in the
    /// log, which should be unreachable given `emit`'s own rejection but is
    /// still worth surfacing for a ledger built by another source.
    DuplicateRequest {
        /// Tenant the duplicated pair belongs to.
        tenant_id: String,
        /// Request digest duplicated.
        request_digest: Digest,
    },
}

/// Failures from appending to the ledger.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeterError {
    /// A primary event for this `(tenant_id, request_digest)` pair was
    /// already recorded; metering is exactly-once.
    #[error("duplicate meter event for tenant '{tenant_id}', request {request_digest}")]
    DuplicateRequest {
        /// Tenant of the rejected duplicate.
        tenant_id: String,
        /// Hex request digest of the rejected duplicate.
        request_digest: String,
    },
}

/// Append-only metering ledger for one process/run.
///
/// Shadow executions are counted but never appended: they must never affect
/// billing, and a ledger that persisted them could accidentally be summed
/// into revenue figures by a careless caller.
#[derive(Debug, Default)]
pub struct MeterLedger {
    events: Vec<MeterEvent>,
    seen: HashSet<(String, Digest)>,
    shadow_attempts: usize,
}

impl MeterLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution outcome.
    ///
    /// Shadow runs (`is_shadow == true`) are counted in
    /// [`MeterLedger::shadow_attempts`] and otherwise ignored: not appended,
    /// never duplicate-checked, never billed. Primary runs are checked
    /// against `(tenant_id, request_digest)` uniqueness and rejected if a
    /// prior primary event already covers that pair.
    pub fn emit(
        &mut self,
        tenant_id: &str,
        request_digest: Digest,
        error_code: &str,
        is_shadow: bool,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), MeterError> {
        if is_shadow {
            self.shadow_attempts += 1;
            tracing::debug!(tenant_id, "shadow run observed, not persisted to ledger");
            return Ok(());
        }

        let key = (tenant_id.to_string(), request_digest);
        if self.seen.contains(&key) {
            return Err(MeterError::DuplicateRequest {
                tenant_id: tenant_id.to_string(),
                request_digest: request_digest.to_hex(),
            });
        }
        self.seen.insert(key);

        let charged = ErrorCode::from_wire_str(error_code).is_billable();
        self.events.push(MeterEvent {
            tenant_id: tenant_id.to_string(),
            request_digest,
            error_code: error_code.to_string(),
            charged,
            recorded_at,
        });
        Ok(())
    }

    /// Number of recorded primary events that are billable.
    pub fn count_primary_success(&self) -> usize {
        self.events.iter().filter(|e| e.charged).count()
    }

    /// Number of recorded primary events that failed (no-charge).
    pub fn count_primary_failure(&self) -> usize {
        self.events.iter().filter(|e| !e.charged).count()
    }

    /// Shadow runs are never billable; this is always zero by construction.
    pub fn count_shadow(&self) -> usize {
        0
    }

    /// Total number of shadow runs observed, for diagnostics only — not a
    /// billing quantity.
    pub fn shadow_attempts(&self) -> usize {
        self.shadow_attempts
    }

    /// All recorded primary events, in append order.
    pub fn events(&self) -> &[MeterEvent] {
        &self.events
    }

    /// Brute-force scan for `(tenant_id, request_digest)` pairs that appear
    /// more than once. Should always be empty given `emit`'s own rejection
    /// of duplicates; exposed for audit tooling that reads a ledger built by
    /// a source other than this type.
    pub fn find_duplicates(&self) -> Vec<(String, Digest)> {
        let mut counts: std::collections::HashMap<(String, Digest), usize> =
            std::collections::HashMap::new();
        for event in &self.events {
            *counts
                .entry((event.tenant_id.clone(), event.request_digest))
                .or_insert(0) += 1;
        }
        let mut dupes: Vec<_> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(key, _)| key)
            .collect();
        dupes.sort();
        dupes
    }

    /// Billing parity check against an externally tracked expectation (e.g.
    /// from a replayed execution log). Returns an empty list when the ledger
    /// is fully consistent; otherwise one [`ParityDiagnostic`] per
    /// discrepancy found (count mismatch, duplicate pairs), so the caller
    /// gets detail rather than a bare pass/fail.
    pub fn verify_parity(&self, expected_billable: usize) -> Vec<ParityDiagnostic> {
        let mut diagnostics = Vec::new();
        let actual = self.count_primary_success();
        if actual != expected_billable {
            diagnostics.push(ParityDiagnostic::CountMismatch {
                expected: expected_billable,
                actual,
            });
        }
        for (tenant_id, request_digest) in self.find_duplicates() {
            diagnostics.push(ParityDiagnostic::DuplicateRequest {
                tenant_id,
                request_digest,
            });
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn digest(seed: &[u8]) -> Digest {
        requiem_hash::hash_bytes(seed)
    }

    #[test]
    fn success_is_charged() {
        let mut ledger = MeterLedger::new();
        ledger.emit("tenant-a", digest(b"1"), "", false, now()).unwrap();
        assert_eq!(ledger.count_primary_success(), 1);
        assert_eq!(ledger.count_primary_failure(), 0);
    }

    #[test]
    fn failure_is_not_charged() {
        let mut ledger = MeterLedger::new();
        ledger
            .emit("tenant-a", digest(b"1"), "timeout", false, now())
            .unwrap();
        assert_eq!(ledger.count_primary_success(), 0);
        assert_eq!(ledger.count_primary_failure(), 1);
    }

    #[test]
    fn duplicate_request_digest_is_rejected() {
        let mut ledger = MeterLedger::new();
        let d = digest(b"same");
        ledger.emit("tenant-a", d, "", false, now()).unwrap();
        let err = ledger.emit("tenant-a", d, "", false, now()).unwrap_err();
        assert_eq!(
            err,
            MeterError::DuplicateRequest {
                tenant_id: "tenant-a".into(),
                request_digest: d.to_hex(),
            }
        );
        assert_eq!(ledger.count_primary_success(), 1);
    }

    #[test]
    fn same_digest_different_tenants_both_charge() {
        let mut ledger = MeterLedger::new();
        let d = digest(b"shared");
        ledger.emit("tenant-a", d, "", false, now()).unwrap();
        ledger.emit("tenant-b", d, "", false, now()).unwrap();
        assert_eq!(ledger.count_primary_success(), 2);
    }

    #[test]
    fn shadow_runs_never_persisted_or_charged() {
        let mut ledger = MeterLedger::new();
        ledger.emit("tenant-a", digest(b"1"), "", true, now()).unwrap();
        ledger.emit("tenant-a", digest(b"1"), "", true, now()).unwrap();
        assert_eq!(ledger.events().len(), 0);
        assert_eq!(ledger.count_shadow(), 0);
        assert_eq!(ledger.shadow_attempts(), 2);
    }

    #[test]
    fn shadow_does_not_block_later_primary_with_same_digest() {
        let mut ledger = MeterLedger::new();
        let d = digest(b"1");
        ledger.emit("tenant-a", d, "", true, now()).unwrap();
        ledger.emit("tenant-a", d, "", false, now()).unwrap();
        assert_eq!(ledger.count_primary_success(), 1);
    }

    #[test]
    fn find_duplicates_is_empty_for_well_formed_ledger() {
        let mut ledger = MeterLedger::new();
        ledger.emit("tenant-a", digest(b"1"), "", false, now()).unwrap();
        ledger.emit("tenant-a", digest(b"2"), "timeout", false, now()).unwrap();
        assert!(ledger.find_duplicates().is_empty());
    }

    #[test]
    fn verify_parity_matches_expected_billable_count() {
        let mut ledger = MeterLedger::new();
        ledger.emit("tenant-a", digest(b"1"), "", false, now()).unwrap();
        ledger.emit("tenant-a", digest(b"2"), "", false, now()).unwrap();
        ledger.emit("tenant-a", digest(b"3"), "timeout", false, now()).unwrap();
        assert_eq!(ledger.verify_parity(2), Vec::new());
        assert_eq!(
            ledger.verify_parity(3),
            vec![ParityDiagnostic::CountMismatch { expected: 3, actual: 2 }]
        );
    }

    #[test]
    fn verify_parity_reports_duplicate_pairs_from_a_foreign_ledger() {
        let mut ledger = MeterLedger::new();
        let d = digest(b"1");
        ledger.emit("tenant-a", d, "", false, now()).unwrap();
        // Simulate a ledger assembled from a source other than `emit`,
        // where the uniqueness invariant was not enforced on the way in.
        ledger.events.push(MeterEvent {
            tenant_id: "tenant-a".into(),
            request_digest: d,
            error_code: String::new(),
            charged: true,
            recorded_at: now(),
        });

        let diagnostics = ledger.verify_parity(1);
        assert!(diagnostics.contains(&ParityDiagnostic::DuplicateRequest {
            tenant_id: "tenant-a".into(),
            request_digest: d,
        }));
    }
}
