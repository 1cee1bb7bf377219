use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const T0: &str = "2023-11-14T22:13:20Z";
const T0_PLUS_1H: &str = "2023-11-14T23:13:20Z";
const T0_PLUS_25H: &str = "2023-11-15T23:13:20Z";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_pm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pm"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pm binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_pm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "pm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing bool field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn add_pattern_args(root: &Path, source: &str, do_text: &str, dont_text: &str) -> Vec<String> {
    vec![
        "--root".to_string(),
        path_str(root).to_string(),
        "pattern".to_string(),
        "add".to_string(),
        "--project".to_string(),
        "demo".to_string(),
        "--title".to_string(),
        "Prefer streaming parsers for large payloads".to_string(),
        "--category".to_string(),
        "data-processing".to_string(),
        "--tag".to_string(),
        "parsing".to_string(),
        "--severity".to_string(),
        "warning".to_string(),
        "--do".to_string(),
        do_text.to_string(),
        "--dont".to_string(),
        dont_text.to_string(),
        "--source".to_string(),
        source.to_string(),
        "--agent".to_string(),
        "tester".to_string(),
        "--source-uri".to_string(),
        "file:///patterns.md".to_string(),
        "--observed-at".to_string(),
        T0.to_string(),
    ]
}

// Test IDs: TCLI-001
#[test]
fn add_query_get_round_trip() {
    let root = unique_temp_dir("patternmemory-cli-roundtrip");

    let added = run_json(add_pattern_args(
        &root,
        "verified-pattern",
        "stream the payload through a bounded reader",
        "buffer the entire payload into memory",
    ));
    assert_eq!(as_str(&added, "state"), "auto_accepted");
    assert_eq!(as_str(&added, "contract_version"), "cli.v1");
    let record = added
        .get("record")
        .unwrap_or_else(|| panic!("missing record in learn outcome: {added}"));
    let record_id = as_str(record, "id").to_string();

    let queried = run_json([
        "--root",
        path_str(&root),
        "query",
        "run",
        "--category",
        "data-processing",
        "--as-of",
        T0_PLUS_1H,
    ]);
    assert_eq!(as_u64(&queried, "returned"), 1);
    assert_eq!(as_u64(&queried, "total_scanned"), 1);

    let fetched =
        run_json(["--root", path_str(&root), "pattern", "get", "--id", record_id.as_str()]);
    assert!(as_bool(&fetched, "found"));
}

// Test IDs: TCLI-002
#[test]
fn conflict_clarification_and_confirm_flow() {
    let root = unique_temp_dir("patternmemory-cli-conflict");

    let original = run_json(add_pattern_args(
        &root,
        "verified-pattern",
        "stream the payload through a bounded reader",
        "buffer the entire payload into memory",
    ));
    assert_eq!(as_str(&original, "state"), "auto_accepted");

    let contradiction = run_json(add_pattern_args(
        &root,
        "official-docs",
        "buffer the entire payload into memory",
        "stream the payload through a bounded reader",
    ));
    assert_eq!(as_str(&contradiction, "state"), "pending_clarification");
    let pending = contradiction
        .get("pending")
        .unwrap_or_else(|| panic!("missing pending in learn outcome: {contradiction}"));
    let pending_id = as_str(pending, "pending_id").to_string();

    let resolved = run_json([
        "--root",
        path_str(&root),
        "pattern",
        "resolve",
        "--pending-id",
        pending_id.as_str(),
        "--resolution",
        "confirm",
        "--resolved-at",
        T0_PLUS_1H,
    ]);
    assert_eq!(as_str(&resolved, "state"), "superseded");

    // The archived loser stays on disk but leaves default retrieval.
    let listed = run_json(["--root", path_str(&root), "pattern", "list"]);
    assert_eq!(as_u64(&listed, "count"), 2);

    let queried = run_json([
        "--root",
        path_str(&root),
        "query",
        "run",
        "--category",
        "data-processing",
        "--as-of",
        T0_PLUS_1H,
    ]);
    assert_eq!(as_u64(&queried, "returned"), 1);
}

// Test IDs: TCLI-003
#[test]
fn cache_store_lookup_and_history_flow() {
    let root = unique_temp_dir("patternmemory-cli-cache");

    let stored = run_json([
        "--root",
        path_str(&root),
        "cache",
        "store",
        "--source",
        "gemini",
        "--role",
        "reviewer",
        "--question",
        "is the queue bounded?",
        "--artifact",
        "src/lib.rs",
        "--response-text",
        "yes, bounded at 128",
        "--key-point",
        "bounded channel",
        "--latency-ms",
        "900",
        "--answered-at",
        T0,
    ]);
    let derived_key = as_str(&stored, "derived_key").to_string();
    assert!(derived_key.starts_with("q_"));

    let fresh = run_json([
        "--root",
        path_str(&root),
        "cache",
        "lookup",
        "--source",
        "gemini",
        "--role",
        "reviewer",
        "--question",
        "is the queue bounded?",
        "--artifact",
        "src/lib.rs",
        "--as-of",
        T0_PLUS_1H,
    ]);
    assert!(as_bool(&fresh, "hit"));
    assert_eq!(as_str(&fresh, "derived_key"), derived_key);

    let expired = run_json([
        "--root",
        path_str(&root),
        "cache",
        "lookup",
        "--source",
        "gemini",
        "--role",
        "reviewer",
        "--question",
        "is the queue bounded?",
        "--artifact",
        "src/lib.rs",
        "--as-of",
        T0_PLUS_25H,
    ]);
    assert!(!as_bool(&expired, "hit"));
    assert!(expired.get("record").is_some_and(|record| !record.is_null()));

    let history = run_json([
        "--root",
        path_str(&root),
        "cache",
        "history",
        "--text",
        "bounded queue",
        "--as-of",
        T0_PLUS_25H,
    ]);
    assert_eq!(as_u64(&history, "count"), 1);
}

// Test IDs: TCLI-004
#[test]
fn malformed_timestamp_is_rejected() {
    let root = unique_temp_dir("patternmemory-cli-badtime");
    let mut args = add_pattern_args(
        &root,
        "verified-pattern",
        "stream the payload through a bounded reader",
        "buffer the entire payload into memory",
    );
    let last = args.len() - 1;
    args[last] = "2023-11-14 22:13:20".to_string();

    let output = run_pm(args);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid RFC3339 UTC timestamp"));
}
