use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

const BASE_URL: &str = "https://turbine.example.cloud";

const PAGE_URL: &str =
    "https://turbine.example.cloud/environments/billing-service-prod/view/DEPLOYMENTS";

const PAGE_HTML: &str = r#"<html><body><div class="deployments-wrapper">
  <turbine-deployment-pane>
    <div class="deployment__body--name"><a href="/components/billing-api">billing-api</a></div>
    <div class="deployment__body--versions"><span class="badge-release">4.2.0</span></div>
    <div class="deployment__body--env-type"><span class="badge__env-type">kubernetes</span></div>
  </turbine-deployment-pane>
  <turbine-deployment-pane>
    <div class="deployment__body--name">
      <a href="/components/billing-worker">billing-worker</a>
    </div>
    <div class="deployment__body--versions"><span class="badge-snapshot">main-SNAPSHOT</span></div>
  </turbine-deployment-pane>
</div></body></html>"#;

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

fn path_str(path: &Path) -> &str {
    path.to_str()
        .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_tn<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tn"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tn binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tn(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "tn command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value["contract_version"], "cli.v1");
    value
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

// Test IDs: TCLI-001
#[test]
fn settings_round_trip_strips_trailing_slashes() {
    let dir = unique_temp_dir("tn-settings");
    let db = dir.join("turbine.sqlite3");

    let shown = run_json(&db, ["settings", "show"]);
    assert_eq!(shown["configured"], false);

    let slashed = format!("{BASE_URL}//");
    let saved = run_json(&db, ["settings", "set", "--base-url", &slashed]);
    assert_eq!(as_str(&saved, "base_url"), BASE_URL);
    assert_eq!(run_json(&db, ["settings", "show"])["configured"], true);

    let reset = run_json(&db, ["settings", "reset"]);
    assert_eq!(as_str(&reset, "base_url"), "");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn visits_populate_recent_list_and_links() {
    let dir = unique_temp_dir("tn-recent");
    let db = dir.join("turbine.sqlite3");
    run_json(&db, ["settings", "set", "--base-url", BASE_URL]);

    let qa_url = format!("{BASE_URL}/environments/orders-qa/view/DEPLOYMENTS");
    let first = run_json(&db, ["visit", "--url", &qa_url]);
    assert_eq!(first["recorded"], true);
    let prod_url = format!("{BASE_URL}/environments/orders-prod/view/DEPLOYMENTS");
    let second = run_json(&db, ["visit", "--url", &prod_url]);
    assert_eq!(second["visit"]["qa_uat1_preference"], "qa");

    let foreign_url = "https://elsewhere/environments/orders-dev/view/DEPLOYMENTS";
    let foreign = run_json(&db, ["visit", "--url", foreign_url]);
    assert_eq!(foreign["recorded"], false);

    let listed = run_json(&db, ["recent", "list", "--query", "ORD"]);
    let items = listed["items"]
        .as_array()
        .unwrap_or_else(|| panic!("items should be an array: {listed}"));
    assert_eq!(items.len(), 1);
    assert_eq!(as_str(&items[0], "last_visited"), "Just now");
    let id = as_str(&items[0], "id").to_string();

    let links = run_json(&db, ["recent", "links", "--id", &id]);
    let links = links["links"]
        .as_array()
        .unwrap_or_else(|| panic!("links should be an array"));
    assert_eq!(links.len(), 5);
    assert!(links.iter().all(|link| link["environment"] != "uat1"));

    let removed = run_json(&db, ["recent", "remove", "--id", &id]);
    assert_eq!(removed["removed"], true);
    let listed = run_json(&db, ["recent", "list"]);
    assert_eq!(listed["items"].as_array().map(Vec::len), Some(0));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn ingest_table_matrix_and_visibility() {
    let dir = unique_temp_dir("tn-components");
    let db = dir.join("turbine.sqlite3");
    let batch = dir.join("batch.json");
    let message = json!({
        "type": "COMPONENT_DATA",
        "payload": [
            {
                "component_name": "api",
                "version": "1.1.0",
                "namespace": "svc",
                "environment": "dev",
                "env_type": "dev",
                "extracted_at": "2026-01-05T10:00:00Z"
            },
            {
                "component_name": "api",
                "version": "1.0.0",
                "namespace": "svc",
                "environment": "prod",
                "env_type": "prod",
                "extracted_at": "2026-01-05T10:00:00Z"
            }
        ]
    });
    fs::write(&batch, message.to_string())
        .unwrap_or_else(|err| panic!("failed to write batch file: {err}"));

    let ingested = run_json(&db, ["components", "ingest", "--file", path_str(&batch)]);
    assert_eq!(ingested["records"], 2);
    assert_eq!(ingested["keys"].as_array().map(Vec::len), Some(2));

    let table = run_json(&db, ["components", "table"]);
    let api = &table["namespaces"]["svc"]["components"]["api"];
    assert_eq!(api["dev"]["version"], "1.1.0");
    assert_eq!(api["prod"]["version"], "1.0.0");

    let output = run_tn(&db, ["components", "matrix", "--text"]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("svc (1 component)"));
    assert!(text.contains("DEV"));
    assert!(text.contains("PROD"));

    let visible = run_json(&db, ["envs", "toggle", "--env", "dev"]);
    let shown = visible["visible"].as_array();
    assert!(shown.is_some_and(|envs| !envs.contains(&Value::from("dev"))));
    let matrix = run_json(&db, ["components", "matrix"]);
    assert_eq!(matrix["namespaces"][0]["environments"], json!(["prod"]));
    let restored = run_json(&db, ["envs", "show-all"]);
    assert_eq!(restored["visible"].as_array().map(Vec::len), Some(6));

    let deleted = run_json(&db, ["components", "delete-namespace", "--namespace", "svc"]);
    assert_eq!(deleted["removed"], 2);
    let output = run_tn(&db, ["components", "matrix", "--text"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("No component data available"));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn scrape_extracts_and_optionally_stores() {
    let dir = unique_temp_dir("tn-scrape");
    let db = dir.join("turbine.sqlite3");
    let page = dir.join("page.html");
    fs::write(&page, PAGE_HTML).unwrap_or_else(|err| panic!("failed to write page: {err}"));
    let page_arg = path_str(&page);

    let dry = run_json(&db, ["scrape", "--url", PAGE_URL, "--html", page_arg]);
    assert_eq!(dry["sent"], false);
    assert_eq!(dry["records"].as_array().map(Vec::len), Some(2));
    assert_eq!(dry["records"][1]["env_type"], "prod");

    let sent = run_json(&db, ["scrape", "--url", PAGE_URL, "--html", page_arg, "--send"]);
    assert_eq!(sent["ack"]["success"], true);

    let table = run_json(&db, ["components", "table"]);
    assert_eq!(
        table["namespaces"]["billing-service"]["components"]["billing-worker"]["prod"]["version"],
        "main-SNAPSHOT"
    );

    let service_only = [
        "scrape",
        "--url",
        PAGE_URL,
        "--html",
        page_arg,
        "--service",
        "http://127.0.0.1:9",
    ];
    let unsent = run_tn(&db, service_only);
    assert!(!unsent.status.success());
    assert!(String::from_utf8_lossy(&unsent.stderr).contains("--send"));

    let empty = dir.join("empty.html");
    fs::write(&empty, "<html><body></body></html>")
        .unwrap_or_else(|err| panic!("failed to write page: {err}"));
    let empty_arg = path_str(&empty);
    let none = run_json(&db, ["scrape", "--url", PAGE_URL, "--html", empty_arg, "--send"]);
    assert_eq!(none["sent"], false);
    assert_eq!(none["records"].as_array().map(Vec::len), Some(0));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-005
#[test]
fn watch_runs_initial_extraction_into_local_database() {
    let dir = unique_temp_dir("tn-watch");
    let db = dir.join("turbine.sqlite3");
    let page = dir.join("page.html");
    fs::write(&page, PAGE_HTML).unwrap_or_else(|err| panic!("failed to write page: {err}"));

    let watch = [
        "watch",
        "--url",
        PAGE_URL,
        "--html",
        path_str(&page),
        "--duration-ms",
        "2000",
    ];
    let report = run_json(&db, watch);
    assert_eq!(report["extractions"], 1);
    assert_eq!(report["batches_sent"], 1);
    assert_eq!(report["observing"], true);

    let table = run_json(&db, ["components", "table"]);
    assert!(table["namespaces"]["billing-service"].is_object());

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-006
#[test]
fn navigation_needs_base_url() {
    let dir = unique_temp_dir("tn-nav");
    let db = dir.join("turbine.sqlite3");

    let output = run_tn(&db, ["nav", "url", "--namespace", "svc", "--env", "prep"]);
    assert!(!output.status.success());

    run_json(&db, ["settings", "set", "--base-url", "https://host/"]);
    let built = run_json(&db, ["nav", "url", "--namespace", "svc", "--env", "prep"]);
    assert_eq!(
        as_str(&built, "url"),
        "https://host/environments/svc-prep/view/DEPLOYMENTS"
    );

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-007
#[test]
fn db_commands_report_schema_and_backup() {
    let dir = unique_temp_dir("tn-db");
    let db = dir.join("turbine.sqlite3");

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status["pending_versions"], json!([1]));

    let planned = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(planned["dry_run"], true);
    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied["up_to_date"], true);

    let integrity = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(integrity["ok"], true);

    let backup = dir.join("backups").join("copy.sqlite3");
    run_json(&db, ["db", "backup", "--out", path_str(&backup)]);
    assert!(backup.exists());

    let _ = fs::remove_dir_all(&dir);
}
