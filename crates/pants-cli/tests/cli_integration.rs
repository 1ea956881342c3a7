use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

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

fn run_pon<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pon"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pon binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_pon(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "pon command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    value
}

fn as_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn add_inquest(db: &Path, url: &str, created_at: &str) -> i64 {
    let value = run_json(
        db,
        ["inquest", "add", "--image-url", url, "--created-at", created_at],
    );
    as_i64(&value, "/inquest/id")
}

#[test]
fn db_migrate_dry_run_then_apply() {
    let dir = unique_temp_dir("pon-migrate");
    let db = dir.join("pants.sqlite3");

    let plan = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(as_i64(&applied, "/after_version"), 2);
    assert_eq!(applied.get("up_to_date").and_then(Value::as_bool), Some(true));

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(as_i64(&status, "/current_version"), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn inquest_commands_walk_the_timeline() {
    let dir = unique_temp_dir("pon-inquest");
    let db = dir.join("pants.sqlite3");

    let older = add_inquest(&db, "http://foo.com/cabinet.jpg", "2024-01-01T00:00:00Z");
    let newer = add_inquest(&db, "http://baz.com/guitar.gif", "2024-01-06T00:00:00Z");

    let shown = run_json(&db, ["inquest", "show", "--id", &older.to_string()]);
    assert_eq!(as_str(&shown, "/inquest/image_url"), "http://foo.com/cabinet.jpg");
    assert_eq!(as_i64(&shown, "/successor_id"), newer);
    assert!(shown.get("predecessor_id").is_some_and(Value::is_null));

    let latest = run_json(&db, ["inquest", "latest"]);
    assert_eq!(as_str(&latest, "/state"), "found");
    assert_eq!(as_i64(&latest, "/inquest/inquest/id"), newer);

    let listed = run_json(&db, ["inquest", "list", "--limit", "1"]);
    assert_eq!(as_i64(&listed, "/count"), 1);
    assert_eq!(as_i64(&listed, "/inquests/0/id"), newer);

    let random =
        run_json(&db, ["inquest", "random", "--exclude", &newer.to_string()]);
    assert_eq!(as_i64(&random, "/pick/inquest/inquest/id"), older);

    let exhausted = run_json(
        &db,
        ["inquest", "random", "--exclude", &older.to_string(), "--exclude", &newer.to_string()],
    );
    assert_eq!(as_str(&exhausted, "/pick/state"), "none");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn invalid_inputs_exit_non_zero() {
    let dir = unique_temp_dir("pon-invalid");
    let db = dir.join("pants.sqlite3");

    let output = run_pon(&db, ["inquest", "add", "--image-url", "umlauts rock!"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not a fully-qualified URL"));

    let output = run_pon(&db, ["inquest", "show", "--id", "68381"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));

    let inquest = add_inquest(&db, "http://animals.org/tortoise.png", "2024-02-01T00:00:00Z");
    let output =
        run_pon(&db, ["ruling", "add", "--inquest-id", &inquest.to_string(), "--vote", "fazbot"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not included in the list"));

    let output = run_pon(&db, ["ruling", "add", "--inquest-id", "1923942", "--vote", "yes"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must exist"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn rulings_are_recorded_and_tallied() {
    let dir = unique_temp_dir("pon-ruling");
    let db = dir.join("pants.sqlite3");
    let inquest = add_inquest(&db, "http://myimageserver.com/images/1.png", "2024-03-01T00:00:00Z");
    let id = inquest.to_string();

    for vote in ["yes", "yes", "no", "not_sure"] {
        let ruling = run_json(&db, ["ruling", "add", "--inquest-id", &id, "--vote", vote]);
        assert_eq!(as_str(&ruling, "/vote"), vote);
        assert_eq!(as_i64(&ruling, "/inquest_id"), inquest);
    }

    let listed = run_json(&db, ["ruling", "list", "--inquest-id", &id]);
    assert_eq!(as_i64(&listed, "/tally/yes"), 2);
    assert_eq!(as_i64(&listed, "/tally/no"), 1);
    assert_eq!(as_i64(&listed, "/tally/not_sure"), 1);
    assert_eq!(listed.get("rulings").and_then(Value::as_array).map(Vec::len), Some(4));

    let _ = fs::remove_dir_all(&dir);
}
