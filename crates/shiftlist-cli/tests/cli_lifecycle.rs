#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::Value;
use shiftlist_cli::{run_cli, Cli};
use ulid::Ulid;

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("shiftlist-cli-{}.sqlite3", Ulid::new()))
}

fn invoke(db: &Path, args: &[&str]) -> Result<Value, String> {
    let mut argv = vec!["shiftlist", "--db"];
    let db_str = match db.to_str() {
        Some(value) => value,
        None => panic!("temp db path is not valid UTF-8"),
    };
    argv.push(db_str);
    argv.extend_from_slice(args);

    let cli = match Cli::try_parse_from(argv) {
        Ok(value) => value,
        Err(err) => panic!("argument parse failed for {:?}: {err}", args),
    };
    run_cli(cli).map_err(|err| format!("{err:#}"))
}

fn must(db: &Path, args: &[&str]) -> Value {
    match invoke(db, args) {
        Ok(value) => value,
        Err(err) => panic!("command {:?} failed: {err}", args),
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    match value.pointer(pointer).and_then(Value::as_str) {
        Some(text) => text,
        None => panic!("missing string at {pointer} in {value}"),
    }
}

const OPENING_SPEC: &str = r#"{
    "name": "Opening checks",
    "frequency": "daily",
    "due_time": "10:00",
    "escalation_minutes": 60,
    "roles": ["cook", "supervisor"],
    "items": [
        { "title": "Preheat ovens", "is_required": true },
        { "title": "Count till", "is_required": true, "roles": ["supervisor"] },
        { "title": "Wipe counters" }
    ]
}"#;

#[test]
fn checklist_add_then_show_round_trips() {
    let db = temp_db();

    let created = must(&db, &["checklist", "add", "--spec-json", OPENING_SPEC]);
    assert_eq!(str_at(&created, "/name"), "Opening checks");
    assert_eq!(str_at(&created, "/frequency"), "daily");
    assert_eq!(created.pointer("/escalation_minutes"), Some(&Value::from(60)));

    let id = str_at(&created, "/id").to_string();
    let shown = must(&db, &["checklist", "show", "--checklist-id", &id]);
    assert_eq!(shown, created);

    let listed = must(&db, &["checklist", "list", "--active-only"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    // The cashier role is on neither the checklist nor any item.
    let for_cashier = must(&db, &["checklist", "list", "--role", "cashier"]);
    assert_eq!(for_cashier.as_array().map(Vec::len), Some(0));
    let for_cook = must(&db, &["checklist", "list", "--role", "cook"]);
    assert_eq!(for_cook.as_array().map(Vec::len), Some(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn full_run_lifecycle_through_the_cli() {
    let db = temp_db();

    let created = must(&db, &["checklist", "add", "--spec-json", OPENING_SPEC]);
    let checklist_id = str_at(&created, "/id").to_string();
    let ovens = str_at(&created, "/items/0/id").to_string();
    let till = str_at(&created, "/items/1/id").to_string();

    let started = must(
        &db,
        &[
            "run", "start",
            "--checklist-id", &checklist_id,
            "--user-id", "alice",
            "--now", "2026-03-02T09:00:00Z",
        ],
    );
    assert_eq!(started.pointer("/resumed"), Some(&Value::Bool(false)));
    let run_id = str_at(&started, "/run/id").to_string();

    // Starting again resumes the same run instead of creating another.
    let resumed = must(
        &db,
        &[
            "run", "start",
            "--checklist-id", &checklist_id,
            "--user-id", "alice",
            "--now", "2026-03-02T09:05:00Z",
        ],
    );
    assert_eq!(resumed.pointer("/resumed"), Some(&Value::Bool(true)));
    assert_eq!(str_at(&resumed, "/run/id"), run_id);

    // A cook cannot toggle the supervisor-only till count.
    let denied = invoke(
        &db,
        &[
            "run", "toggle",
            "--run-id", &run_id,
            "--item-id", &till,
            "--roles", "cook",
            "--now", "2026-03-02T09:10:00Z",
        ],
    );
    match denied {
        Ok(value) => panic!("expected authorization failure, got {value}"),
        Err(err) => assert!(err.contains("not permitted"), "unexpected error: {err}"),
    }

    let toggled = must(
        &db,
        &[
            "run", "toggle",
            "--run-id", &run_id,
            "--item-id", &ovens,
            "--roles", "cook",
            "--notes", "both decks on",
            "--now", "2026-03-02T09:10:00Z",
        ],
    );
    assert_eq!(toggled.pointer("/progress"), Some(&Value::from(33)));

    // Required till count is still unchecked, so completion is rejected
    // and the run stays open.
    let blocked = invoke(
        &db,
        &["run", "complete", "--run-id", &run_id, "--now", "2026-03-02T09:30:00Z"],
    );
    match blocked {
        Ok(value) => panic!("expected completion gate, got {value}"),
        Err(err) => assert!(
            err.contains("required item(s) remain unchecked"),
            "unexpected error: {err}"
        ),
    }
    let shown = must(&db, &["run", "show", "--run-id", &run_id]);
    assert_eq!(str_at(&shown, "/status"), "in_progress");

    must(
        &db,
        &[
            "run", "toggle",
            "--run-id", &run_id,
            "--item-id", &till,
            "--roles", "supervisor",
            "--now", "2026-03-02T09:40:00Z",
        ],
    );
    let completed = must(
        &db,
        &["run", "complete", "--run-id", &run_id, "--now", "2026-03-02T09:45:00Z"],
    );
    assert_eq!(str_at(&completed, "/status"), "completed");
    assert_eq!(completed.pointer("/progress"), Some(&Value::from(67)));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn sweep_flags_runs_past_the_escalation_deadline() {
    let db = temp_db();

    let created = must(&db, &["checklist", "add", "--spec-json", OPENING_SPEC]);
    let checklist_id = str_at(&created, "/id").to_string();

    must(
        &db,
        &[
            "run", "start",
            "--checklist-id", &checklist_id,
            "--user-id", "bob",
            "--now", "2026-03-02T09:00:00Z",
        ],
    );

    // Due 10:00 plus 60 minutes of escalation; 10:30 is inside the window.
    let early = must(&db, &["sweep", "--now", "2026-03-02T10:30:00Z"]);
    assert_eq!(early.pointer("/flagged_overdue"), Some(&Value::from(0)));

    let late = must(&db, &["sweep", "--now", "2026-03-02T11:05:00Z"]);
    assert_eq!(late.pointer("/flagged_overdue"), Some(&Value::from(1)));

    let listed = must(&db, &["run", "list", "--status", "overdue"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn pending_excludes_checklists_already_started_on_the_date() {
    let db = temp_db();

    let created = must(&db, &["checklist", "add", "--spec-json", OPENING_SPEC]);
    let checklist_id = str_at(&created, "/id").to_string();

    let before = must(&db, &["checklist", "pending", "--date", "2026-03-02"]);
    assert_eq!(before.as_array().map(Vec::len), Some(1));

    must(
        &db,
        &[
            "run", "start",
            "--checklist-id", &checklist_id,
            "--user-id", "alice",
            "--now", "2026-03-02T08:00:00Z",
        ],
    );

    let after = must(&db, &["checklist", "pending", "--date", "2026-03-02"]);
    assert_eq!(after.as_array().map(Vec::len), Some(0));

    // The run only covers its own day; the daily checklist is pending
    // again the next morning.
    let next_day = must(&db, &["checklist", "pending", "--date", "2026-03-03"]);
    assert_eq!(next_day.as_array().map(Vec::len), Some(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn reports_cover_the_recorded_history() {
    let db = temp_db();

    let created = must(&db, &["checklist", "add", "--spec-json", OPENING_SPEC]);
    let checklist_id = str_at(&created, "/id").to_string();
    let ovens = str_at(&created, "/items/0/id").to_string();
    let till = str_at(&created, "/items/1/id").to_string();
    let counters = str_at(&created, "/items/2/id").to_string();

    let started = must(
        &db,
        &[
            "run", "start",
            "--checklist-id", &checklist_id,
            "--user-id", "alice",
            "--now", "2026-03-02T09:00:00Z",
        ],
    );
    let run_id = str_at(&started, "/run/id").to_string();
    for (item, role) in [(&ovens, "cook"), (&till, "supervisor"), (&counters, "cook")] {
        must(
            &db,
            &[
                "run", "toggle",
                "--run-id", &run_id,
                "--item-id", item,
                "--roles", role,
                "--now", "2026-03-02T09:10:00Z",
            ],
        );
    }
    must(
        &db,
        &["run", "complete", "--run-id", &run_id, "--now", "2026-03-02T09:30:00Z"],
    );

    let overview = must(&db, &["report", "overview", "--now", "2026-03-02T12:00:00Z"]);
    assert_eq!(overview.pointer("/started_today"), Some(&Value::from(1)));
    assert_eq!(overview.pointer("/overdue_runs"), Some(&Value::from(0)));
    assert_eq!(overview.pointer("/active_checklists"), Some(&Value::from(1)));

    // Overview and period accept the same status/checklist filters as the
    // other reports.
    let no_failed = must(
        &db,
        &["report", "overview", "--now", "2026-03-02T12:00:00Z", "--status", "failed"],
    );
    assert_eq!(no_failed.pointer("/started_today"), Some(&Value::from(0)));

    let week_completed = must(
        &db,
        &[
            "report", "period",
            "--bucket", "week",
            "--now", "2026-03-02T12:00:00Z",
            "--status", "completed",
            "--checklist-id", &checklist_id,
        ],
    );
    assert_eq!(week_completed.pointer("/total_runs"), Some(&Value::from(1)));
    let week_failed = must(
        &db,
        &[
            "report", "period",
            "--bucket", "week",
            "--now", "2026-03-02T12:00:00Z",
            "--status", "failed",
        ],
    );
    assert_eq!(week_failed.pointer("/total_runs"), Some(&Value::from(0)));

    let employees = must(
        &db,
        &["report", "employees", "--from", "2026-03-01", "--to", "2026-03-07"],
    );
    assert_eq!(str_at(&employees, "/0/key"), "alice");
    assert_eq!(
        employees.pointer("/0/average_completion_rate"),
        Some(&Value::from(100))
    );

    let trend = must(
        &db,
        &["report", "trend", "--from", "2026-03-01", "--to", "2026-03-03"],
    );
    assert_eq!(trend.as_array().map(Vec::len), Some(3));
    assert_eq!(trend.pointer("/1/run_count"), Some(&Value::from(1)));

    let dist = must(&db, &["report", "status-dist"]);
    assert_eq!(str_at(&dist, "/0/status"), "completed");
    assert_eq!(dist.pointer("/0/count"), Some(&Value::from(1)));

    let _ = std::fs::remove_file(&db);
}
