//! SQLite-backed history store and checklist catalog for shiftlist.
//!
//! The store owns every mutation of run state: each lifecycle operation
//! loads the run, applies the pure transition from `shiftlist-core`, and
//! persists the result inside one write transaction. SQLite serializes
//! writers, so a completion check always sees every toggle acknowledged
//! before it. Run uniqueness is a schema constraint, not a read-then-write
//! check in application code.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use shiftlist_core::{
    build_run, format_rfc3339, is_overdue, parse_rfc3339_utc, Checklist, ChecklistError,
    ChecklistId, ChecklistItem, Evidence, Frequency, ItemId, RoleId, Run, RunFilter, RunId,
    RunStatus, UserId,
};
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time, Weekday};
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS checklists (
  checklist_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  frequency TEXT NOT NULL CHECK (
    frequency IN ('daily','weekly','monthly','quarterly','half_yearly','yearly')
  ),
  due_time TEXT,
  week_day TEXT CHECK (
    week_day IN ('monday','tuesday','wednesday','thursday','friday','saturday','sunday')
    OR week_day IS NULL
  ),
  month_day INTEGER CHECK (month_day BETWEEN 1 AND 31 OR month_day IS NULL),
  escalation_minutes INTEGER NOT NULL CHECK (escalation_minutes >= 1),
  requires_photo_evidence INTEGER NOT NULL DEFAULT 0 CHECK (requires_photo_evidence IN (0, 1)),
  roles_json TEXT NOT NULL DEFAULT '[]',
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS checklist_items (
  item_id TEXT PRIMARY KEY,
  checklist_id TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  item_order INTEGER NOT NULL,
  is_required INTEGER NOT NULL DEFAULT 0 CHECK (is_required IN (0, 1)),
  roles_json TEXT NOT NULL DEFAULT '[]',
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checklist_items_checklist
  ON checklist_items(checklist_id, item_order);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  checklist_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('in_progress','completed','overdue','failed')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  requires_photo_evidence INTEGER NOT NULL DEFAULT 0 CHECK (requires_photo_evidence IN (0, 1)),
  failure_reason TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
  ON runs(checklist_id, user_id) WHERE status = 'in_progress';
CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
CREATE INDEX IF NOT EXISTS idx_runs_checklist ON runs(checklist_id, started_at);
CREATE INDEX IF NOT EXISTS idx_runs_user ON runs(user_id, started_at);

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs are never deleted');
END;

CREATE TABLE IF NOT EXISTS run_evidence (
  run_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  title TEXT NOT NULL,
  is_required INTEGER NOT NULL DEFAULT 0 CHECK (is_required IN (0, 1)),
  roles_json TEXT NOT NULL DEFAULT '[]',
  checklist_roles_json TEXT NOT NULL DEFAULT '[]',
  item_order INTEGER NOT NULL,
  checked INTEGER NOT NULL DEFAULT 0 CHECK (checked IN (0, 1)),
  notes TEXT,
  file_ref TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (run_id, item_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_run_evidence_no_delete
BEFORE DELETE ON run_evidence
BEGIN
  SELECT RAISE(FAIL, 'run_evidence rows are never deleted');
END;
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Typed domain failure from the core; callers match on this to show
    /// specific user-facing messages.
    #[error(transparent)]
    Domain(#[from] ChecklistError),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of `start_run`: `resumed` is true when an `in_progress` run for
/// the same (user, checklist) pair already existed and was returned
/// instead of a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartedRun {
    pub run: Run,
    pub resumed: bool,
}

pub struct ShiftlistStore {
    conn: Connection,
}

impl ShiftlistStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Applies schema v1. Idempotent; safe to call on every open.
    pub fn migrate(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        self.conn.execute_batch(SCHEMA_V1)?;
        let now = format_rfc3339(shiftlist_core::now_utc())?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now],
        )?;
        info!(version = SCHEMA_VERSION, "schema migration applied");
        Ok(())
    }

    // -- checklist catalog --------------------------------------------------

    /// Inserts or updates a checklist and its items. Item rows are updated
    /// in place by id, so item identity survives edits; items missing from
    /// the new definition are removed.
    pub fn upsert_checklist(&mut self, checklist: &Checklist) -> StoreResult<()> {
        checklist.validate()?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO checklists(
                checklist_id, name, description, frequency, due_time, week_day,
                month_day, escalation_minutes, requires_photo_evidence, roles_json, is_active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(checklist_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                frequency = excluded.frequency,
                due_time = excluded.due_time,
                week_day = excluded.week_day,
                month_day = excluded.month_day,
                escalation_minutes = excluded.escalation_minutes,
                requires_photo_evidence = excluded.requires_photo_evidence,
                roles_json = excluded.roles_json,
                is_active = excluded.is_active",
            params![
                checklist.id.to_string(),
                checklist.name,
                checklist.description,
                checklist.frequency.as_str(),
                encode_time(checklist.due_time)?,
                checklist.week_day.map(weekday_to_str),
                checklist.month_day.map(i64::from),
                i64::from(checklist.escalation_minutes),
                i64::from(checklist.requires_photo_evidence),
                encode_roles(&checklist.roles)?,
                i64::from(checklist.is_active),
            ],
        )?;

        for item in &checklist.items {
            tx.execute(
                "INSERT INTO checklist_items(
                    item_id, checklist_id, title, description, item_order, is_required, roles_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(item_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    item_order = excluded.item_order,
                    is_required = excluded.is_required,
                    roles_json = excluded.roles_json",
                params![
                    item.id.to_string(),
                    checklist.id.to_string(),
                    item.title,
                    item.description,
                    i64::from(item.order),
                    i64::from(item.is_required),
                    encode_roles(&item.roles)?,
                ],
            )?;
        }

        let kept: Vec<String> = checklist.items.iter().map(|item| item.id.to_string()).collect();
        if kept.is_empty() {
            tx.execute(
                "DELETE FROM checklist_items WHERE checklist_id = ?1",
                params![checklist.id.to_string()],
            )?;
        } else {
            let placeholders = (0..kept.len())
                .map(|idx| format!("?{}", idx + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "DELETE FROM checklist_items WHERE checklist_id = ?1 AND item_id NOT IN ({placeholders})"
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(kept.len() + 1);
            let checklist_id = checklist.id.to_string();
            values.push(&checklist_id);
            for id in &kept {
                values.push(id);
            }
            tx.execute(&sql, values.as_slice())?;
        }

        tx.commit()?;
        debug!(checklist_id = %checklist.id, items = checklist.items.len(), "checklist upserted");
        Ok(())
    }

    pub fn get_checklist(&self, checklist_id: ChecklistId) -> StoreResult<Option<Checklist>> {
        load_checklist(&self.conn, checklist_id)
    }

    pub fn list_checklists(&self, active_only: bool) -> StoreResult<Vec<Checklist>> {
        let sql = if active_only {
            "SELECT checklist_id FROM checklists WHERE is_active = 1 ORDER BY name ASC"
        } else {
            "SELECT checklist_id FROM checklists ORDER BY name ASC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut checklists = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = parse_checklist_id(&raw)?;
            if let Some(checklist) = load_checklist(&self.conn, id)? {
                checklists.push(checklist);
            }
        }
        Ok(checklists)
    }

    /// Deletes a checklist; the schema cascades to its items. Run history
    /// referencing the checklist stays untouched.
    pub fn delete_checklist(&mut self, checklist_id: ChecklistId) -> StoreResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM checklists WHERE checklist_id = ?1",
            params![checklist_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    /// Explicit administrative action from the role resolver: persists the
    /// checklist-level roles onto every item.
    pub fn apply_checklist_roles_to_items(
        &mut self,
        checklist_id: ChecklistId,
    ) -> StoreResult<Checklist> {
        let checklist = self
            .get_checklist(checklist_id)?
            .ok_or(ChecklistError::ChecklistNotFound { checklist_id })?;
        let updated = shiftlist_core::apply_checklist_roles_to_all_items(&checklist);
        self.upsert_checklist(&updated)?;
        Ok(updated)
    }

    // -- run lifecycle ------------------------------------------------------

    /// Starts a run, or resumes the existing `in_progress` one. The partial
    /// unique index on `runs` makes this idempotent under concurrent calls:
    /// the second insert hits the constraint and is translated into a
    /// resume, never surfaced as a storage error.
    pub fn start_run(
        &mut self,
        checklist_id: ChecklistId,
        user_id: &UserId,
        now: OffsetDateTime,
    ) -> StoreResult<StartedRun> {
        let checklist = self
            .get_checklist(checklist_id)?
            .ok_or(ChecklistError::ChecklistNotFound { checklist_id })?;
        let run = build_run(&checklist, user_id.clone(), now)?;

        let tx = self.conn.transaction()?;
        match insert_run(&tx, &run) {
            Ok(()) => {
                tx.commit()?;
                info!(run_id = %run.id, checklist_id = %checklist_id, user_id = %user_id, "run started");
                Ok(StartedRun { run, resumed: false })
            }
            Err(StoreError::Storage(err)) if is_unique_violation(&err) => {
                drop(tx);
                let existing = self.find_active_run(checklist_id, user_id)?.ok_or_else(|| {
                    StoreError::Corrupt(
                        "active run missing after uniqueness conflict".to_string(),
                    )
                })?;
                debug!(run_id = %existing.id, user_id = %user_id, "resumed existing in-progress run");
                Ok(StartedRun {
                    run: existing,
                    resumed: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn find_active_run(
        &self,
        checklist_id: ChecklistId,
        user_id: &UserId,
    ) -> StoreResult<Option<Run>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM runs
                 WHERE checklist_id = ?1 AND user_id = ?2 AND status = 'in_progress'",
                params![checklist_id.to_string(), user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(value) => load_run(&self.conn, parse_run_id(&value)?),
            None => Ok(None),
        }
    }

    /// Records evidence for one item inside a write transaction, so a
    /// racing completion observes the toggle or runs strictly before it.
    pub fn toggle_item(
        &mut self,
        run_id: RunId,
        item_id: ItemId,
        checked: bool,
        notes: Option<String>,
        file_ref: Option<String>,
        user_roles: &BTreeSet<RoleId>,
        now: OffsetDateTime,
    ) -> StoreResult<Run> {
        let tx = self.conn.transaction()?;
        let mut run = load_run(&tx, run_id)?.ok_or(ChecklistError::RunNotFound { run_id })?;
        shiftlist_core::toggle_item(
            &mut run, item_id, checked, notes, file_ref, user_roles, now,
        )?;

        let row = run
            .evidence
            .iter()
            .find(|row| row.item_id == item_id)
            .ok_or_else(|| StoreError::Corrupt("toggled evidence row vanished".to_string()))?;
        tx.execute(
            "UPDATE run_evidence
             SET checked = ?1, notes = ?2, file_ref = ?3, updated_at = ?4
             WHERE run_id = ?5 AND item_id = ?6",
            params![
                i64::from(row.checked),
                row.notes,
                row.file_ref,
                format_rfc3339(row.updated_at)?,
                run_id.to_string(),
                item_id.to_string(),
            ],
        )?;
        tx.commit()?;
        debug!(run_id = %run_id, item_id = %item_id, checked, "evidence toggled");
        Ok(run)
    }

    /// Completes a run. The required-item and photo-evidence checks read
    /// inside the same transaction that writes the status, so they are
    /// linearizable with every acknowledged toggle.
    pub fn complete_run(&mut self, run_id: RunId, now: OffsetDateTime) -> StoreResult<Run> {
        let tx = self.conn.transaction()?;
        let mut run = load_run(&tx, run_id)?.ok_or(ChecklistError::RunNotFound { run_id })?;
        shiftlist_core::complete_run(&mut run, now)?;
        persist_run_status(&tx, &run)?;
        tx.commit()?;
        info!(run_id = %run_id, "run completed");
        Ok(run)
    }

    /// Sweep transition; idempotent, no-op when the run is already overdue
    /// or terminal.
    pub fn mark_overdue(&mut self, run_id: RunId) -> StoreResult<Run> {
        let tx = self.conn.transaction()?;
        let mut run = load_run(&tx, run_id)?.ok_or(ChecklistError::RunNotFound { run_id })?;
        if shiftlist_core::mark_overdue(&mut run) {
            persist_run_status(&tx, &run)?;
            info!(run_id = %run_id, "run marked overdue");
        }
        tx.commit()?;
        Ok(run)
    }

    /// Explicit close-out, e.g. from a period-close job.
    pub fn mark_failed(
        &mut self,
        run_id: RunId,
        reason: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Run> {
        let tx = self.conn.transaction()?;
        let mut run = load_run(&tx, run_id)?.ok_or(ChecklistError::RunNotFound { run_id })?;
        if shiftlist_core::mark_failed(&mut run, reason, now) {
            persist_run_status(&tx, &run)?;
            info!(run_id = %run_id, reason, "run marked failed");
        }
        tx.commit()?;
        Ok(run)
    }

    /// Flags every `in_progress` run past its escalation deadline. Runs
    /// whose checklist no longer exists are skipped. Returns how many runs
    /// were flagged; safe to re-run.
    pub fn sweep_overdue(&mut self, now: OffsetDateTime) -> StoreResult<usize> {
        let catalog: BTreeMap<ChecklistId, Checklist> = self
            .list_checklists(false)?
            .into_iter()
            .map(|checklist| (checklist.id, checklist))
            .collect();

        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt =
                tx.prepare("SELECT run_id FROM runs WHERE status = 'in_progress'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut flagged = 0_usize;
        for raw in ids {
            let run_id = parse_run_id(&raw)?;
            let Some(mut run) = load_run(&tx, run_id)? else {
                continue;
            };
            let Some(checklist) = catalog.get(&run.checklist_id) else {
                continue;
            };
            if is_overdue(&run, checklist, now) && shiftlist_core::mark_overdue(&mut run) {
                persist_run_status(&tx, &run)?;
                flagged += 1;
            }
        }
        tx.commit()?;
        info!(flagged, "overdue sweep finished");
        Ok(flagged)
    }

    // -- history queries ----------------------------------------------------

    pub fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        load_run(&self.conn, run_id)
    }

    /// Runs for analytics, filtered by start date range (inclusive) and the
    /// optional status/checklist filter, ordered by start time.
    pub fn list_runs(
        &self,
        range: Option<(Date, Date)>,
        filter: &RunFilter,
    ) -> StoreResult<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id FROM runs ORDER BY started_at ASC, run_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut runs = Vec::new();
        for raw in ids {
            let Some(run) = load_run(&self.conn, parse_run_id(&raw)?)? else {
                continue;
            };
            if let Some((start, end)) = range {
                let date = run.started_at.date();
                if date < start || date > end {
                    continue;
                }
            }
            if filter.matches(&run) {
                runs.push(run);
            }
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// row plumbing
// ---------------------------------------------------------------------------

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn insert_run(conn: &Connection, run: &Run) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO runs(
            run_id, checklist_id, user_id, status, started_at,
            completed_at, requires_photo_evidence, failure_reason
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            run.id.to_string(),
            run.checklist_id.to_string(),
            run.user_id.as_str(),
            run.status.as_str(),
            format_rfc3339(run.started_at)?,
            run.completed_at.map(format_rfc3339).transpose()?,
            i64::from(run.requires_photo_evidence),
            run.failure_reason,
        ],
    )?;

    for row in &run.evidence {
        conn.execute(
            "INSERT INTO run_evidence(
                run_id, item_id, title, is_required, roles_json,
                checklist_roles_json, item_order, checked, notes, file_ref, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id.to_string(),
                row.item_id.to_string(),
                row.title,
                i64::from(row.is_required),
                encode_roles(&row.roles)?,
                encode_roles(&row.checklist_roles)?,
                i64::from(row.order),
                i64::from(row.checked),
                row.notes,
                row.file_ref,
                format_rfc3339(row.updated_at)?,
            ],
        )?;
    }
    Ok(())
}

fn persist_run_status(conn: &Connection, run: &Run) -> StoreResult<()> {
    conn.execute(
        "UPDATE runs SET status = ?1, completed_at = ?2, failure_reason = ?3 WHERE run_id = ?4",
        params![
            run.status.as_str(),
            run.completed_at.map(format_rfc3339).transpose()?,
            run.failure_reason,
            run.id.to_string(),
        ],
    )?;
    Ok(())
}

struct RawChecklistRow {
    name: String,
    description: String,
    frequency: String,
    due_time: Option<String>,
    week_day: Option<String>,
    month_day: Option<i64>,
    escalation_minutes: i64,
    requires_photo_evidence: i64,
    roles_json: String,
    is_active: i64,
}

fn load_checklist(conn: &Connection, checklist_id: ChecklistId) -> StoreResult<Option<Checklist>> {
    let raw = conn
        .query_row(
            "SELECT name, description, frequency, due_time, week_day, month_day,
                    escalation_minutes, requires_photo_evidence, roles_json, is_active
             FROM checklists WHERE checklist_id = ?1",
            params![checklist_id.to_string()],
            |row| {
                Ok(RawChecklistRow {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    frequency: row.get(2)?,
                    due_time: row.get(3)?,
                    week_day: row.get(4)?,
                    month_day: row.get(5)?,
                    escalation_minutes: row.get(6)?,
                    requires_photo_evidence: row.get(7)?,
                    roles_json: row.get(8)?,
                    is_active: row.get(9)?,
                })
            },
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT item_id, title, description, item_order, is_required, roles_json
         FROM checklist_items WHERE checklist_id = ?1 ORDER BY item_order ASC",
    )?;
    let raw_items = stmt
        .query_map(params![checklist_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(raw_items.len());
    for (id, title, description, order, is_required, roles_json) in raw_items {
        items.push(ChecklistItem {
            id: parse_item_id(&id)?,
            title,
            description,
            order: to_u32(order, "item_order")?,
            is_required: is_required != 0,
            roles: decode_roles(&roles_json)?,
        });
    }

    let frequency = Frequency::parse(&raw.frequency)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown frequency '{}'", raw.frequency)))?;

    Ok(Some(Checklist {
        id: checklist_id,
        name: raw.name,
        description: raw.description,
        frequency,
        due_time: raw.due_time.as_deref().map(decode_time).transpose()?,
        week_day: raw.week_day.as_deref().map(weekday_from_str).transpose()?,
        month_day: raw
            .month_day
            .map(|value| {
                u8::try_from(value)
                    .map_err(|_| StoreError::Corrupt(format!("month_day out of range: {value}")))
            })
            .transpose()?,
        escalation_minutes: to_u32(raw.escalation_minutes, "escalation_minutes")?,
        requires_photo_evidence: raw.requires_photo_evidence != 0,
        roles: decode_roles(&raw.roles_json)?,
        items,
        is_active: raw.is_active != 0,
    }))
}

struct RawRunRow {
    checklist_id: String,
    user_id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    requires_photo_evidence: i64,
    failure_reason: Option<String>,
}

fn load_run(conn: &Connection, run_id: RunId) -> StoreResult<Option<Run>> {
    let raw = conn
        .query_row(
            "SELECT checklist_id, user_id, status, started_at, completed_at,
                    requires_photo_evidence, failure_reason
             FROM runs WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| {
                Ok(RawRunRow {
                    checklist_id: row.get(0)?,
                    user_id: row.get(1)?,
                    status: row.get(2)?,
                    started_at: row.get(3)?,
                    completed_at: row.get(4)?,
                    requires_photo_evidence: row.get(5)?,
                    failure_reason: row.get(6)?,
                })
            },
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT item_id, title, is_required, roles_json, checklist_roles_json,
                item_order, checked, notes, file_ref, updated_at
         FROM run_evidence WHERE run_id = ?1 ORDER BY item_order ASC",
    )?;
    let raw_evidence = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut evidence = Vec::with_capacity(raw_evidence.len());
    for (
        item_id,
        title,
        is_required,
        roles_json,
        checklist_roles_json,
        order,
        checked,
        notes,
        file_ref,
        updated_at,
    ) in raw_evidence
    {
        evidence.push(Evidence {
            item_id: parse_item_id(&item_id)?,
            title,
            is_required: is_required != 0,
            roles: decode_roles(&roles_json)?,
            checklist_roles: decode_roles(&checklist_roles_json)?,
            order: to_u32(order, "item_order")?,
            checked: checked != 0,
            notes,
            file_ref,
            updated_at: parse_stored_ts(&updated_at)?,
        });
    }

    let status = RunStatus::parse(&raw.status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status '{}'", raw.status)))?;
    let user_id = UserId::parse(&raw.user_id)
        .map_err(|err| StoreError::Corrupt(format!("stored user id: {err}")))?;

    Ok(Some(Run {
        id: run_id,
        checklist_id: parse_checklist_id(&raw.checklist_id)?,
        user_id,
        status,
        started_at: parse_stored_ts(&raw.started_at)?,
        completed_at: raw.completed_at.as_deref().map(parse_stored_ts).transpose()?,
        requires_photo_evidence: raw.requires_photo_evidence != 0,
        failure_reason: raw.failure_reason,
        evidence,
    }))
}

// ---------------------------------------------------------------------------
// encoding helpers
// ---------------------------------------------------------------------------

fn encode_roles(roles: &BTreeSet<RoleId>) -> StoreResult<String> {
    let slugs: Vec<&str> = roles.iter().map(RoleId::as_str).collect();
    serde_json::to_string(&slugs)
        .map_err(|err| StoreError::Corrupt(format!("failed to encode roles: {err}")))
}

fn decode_roles(json: &str) -> StoreResult<BTreeSet<RoleId>> {
    let slugs: Vec<String> = serde_json::from_str(json)
        .map_err(|err| StoreError::Corrupt(format!("invalid roles JSON '{json}': {err}")))?;
    slugs
        .iter()
        .map(|slug| {
            RoleId::parse(slug).map_err(|err| StoreError::Corrupt(format!("stored role: {err}")))
        })
        .collect()
}

fn encode_time(value: Option<Time>) -> StoreResult<Option<String>> {
    let format = format_description!("[hour]:[minute]:[second]");
    value
        .map(|t| {
            t.format(&format)
                .map_err(|err| StoreError::Corrupt(format!("failed to format time: {err}")))
        })
        .transpose()
}

fn decode_time(value: &str) -> StoreResult<Time> {
    let format = format_description!("[hour]:[minute]:[second]");
    Time::parse(value, &format)
        .map_err(|err| StoreError::Corrupt(format!("invalid stored time '{value}': {err}")))
}

fn weekday_to_str(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "monday",
        Weekday::Tuesday => "tuesday",
        Weekday::Wednesday => "wednesday",
        Weekday::Thursday => "thursday",
        Weekday::Friday => "friday",
        Weekday::Saturday => "saturday",
        Weekday::Sunday => "sunday",
    }
}

fn weekday_from_str(value: &str) -> StoreResult<Weekday> {
    match value {
        "monday" => Ok(Weekday::Monday),
        "tuesday" => Ok(Weekday::Tuesday),
        "wednesday" => Ok(Weekday::Wednesday),
        "thursday" => Ok(Weekday::Thursday),
        "friday" => Ok(Weekday::Friday),
        "saturday" => Ok(Weekday::Saturday),
        "sunday" => Ok(Weekday::Sunday),
        _ => Err(StoreError::Corrupt(format!("unknown weekday '{value}'"))),
    }
}

fn parse_stored_ts(value: &str) -> StoreResult<OffsetDateTime> {
    parse_rfc3339_utc(value)
        .map_err(|err| StoreError::Corrupt(format!("stored timestamp: {err}")))
}

fn parse_checklist_id(value: &str) -> StoreResult<ChecklistId> {
    ChecklistId::parse(value)
        .map_err(|err| StoreError::Corrupt(format!("stored checklist id: {err}")))
}

fn parse_item_id(value: &str) -> StoreResult<ItemId> {
    ItemId::parse(value).map_err(|err| StoreError::Corrupt(format!("stored item id: {err}")))
}

fn parse_run_id(value: &str) -> StoreResult<RunId> {
    RunId::parse(value).map_err(|err| StoreError::Corrupt(format!("stored run id: {err}")))
}

fn to_u32(value: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}
