//! Command surface for the shiftlist engine.
//!
//! Every command prints one JSON document on stdout. Host processes can
//! embed the same behavior through [`run_cli`] instead of spawning the
//! binary.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use shiftlist_core::{
    checklist_performance, default_escalation_minutes, employee_performance, is_pending_on,
    now_utc, overview, parse_date, parse_rfc3339_utc, period_metrics, status_distribution, trend,
    visible_checklists, Checklist, ChecklistId, ChecklistItem, Frequency, ItemId, PeriodBucket,
    RoleId, RunFilter, RunId, RunStatus, UserId,
};
use shiftlist_store_sqlite::ShiftlistStore;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time, Weekday};

#[derive(Debug, Parser)]
#[command(name = "shiftlist")]
#[command(about = "Checklist execution and analytics for shift operations")]
pub struct Cli {
    #[arg(long, default_value = "./shiftlist.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Checklist {
        #[command(subcommand)]
        command: ChecklistCommand,
    },
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Sweep(SweepArgs),
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ChecklistCommand {
    /// Create or replace a checklist from a JSON definition.
    Add(AddChecklistArgs),
    Show {
        #[arg(long)]
        checklist_id: String,
    },
    List(ListChecklistsArgs),
    /// Checklists due on a date that a run has not yet been started for.
    Pending {
        #[arg(long)]
        date: Option<String>,
    },
    Delete {
        #[arg(long)]
        checklist_id: String,
    },
    /// Copy the checklist-level roles onto every item (explicit action;
    /// inheritance is otherwise computed at read time).
    ApplyRoles {
        #[arg(long)]
        checklist_id: String,
    },
}

#[derive(Debug, Args)]
pub struct AddChecklistArgs {
    /// Checklist definition; see `ChecklistSpec` for the accepted shape.
    #[arg(long)]
    spec_json: String,
}

#[derive(Debug, Args)]
pub struct ListChecklistsArgs {
    #[arg(long)]
    active_only: bool,
    /// Restrict to checklists this role may execute.
    #[arg(long)]
    role: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Start(StartRunArgs),
    Toggle(ToggleArgs),
    Complete {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        now: Option<String>,
    },
    Fail {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        now: Option<String>,
    },
    Show {
        #[arg(long)]
        run_id: String,
    },
    List(ListRunsArgs),
}

#[derive(Debug, Args)]
pub struct StartRunArgs {
    #[arg(long)]
    checklist_id: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct ToggleArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    item_id: String,
    /// Unchecks the item instead of checking it.
    #[arg(long)]
    uncheck: bool,
    /// Comma-separated role slugs of the caller, from the identity
    /// provider.
    #[arg(long)]
    roles: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    file_ref: Option<String>,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListRunsArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    checklist_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Overview {
        #[arg(long)]
        now: Option<String>,
        #[command(flatten)]
        filter: ReportFilterArgs,
    },
    Period {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        now: Option<String>,
        #[command(flatten)]
        filter: ReportFilterArgs,
    },
    Employees(ReportRangeArgs),
    Checklists(ReportRangeArgs),
    Trend(TrendArgs),
    StatusDist(ReportRangeArgs),
}

#[derive(Debug, Args)]
pub struct ReportFilterArgs {
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    checklist_id: Option<String>,
}

impl ReportFilterArgs {
    fn to_filter(&self) -> Result<RunFilter> {
        parse_filter(self.status.as_deref(), self.checklist_id.as_deref())
    }
}

#[derive(Debug, Args)]
pub struct ReportRangeArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[command(flatten)]
    filter: ReportFilterArgs,
}

#[derive(Debug, Args)]
pub struct TrendArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[command(flatten)]
    filter: ReportFilterArgs,
}

/// External JSON shape for `checklist add`. Ids and item order values are
/// assigned here; role slugs and the frequency pass through the core's
/// normalization boundary.
#[derive(Debug, Deserialize)]
pub struct ChecklistSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub frequency: String,
    #[serde(default)]
    pub due_time: Option<String>,
    #[serde(default)]
    pub week_day: Option<String>,
    #[serde(default)]
    pub month_day: Option<u8>,
    #[serde(default)]
    pub escalation_minutes: Option<u32>,
    #[serde(default)]
    pub requires_photo_evidence: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub items: Vec<ItemSpec>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ItemSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Executes a parsed CLI invocation and returns the JSON document the
/// binary prints.
///
/// # Errors
/// Returns an error for invalid arguments, domain failures surfaced by the
/// store, and storage faults.
pub fn run_cli(cli: Cli) -> Result<Value> {
    let mut store = ShiftlistStore::open(&cli.db)
        .with_context(|| format!("failed to open database at {}", cli.db.display()))?;
    store.migrate().context("failed to apply schema migrations")?;

    match cli.command {
        Command::Checklist { command } => run_checklist(&mut store, command),
        Command::Run { command } => run_run(&mut store, command),
        Command::Sweep(args) => {
            let flagged = store.sweep_overdue(parse_now(args.now.as_deref())?)?;
            Ok(json!({ "flagged_overdue": flagged }))
        }
        Command::Report { command } => run_report(&store, command),
    }
}

fn run_checklist(store: &mut ShiftlistStore, command: ChecklistCommand) -> Result<Value> {
    match command {
        ChecklistCommand::Add(args) => {
            let spec: ChecklistSpec = serde_json::from_str(&args.spec_json)
                .context("invalid --spec-json payload")?;
            let checklist = build_checklist(spec)?;
            store.upsert_checklist(&checklist)?;
            Ok(serde_json::to_value(&checklist)?)
        }
        ChecklistCommand::Show { checklist_id } => {
            let id = ChecklistId::parse(&checklist_id)?;
            let checklist = store
                .get_checklist(id)?
                .ok_or_else(|| anyhow!("checklist {checklist_id} not found"))?;
            Ok(serde_json::to_value(&checklist)?)
        }
        ChecklistCommand::List(args) => {
            let checklists = store.list_checklists(args.active_only)?;
            let checklists = match args.role.as_deref() {
                Some(slug) => {
                    let roles: BTreeSet<RoleId> = [RoleId::parse(slug)?].into_iter().collect();
                    visible_checklists(&checklists, &roles)
                        .into_iter()
                        .cloned()
                        .collect()
                }
                None => checklists,
            };
            Ok(serde_json::to_value(&checklists)?)
        }
        ChecklistCommand::Pending { date } => {
            let date = match date {
                Some(value) => parse_date(&value)?,
                None => now_utc().date(),
            };
            let started: BTreeSet<ChecklistId> = store
                .list_runs(Some((date, date)), &RunFilter::default())?
                .into_iter()
                .map(|run| run.checklist_id)
                .collect();
            let pending: Vec<Checklist> = store
                .list_checklists(true)?
                .into_iter()
                .filter(|checklist| {
                    is_pending_on(checklist, date) && !started.contains(&checklist.id)
                })
                .collect();
            Ok(serde_json::to_value(&pending)?)
        }
        ChecklistCommand::Delete { checklist_id } => {
            let id = ChecklistId::parse(&checklist_id)?;
            let deleted = store.delete_checklist(id)?;
            Ok(json!({ "deleted": deleted }))
        }
        ChecklistCommand::ApplyRoles { checklist_id } => {
            let id = ChecklistId::parse(&checklist_id)?;
            let updated = store.apply_checklist_roles_to_items(id)?;
            Ok(serde_json::to_value(&updated)?)
        }
    }
}

fn run_run(store: &mut ShiftlistStore, command: RunCommand) -> Result<Value> {
    match command {
        RunCommand::Start(args) => {
            let checklist_id = ChecklistId::parse(&args.checklist_id)?;
            let user_id = UserId::parse(&args.user_id)?;
            let started =
                store.start_run(checklist_id, &user_id, parse_now(args.now.as_deref())?)?;
            Ok(serde_json::to_value(&started)?)
        }
        RunCommand::Toggle(args) => {
            let run_id = RunId::parse(&args.run_id)?;
            let item_id = ItemId::parse(&args.item_id)?;
            let roles = parse_roles(&args.roles)?;
            let run = store.toggle_item(
                run_id,
                item_id,
                !args.uncheck,
                args.notes,
                args.file_ref,
                &roles,
                parse_now(args.now.as_deref())?,
            )?;
            run_to_value(&run)
        }
        RunCommand::Complete { run_id, now } => {
            let run = store.complete_run(RunId::parse(&run_id)?, parse_now(now.as_deref())?)?;
            run_to_value(&run)
        }
        RunCommand::Fail { run_id, reason, now } => {
            let run =
                store.mark_failed(RunId::parse(&run_id)?, &reason, parse_now(now.as_deref())?)?;
            run_to_value(&run)
        }
        RunCommand::Show { run_id } => {
            let id = RunId::parse(&run_id)?;
            let run = store
                .get_run(id)?
                .ok_or_else(|| anyhow!("run {run_id} not found"))?;
            run_to_value(&run)
        }
        RunCommand::List(args) => {
            let range = parse_range(args.from.as_deref(), args.to.as_deref())?;
            let filter = parse_filter(args.status.as_deref(), args.checklist_id.as_deref())?;
            let runs = store.list_runs(range, &filter)?;
            Ok(serde_json::to_value(&runs)?)
        }
    }
}

fn run_report(store: &ShiftlistStore, command: ReportCommand) -> Result<Value> {
    match command {
        ReportCommand::Overview { now, filter } => {
            let now = parse_now(now.as_deref())?;
            let runs = store.list_runs(None, &filter.to_filter()?)?;
            let checklists = store.list_checklists(false)?;
            Ok(serde_json::to_value(overview(&runs, &checklists, now))?)
        }
        ReportCommand::Period { bucket, now, filter } => {
            let bucket = PeriodBucket::parse(&bucket)
                .ok_or_else(|| anyhow!("unknown period bucket '{bucket}'"))?;
            let now = parse_now(now.as_deref())?;
            let runs = store.list_runs(None, &filter.to_filter()?)?;
            Ok(serde_json::to_value(period_metrics(&runs, bucket, now))?)
        }
        ReportCommand::Employees(args) => {
            let runs = filtered_runs(store, &args)?;
            Ok(serde_json::to_value(employee_performance(&runs))?)
        }
        ReportCommand::Checklists(args) => {
            let runs = filtered_runs(store, &args)?;
            Ok(serde_json::to_value(checklist_performance(&runs))?)
        }
        ReportCommand::Trend(args) => {
            let start = parse_date(&args.from)?;
            let end = parse_date(&args.to)?;
            if end < start {
                return Err(anyhow!("--to must not be before --from"));
            }
            let runs = store.list_runs(Some((start, end)), &args.filter.to_filter()?)?;
            Ok(serde_json::to_value(trend(&runs, start, end))?)
        }
        ReportCommand::StatusDist(args) => {
            let runs = filtered_runs(store, &args)?;
            let distribution: Vec<Value> = status_distribution(&runs)
                .into_iter()
                .map(|(status, count)| json!({ "status": status.as_str(), "count": count }))
                .collect();
            Ok(Value::Array(distribution))
        }
    }
}

fn filtered_runs(store: &ShiftlistStore, args: &ReportRangeArgs) -> Result<Vec<shiftlist_core::Run>> {
    let range = parse_range(args.from.as_deref(), args.to.as_deref())?;
    Ok(store.list_runs(range, &args.filter.to_filter()?)?)
}

fn build_checklist(spec: ChecklistSpec) -> Result<Checklist> {
    let frequency = Frequency::parse(&spec.frequency)
        .ok_or_else(|| anyhow!("unknown frequency '{}'", spec.frequency))?;

    let due_time = spec.due_time.as_deref().map(parse_time).transpose()?;
    let week_day = spec.week_day.as_deref().map(parse_weekday).transpose()?;

    let items = spec
        .items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Ok(ChecklistItem {
                id: ItemId::new(),
                title: item.title,
                description: item.description,
                order: u32::try_from(index + 1).unwrap_or(u32::MAX),
                is_required: item.is_required,
                roles: parse_role_list(&item.roles)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let checklist = Checklist {
        id: ChecklistId::new(),
        name: spec.name,
        description: spec.description,
        frequency,
        due_time,
        week_day,
        month_day: spec.month_day,
        escalation_minutes: spec
            .escalation_minutes
            .unwrap_or_else(|| default_escalation_minutes(frequency)),
        requires_photo_evidence: spec.requires_photo_evidence,
        roles: parse_role_list(&spec.roles)?,
        items,
        is_active: spec.is_active,
    };
    checklist.validate()?;
    Ok(checklist)
}

fn run_to_value(run: &shiftlist_core::Run) -> Result<Value> {
    let mut value = serde_json::to_value(run)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "progress".to_string(),
            Value::from(shiftlist_core::progress(run)),
        );
    }
    Ok(value)
}

fn parse_now(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => Ok(parse_rfc3339_utc(raw)?),
        None => Ok(now_utc()),
    }
}

fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<Option<(Date, Date)>> {
    match (from, to) {
        (Some(from), Some(to)) => {
            let start = parse_date(from)?;
            let end = parse_date(to)?;
            if end < start {
                return Err(anyhow!("--to must not be before --from"));
            }
            Ok(Some((start, end)))
        }
        (None, None) => Ok(None),
        _ => Err(anyhow!("--from and --to must be provided together")),
    }
}

fn parse_filter(status: Option<&str>, checklist_id: Option<&str>) -> Result<RunFilter> {
    let status = status
        .map(|raw| RunStatus::parse(raw).ok_or_else(|| anyhow!("unknown run status '{raw}'")))
        .transpose()?;
    let checklist_id = checklist_id
        .map(ChecklistId::parse)
        .transpose()?;
    Ok(RunFilter {
        status,
        checklist_id,
    })
}

fn parse_roles(csv: &str) -> Result<BTreeSet<RoleId>> {
    parse_role_list(
        &csv.split(',')
            .map(str::trim)
            .filter(|slug| !slug.is_empty())
            .map(String::from)
            .collect::<Vec<_>>(),
    )
}

fn parse_role_list(slugs: &[String]) -> Result<BTreeSet<RoleId>> {
    slugs
        .iter()
        .map(|slug| RoleId::parse(slug).map_err(Into::into))
        .collect()
}

fn parse_time(value: &str) -> Result<Time> {
    let format = format_description!("[hour]:[minute]");
    Time::parse(value, &format).with_context(|| format!("invalid time '{value}' (expected HH:MM)"))
}

fn parse_weekday(value: &str) -> Result<Weekday> {
    match value.to_ascii_lowercase().as_str() {
        "monday" => Ok(Weekday::Monday),
        "tuesday" => Ok(Weekday::Tuesday),
        "wednesday" => Ok(Weekday::Wednesday),
        "thursday" => Ok(Weekday::Thursday),
        "friday" => Ok(Weekday::Friday),
        "saturday" => Ok(Weekday::Saturday),
        "sunday" => Ok(Weekday::Sunday),
        _ => Err(anyhow!("unknown weekday '{value}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_csv_trims_dedupes_and_normalizes() {
        let roles = match parse_roles(" Cook , supervisor ,cook,") {
            Ok(value) => value,
            Err(err) => panic!("csv parse failed: {err}"),
        };
        let slugs: Vec<&str> = roles.iter().map(RoleId::as_str).collect();
        assert_eq!(slugs, vec!["cook", "supervisor"]);
    }

    #[test]
    fn range_flags_must_come_in_pairs() {
        assert!(parse_range(Some("2026-03-01"), None).is_err());
        assert!(parse_range(Some("2026-03-07"), Some("2026-03-01")).is_err());
        let range = match parse_range(Some("2026-03-01"), Some("2026-03-07")) {
            Ok(value) => value,
            Err(err) => panic!("range parse failed: {err}"),
        };
        assert!(range.is_some());
    }

    #[test]
    fn due_time_accepts_hh_mm_only() {
        assert!(parse_time("09:00").is_ok());
        assert!(parse_time("9am").is_err());
    }

    #[test]
    fn checklist_spec_defaults_escalation_by_frequency() {
        let spec: ChecklistSpec = match serde_json::from_str(
            r#"{ "name": "Close-down", "frequency": "weekly", "week_day": "friday" }"#,
        ) {
            Ok(value) => value,
            Err(err) => panic!("spec json failed: {err}"),
        };
        let checklist = match build_checklist(spec) {
            Ok(value) => value,
            Err(err) => panic!("build failed: {err}"),
        };
        assert_eq!(checklist.escalation_minutes, 240);
        assert_eq!(checklist.week_day, Some(Weekday::Friday));
        assert!(checklist.is_active);
    }

    #[test]
    fn cli_parses_nested_run_toggle() {
        let cli = match Cli::try_parse_from([
            "shiftlist",
            "--db",
            "/tmp/x.sqlite3",
            "run",
            "toggle",
            "--run-id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--item-id",
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "--roles",
            "cook",
            "--uncheck",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        match cli.command {
            Command::Run {
                command: RunCommand::Toggle(args),
            } => {
                assert!(args.uncheck);
                assert_eq!(args.roles, "cook");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
