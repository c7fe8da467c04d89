//! Domain core for the shiftlist checklist engine.
//!
//! Pure logic only: role resolution, occurrence scheduling, the run state
//! machine, and read-side analytics. Persistence lives in
//! `shiftlist-store-sqlite`; this crate never touches I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::time;
use time::{Date, Duration, Month, OffsetDateTime, Time, UtcOffset, Weekday};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChecklistError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("checklist {checklist_id} not found")]
    ChecklistNotFound { checklist_id: ChecklistId },
    #[error("checklist {checklist_id} is inactive and cannot be started")]
    ChecklistInactive { checklist_id: ChecklistId },
    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },
    #[error("run {run_id} is {status} and no longer accepts changes")]
    RunNotActive { run_id: RunId, status: RunStatus },
    #[error("item {item_id} does not belong to run {run_id}")]
    ItemNotInRun { run_id: RunId, item_id: ItemId },
    #[error("caller roles are not permitted to act on item {item_id}")]
    Unauthorized { item_id: ItemId },
    #[error("{} required item(s) remain unchecked", items.len())]
    IncompleteRequiredItems { items: Vec<BlockingItem> },
    #[error("{} required item(s) lack photo evidence", items.len())]
    MissingPhotoEvidence { items: Vec<BlockingItem> },
}

/// Names one item blocking `complete_run`, so callers can say which
/// duties remain instead of a bare failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockingItem {
    pub item_id: ItemId,
    pub title: String,
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses an id from its canonical ULID string form.
            ///
            /// # Errors
            /// Returns [`ChecklistError::Validation`] when the value is not
            /// a valid ULID.
            pub fn parse(value: &str) -> Result<Self, ChecklistError> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    ChecklistError::Validation(format!(
                        "invalid {} '{value}': {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ChecklistId);
ulid_id!(ItemId);
ulid_id!(RunId);

/// Opaque identity-provider user id. The core trusts it and never
/// authenticates.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Accepts any non-empty identifier after trimming.
    ///
    /// # Errors
    /// Returns [`ChecklistError::Validation`] for empty input.
    pub fn parse(value: &str) -> Result<Self, ChecklistError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ChecklistError::Validation(
                "user id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated role slug. `parse` is the single normalization boundary for
/// external role strings: input is trimmed and lowercased, then restricted
/// to `[a-z0-9_-]`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RoleId(String);

impl RoleId {
    /// Normalizes and validates a role slug.
    ///
    /// # Errors
    /// Returns [`ChecklistError::Validation`] for empty input or characters
    /// outside `[a-z0-9_-]` after lowercasing.
    pub fn parse(value: &str) -> Result<Self, ChecklistError> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(ChecklistError::Validation(
                "role id MUST be non-empty".to_string(),
            ));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(ChecklistError::Validation(format!(
                "role id '{value}' contains characters outside [a-z0-9_-]"
            )));
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static reference entry for a job role.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
}

impl Frequency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::HalfYearly => "half_yearly",
            Self::Yearly => "yearly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "half_yearly" => Some(Self::HalfYearly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// Scheduling only understands daily/weekly/monthly; longer periods
    /// fold into monthly. Known simplification carried over from the
    /// source system, not a defect to fix here.
    #[must_use]
    pub fn scheduling_bucket(self) -> Self {
        match self {
            Self::Daily => Self::Daily,
            Self::Weekly => Self::Weekly,
            Self::Monthly | Self::Quarterly | Self::HalfYearly | Self::Yearly => Self::Monthly,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Overdue,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Overdue => "overdue",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "overdue" => Some(Self::Overdue),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Open states still accept toggles and completion. `overdue` is a
    /// passive time-based label, not a dead end: a late finish is allowed.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::InProgress | Self::Overdue)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const DAILY_ESCALATION_MINUTES: u32 = 60;
pub const NON_DAILY_ESCALATION_MINUTES: u32 = 240;

#[must_use]
pub fn default_escalation_minutes(frequency: Frequency) -> u32 {
    match frequency {
        Frequency::Daily => DAILY_ESCALATION_MINUTES,
        _ => NON_DAILY_ESCALATION_MINUTES,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub order: u32,
    #[serde(default)]
    pub is_required: bool,
    /// Overrides the checklist roles entirely when non-empty.
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checklist {
    pub id: ChecklistId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub frequency: Frequency,
    #[serde(default)]
    pub due_time: Option<Time>,
    /// Weekly occurrence day; Monday when absent.
    #[serde(default)]
    pub week_day: Option<Weekday>,
    /// Monthly occurrence day 1..=31, clamped to month length; 1 when absent.
    #[serde(default)]
    pub month_day: Option<u8>,
    pub escalation_minutes: u32,
    #[serde(default)]
    pub requires_photo_evidence: bool,
    /// Empty set = unrestricted: every role may execute.
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
    pub items: Vec<ChecklistItem>,
    pub is_active: bool,
}

impl Checklist {
    /// Structural validation before the checklist enters the catalog.
    ///
    /// # Errors
    /// Returns [`ChecklistError::Validation`] when the name is empty, item
    /// order values are not strictly increasing, item ids repeat,
    /// `month_day` is outside 1..=31, or `escalation_minutes` is zero.
    pub fn validate(&self) -> Result<(), ChecklistError> {
        if self.name.trim().is_empty() {
            return Err(ChecklistError::Validation(
                "checklist name MUST be non-empty".to_string(),
            ));
        }

        if self.escalation_minutes == 0 {
            return Err(ChecklistError::Validation(
                "escalation_minutes MUST be >= 1".to_string(),
            ));
        }

        if let Some(day) = self.month_day {
            if !(1..=31).contains(&day) {
                return Err(ChecklistError::Validation(
                    "month_day MUST be in 1..=31".to_string(),
                ));
            }
        }

        let mut seen_ids = BTreeSet::new();
        let mut prev_order: Option<u32> = None;
        for item in &self.items {
            if item.title.trim().is_empty() {
                return Err(ChecklistError::Validation(format!(
                    "item {} title MUST be non-empty",
                    item.id
                )));
            }
            if !seen_ids.insert(item.id) {
                return Err(ChecklistError::Validation(format!(
                    "duplicate item id {}",
                    item.id
                )));
            }
            if let Some(prev) = prev_order {
                if item.order <= prev {
                    return Err(ChecklistError::Validation(
                        "item order values MUST be unique and strictly increasing".to_string(),
                    ));
                }
            }
            prev_order = Some(item.order);
        }

        Ok(())
    }
}

/// Completion record for one item within one run. Snapshotted from the
/// checklist at run start; later checklist edits never touch it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    pub item_id: ItemId,
    pub title: String,
    pub is_required: bool,
    /// Item-level roles at start time (override when non-empty).
    pub roles: BTreeSet<RoleId>,
    /// Checklist-level roles at start time (the fallback).
    pub checklist_roles: BTreeSet<RoleId>,
    pub order: u32,
    pub checked: bool,
    pub notes: Option<String>,
    pub file_ref: Option<String>,
    pub updated_at: OffsetDateTime,
}

/// One execution instance of a checklist by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub id: RunId,
    pub checklist_id: ChecklistId,
    pub user_id: UserId,
    pub status: RunStatus,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub requires_photo_evidence: bool,
    pub failure_reason: Option<String>,
    pub evidence: Vec<Evidence>,
}

// ---------------------------------------------------------------------------
// Role resolver
// ---------------------------------------------------------------------------

/// Effective role set for an item within a checklist: a non-empty item set
/// overrides the checklist set entirely; an empty result means
/// unrestricted, never "no one". Every caller (lifecycle, analytics,
/// presentation) resolves through here; this is the single source of truth.
#[must_use]
pub fn effective_roles<'a>(
    checklist_roles: &'a BTreeSet<RoleId>,
    item_roles: Option<&'a BTreeSet<RoleId>>,
) -> &'a BTreeSet<RoleId> {
    match item_roles {
        Some(roles) if !roles.is_empty() => roles,
        _ => checklist_roles,
    }
}

/// Default-open policy: an empty effective set admits every role.
#[must_use]
pub fn can_access(role: &RoleId, effective: &BTreeSet<RoleId>) -> bool {
    effective.is_empty() || effective.contains(role)
}

/// Set form of [`can_access`] for identity-provider inputs carrying the
/// caller's full role set.
#[must_use]
pub fn any_role_can_access(roles: &BTreeSet<RoleId>, effective: &BTreeSet<RoleId>) -> bool {
    effective.is_empty() || roles.iter().any(|role| effective.contains(role))
}

/// Bulk filter: checklists a holder of `user_roles` may execute.
#[must_use]
pub fn visible_checklists<'a>(
    checklists: &'a [Checklist],
    user_roles: &BTreeSet<RoleId>,
) -> Vec<&'a Checklist> {
    checklists
        .iter()
        .filter(|checklist| any_role_can_access(user_roles, &checklist.roles))
        .collect()
}

/// Items of a checklist a holder of `user_roles` may act on.
#[must_use]
pub fn visible_items<'a>(
    checklist: &'a Checklist,
    user_roles: &BTreeSet<RoleId>,
) -> Vec<&'a ChecklistItem> {
    checklist
        .items
        .iter()
        .filter(|item| {
            any_role_can_access(user_roles, effective_roles(&checklist.roles, Some(&item.roles)))
        })
        .collect()
}

/// Explicit administrative action: copies the checklist-level roles onto
/// every item. Inheritance is otherwise computed at read time, never
/// persisted.
#[must_use]
pub fn apply_checklist_roles_to_all_items(checklist: &Checklist) -> Checklist {
    let mut updated = checklist.clone();
    for item in &mut updated.items {
        item.roles = checklist.roles.clone();
    }
    updated
}

// ---------------------------------------------------------------------------
// Schedule calculator
// ---------------------------------------------------------------------------

const END_OF_DAY: Time = time!(23:59:59);

/// Whether the checklist's frequency implies an occurrence covering `date`.
#[must_use]
pub fn occurs_on(checklist: &Checklist, date: Date) -> bool {
    match checklist.frequency.scheduling_bucket() {
        Frequency::Daily => true,
        Frequency::Weekly => date.weekday() == checklist.week_day.unwrap_or(Weekday::Monday),
        _ => {
            let wanted = checklist.month_day.unwrap_or(1);
            let clamped = wanted.min(date.month().length(date.year()));
            date.day() == clamped
        }
    }
}

/// Due instant for an occurrence on `date`: the configured time of day, or
/// end of day when none is set. All instants are UTC.
#[must_use]
pub fn due_instant(checklist: &Checklist, date: Date) -> OffsetDateTime {
    date.with_time(checklist.due_time.unwrap_or(END_OF_DAY))
        .assume_offset(UtcOffset::UTC)
}

#[must_use]
pub fn escalation_deadline(checklist: &Checklist, due: OffsetDateTime) -> OffsetDateTime {
    due + Duration::minutes(i64::from(checklist.escalation_minutes))
}

/// An `in_progress` run past its escalation deadline is overdue. A run
/// already marked `overdue` keeps that label; `failed` only ever comes
/// from an explicit close-out, never from the clock.
#[must_use]
pub fn is_overdue(run: &Run, checklist: &Checklist, now: OffsetDateTime) -> bool {
    if run.status != RunStatus::InProgress {
        return false;
    }
    let due = due_instant(checklist, run.started_at.date());
    now > escalation_deadline(checklist, due)
}

/// Whether an active checklist should surface as "pending" on `date` for
/// callers listing not-yet-run duties.
#[must_use]
pub fn is_pending_on(checklist: &Checklist, date: Date) -> bool {
    checklist.is_active && occurs_on(checklist, date)
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Builds a fresh run with one unchecked evidence row per current item.
/// Uniqueness of the `(user, checklist)` active run is enforced at the
/// storage boundary, not here.
///
/// # Errors
/// Returns [`ChecklistError::ChecklistInactive`] for a disabled checklist
/// and [`ChecklistError::Validation`] when the checklist itself is
/// malformed.
pub fn build_run(
    checklist: &Checklist,
    user_id: UserId,
    now: OffsetDateTime,
) -> Result<Run, ChecklistError> {
    checklist.validate()?;
    if !checklist.is_active {
        return Err(ChecklistError::ChecklistInactive {
            checklist_id: checklist.id,
        });
    }

    let evidence = checklist
        .items
        .iter()
        .map(|item| Evidence {
            item_id: item.id,
            title: item.title.clone(),
            is_required: item.is_required,
            roles: item.roles.clone(),
            checklist_roles: checklist.roles.clone(),
            order: item.order,
            checked: false,
            notes: None,
            file_ref: None,
            updated_at: now,
        })
        .collect();

    Ok(Run {
        id: RunId::new(),
        checklist_id: checklist.id,
        user_id,
        status: RunStatus::InProgress,
        started_at: now,
        completed_at: None,
        requires_photo_evidence: checklist.requires_photo_evidence,
        failure_reason: None,
        evidence,
    })
}

/// Records evidence for one item. Authorization uses the role snapshot
/// captured at run start, resolved through [`effective_roles`]. Run status
/// never changes here; last write wins on `checked`/`notes`/`file_ref`.
///
/// # Errors
/// Returns [`ChecklistError::RunNotActive`] on a closed run,
/// [`ChecklistError::ItemNotInRun`] for an unknown item, and
/// [`ChecklistError::Unauthorized`] when the caller's roles do not satisfy
/// the item's effective role set.
pub fn toggle_item(
    run: &mut Run,
    item_id: ItemId,
    checked: bool,
    notes: Option<String>,
    file_ref: Option<String>,
    user_roles: &BTreeSet<RoleId>,
    now: OffsetDateTime,
) -> Result<(), ChecklistError> {
    if !run.status.is_open() {
        return Err(ChecklistError::RunNotActive {
            run_id: run.id,
            status: run.status,
        });
    }

    let run_id = run.id;
    let row = run
        .evidence
        .iter_mut()
        .find(|row| row.item_id == item_id)
        .ok_or(ChecklistError::ItemNotInRun { run_id, item_id })?;

    if !any_role_can_access(user_roles, effective_roles(&row.checklist_roles, Some(&row.roles))) {
        return Err(ChecklistError::Unauthorized { item_id });
    }

    row.checked = checked;
    if let Some(value) = notes {
        row.notes = Some(value);
    }
    if let Some(value) = file_ref {
        row.file_ref = Some(value);
    }
    row.updated_at = now;
    Ok(())
}

/// Integer completion percentage, rounded half-up. A run with no items
/// reports 0% rather than dividing by zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress(run: &Run) -> u8 {
    let total = run.evidence.len();
    if total == 0 {
        return 0;
    }
    let checked = run.evidence.iter().filter(|row| row.checked).count();
    round_percent(100.0 * checked as f64 / total as f64)
}

/// Completes a run. Either fully transitions or leaves the run unchanged.
///
/// # Errors
/// Returns [`ChecklistError::RunNotActive`] on a closed run,
/// [`ChecklistError::IncompleteRequiredItems`] naming every unchecked
/// required item, then [`ChecklistError::MissingPhotoEvidence`] naming
/// every required checked item without a file reference when the run's
/// snapshot demands photo evidence.
pub fn complete_run(run: &mut Run, now: OffsetDateTime) -> Result<(), ChecklistError> {
    if !run.status.is_open() {
        return Err(ChecklistError::RunNotActive {
            run_id: run.id,
            status: run.status,
        });
    }

    let unchecked: Vec<BlockingItem> = run
        .evidence
        .iter()
        .filter(|row| row.is_required && !row.checked)
        .map(|row| BlockingItem {
            item_id: row.item_id,
            title: row.title.clone(),
        })
        .collect();
    if !unchecked.is_empty() {
        return Err(ChecklistError::IncompleteRequiredItems { items: unchecked });
    }

    if run.requires_photo_evidence {
        let missing: Vec<BlockingItem> = run
            .evidence
            .iter()
            .filter(|row| row.is_required && row.checked && row.file_ref.is_none())
            .map(|row| BlockingItem {
                item_id: row.item_id,
                title: row.title.clone(),
            })
            .collect();
        if !missing.is_empty() {
            return Err(ChecklistError::MissingPhotoEvidence { items: missing });
        }
    }

    run.status = RunStatus::Completed;
    run.completed_at = Some(now);
    Ok(())
}

/// Sweep transition from `in_progress` to `overdue`. Idempotent: repeat
/// calls and calls racing a completion are no-ops. Returns whether the run
/// changed.
pub fn mark_overdue(run: &mut Run) -> bool {
    if run.status != RunStatus::InProgress {
        return false;
    }
    run.status = RunStatus::Overdue;
    true
}

/// Explicit close-out of an open run as `failed`, recording the reason and the
/// close-out instant. No-op when already failed, and no-op when completed
/// (a late completion wins over a racing close-out).
pub fn mark_failed(run: &mut Run, reason: &str, now: OffsetDateTime) -> bool {
    if !run.status.is_open() {
        return false;
    }
    run.status = RunStatus::Failed;
    run.failure_reason = Some(reason.to_string());
    run.completed_at = Some(now);
    true
}

// ---------------------------------------------------------------------------
// Analytics aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Overview {
    pub started_today: usize,
    pub started_this_week: usize,
    pub started_this_month: usize,
    pub overdue_runs: usize,
    pub active_checklists: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PeriodBucket {
    Today,
    Week,
    Month,
    Quarter,
    Year,
}

impl PeriodBucket {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "today" => Some(Self::Today),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "quarter" => Some(Self::Quarter),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeriodMetrics {
    pub bucket: PeriodBucket,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub average_completion_rate: u8,
    pub average_duration_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PerformanceRow {
    pub key: String,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub average_completion_rate: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TrendPoint {
    pub date: Date,
    pub run_count: usize,
    pub completion_rate: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub checklist_id: Option<ChecklistId>,
}

impl RunFilter {
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(checklist_id) = self.checklist_id {
            if run.checklist_id != checklist_id {
                return false;
            }
        }
        true
    }
}

/// Shared pre-filter for every aggregation: date range on start date
/// (inclusive) plus the optional status/checklist filter.
#[must_use]
pub fn filter_runs<'a>(
    runs: &'a [Run],
    range: Option<(Date, Date)>,
    filter: &RunFilter,
) -> Vec<&'a Run> {
    runs.iter()
        .filter(|run| {
            if let Some((start, end)) = range {
                let date = run.started_at.date();
                if date < start || date > end {
                    return false;
                }
            }
            filter.matches(run)
        })
        .collect()
}

/// Dashboard counters. Week = Monday-start week of `now`; month = calendar
/// month; all UTC.
#[must_use]
pub fn overview(runs: &[Run], checklists: &[Checklist], now: OffsetDateTime) -> Overview {
    let today = now.date();
    let week = (week_start(today), week_start(today) + Duration::days(6));
    let month = month_range(today);

    let started_within = |range: (Date, Date)| {
        runs.iter()
            .filter(|run| {
                let date = run.started_at.date();
                date >= range.0 && date <= range.1
            })
            .count()
    };

    Overview {
        started_today: started_within((today, today)),
        started_this_week: started_within(week),
        started_this_month: started_within(month),
        overdue_runs: runs
            .iter()
            .filter(|run| run.status == RunStatus::Overdue)
            .count(),
        active_checklists: checklists
            .iter()
            .filter(|checklist| checklist.is_active)
            .count(),
    }
}

/// Calendar range covered by a bucket relative to `now`.
#[must_use]
pub fn bucket_range(bucket: PeriodBucket, now: OffsetDateTime) -> (Date, Date) {
    let today = now.date();
    match bucket {
        PeriodBucket::Today => (today, today),
        PeriodBucket::Week => {
            let start = week_start(today);
            (start, start + Duration::days(6))
        }
        PeriodBucket::Month => month_range(today),
        PeriodBucket::Quarter => quarter_range(today),
        PeriodBucket::Year => year_range(today),
    }
}

/// Aggregates runs started within the bucket. Completion rate is the mean
/// of per-run progress; duration covers completed runs only, skipping rows
/// whose timestamps are inconsistent rather than failing the report.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn period_metrics(runs: &[Run], bucket: PeriodBucket, now: OffsetDateTime) -> PeriodMetrics {
    let range = bucket_range(bucket, now);
    let in_bucket = filter_runs(runs, Some(range), &RunFilter::default());

    let total_runs = in_bucket.len();
    let completed_runs = in_bucket
        .iter()
        .filter(|run| run.status == RunStatus::Completed)
        .count();

    let average_completion_rate = if total_runs == 0 {
        0
    } else {
        let sum: f64 = in_bucket.iter().map(|run| f64::from(progress(run))).sum();
        round_percent(sum / total_runs as f64)
    };

    let mut duration_seconds = 0.0_f64;
    let mut duration_count = 0_usize;
    for run in &in_bucket {
        if run.status != RunStatus::Completed {
            continue;
        }
        let Some(completed_at) = run.completed_at else {
            continue;
        };
        if completed_at < run.started_at {
            continue;
        }
        duration_seconds += (completed_at - run.started_at).as_seconds_f64();
        duration_count += 1;
    }
    let average_duration_minutes = if duration_count == 0 {
        None
    } else {
        Some(round_minutes(
            duration_seconds / duration_count as f64 / 60.0,
        ))
    };

    PeriodMetrics {
        bucket,
        total_runs,
        completed_runs,
        average_completion_rate,
        average_duration_minutes,
    }
}

/// Per-employee rollup over the supplied runs, ordered by completion rate
/// descending, then total runs descending, then key ascending.
#[must_use]
pub fn employee_performance(runs: &[Run]) -> Vec<PerformanceRow> {
    performance_rows(runs, |run| run.user_id.to_string())
}

/// Per-checklist rollup, same shape and ordering as employee performance.
#[must_use]
pub fn checklist_performance(runs: &[Run]) -> Vec<PerformanceRow> {
    performance_rows(runs, |run| run.checklist_id.to_string())
}

#[allow(clippy::cast_precision_loss)]
fn performance_rows(runs: &[Run], key_fn: impl Fn(&Run) -> String) -> Vec<PerformanceRow> {
    let mut groups: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    for run in runs {
        let entry = groups.entry(key_fn(run)).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if run.status == RunStatus::Completed {
            entry.1 += 1;
        }
        entry.2 += f64::from(progress(run));
    }

    let mut rows: Vec<PerformanceRow> = groups
        .into_iter()
        .map(|(key, (total, completed, sum))| PerformanceRow {
            key,
            total_runs: total,
            completed_runs: completed,
            average_completion_rate: round_percent(sum / total as f64),
        })
        .collect();

    rows.sort_by(|a, b| {
        b.average_completion_rate
            .cmp(&a.average_completion_rate)
            .then(b.total_runs.cmp(&a.total_runs))
            .then(a.key.cmp(&b.key))
    });
    rows
}

/// One point per calendar day in `[start, end]`, inclusive. Days without
/// activity report `{0, 0}` instead of being omitted, so chart axes stay
/// continuous.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn trend(runs: &[Run], start: Date, end: Date) -> Vec<TrendPoint> {
    let mut by_day: BTreeMap<Date, (usize, f64)> = BTreeMap::new();
    for run in runs {
        let date = run.started_at.date();
        if date < start || date > end {
            continue;
        }
        let entry = by_day.entry(date).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += f64::from(progress(run));
    }

    let mut points = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let (run_count, completion_rate) = match by_day.get(&cursor) {
            Some((count, sum)) if *count > 0 => (*count, round_percent(sum / *count as f64)),
            _ => (0, 0),
        };
        points.push(TrendPoint {
            date: cursor,
            run_count,
            completion_rate,
        });
        match cursor.next_day() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    points
}

/// Run count per status within the supplied set, for proportional display.
#[must_use]
pub fn status_distribution(runs: &[Run]) -> BTreeMap<RunStatus, usize> {
    let mut counts = BTreeMap::new();
    for run in runs {
        *counts.entry(run.status).or_insert(0) += 1;
    }
    counts
}

// ---------------------------------------------------------------------------
// Calendar and numeric helpers
// ---------------------------------------------------------------------------

#[must_use]
pub fn week_start(date: Date) -> Date {
    date - Duration::days(i64::from(date.weekday().number_days_from_monday()))
}

fn month_range(date: Date) -> (Date, Date) {
    let first = calendar_date(date.year(), date.month(), 1, date);
    let last = calendar_date(
        date.year(),
        date.month(),
        date.month().length(date.year()),
        date,
    );
    (first, last)
}

fn quarter_range(date: Date) -> (Date, Date) {
    let month_number = u8::from(date.month());
    let start_number = ((month_number - 1) / 3) * 3 + 1;
    let start_month = Month::try_from(start_number).unwrap_or(date.month());
    let end_month = Month::try_from(start_number + 2).unwrap_or(date.month());
    let first = calendar_date(date.year(), start_month, 1, date);
    let last = calendar_date(
        date.year(),
        end_month,
        end_month.length(date.year()),
        date,
    );
    (first, last)
}

fn year_range(date: Date) -> (Date, Date) {
    (
        calendar_date(date.year(), Month::January, 1, date),
        calendar_date(date.year(), Month::December, 31, date),
    )
}

// Aggregation must degrade instead of aborting, so calendar math falls
// back to the input date on the (unreachable) invalid combination.
fn calendar_date(year: i32, month: Month, day: u8, fallback: Date) -> Date {
    Date::from_calendar_date(year, month, day).unwrap_or(fallback)
}

/// Half-up rounding to an integer percentage, clamped to 0..=100.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_percent(value: f64) -> u8 {
    if value <= 0.0 {
        return 0;
    }
    let rounded = (value + 0.5).floor();
    if rounded >= 100.0 {
        100
    } else {
        rounded as u8
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_minutes(value: f64) -> u64 {
    if value <= 0.0 {
        return 0;
    }
    (value + 0.5).floor() as u64
}

/// Parses an RFC3339 timestamp, normalizing any offset to UTC.
///
/// # Errors
/// Returns [`ChecklistError::Validation`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ChecklistError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| ChecklistError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ChecklistError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ChecklistError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ChecklistError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`ChecklistError::Validation`] when parsing fails.
pub fn parse_date(value: &str) -> Result<Date, ChecklistError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(value, &format)
        .map_err(|err| ChecklistError::Validation(format!("invalid date '{value}': {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
