//! Challenge lifecycle
//!
//! An enrollment starts `active` and ends either `completed` (points awarded)
//! or `failed` (nothing awarded). Terminal enrollments are never looked at
//! again.
//!
//! The two challenge kinds settle differently on purpose:
//!
//! - savings: completes as soon as the savings inside the window reach the
//!   goal, even before the window ends; fails once the window has elapsed
//!   short of the goal.
//! - spending cap: fails as soon as spending inside the window goes over the
//!   cap; completes only once the whole window has elapsed without a breach.

use crate::db::{self, ChallengeDefinition, Database, DbError, Enrollment, NewChallengeDefinition, Result};
use crate::ledger::CategoryFilter;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Savings,
    SpendingCap,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Savings => "savings",
            ChallengeKind::SpendingCap => "spending_cap",
        }
    }

    /// Ledger entries that count toward this kind's aggregate
    pub fn filter(&self) -> CategoryFilter {
        match self {
            ChallengeKind::Savings => CategoryFilter::savings(),
            ChallengeKind::SpendingCap => CategoryFilter::spending(),
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = DbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "savings" => Ok(ChallengeKind::Savings),
            "spending_cap" => Ok(ChallengeKind::SpendingCap),
            other => Err(DbError::Corrupt(format!("unknown challenge kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Active,
    Completed,
    Failed,
}

impl EnrollmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentState::Active => "active",
            EnrollmentState::Completed => "completed",
            EnrollmentState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentState::Active)
    }
}

impl FromStr for EnrollmentState {
    type Err = DbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentState::Active),
            "completed" => Ok(EnrollmentState::Completed),
            "failed" => Ok(EnrollmentState::Failed),
            other => Err(DbError::Corrupt(format!("unknown enrollment state '{}'", other))),
        }
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive time window of an enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, duration_days: i32) -> Self {
        Window {
            start,
            end: start + Duration::days(i64::from(duration_days)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }
}

/// Terminal transition decided for an active enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Fail,
}

/// Decide whether an active enrollment settles. `None` keeps it active.
pub fn evaluate(kind: ChallengeKind, goal: f64, aggregate: f64, expired: bool) -> Option<Verdict> {
    match kind {
        ChallengeKind::Savings if aggregate >= goal => Some(Verdict::Complete),
        ChallengeKind::Savings if expired => Some(Verdict::Fail),
        ChallengeKind::SpendingCap if aggregate > goal => Some(Verdict::Fail),
        ChallengeKind::SpendingCap if expired => Some(Verdict::Complete),
        _ => None,
    }
}

/// An enrollment that reached a terminal state during this call
#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub enrollment_id: i32,
    pub code: String,
    pub title: String,
    pub kind: ChallengeKind,
    pub state: EnrollmentState,
    pub earned_points: i32,
}

/// Settle every active enrollment of `user_id` that can settle right now
pub fn advance_challenge_states(db: &Database, user_id: i32) -> Result<Vec<Settlement>> {
    advance_challenge_states_at(db, user_id, Utc::now())
}

pub fn advance_challenge_states_at(db: &Database, user_id: i32, now: DateTime<Utc>) -> Result<Vec<Settlement>> {
    let mut settled = Vec::new();

    for (enrollment, definition) in db.active_enrollments(user_id)? {
        let kind = match definition.kind.parse::<ChallengeKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(enrollment_id = enrollment.id, error = %e, "skipping enrollment");
                continue;
            }
        };
        let window = Window::new(db::parse_ts(&enrollment.started_at)?, definition.duration_days);
        let aggregate = db.sum_expenses(user_id, kind.filter(), window.start, window.end)?;

        let Some(verdict) = evaluate(kind, definition.goal_amount, aggregate, window.is_expired(now)) else {
            debug!(enrollment_id = enrollment.id, aggregate, "enrollment still active");
            continue;
        };

        let (state, points) = match verdict {
            Verdict::Complete => (EnrollmentState::Completed, definition.points),
            Verdict::Fail => (EnrollmentState::Failed, 0),
        };

        if db.settle_enrollment(enrollment.id, user_id, state.as_str(), points, now)? {
            info!(
                user_id,
                enrollment_id = enrollment.id,
                code = %definition.code,
                state = %state,
                points,
                "challenge settled"
            );
            settled.push(Settlement {
                enrollment_id: enrollment.id,
                code: definition.code,
                title: definition.title,
                kind,
                state,
                earned_points: points,
            });
        } else {
            debug!(enrollment_id = enrollment.id, "enrollment already settled elsewhere");
        }
    }

    if !settled.is_empty() {
        db.sync_gamification_counters(user_id)?;
    }
    Ok(settled)
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub enrollment: Enrollment,
    pub created: bool,
}

/// Enroll in a challenge by code. Joining twice returns the first enrollment.
pub fn join_challenge(db: &Database, user_id: i32, code: &str) -> Result<JoinOutcome> {
    join_challenge_at(db, user_id, code, Utc::now())
}

pub fn join_challenge_at(db: &Database, user_id: i32, code: &str, now: DateTime<Utc>) -> Result<JoinOutcome> {
    db.require_user(user_id)?;
    let definition = db
        .find_challenge_definition(code)?
        .filter(|d| d.is_active)
        .ok_or_else(|| DbError::NotFound(format!("Challenge '{}'", code)))?;

    let (enrollment, created) = db.enroll(user_id, definition.id, now)?;
    if created {
        info!(user_id, code, enrollment_id = enrollment.id, "challenge joined");
    }
    Ok(JoinOutcome { enrollment, created })
}

/// Where an active enrollment stands
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeProgress {
    pub enrollment_id: i32,
    pub code: String,
    pub title: String,
    pub kind: ChallengeKind,
    pub goal_amount: f64,
    pub aggregate: f64,
    pub percent: f64,
    /// RFC 3339, inclusive
    pub ends_at: String,
    pub days_left: i64,
}

/// `min(aggregate / goal * 100, 100)`, 0 for a zero goal
pub fn progress_percent(aggregate: f64, goal: f64) -> f64 {
    if goal <= 0.0 {
        return 0.0;
    }
    (aggregate / goal * 100.0).clamp(0.0, 100.0)
}

fn progress_of(db: &Database, user_id: i32, enrollment: &Enrollment, definition: &ChallengeDefinition, now: DateTime<Utc>) -> Result<ChallengeProgress> {
    let kind = definition.kind.parse::<ChallengeKind>()?;
    let window = Window::new(db::parse_ts(&enrollment.started_at)?, definition.duration_days);
    let aggregate = db.sum_expenses(user_id, kind.filter(), window.start, window.end)?;
    Ok(ChallengeProgress {
        enrollment_id: enrollment.id,
        code: definition.code.clone(),
        title: definition.title.clone(),
        kind,
        goal_amount: definition.goal_amount,
        aggregate,
        percent: progress_percent(aggregate, definition.goal_amount),
        ends_at: db::format_ts(window.end),
        days_left: (window.end - now).num_days().max(0),
    })
}

/// Settle what can settle, then report progress on what is still active
pub fn challenge_progress(db: &Database, user_id: i32) -> Result<(Vec<Settlement>, Vec<ChallengeProgress>)> {
    challenge_progress_at(db, user_id, Utc::now())
}

pub fn challenge_progress_at(
    db: &Database,
    user_id: i32,
    now: DateTime<Utc>,
) -> Result<(Vec<Settlement>, Vec<ChallengeProgress>)> {
    let settled = advance_challenge_states_at(db, user_id, now)?;
    let mut active = Vec::new();
    for (enrollment, definition) in db.active_enrollments(user_id)? {
        active.push(progress_of(db, user_id, &enrollment, &definition, now)?);
    }
    Ok((settled, active))
}

/// Result of checking one enrollment by id
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Settled(Settlement),
    Active(ChallengeProgress),
    /// Already terminal before this check
    Closed { state: EnrollmentState, earned_points: i32 },
    /// Unknown id, or owned by someone else; the caller should re-list
    StateLost,
}

/// Check a single enrollment on behalf of `user_id`
pub fn check_enrollment(db: &Database, user_id: i32, enrollment_id: i32) -> Result<CheckOutcome> {
    check_enrollment_at(db, user_id, enrollment_id, Utc::now())
}

pub fn check_enrollment_at(db: &Database, user_id: i32, enrollment_id: i32, now: DateTime<Utc>) -> Result<CheckOutcome> {
    let Some(enrollment) = db.get_enrollment(enrollment_id)?.filter(|e| e.user_id == user_id) else {
        warn!(user_id, enrollment_id, "enrollment not found for user");
        return Ok(CheckOutcome::StateLost);
    };

    let state = enrollment.state.parse::<EnrollmentState>()?;
    if state.is_terminal() {
        return Ok(CheckOutcome::Closed {
            state,
            earned_points: enrollment.earned_points,
        });
    }

    let settled = advance_challenge_states_at(db, user_id, now)?;
    if let Some(s) = settled.into_iter().find(|s| s.enrollment_id == enrollment_id) {
        return Ok(CheckOutcome::Settled(s));
    }

    match db.get_enrollment(enrollment_id)? {
        Some(current) if current.state == EnrollmentState::Active.as_str() => {
            let Some(definition) = db.get_challenge_definition(current.definition_id)? else {
                return Ok(CheckOutcome::StateLost);
            };
            Ok(CheckOutcome::Active(progress_of(db, user_id, &current, &definition, now)?))
        }
        Some(current) => Ok(CheckOutcome::Closed {
            state: current.state.parse()?,
            earned_points: current.earned_points,
        }),
        None => Ok(CheckOutcome::StateLost),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub enrollment_id: i32,
    pub code: String,
    pub title: String,
    pub state: EnrollmentState,
    pub earned_points: i32,
    pub started_at: String,
    pub closed_at: Option<String>,
}

/// Terminal enrollments, most recently started first
pub fn challenge_history(db: &Database, user_id: i32, limit: i64) -> Result<Vec<HistoryEntry>> {
    db.enrollment_history(user_id, limit)?
        .into_iter()
        .map(|(e, d)| {
            Ok(HistoryEntry {
                enrollment_id: e.id,
                code: d.code,
                title: d.title,
                state: e.state.parse()?,
                earned_points: e.earned_points,
                started_at: e.started_at,
                closed_at: e.closed_at,
            })
        })
        .collect()
}

/// The stock catalogue: (code, title, kind, goal, days, points)
pub const DEFAULT_CHALLENGES: &[(&str, &str, ChallengeKind, f64, i32, i32)] = &[
    ("save-50-week", "Save $50 this week", ChallengeKind::Savings, 50.0, 7, 30),
    ("save-200-month", "Save $200 this month", ChallengeKind::Savings, 200.0, 30, 100),
    ("no-spend-3-days", "Three days without spending", ChallengeKind::SpendingCap, 0.0, 3, 25),
    ("save-100-fortnight", "Save $100 in fifteen days", ChallengeKind::Savings, 100.0, 15, 60),
    ("cap-30-week", "Spend under $30 this week", ChallengeKind::SpendingCap, 30.0, 7, 40),
];

/// Insert the stock catalogue; existing codes are left alone. Returns how many were new.
pub fn seed_default_challenges(db: &Database) -> Result<usize> {
    let mut inserted = 0;
    for (code, title, kind, goal, days, points) in DEFAULT_CHALLENGES {
        let new = NewChallengeDefinition {
            code: *code,
            title: *title,
            kind: kind.as_str(),
            goal_amount: *goal,
            duration_days: *days,
            points: *points,
            is_active: true,
        };
        if db.upsert_challenge_definition(&new)? {
            inserted += 1;
        }
    }
    debug!(inserted, "challenge catalogue seeded");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_savings_completes_early_when_goal_met() {
        assert_eq!(evaluate(ChallengeKind::Savings, 100.0, 150.0, false), Some(Verdict::Complete));
        assert_eq!(evaluate(ChallengeKind::Savings, 100.0, 100.0, true), Some(Verdict::Complete));
    }

    #[test]
    fn test_savings_fails_only_after_expiry() {
        assert_eq!(evaluate(ChallengeKind::Savings, 100.0, 99.0, false), None);
        assert_eq!(evaluate(ChallengeKind::Savings, 100.0, 99.0, true), Some(Verdict::Fail));
    }

    #[test]
    fn test_spending_cap_fails_on_breach_mid_window() {
        assert_eq!(evaluate(ChallengeKind::SpendingCap, 50.0, 100.0, false), Some(Verdict::Fail));
        assert_eq!(evaluate(ChallengeKind::SpendingCap, 0.0, 0.01, false), Some(Verdict::Fail));
    }

    #[test]
    fn test_spending_cap_completes_only_after_window() {
        assert_eq!(evaluate(ChallengeKind::SpendingCap, 50.0, 50.0, false), None);
        assert_eq!(evaluate(ChallengeKind::SpendingCap, 50.0, 50.0, true), Some(Verdict::Complete));
        assert_eq!(evaluate(ChallengeKind::SpendingCap, 50.0, 0.0, true), Some(Verdict::Complete));
    }

    #[test]
    fn test_window_expiry_is_strict() {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        let window = Window::new(start, 7);
        assert!(!window.is_expired(window.end));
        assert!(window.is_expired(window.end + Duration::seconds(1)));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(25.0, 100.0), 25.0);
        assert_eq!(progress_percent(250.0, 100.0), 100.0);
        assert_eq!(progress_percent(10.0, 0.0), 0.0);
    }

    #[test]
    fn test_kind_and_state_parse() {
        assert_eq!("spending_cap".parse::<ChallengeKind>().unwrap(), ChallengeKind::SpendingCap);
        assert!("no_gastos".parse::<ChallengeKind>().is_err());
        assert!("failed".parse::<EnrollmentState>().unwrap().is_terminal());
        assert!(!EnrollmentState::Active.is_terminal());
    }

    #[test]
    fn test_default_catalogue_codes_are_unique() {
        let mut codes: Vec<_> = DEFAULT_CHALLENGES.iter().map(|c| c.0).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), DEFAULT_CHALLENGES.len());
    }
}
