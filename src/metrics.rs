//! Longitudinal metrics
//!
//! Improvement is measured between the first and the latest assessment.
//! Engagement counters (sessions, usage hours, active days) are updated by
//! session activity and mirrored point/challenge totals are refreshed after
//! gamification events.

use crate::db::{Assessment, Database, Result, UserMetrics};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImprovementSummary {
    pub initial_score: i32,
    pub current_score: i32,
    pub improvement_pct: f64,
}

/// Improvement across a user's assessments.
///
/// The initial score comes from the smallest sequence number and the current
/// score from the largest, ties broken by the latest timestamp. Input order
/// does not matter.
pub fn summarize(records: &[Assessment]) -> ImprovementSummary {
    let first = records
        .iter()
        .min_by(|a, b| a.sequence_number.cmp(&b.sequence_number).then_with(|| a.taken_at.cmp(&b.taken_at)));
    let last = records
        .iter()
        .max_by(|a, b| a.sequence_number.cmp(&b.sequence_number).then_with(|| a.taken_at.cmp(&b.taken_at)));

    let (Some(first), Some(last)) = (first, last) else {
        return ImprovementSummary {
            initial_score: 0,
            current_score: 0,
            improvement_pct: 0.0,
        };
    };

    let initial_score = first.total_score;
    let current_score = last.total_score;
    let improvement_pct = if initial_score > 0 {
        f64::from(current_score - initial_score) / f64::from(initial_score) * 100.0
    } else {
        0.0
    };

    ImprovementSummary {
        initial_score,
        current_score,
        improvement_pct,
    }
}

/// Recompute and persist the improvement fields from stored assessments
pub fn refresh_improvement(db: &Database, user_id: i32) -> Result<ImprovementSummary> {
    let history = db.list_assessments(user_id)?;
    let summary = summarize(&history);
    db.set_improvement(user_id, summary.initial_score, summary.current_score, summary.improvement_pct)?;
    debug!(user_id, pct = summary.improvement_pct, "improvement refreshed");
    Ok(summary)
}

/// Count a session of `hours` and mark the day active
pub fn record_session(db: &Database, user_id: i32, hours: f64) -> Result<UserMetrics> {
    record_session_at(db, user_id, hours, Utc::now())
}

pub fn record_session_at(db: &Database, user_id: i32, hours: f64, at: DateTime<Utc>) -> Result<UserMetrics> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(crate::db::DbError::Validation(format!(
            "session hours must be a non-negative number, got {}",
            hours
        )));
    }
    db.require_user(user_id)?;
    let metrics = db.record_session(user_id, hours, at)?;
    debug!(user_id, sessions = metrics.total_sessions, "session recorded");
    Ok(metrics)
}

/// Longest run of consecutive calendar days. Input must be sorted ascending.
pub fn longest_consecutive_days(days: &[NaiveDate]) -> u32 {
    let mut best = 0u32;
    let mut run = 0u32;
    let mut prev: Option<NaiveDate> = None;

    for day in days {
        run = match prev {
            Some(p) if *day == p => run,
            Some(p) if p.succ_opt() == Some(*day) => run + 1,
            _ => 1,
        };
        best = best.max(run);
        prev = Some(*day);
    }
    best
}

/// Longest active-day streak for a user; unparseable rows are skipped
pub fn longest_consecutive_active_days(db: &Database, user_id: i32) -> Result<u32> {
    let days: Vec<NaiveDate> = db
        .activity_days(user_id)?
        .iter()
        .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .collect();
    Ok(longest_consecutive_days(&days))
}

/// Snapshot with improvement recomputed and counters mirrored
pub fn metrics_for(db: &Database, user_id: i32) -> Result<UserMetrics> {
    db.require_user(user_id)?;
    refresh_improvement(db, user_id)?;
    db.sync_gamification_counters(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: i32, taken_at: &str, total: i32) -> Assessment {
        Assessment {
            id: seq,
            user_id: 1,
            sequence_number: seq,
            taken_at: taken_at.to_string(),
            budgeting: 3,
            saving: 3,
            credit: 3,
            investing: 3,
            fraud_awareness: 3,
            has_cards: false,
            card_count: 0,
            debt_amount: 0.0,
            min_payment_frequency: 0,
            fraud_experience: false,
            theory_score: 3,
            practice_score: 3,
            total_score: total,
            level: "medium".to_string(),
        }
    }

    #[test]
    fn test_empty_history() {
        let s = summarize(&[]);
        assert_eq!((s.initial_score, s.current_score), (0, 0));
        assert_eq!(s.improvement_pct, 0.0);
    }

    #[test]
    fn test_single_assessment_has_no_improvement() {
        let s = summarize(&[record(1, "2026-01-01T00:00:00.000000Z", 64)]);
        assert_eq!(s.initial_score, 64);
        assert_eq!(s.current_score, 64);
        assert_eq!(s.improvement_pct, 0.0);
    }

    #[test]
    fn test_forty_to_sixty_is_fifty_percent() {
        let s = summarize(&[
            record(1, "2026-01-01T00:00:00.000000Z", 40),
            record(2, "2026-02-01T00:00:00.000000Z", 60),
        ]);
        assert_eq!(s.improvement_pct, 50.0);
    }

    #[test]
    fn test_order_independent_and_tie_broken_by_time() {
        let s = summarize(&[
            record(3, "2026-03-02T00:00:00.000000Z", 90),
            record(1, "2026-01-01T00:00:00.000000Z", 50),
            record(3, "2026-03-01T00:00:00.000000Z", 70),
        ]);
        assert_eq!(s.initial_score, 50);
        assert_eq!(s.current_score, 90);
        assert_eq!(s.improvement_pct, 80.0);
    }

    #[test]
    fn test_zero_initial_score_means_zero_improvement() {
        let s = summarize(&[
            record(1, "2026-01-01T00:00:00.000000Z", 0),
            record(2, "2026-01-02T00:00:00.000000Z", 70),
        ]);
        assert_eq!(s.improvement_pct, 0.0);
    }

    #[test]
    fn test_longest_streak() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert_eq!(longest_consecutive_days(&[]), 0);
        let days = [
            d("2026-01-30"),
            d("2026-01-31"),
            d("2026-02-01"),
            d("2026-02-03"),
            d("2026-02-04"),
        ];
        assert_eq!(longest_consecutive_days(&days), 3);
    }
}
