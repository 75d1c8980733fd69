//! Achievements
//!
//! Each definition stores its unlock rule as JSON, decoded into the closed
//! [`UnlockRule`] enum. Rules are checked against a [`UserStateSnapshot`];
//! unlocking is permanent and bonus points are paid once, when the unlock row
//! is created.

use crate::challenge::ChallengeKind;
use crate::db::{AchievementDefinition, Database, NewAchievementDefinition, Result};
use crate::ledger::{self, ExpenseCategory};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnlockRule {
    AssessmentCompleted,
    FirstSavingsExpense,
    ConsecutiveActiveDays {
        days: u32,
    },
    ChallengesCompleted {
        #[serde(default)]
        challenge: Option<ChallengeKind>,
        count: u32,
    },
    /// Distinct content items viewed, optionally only ids under `topic/`
    ContentViewed {
        count: u32,
        #[serde(default)]
        topic: Option<String>,
    },
    /// Savings deposits within one calendar month
    MonthlySavings {
        amount: f64,
    },
    AllAchievementsUnlocked,
}

/// Everything the rules look at, gathered once per evaluation
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserStateSnapshot {
    pub assessments_completed: u32,
    pub has_savings_expense: bool,
    pub longest_streak: u32,
    pub completed_savings: u32,
    pub completed_spending_cap: u32,
    pub viewed_content: Vec<String>,
    pub best_monthly_savings: f64,
    /// Codes of achievements already unlocked
    pub unlocked: HashSet<String>,
}

impl UserStateSnapshot {
    pub fn load(db: &Database, user_id: i32) -> Result<Self> {
        let assessments = db.list_assessments(user_id)?;
        let savings = db.expenses_in_category(user_id, ExpenseCategory::Savings.as_str())?;
        let best_monthly_savings = ledger::monthly_savings(db, user_id)?
            .into_iter()
            .map(|(_, total)| total)
            .fold(0.0, f64::max);

        let by_id: std::collections::HashMap<i32, String> = db
            .list_achievement_definitions()?
            .into_iter()
            .map(|d| (d.id, d.code))
            .collect();
        let unlocked = db
            .list_unlocks(user_id)?
            .into_iter()
            .filter_map(|u| by_id.get(&u.achievement_id).cloned())
            .collect();

        Ok(UserStateSnapshot {
            assessments_completed: assessments.len() as u32,
            has_savings_expense: !savings.is_empty(),
            longest_streak: metrics::longest_consecutive_active_days(db, user_id)?,
            completed_savings: db.count_completed_challenges(user_id, Some(ChallengeKind::Savings.as_str()))? as u32,
            completed_spending_cap: db.count_completed_challenges(user_id, Some(ChallengeKind::SpendingCap.as_str()))?
                as u32,
            viewed_content: db.list_content_views(user_id)?,
            best_monthly_savings,
            unlocked,
        })
    }

    fn completed(&self, kind: Option<ChallengeKind>) -> u32 {
        match kind {
            Some(ChallengeKind::Savings) => self.completed_savings,
            Some(ChallengeKind::SpendingCap) => self.completed_spending_cap,
            None => self.completed_savings + self.completed_spending_cap,
        }
    }

    fn viewed(&self, topic: Option<&str>) -> u32 {
        match topic {
            Some(topic) => {
                let prefix = format!("{}/", topic);
                self.viewed_content.iter().filter(|id| id.starts_with(&prefix)).count() as u32
            }
            None => self.viewed_content.len() as u32,
        }
    }
}

fn ratio(have: f64, need: f64) -> f64 {
    if need <= 0.0 {
        return 100.0;
    }
    (have / need * 100.0).clamp(0.0, 100.0)
}

impl UnlockRule {
    /// Progress toward the rule in percent.
    ///
    /// `others` is the (unlocked, total) count of every achievement that is
    /// not itself an all-achievements rule.
    pub fn progress(&self, state: &UserStateSnapshot, others: (usize, usize)) -> f64 {
        match self {
            UnlockRule::AssessmentCompleted => ratio(f64::from(state.assessments_completed), 1.0),
            UnlockRule::FirstSavingsExpense => {
                if state.has_savings_expense {
                    100.0
                } else {
                    0.0
                }
            }
            UnlockRule::ConsecutiveActiveDays { days } => ratio(f64::from(state.longest_streak), f64::from(*days)),
            UnlockRule::ChallengesCompleted { challenge, count } => {
                ratio(f64::from(state.completed(*challenge)), f64::from(*count))
            }
            UnlockRule::ContentViewed { count, topic } => {
                ratio(f64::from(state.viewed(topic.as_deref())), f64::from(*count))
            }
            UnlockRule::MonthlySavings { amount } => ratio(state.best_monthly_savings, *amount),
            UnlockRule::AllAchievementsUnlocked => ratio(others.0 as f64, others.1 as f64),
        }
    }

    pub fn is_satisfied(&self, state: &UserStateSnapshot, others: (usize, usize)) -> bool {
        match self {
            UnlockRule::AssessmentCompleted => state.assessments_completed >= 1,
            UnlockRule::FirstSavingsExpense => state.has_savings_expense,
            UnlockRule::ConsecutiveActiveDays { days } => state.longest_streak >= *days,
            UnlockRule::ChallengesCompleted { challenge, count } => state.completed(*challenge) >= *count,
            UnlockRule::ContentViewed { count, topic } => state.viewed(topic.as_deref()) >= *count,
            UnlockRule::MonthlySavings { amount } => state.best_monthly_savings >= *amount,
            UnlockRule::AllAchievementsUnlocked => others.1 > 0 && others.0 >= others.1,
        }
    }
}

/// A definition with its decoded rule
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub definition: AchievementDefinition,
    pub rule: UnlockRule,
}

/// Active definitions with decodable rules; undecodable ones are logged and skipped
pub fn load_catalog(db: &Database) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();
    for definition in db.list_achievement_definitions()? {
        match serde_json::from_str::<UnlockRule>(&definition.rule_json) {
            Ok(rule) => entries.push(CatalogEntry { definition, rule }),
            Err(e) => warn!(code = %definition.code, error = %e, "undecodable achievement rule"),
        }
    }
    Ok(entries)
}

fn is_meta(rule: &UnlockRule) -> bool {
    matches!(rule, UnlockRule::AllAchievementsUnlocked)
}

fn others_unlocked(catalog: &[CatalogEntry], unlocked: &HashSet<String>) -> (usize, usize) {
    let others: Vec<&CatalogEntry> = catalog.iter().filter(|e| !is_meta(&e.rule)).collect();
    let done = others.iter().filter(|e| unlocked.contains(&e.definition.code)).count();
    (done, others.len())
}

/// Entries not yet unlocked whose rules hold.
///
/// Plain rules are checked first; all-achievements rules are then checked
/// against the unlocked set as it will be once the plain ones are granted.
pub fn eligible<'a>(catalog: &'a [CatalogEntry], state: &UserStateSnapshot) -> Vec<&'a CatalogEntry> {
    let mut projected = state.unlocked.clone();
    let mut found = Vec::new();
    let others = others_unlocked(catalog, &state.unlocked);

    for entry in catalog.iter().filter(|e| !is_meta(&e.rule)) {
        if !state.unlocked.contains(&entry.definition.code) && entry.rule.is_satisfied(state, others) {
            projected.insert(entry.definition.code.clone());
            found.push(entry);
        }
    }

    let others = others_unlocked(catalog, &projected);
    for entry in catalog.iter().filter(|e| is_meta(&e.rule)) {
        if !state.unlocked.contains(&entry.definition.code) && entry.rule.is_satisfied(state, others) {
            found.push(entry);
        }
    }
    found
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockedAchievement {
    pub achievement_id: i32,
    pub code: String,
    pub title: String,
    pub bonus_points: i32,
}

/// Unlock everything the snapshot makes eligible; returns only new unlocks
pub fn unlock_eligible_achievements(
    db: &Database,
    user_id: i32,
    state: &UserStateSnapshot,
    now: DateTime<Utc>,
) -> Result<Vec<UnlockedAchievement>> {
    let catalog = load_catalog(db)?;
    let mut unlocked = Vec::new();

    for entry in eligible(&catalog, state) {
        let def = &entry.definition;
        if db.unlock_achievement(user_id, def.id, def.bonus_points, now)? {
            info!(user_id, code = %def.code, bonus = def.bonus_points, "achievement unlocked");
            unlocked.push(UnlockedAchievement {
                achievement_id: def.id,
                code: def.code.clone(),
                title: def.title.clone(),
                bonus_points: def.bonus_points,
            });
        } else {
            debug!(user_id, code = %def.code, "achievement already unlocked");
        }
    }

    if !unlocked.is_empty() {
        db.sync_gamification_counters(user_id)?;
    }
    Ok(unlocked)
}

/// Load the user's state and unlock what it earns
pub fn unlock_for_user(db: &Database, user_id: i32, now: DateTime<Utc>) -> Result<Vec<UnlockedAchievement>> {
    let state = UserStateSnapshot::load(db, user_id)?;
    unlock_eligible_achievements(db, user_id, &state, now)
}

#[derive(Debug, Clone, Serialize)]
pub struct AchievementStatus {
    pub code: String,
    pub title: String,
    pub description: String,
    pub bonus_points: i32,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AchievementOverview {
    pub unlocked: Vec<AchievementStatus>,
    pub locked: Vec<AchievementStatus>,
    pub percent_complete: f64,
}

pub fn achievement_overview(db: &Database, user_id: i32) -> Result<AchievementOverview> {
    db.require_user(user_id)?;
    let state = UserStateSnapshot::load(db, user_id)?;
    let catalog = load_catalog(db)?;
    let others = others_unlocked(&catalog, &state.unlocked);

    let mut unlocked = Vec::new();
    let mut locked = Vec::new();
    for entry in &catalog {
        let def = &entry.definition;
        let is_unlocked = state.unlocked.contains(&def.code);
        let status = AchievementStatus {
            code: def.code.clone(),
            title: def.title.clone(),
            description: def.description.clone(),
            bonus_points: def.bonus_points,
            progress: if is_unlocked { 100.0 } else { entry.rule.progress(&state, others) },
        };
        if is_unlocked {
            unlocked.push(status);
        } else {
            locked.push(status);
        }
    }

    let total = unlocked.len() + locked.len();
    let percent_complete = if total == 0 {
        0.0
    } else {
        unlocked.len() as f64 / total as f64 * 100.0
    };
    Ok(AchievementOverview {
        unlocked,
        locked,
        percent_complete,
    })
}

/// Stock achievements: (code, title, description, bonus, rule)
pub fn default_achievements() -> Vec<(&'static str, &'static str, &'static str, i32, UnlockRule)> {
    vec![
        (
            "first-step",
            "First Step",
            "Complete your first financial assessment",
            50,
            UnlockRule::AssessmentCompleted,
        ),
        (
            "first-savings",
            "First Savings",
            "Record your first savings deposit",
            100,
            UnlockRule::FirstSavingsExpense,
        ),
        (
            "steady-week",
            "Steady Week",
            "Stay active seven days in a row",
            150,
            UnlockRule::ConsecutiveActiveDays { days: 7 },
        ),
        (
            "budget-master",
            "Budget Master",
            "Finish three spending-cap challenges",
            300,
            UnlockRule::ChallengesCompleted {
                challenge: Some(ChallengeKind::SpendingCap),
                count: 3,
            },
        ),
        (
            "stellar-saver",
            "Stellar Saver",
            "Save 1000 within a single month",
            200,
            UnlockRule::MonthlySavings { amount: 1000.0 },
        ),
        (
            "fraud-expert",
            "Fraud Expert",
            "Read five fraud-prevention lessons",
            250,
            UnlockRule::ContentViewed {
                count: 5,
                topic: Some("fraud".to_string()),
            },
        ),
        (
            "librarian",
            "Librarian",
            "Open ten different lessons",
            200,
            UnlockRule::ContentViewed { count: 10, topic: None },
        ),
        (
            "challenge-hunter",
            "Challenge Hunter",
            "Complete five challenges of any kind",
            200,
            UnlockRule::ChallengesCompleted { challenge: None, count: 5 },
        ),
        (
            "financial-legend",
            "Financial Legend",
            "Unlock every other achievement",
            500,
            UnlockRule::AllAchievementsUnlocked,
        ),
    ]
}

/// Insert the stock achievements; existing codes are left alone
pub fn seed_default_achievements(db: &Database) -> Result<usize> {
    let mut inserted = 0;
    for (code, title, description, bonus_points, rule) in default_achievements() {
        let rule_json = serde_json::to_string(&rule).map_err(|e| crate::db::DbError::Corrupt(e.to_string()))?;
        let new = NewAchievementDefinition {
            code,
            title,
            description,
            bonus_points,
            rule_json: &rule_json,
            is_active: true,
        };
        if db.upsert_achievement_definition(&new)? {
            inserted += 1;
        }
    }
    debug!(inserted, "achievement catalogue seeded");
    Ok(inserted)
}

/// Record a content view and check achievements
pub fn view_content(db: &Database, user_id: i32, content_id: &str) -> Result<(bool, Vec<UnlockedAchievement>)> {
    let content_id = content_id.trim();
    if content_id.is_empty() {
        return Err(crate::db::DbError::Validation("content id must not be empty".into()));
    }
    db.require_user(user_id)?;
    let now = Utc::now();
    let first_view = db.record_content_view(user_id, content_id, now)?;
    db.mark_active_day(user_id, now)?;
    let unlocked = unlock_for_user(db, user_id, now)?;
    Ok((first_view, unlocked))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i32, code: &str, rule: UnlockRule) -> CatalogEntry {
        CatalogEntry {
            definition: AchievementDefinition {
                id,
                code: code.to_string(),
                title: code.to_string(),
                description: String::new(),
                bonus_points: 10,
                rule_json: serde_json::to_string(&rule).unwrap(),
                is_active: true,
            },
            rule,
        }
    }

    #[test]
    fn test_rule_json_shape() {
        let rule = UnlockRule::ChallengesCompleted {
            challenge: Some(ChallengeKind::SpendingCap),
            count: 3,
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"kind":"challenges_completed","challenge":"spending_cap","count":3}"#);
        assert_eq!(serde_json::from_str::<UnlockRule>(&json).unwrap(), rule);

        let bare: UnlockRule = serde_json::from_str(r#"{"kind":"content_viewed","count":2}"#).unwrap();
        assert_eq!(bare, UnlockRule::ContentViewed { count: 2, topic: None });
    }

    #[test]
    fn test_unknown_rule_kind_is_rejected() {
        assert!(serde_json::from_str::<UnlockRule>(r#"{"kind":"moon_landing"}"#).is_err());
    }

    #[test]
    fn test_predicates() {
        let state = UserStateSnapshot {
            assessments_completed: 1,
            longest_streak: 6,
            completed_spending_cap: 2,
            completed_savings: 1,
            viewed_content: vec!["fraud/phishing".into(), "budget/basics".into()],
            best_monthly_savings: 1000.0,
            ..Default::default()
        };
        let none = (0, 0);
        assert!(UnlockRule::AssessmentCompleted.is_satisfied(&state, none));
        assert!(!UnlockRule::FirstSavingsExpense.is_satisfied(&state, none));
        assert!(!UnlockRule::ConsecutiveActiveDays { days: 7 }.is_satisfied(&state, none));
        assert!(UnlockRule::ChallengesCompleted { challenge: None, count: 3 }.is_satisfied(&state, none));
        assert!(!UnlockRule::ChallengesCompleted {
            challenge: Some(ChallengeKind::SpendingCap),
            count: 3
        }
        .is_satisfied(&state, none));
        assert!(UnlockRule::ContentViewed { count: 1, topic: Some("fraud".into()) }.is_satisfied(&state, none));
        assert!(!UnlockRule::ContentViewed { count: 2, topic: Some("fraud".into()) }.is_satisfied(&state, none));
        assert!(UnlockRule::MonthlySavings { amount: 1000.0 }.is_satisfied(&state, none));
        assert!(!UnlockRule::AllAchievementsUnlocked.is_satisfied(&state, none));
    }

    #[test]
    fn test_progress_is_capped() {
        let state = UserStateSnapshot {
            longest_streak: 14,
            viewed_content: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(UnlockRule::ConsecutiveActiveDays { days: 7 }.progress(&state, (0, 0)), 100.0);
        assert_eq!(UnlockRule::ContentViewed { count: 10, topic: None }.progress(&state, (0, 0)), 20.0);
        assert_eq!(UnlockRule::AllAchievementsUnlocked.progress(&state, (1, 4)), 25.0);
    }

    #[test]
    fn test_meta_rule_unlocks_in_same_pass() {
        let catalog = vec![
            entry(1, "a", UnlockRule::AssessmentCompleted),
            entry(2, "b", UnlockRule::FirstSavingsExpense),
            entry(3, "all", UnlockRule::AllAchievementsUnlocked),
        ];
        let mut state = UserStateSnapshot {
            assessments_completed: 1,
            has_savings_expense: true,
            ..Default::default()
        };
        let codes: Vec<_> = eligible(&catalog, &state).iter().map(|e| e.definition.code.as_str()).collect();
        assert_eq!(codes, vec!["a", "b", "all"]);

        state.has_savings_expense = false;
        let codes: Vec<_> = eligible(&catalog, &state).iter().map(|e| e.definition.code.as_str()).collect();
        assert_eq!(codes, vec!["a"]);
    }

    #[test]
    fn test_already_unlocked_is_not_eligible() {
        let catalog = vec![entry(1, "a", UnlockRule::AssessmentCompleted)];
        let state = UserStateSnapshot {
            assessments_completed: 3,
            unlocked: ["a".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(eligible(&catalog, &state).is_empty());
    }

    #[test]
    fn test_default_catalogue_round_trips_through_json() {
        for (code, _, _, _, rule) in default_achievements() {
            let json = serde_json::to_string(&rule).unwrap();
            assert_eq!(serde_json::from_str::<UnlockRule>(&json).unwrap(), rule, "{}", code);
        }
    }
}
