//! Pecunia - Progress and gamification engine for personal-finance education
//!
//! Score what a learner knows, track what they do with their money, and
//! reward progress with challenges, achievements and story chapters.
//!
//! # Overview
//!
//! Everything lives in one SQLite store. Learners record expenses and savings
//! in an append-only ledger; challenges settle against that ledger once and
//! only once, achievements unlock at most once per learner, and quiz content
//! from an external generation service is precached so a learner rarely waits.
//!
//! # Engines
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `assessment` | Score a questionnaire into a total (0-140) and a level |
//! | `metrics` | Improvement, sessions and streaks per learner |
//! | `challenge` | Time-boxed savings and spending-cap goals |
//! | `achievement` | Rule-based badges with one-time bonuses |
//! | `precache` | Single-use generated content, refilled in the background |
//!
//! # Quick Start
//!
//! ```no_run
//! use pecunia::{Database, ledger};
//! use pecunia::ledger::{ExpenseCategory, NewEntry};
//!
//! let db = Database::new("pecunia.db").unwrap();
//! pecunia::init::seed_catalogues(&db).unwrap();
//!
//! let user = db.create_user("ana@example.com", "Ana").unwrap();
//! pecunia::challenge::join_challenge(&db, user, "save-50-week").unwrap();
//!
//! let outcome = ledger::register_expense(&db, &NewEntry {
//!     user_id: user,
//!     amount: 60.0,
//!     category: ExpenseCategory::Savings,
//!     store_name: "Piggy bank".into(),
//!     spent_at: chrono::Utc::now(),
//! }).unwrap();
//! println!("settled {} challenge(s)", outcome.settled.len());
//! ```

pub mod achievement;
pub mod assessment;
pub mod challenge;
pub mod config;
pub mod db;
pub mod games;
pub mod generator;
pub mod init;
pub mod ledger;
pub mod metrics;
pub mod precache;
pub mod schema;
pub mod storyline;

pub use achievement::{achievement_overview, unlock_for_user, view_content, AchievementOverview, UnlockRule, UnlockedAchievement};
pub use assessment::{
    grade_bundle, record_assessment, record_quiz, score_assessment, AssessmentAnswers, CompetencyLevel, QuizResponses,
    Score,
};
pub use challenge::{advance_challenge_states, challenge_progress, join_challenge, ChallengeKind, EnrollmentState, Settlement};
pub use config::Config;
pub use db::{
    Assessment, ChallengeDefinition, Database, DbError, DbSummary, Enrollment, GameScore, User, UserMetrics,
    CURRENT_SCHEMA,
};
pub use generator::{ContentGenerator, ContentKind, ContentPayload, GenerationError};
pub use ledger::{register_expense, ExpenseCategory, NewEntry};
pub use metrics::{record_session, refresh_improvement, ImprovementSummary};
pub use precache::{ContentPrecacheManager, Fetched, Source};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_is_exported() {
        assert!(CURRENT_SCHEMA.version_string().starts_with("1."));
        assert!(CURRENT_SCHEMA.has_feature("ledger"));
    }
}
