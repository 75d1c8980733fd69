//! Progressive storyline
//!
//! Chapter 1 is always open. Chapter n opens once chapter n-1 is completed.
//! Completing a chapter pays the configured points once.

use crate::db::{Database, DbError, Result, Storyline};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ChapterStatus {
    pub chapter: Storyline,
    pub unlocked: bool,
    pub completed: bool,
}

/// Every chapter in order with the user's lock/completion state
pub fn chapters_for(db: &Database, user_id: i32) -> Result<Vec<ChapterStatus>> {
    db.require_user(user_id)?;
    let completed: HashSet<i32> = db
        .story_progress(user_id)?
        .into_iter()
        .filter(|p| p.completed)
        .map(|p| p.storyline_id)
        .collect();

    let mut previous_done = true;
    let mut statuses = Vec::new();
    for chapter in db.list_storylines()? {
        let done = completed.contains(&chapter.id);
        let unlocked = chapter.chapter_number <= 1 || previous_done;
        statuses.push(ChapterStatus {
            chapter,
            unlocked,
            completed: done,
        });
        previous_done = done;
    }
    Ok(statuses)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChapterCompletion {
    Completed { points: i32 },
    AlreadyCompleted,
    Locked,
}

/// Complete a chapter by number
pub fn complete_chapter(db: &Database, user_id: i32, chapter_number: i32, points: i32) -> Result<ChapterCompletion> {
    let status = chapters_for(db, user_id)?
        .into_iter()
        .find(|s| s.chapter.chapter_number == chapter_number)
        .ok_or_else(|| DbError::NotFound(format!("Chapter {}", chapter_number)))?;

    if status.completed {
        return Ok(ChapterCompletion::AlreadyCompleted);
    }
    if !status.unlocked {
        return Ok(ChapterCompletion::Locked);
    }

    let now = Utc::now();
    if db.complete_storyline(user_id, status.chapter.id, points, now)? {
        db.mark_active_day(user_id, now)?;
        db.sync_gamification_counters(user_id)?;
        info!(user_id, chapter_number, points, "chapter completed");
        Ok(ChapterCompletion::Completed { points })
    } else {
        Ok(ChapterCompletion::AlreadyCompleted)
    }
}

const DEFAULT_CHAPTERS: &[(i32, &str, &str)] = &[
    (
        1,
        "The Financial Wake-Up",
        "Money has always seemed to vanish by the end of the month. Starting today you will learn to see where it goes, \
         build a budget that fits your life and protect what you earn. Finish your first assessment to move on.",
    ),
    (
        2,
        "Your First Budget",
        "A budget is a plan, not a punishment. Write down what comes in, split what goes out into needs, wants and \
         savings, and review it weekly.",
    ),
    (
        3,
        "The Art of Saving",
        "Pay yourself first. Move a fixed amount to savings the day you get paid and build an emergency fund that \
         covers three months of expenses.",
    ),
    (
        4,
        "Credit: Friend or Foe?",
        "A card is borrowed money. Pay the full balance, never just the minimum, and keep usage low to build a \
         healthy credit history.",
    ),
    (
        5,
        "Protecting Yourself From Fraud",
        "No bank asks for your password by message. Check links before you click, never share verification codes \
         and report suspicious charges immediately.",
    ),
    (
        6,
        "Your Financial Future",
        "With a budget, savings and healthy credit you are ready to think long term: compound interest, diversified \
         investments and goals measured in years.",
    ),
];

/// Insert the stock chapters; existing chapter numbers are left alone
pub fn seed_default_storylines(db: &Database) -> Result<usize> {
    let mut inserted = 0;
    for (number, title, body) in DEFAULT_CHAPTERS {
        if db.upsert_storyline(*number, title, body)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database, i32) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("story.db")).unwrap();
        seed_default_storylines(&db).unwrap();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        (dir, db, user)
    }

    #[test]
    fn test_only_first_chapter_open_initially() {
        let (_dir, db, user) = setup();
        let chapters = chapters_for(&db, user).unwrap();
        assert_eq!(chapters.len(), DEFAULT_CHAPTERS.len());
        assert!(chapters[0].unlocked);
        assert!(chapters[1..].iter().all(|c| !c.unlocked && !c.completed));
    }

    #[test]
    fn test_completing_opens_next_and_pays_once() {
        let (_dir, db, user) = setup();
        assert_eq!(complete_chapter(&db, user, 2, 50).unwrap(), ChapterCompletion::Locked);
        assert_eq!(complete_chapter(&db, user, 1, 50).unwrap(), ChapterCompletion::Completed { points: 50 });
        assert_eq!(complete_chapter(&db, user, 1, 50).unwrap(), ChapterCompletion::AlreadyCompleted);

        let chapters = chapters_for(&db, user).unwrap();
        assert!(chapters[1].unlocked);
        assert!(!chapters[2].unlocked);
        assert_eq!(db.require_user(user).unwrap().points, 50);
    }

    #[test]
    fn test_unknown_chapter() {
        let (_dir, db, user) = setup();
        assert!(matches!(complete_chapter(&db, user, 42, 50), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_seeding_twice_is_harmless() {
        let (_dir, db, _user) = setup();
        assert_eq!(seed_default_storylines(&db).unwrap(), 0);
    }
}
