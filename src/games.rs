//! Trivia and fill-in-the-blank games
//!
//! Quiz state lives in an explicit [`TriviaSession`] value owned by the
//! caller, created at round start and reset after each finished round.

use crate::config::GamesConfig;
use crate::db::{Database, DbError, GameScore, Result, RoundTally, TriviaQuestion};
use crate::generator::Phrase;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub const TRIVIA_GAME: &str = "trivia";
pub const PHRASE_GAME: &str = "phrases";

/// Shown in place of the keyword
pub const BLANK: &str = "______________________";

/// Decoded options of a stored trivia question
pub fn trivia_options(question: &TriviaQuestion) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(&question.options_json)
        .map_err(|e| DbError::Corrupt(format!("trivia question {} options: {}", question.id, e)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriviaSession {
    pub current_question: Option<i32>,
    pub score: i32,
    pub hits: u32,
    pub misses: u32,
    pub served: BTreeSet<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriviaAnswer {
    Scored {
        correct: bool,
        correct_key: String,
        score: i32,
        misses: u32,
        round_over: bool,
    },
    /// The session pointed at a question that is gone; it has been reset
    StateLost,
}

impl TriviaSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Pick an unserved question at random. `None` when the bank is exhausted.
    pub fn next_question<'a, R: Rng + ?Sized>(
        &mut self,
        bank: &'a [TriviaQuestion],
        rng: &mut R,
    ) -> Option<&'a TriviaQuestion> {
        let unserved: Vec<&TriviaQuestion> = bank.iter().filter(|q| !self.served.contains(&q.id)).collect();
        let picked = unserved.choose(rng).copied();
        self.current_question = picked.map(|q| q.id);
        picked
    }

    /// Answer the current question with an option key
    pub fn answer(&mut self, bank: &[TriviaQuestion], key: &str, rules: &GamesConfig) -> TriviaAnswer {
        let Some(question) = self
            .current_question
            .and_then(|id| bank.iter().find(|q| q.id == id))
        else {
            warn!(current = ?self.current_question, "trivia session lost its question, restarting");
            self.reset();
            return TriviaAnswer::StateLost;
        };

        let correct = key.trim().eq_ignore_ascii_case(question.correct_key.trim());
        if correct {
            self.score += rules.trivia_points_per_hit;
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.served.insert(question.id);
        self.current_question = None;

        let exhausted = bank.iter().all(|q| self.served.contains(&q.id));
        TriviaAnswer::Scored {
            correct,
            correct_key: question.correct_key.clone(),
            score: self.score,
            misses: self.misses,
            round_over: self.misses >= rules.trivia_max_misses || exhausted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriviaSummary {
    pub score: i32,
    pub new_best: bool,
    pub totals: GameScore,
}

/// Persist a finished round and reset the session
pub fn finish_trivia_round(db: &Database, user_id: i32, session: &mut TriviaSession) -> Result<TriviaSummary> {
    let tally = RoundTally {
        points: session.score,
        correct: session.hits as i32,
        partial: 0,
        incorrect: session.misses as i32,
    };
    let now = Utc::now();
    let totals = db.record_game_round(user_id, TRIVIA_GAME, &tally, now)?;
    let new_best = db.raise_best_trivia_score(user_id, session.score)?;
    db.mark_active_day(user_id, now)?;
    info!(user_id, score = session.score, new_best, "trivia round finished");

    let summary = TriviaSummary {
        score: session.score,
        new_best,
        totals,
    };
    session.reset();
    Ok(summary)
}

// ============================================================================
// Phrases
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseRound {
    pub sentence: String,
    pub keyword: String,
}

impl From<Phrase> for PhraseRound {
    fn from(p: Phrase) -> Self {
        PhraseRound {
            sentence: p.sentence,
            keyword: p.keyword,
        }
    }
}

impl PhraseRound {
    /// The sentence with the first occurrence of the keyword blanked out
    pub fn blanked(&self) -> String {
        let haystack = self.sentence.to_lowercase();
        let needle = self.keyword.to_lowercase();
        // Lowercasing can change byte lengths outside ASCII; only splice when offsets line up.
        match haystack.find(&needle) {
            Some(start)
                if haystack.len() == self.sentence.len()
                    && self.sentence.is_char_boundary(start)
                    && self.sentence.is_char_boundary(start + needle.len()) =>
            {
                format!(
                    "{}{}{}",
                    &self.sentence[..start],
                    BLANK,
                    &self.sentence[start + needle.len()..]
                )
            }
            _ => self.sentence.replacen(&self.keyword, BLANK, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhraseVerdict {
    Correct,
    Partial,
    Incorrect,
}

/// Plain string check: exact match is correct, containment either way is partial
pub fn verify_simple(answer: &str, keyword: &str) -> PhraseVerdict {
    let answer = answer.trim().to_lowercase();
    let keyword = keyword.trim().to_lowercase();
    if answer.is_empty() {
        return PhraseVerdict::Incorrect;
    }
    if answer == keyword {
        PhraseVerdict::Correct
    } else if keyword.contains(&answer) || answer.contains(&keyword) {
        PhraseVerdict::Partial
    } else {
        PhraseVerdict::Incorrect
    }
}

pub fn phrase_points(verdict: PhraseVerdict, rules: &GamesConfig) -> i32 {
    match verdict {
        PhraseVerdict::Correct => rules.phrase_exact_points,
        PhraseVerdict::Partial => rules.phrase_partial_points,
        PhraseVerdict::Incorrect => 0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhraseResult {
    pub verdict: PhraseVerdict,
    pub points: i32,
    pub keyword: String,
    pub totals: GameScore,
}

/// Check an answer for a round and add the points to the phrase totals
pub fn play_phrase(
    db: &Database,
    user_id: i32,
    round: &PhraseRound,
    answer: &str,
    rules: &GamesConfig,
) -> Result<PhraseResult> {
    db.require_user(user_id)?;
    let verdict = verify_simple(answer, &round.keyword);
    let points = phrase_points(verdict, rules);
    let tally = RoundTally {
        points,
        correct: i32::from(verdict == PhraseVerdict::Correct),
        partial: i32::from(verdict == PhraseVerdict::Partial),
        incorrect: i32::from(verdict == PhraseVerdict::Incorrect),
    };
    let now = Utc::now();
    let totals = db.record_game_round(user_id, PHRASE_GAME, &tally, now)?;
    db.mark_active_day(user_id, now)?;
    debug!(user_id, ?verdict, points, "phrase answered");

    Ok(PhraseResult {
        verdict,
        points,
        keyword: round.keyword.clone(),
        totals,
    })
}

const DEFAULT_TRIVIA: &[(&str, [&str; 4], &str)] = &[
    (
        "What does a credit card's annual effective rate include?",
        ["Only interest", "Interest plus fees and charges", "Only fees", "Nothing"],
        "B",
    ),
    (
        "How many months of expenses should an emergency fund cover?",
        ["One week", "Between 3 and 6", "Twelve or more", "None"],
        "B",
    ),
    (
        "Which of these is a sign of phishing?",
        ["A message asking for your password", "Your monthly statement", "A branch visit", "An ATM receipt"],
        "A",
    ),
    (
        "What is compound interest?",
        ["Interest on interest", "A bank fee", "A fixed penalty", "A tax refund"],
        "A",
    ),
    (
        "What does diversifying investments do?",
        ["Raises fees", "Spreads risk", "Guarantees profit", "Avoids taxes"],
        "B",
    ),
    (
        "What happens to savings kept in cash during inflation?",
        ["They grow", "They lose purchasing power", "Nothing", "They double"],
        "B",
    ),
    (
        "Smishing is fraud carried out through...",
        ["Phone calls", "Text messages", "Letters", "Card skimmers"],
        "B",
    ),
    (
        "Paying only the minimum on a card usually...",
        ["Clears the debt quickly", "Makes the debt last longer and cost more", "Improves your score", "Cancels interest"],
        "B",
    ),
];

/// Insert the stock trivia questions; existing prompts are left alone
pub fn seed_default_trivia(db: &Database) -> Result<usize> {
    let mut inserted = 0;
    for (prompt, options, correct) in DEFAULT_TRIVIA {
        let options: BTreeMap<&str, &str> = ["A", "B", "C", "D"].into_iter().zip(options.iter().copied()).collect();
        let options_json = serde_json::to_string(&options).map_err(|e| DbError::Corrupt(e.to_string()))?;
        if db.insert_trivia_question(prompt, &options_json, correct)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bank() -> Vec<TriviaQuestion> {
        (1..=4)
            .map(|id| TriviaQuestion {
                id,
                prompt: format!("Question {}", id),
                options_json: r#"{"A":"yes","B":"no"}"#.to_string(),
                correct_key: "A".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_trivia_never_repeats_questions() {
        let bank = bank();
        let rules = GamesConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut session = TriviaSession::new();
        let mut seen = BTreeSet::new();

        while let Some(q) = session.next_question(&bank, &mut rng) {
            assert!(seen.insert(q.id));
            session.answer(&bank, "a", &rules);
        }
        assert_eq!(seen.len(), bank.len());
        assert_eq!(session.score, 400);
    }

    #[test]
    fn test_trivia_round_ends_after_max_misses() {
        let bank = bank();
        let rules = GamesConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut session = TriviaSession::new();

        let mut last = None;
        for _ in 0..3 {
            session.next_question(&bank, &mut rng).unwrap();
            last = Some(session.answer(&bank, "B", &rules));
        }
        match last.unwrap() {
            TriviaAnswer::Scored { round_over, misses, score, .. } => {
                assert!(round_over);
                assert_eq!(misses, 3);
                assert_eq!(score, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trivia_state_lost_resets_session() {
        let bank = bank();
        let rules = GamesConfig::default();
        let mut session = TriviaSession {
            current_question: Some(99),
            score: 300,
            hits: 3,
            misses: 1,
            served: [1, 2, 3].into_iter().collect(),
        };
        assert_eq!(session.answer(&bank, "A", &rules), TriviaAnswer::StateLost);
        assert_eq!(session, TriviaSession::new());

        assert_eq!(session.answer(&bank, "A", &rules), TriviaAnswer::StateLost);
    }

    #[test]
    fn test_verify_simple() {
        assert_eq!(verify_simple(" Compound Interest ", "compound interest"), PhraseVerdict::Correct);
        assert_eq!(verify_simple("interest", "compound interest"), PhraseVerdict::Partial);
        assert_eq!(verify_simple("compound interest rate", "compound interest"), PhraseVerdict::Partial);
        assert_eq!(verify_simple("inflation", "compound interest"), PhraseVerdict::Incorrect);
        assert_eq!(verify_simple("   ", "compound interest"), PhraseVerdict::Incorrect);
    }

    #[test]
    fn test_phrase_points() {
        let rules = GamesConfig::default();
        assert_eq!(phrase_points(PhraseVerdict::Correct, &rules), 5);
        assert_eq!(phrase_points(PhraseVerdict::Partial, &rules), 2);
        assert_eq!(phrase_points(PhraseVerdict::Incorrect, &rules), 0);
    }

    #[test]
    fn test_blanked_is_case_insensitive() {
        let round = PhraseRound {
            sentence: "Compound interest lets money grow".into(),
            keyword: "compound interest".into(),
        };
        assert_eq!(round.blanked(), format!("{} lets money grow", BLANK));
    }

    #[test]
    fn test_blanked_with_accents() {
        let round = PhraseRound {
            sentence: "La inflación reduce el poder adquisitivo".into(),
            keyword: "inflación".into(),
        };
        assert_eq!(round.blanked(), format!("La {} reduce el poder adquisitivo", BLANK));
    }
}
