//! Financial competency assessments
//!
//! Scoring is a pure function of the answers:
//!
//! ```text
//! competency = (budgeting + saving + credit + investing + fraud_awareness) * 4   [20, 100]
//! debt       = 20                                  no cards, or no debt
//!            = max(0, 20 - debt_amount / 1000)     otherwise
//! gap        = max(0, 20 - |theory - practice|)
//! total      = competency + debt + gap
//! ```
//!
//! `total >= 80` is high, `total >= 50` is medium, anything below is low.
//! Answers are validated before they reach the scorer; the scorer itself
//! never fails.

use crate::db::{Assessment, AssessmentDraft, Database, DbError, UserMetrics};
use crate::generator::{GeneratedQuestion, QuestionBundle};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// The five self-rated topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Budgeting,
    Saving,
    Credit,
    Investing,
    FraudAwareness,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Budgeting,
        Dimension::Saving,
        Dimension::Credit,
        Dimension::Investing,
        Dimension::FraudAwareness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Budgeting => "budgeting",
            Dimension::Saving => "saving",
            Dimension::Credit => "credit",
            Dimension::Investing => "investing",
            Dimension::FraudAwareness => "fraud_awareness",
        }
    }

    /// Human-readable topic used in generation prompts
    pub fn topic(&self) -> &'static str {
        match self {
            Dimension::Budgeting => "personal budgeting",
            Dimension::Saving => "saving habits",
            Dimension::Credit => "credit and debt",
            Dimension::Investing => "basic investing",
            Dimension::FraudAwareness => "fraud prevention",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetencyLevel {
    Low,
    Medium,
    High,
}

impl CompetencyLevel {
    pub fn from_total(total: f64) -> Self {
        if total >= 80.0 {
            CompetencyLevel::High
        } else if total >= 50.0 {
            CompetencyLevel::Medium
        } else {
            CompetencyLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompetencyLevel::Low => "low",
            CompetencyLevel::Medium => "medium",
            CompetencyLevel::High => "high",
        }
    }
}

impl fmt::Display for CompetencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompetencyLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(CompetencyLevel::Low),
            "medium" => Ok(CompetencyLevel::Medium),
            "high" => Ok(CompetencyLevel::High),
            other => Err(DbError::Corrupt(format!("unknown competency level '{}'", other))),
        }
    }
}

/// Boundary check failures for [`AssessmentAnswers`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be between 1 and 5, got {value}")]
    OutOfRange { field: &'static str, value: i32 },
    #[error("card_count must not be negative, got {0}")]
    NegativeCardCount(i32),
    #[error("debt_amount must be a finite non-negative number, got {0}")]
    InvalidDebt(f64),
    #[error("min_payment_frequency must not be negative, got {0}")]
    NegativeFrequency(i32),
}

impl From<ValidationError> for DbError {
    fn from(e: ValidationError) -> Self {
        DbError::Validation(e.to_string())
    }
}

/// One filled-in questionnaire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentAnswers {
    pub budgeting: i32,
    pub saving: i32,
    pub credit: i32,
    pub investing: i32,
    pub fraud_awareness: i32,
    pub has_cards: bool,
    #[serde(default)]
    pub card_count: i32,
    #[serde(default)]
    pub debt_amount: f64,
    pub theory: i32,
    pub practice: i32,
    /// How often the user only pays the card minimum (0 = never). Recorded, not scored.
    #[serde(default)]
    pub min_payment_frequency: i32,
    #[serde(default)]
    pub fraud_experience: bool,
}

impl AssessmentAnswers {
    pub fn dimension(&self, dimension: Dimension) -> i32 {
        match dimension {
            Dimension::Budgeting => self.budgeting,
            Dimension::Saving => self.saving,
            Dimension::Credit => self.credit,
            Dimension::Investing => self.investing,
            Dimension::FraudAwareness => self.fraud_awareness,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let rated = [
            ("budgeting", self.budgeting),
            ("saving", self.saving),
            ("credit", self.credit),
            ("investing", self.investing),
            ("fraud_awareness", self.fraud_awareness),
            ("theory", self.theory),
            ("practice", self.practice),
        ];
        for (field, value) in rated {
            if !(1..=5).contains(&value) {
                return Err(ValidationError::OutOfRange { field, value });
            }
        }
        if self.card_count < 0 {
            return Err(ValidationError::NegativeCardCount(self.card_count));
        }
        if !self.debt_amount.is_finite() || self.debt_amount < 0.0 {
            return Err(ValidationError::InvalidDebt(self.debt_amount));
        }
        if self.min_payment_frequency < 0 {
            return Err(ValidationError::NegativeFrequency(self.min_payment_frequency));
        }
        Ok(())
    }

    /// Signed theory-practice gap
    pub fn gap(&self) -> i32 {
        self.theory - self.practice
    }
}

/// Scorer output
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub total: i32,
    pub level: CompetencyLevel,
}

/// Score a validated questionnaire.
///
/// The level is classified on the exact total; the returned integer total is
/// truncated, which never moves a result across a level boundary.
pub fn score_assessment(answers: &AssessmentAnswers) -> Score {
    let dimension_sum: i32 = Dimension::ALL.iter().map(|d| answers.dimension(*d)).sum();
    let competency = f64::from(dimension_sum * 4);

    let debt = if !answers.has_cards || answers.debt_amount == 0.0 {
        20.0
    } else {
        (20.0 - answers.debt_amount / 1000.0).max(0.0)
    };

    let gap = (20 - answers.gap().abs()).max(0);

    let total = competency + debt + f64::from(gap);
    Score {
        total: total as i32,
        level: CompetencyLevel::from_total(total),
    }
}

/// Map a quiz result to a 1-5 dimension rating: `1 + floor(correct / answered * 4)`.
///
/// No answers rates as 1.
pub fn dimension_from_quiz(correct: u32, answered: u32) -> i32 {
    if answered == 0 {
        return 1;
    }
    let ratio = f64::from(correct.min(answered)) / f64::from(answered);
    (1 + (ratio * 4.0) as i32).clamp(1, 5)
}

/// Practice rating from the practical quiz; 3 when nothing was answered
pub fn practice_from_quiz(correct: u32, answered: u32) -> i32 {
    if answered == 0 {
        3
    } else {
        dimension_from_quiz(correct, answered)
    }
}

/// A learner's picks for one [`QuestionBundle`], plus the self-reported card profile.
///
/// Picks are option keys by question position; `None` or a blank key leaves
/// the question unanswered, and unanswered questions do not count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizResponses {
    #[serde(default)]
    pub topics: BTreeMap<String, Vec<Option<String>>>,
    #[serde(default)]
    pub theory: Vec<Option<String>>,
    #[serde(default)]
    pub practice: Vec<Option<String>>,
    #[serde(default)]
    pub has_cards: bool,
    #[serde(default)]
    pub card_count: i32,
    #[serde(default)]
    pub debt_amount: f64,
    #[serde(default)]
    pub min_payment_frequency: i32,
    #[serde(default)]
    pub fraud_experience: bool,
}

/// (correct, answered) over the questions that got a non-blank pick
fn tally(questions: &[GeneratedQuestion], picks: Option<&Vec<Option<String>>>) -> (u32, u32) {
    let Some(picks) = picks else {
        return (0, 0);
    };
    questions
        .iter()
        .zip(picks)
        .filter_map(|(question, pick)| {
            let key = pick.as_deref().map(str::trim).filter(|k| !k.is_empty())?;
            Some(question.is_correct(key))
        })
        .fold((0, 0), |(correct, answered), hit| (correct + u32::from(hit), answered + 1))
}

/// Turn quiz picks into questionnaire answers.
///
/// Each topic rates `1 + floor(correct / answered * 4)`, or 1 with nothing
/// answered. Theory follows the same rule; practice defaults to 3.
pub fn grade_bundle(bundle: &QuestionBundle, responses: &QuizResponses) -> AssessmentAnswers {
    let rate = |dimension: Dimension| {
        let questions = bundle.topics.get(dimension.as_str()).map(Vec::as_slice).unwrap_or_default();
        let (correct, answered) = tally(questions, responses.topics.get(dimension.as_str()));
        dimension_from_quiz(correct, answered)
    };
    let (theory_correct, theory_answered) = tally(&bundle.theory, Some(&responses.theory));
    let (practice_correct, practice_answered) = tally(&bundle.practice, Some(&responses.practice));

    AssessmentAnswers {
        budgeting: rate(Dimension::Budgeting),
        saving: rate(Dimension::Saving),
        credit: rate(Dimension::Credit),
        investing: rate(Dimension::Investing),
        fraud_awareness: rate(Dimension::FraudAwareness),
        has_cards: responses.has_cards,
        card_count: responses.card_count,
        debt_amount: responses.debt_amount,
        theory: dimension_from_quiz(theory_correct, theory_answered),
        practice: practice_from_quiz(practice_correct, practice_answered),
        min_payment_frequency: responses.min_payment_frequency,
        fraud_experience: responses.fraud_experience,
    }
}

/// Grade a taken quiz and record the resulting assessment
pub fn record_quiz(
    db: &Database,
    user_id: i32,
    bundle: &QuestionBundle,
    responses: &QuizResponses,
) -> crate::db::Result<RecordedAssessment> {
    let answers = grade_bundle(bundle, responses);
    debug!(user_id, questions = bundle.question_count(), "quiz graded");
    record_assessment(db, user_id, &answers)
}

/// A persisted assessment together with the refreshed metrics
#[derive(Debug, Clone, Serialize)]
pub struct RecordedAssessment {
    pub assessment: Assessment,
    pub level: CompetencyLevel,
    pub metrics: UserMetrics,
}

/// Validate, score and persist an assessment, then roll up metrics
pub fn record_assessment(db: &Database, user_id: i32, answers: &AssessmentAnswers) -> crate::db::Result<RecordedAssessment> {
    record_assessment_at(db, user_id, answers, Utc::now())
}

pub fn record_assessment_at(
    db: &Database,
    user_id: i32,
    answers: &AssessmentAnswers,
    taken_at: DateTime<Utc>,
) -> crate::db::Result<RecordedAssessment> {
    answers.validate()?;
    db.require_user(user_id)?;

    let score = score_assessment(answers);
    let draft = AssessmentDraft {
        budgeting: answers.budgeting,
        saving: answers.saving,
        credit: answers.credit,
        investing: answers.investing,
        fraud_awareness: answers.fraud_awareness,
        has_cards: answers.has_cards,
        card_count: answers.card_count,
        debt_amount: answers.debt_amount,
        min_payment_frequency: answers.min_payment_frequency,
        fraud_experience: answers.fraud_experience,
        theory_score: answers.theory,
        practice_score: answers.practice,
        total_score: score.total,
        level: score.level.as_str().to_string(),
    };

    let (assessment, metrics) = db.insert_assessment(user_id, &draft, taken_at, |history| {
        let summary = metrics::summarize(history);
        (summary.initial_score, summary.current_score, summary.improvement_pct)
    })?;

    info!(
        user_id,
        sequence = assessment.sequence_number,
        total = score.total,
        level = %score.level,
        "assessment recorded"
    );

    Ok(RecordedAssessment {
        assessment,
        level: score.level,
        metrics,
    })
}
