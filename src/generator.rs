//! Content generation
//!
//! Question bundles and fill-in-the-blank phrases come from an external text
//! generation service. Its output is untrusted: code fences are stripped,
//! the JSON is parsed into typed payloads and validated before anything is
//! stored. When the service is unreachable or misbehaves, the offline
//! generator produces content from a fixed bank instead.

use crate::assessment::Dimension;
use crate::config::GenerationConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    QuestionBundle,
    Phrase,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::QuestionBundle => "question_bundle",
            ContentKind::Phrase => "phrase",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question_bundle" | "questions" => Ok(ContentKind::QuestionBundle),
            "phrase" | "phrases" => Ok(ContentKind::Phrase),
            other => Err(format!("unknown content kind '{}' (expected: questions, phrase)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    VeryEasy,
    Easy,
    Intermediate,
    Hard,
    #[default]
    #[serde(other)]
    Unrated,
}

/// One multiple-choice question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    #[serde(rename = "question")]
    pub prompt: String,
    /// Option key (`A`, `B`, ...) to option text
    pub options: BTreeMap<String, String>,
    #[serde(rename = "answer")]
    pub correct: String,
    #[serde(default)]
    pub difficulty: Difficulty,
}

impl GeneratedQuestion {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::Invalid("question text is empty".into()));
        }
        if self.options.len() < 2 {
            return Err(GenerationError::Invalid(format!(
                "question '{}' has {} option(s)",
                self.prompt,
                self.options.len()
            )));
        }
        if !self.options.contains_key(&self.correct) {
            return Err(GenerationError::Invalid(format!(
                "answer '{}' is not one of the options of '{}'",
                self.correct, self.prompt
            )));
        }
        Ok(())
    }

    /// Answer check against an option key, ignoring case and whitespace
    pub fn is_correct(&self, key: &str) -> bool {
        key.trim().eq_ignore_ascii_case(self.correct.trim())
    }
}

/// A full assessment quiz: questions per topic plus the theory/practice gap set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuestionBundle {
    /// Keyed by [`Dimension::as_str`]
    pub topics: BTreeMap<String, Vec<GeneratedQuestion>>,
    pub theory: Vec<GeneratedQuestion>,
    pub practice: Vec<GeneratedQuestion>,
}

impl QuestionBundle {
    pub fn validate(&self) -> Result<(), GenerationError> {
        for dimension in Dimension::ALL {
            match self.topics.get(dimension.as_str()) {
                Some(questions) if !questions.is_empty() => {}
                _ => {
                    return Err(GenerationError::Invalid(format!("no questions for topic '{}'", dimension)));
                }
            }
        }
        self.topics
            .values()
            .flatten()
            .chain(self.theory.iter())
            .chain(self.practice.iter())
            .try_for_each(GeneratedQuestion::validate)
    }

    pub fn question_count(&self) -> usize {
        self.topics.values().map(Vec::len).sum::<usize>() + self.theory.len() + self.practice.len()
    }
}

/// A sentence with one key term to blank out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phrase {
    pub sentence: String,
    pub keyword: String,
}

impl Phrase {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.keyword.trim().is_empty() {
            return Err(GenerationError::Invalid("phrase keyword is empty".into()));
        }
        if !self.sentence.to_lowercase().contains(&self.keyword.to_lowercase()) {
            return Err(GenerationError::Invalid(format!(
                "keyword '{}' does not appear in '{}'",
                self.keyword, self.sentence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPayload {
    QuestionBundle(QuestionBundle),
    Phrase(Phrase),
}

impl ContentPayload {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentPayload::QuestionBundle(_) => ContentKind::QuestionBundle,
            ContentPayload::Phrase(_) => ContentKind::Phrase,
        }
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        match self {
            ContentPayload::QuestionBundle(bundle) => bundle.validate(),
            ContentPayload::Phrase(phrase) => phrase.validate(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation endpoint is not configured")]
    Unconfigured,
    #[error("API key variable {0} is not set")]
    MissingKey(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("generation service answered HTTP {0}")]
    Status(u16),
    #[error("malformed generation output: {0}")]
    Malformed(String),
    #[error("invalid generated content: {0}")]
    Invalid(String),
}

/// Something that can produce fresh content
pub trait ContentGenerator: Send + Sync {
    fn generate(&self, kind: ContentKind) -> Result<ContentPayload, GenerationError>;
}

// ============================================================================
// Output cleanup
// ============================================================================

/// Strip a surrounding markdown code fence and a leading `json` tag
pub fn strip_code_fence(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let inner = rest.split("```").next().unwrap_or(rest);
    inner.strip_prefix("json").unwrap_or(inner).trim()
}

/// Remove markdown emphasis markers and collapse whitespace
pub fn clean_markdown(text: &str) -> String {
    let stripped = text.replace("**", "").replace('*', "").replace("__", "").replace('_', "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Deserialize)]
struct QuestionSet {
    questions: Vec<GeneratedQuestion>,
}

pub fn parse_questions(raw: &str) -> Result<Vec<GeneratedQuestion>, GenerationError> {
    let set: QuestionSet =
        serde_json::from_str(strip_code_fence(raw)).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    let questions: Vec<GeneratedQuestion> = set
        .questions
        .into_iter()
        .map(|mut q| {
            q.correct = q.correct.trim().to_uppercase();
            q.options = q.options.into_iter().map(|(k, v)| (k.trim().to_uppercase(), v)).collect();
            q
        })
        .collect();
    for q in &questions {
        q.validate()?;
    }
    Ok(questions)
}

pub fn parse_phrase(raw: &str) -> Result<Phrase, GenerationError> {
    let phrase: Phrase =
        serde_json::from_str(strip_code_fence(raw)).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    let phrase = Phrase {
        sentence: clean_markdown(&phrase.sentence),
        keyword: clean_markdown(&phrase.keyword),
    };
    phrase.validate()?;
    Ok(phrase)
}

// ============================================================================
// HTTP generator
// ============================================================================

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Client for a text-generation gateway.
///
/// POSTs `{"prompt": ...}` and expects `{"text": ...}` back, the text being
/// the model's raw answer.
pub struct HttpGenerator {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
    questions_per_topic: u32,
    gap_questions: u32,
}

impl HttpGenerator {
    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let endpoint = config.endpoint.clone().ok_or(GenerationError::Unconfigured)?;
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| GenerationError::MissingKey(config.api_key_env.clone()))?;
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("pecunia/", env!("CARGO_PKG_VERSION")))
            .build();
        Ok(HttpGenerator {
            agent,
            endpoint,
            api_key,
            questions_per_topic: config.questions_per_topic.max(1),
            gap_questions: config.gap_questions.max(1),
        })
    }

    fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("authorization", &format!("Bearer {}", self.api_key))
            .send_json(GenerateRequest { prompt });

        match response {
            Ok(resp) => {
                let body: GenerateResponse = resp
                    .into_json()
                    .map_err(|e| GenerationError::Malformed(format!("response body: {}", e)))?;
                Ok(body.text)
            }
            Err(ureq::Error::Status(code, _)) => Err(GenerationError::Status(code)),
            Err(ureq::Error::Transport(transport)) => Err(GenerationError::Transport(transport.to_string())),
        }
    }

    fn questions(&self, subject: &str, count: u32) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        let raw = self.complete(&question_prompt(subject, count))?;
        parse_questions(&raw)
    }
}

fn question_prompt(subject: &str, count: u32) -> String {
    format!(
        "Write {count} multiple-choice questions about {subject} for a personal-finance assessment.\n\
         Each question has four options keyed A, B, C and D with exactly one correct answer.\n\
         Mix difficulties: very_easy, easy, intermediate and hard.\n\
         Answer ONLY with JSON of the form:\n\
         {{\"questions\": [{{\"question\": \"...\", \"options\": {{\"A\": \"...\", \"B\": \"...\", \"C\": \"...\", \"D\": \"...\"}}, \
         \"answer\": \"A\", \"difficulty\": \"easy\"}}]}}"
    )
}

const PHRASE_PROMPT: &str = "Write one educational sentence of 10 to 25 words about economics, personal finance, \
investing, banking or digital fraud. It must be a definition, fact or explanation and contain one key term \
that a learner could fill in. Answer ONLY with JSON of the form: \
{\"sentence\": \"The full sentence including the key term\", \"keyword\": \"the key term\"}";

impl ContentGenerator for HttpGenerator {
    fn generate(&self, kind: ContentKind) -> Result<ContentPayload, GenerationError> {
        match kind {
            ContentKind::Phrase => {
                let raw = self.complete(PHRASE_PROMPT)?;
                Ok(ContentPayload::Phrase(parse_phrase(&raw)?))
            }
            ContentKind::QuestionBundle => {
                let mut bundle = QuestionBundle::default();
                for dimension in Dimension::ALL {
                    let questions = self.questions(dimension.topic(), self.questions_per_topic)?;
                    bundle.topics.insert(dimension.as_str().to_string(), questions);
                }
                bundle.theory =
                    self.questions("theoretical finance concepts and definitions", self.gap_questions)?;
                bundle.practice =
                    self.questions("practical everyday money decisions and scenarios", self.gap_questions)?;
                bundle.validate()?;
                debug!(questions = bundle.question_count(), "question bundle generated");
                Ok(ContentPayload::QuestionBundle(bundle))
            }
        }
    }
}

// ============================================================================
// Offline generator
// ============================================================================

const OFFLINE_PHRASES: &[(&str, &str)] = &[
    ("Compound interest lets money grow exponentially over time", "Compound interest"),
    ("Diversification reduces risk by spreading investments across different assets", "Diversification"),
    ("Phishing is a fraud that tricks people into revealing personal information", "Phishing"),
    ("A personal budget helps you control spending and plan your savings", "budget"),
    ("Inflation reduces the purchasing power of money over time", "Inflation"),
    ("An emergency fund should cover between 3 and 6 months of basic expenses", "emergency fund"),
    ("Smishing is a fraud that uses text messages to steal information", "Smishing"),
    ("The 50-30-20 rule splits income into needs, wants and savings", "50-30-20"),
];

type OfflineQuestion = (&'static str, [&'static str; 4], &'static str);

fn offline_topic_bank(dimension: Dimension) -> &'static [OfflineQuestion] {
    match dimension {
        Dimension::Budgeting => &[
            (
                "What is the first step in building a budget?",
                ["Listing your income and expenses", "Opening a credit card", "Buying stocks", "Taking a loan"],
                "A",
            ),
            (
                "In the 50-30-20 rule, what does the 20 stand for?",
                ["Rent", "Entertainment", "Savings", "Groceries"],
                "C",
            ),
        ],
        Dimension::Saving => &[
            (
                "What is an emergency fund for?",
                ["Holidays", "Unexpected expenses", "Buying gadgets", "Paying taxes early"],
                "B",
            ),
            (
                "When is the best moment to move money to savings?",
                ["At the end of the month", "Only when there is money left", "Right after getting paid", "Never"],
                "C",
            ),
        ],
        Dimension::Credit => &[
            (
                "What happens if you only pay the minimum on a credit card?",
                ["Nothing", "The debt grows with interest", "The bank closes the card", "Your limit doubles"],
                "B",
            ),
            (
                "What improves a credit history?",
                ["Paying on time", "Having many cards", "Maxing out your limit", "Skipping payments"],
                "A",
            ),
        ],
        Dimension::Investing => &[
            (
                "What does diversification reduce?",
                ["Taxes", "Returns", "Risk", "Fees"],
                "C",
            ),
            (
                "What does a share of stock represent?",
                ["A loan to the company", "Part ownership of the company", "A savings account", "An insurance policy"],
                "B",
            ),
        ],
        Dimension::FraudAwareness => &[
            (
                "Your bank sends a text asking for your password. What do you do?",
                ["Reply with it", "Ignore it and contact the bank directly", "Forward it to friends", "Click the link"],
                "B",
            ),
            (
                "What is phishing?",
                ["A savings plan", "A type of loan", "Fake messages that steal personal data", "A bank fee"],
                "C",
            ),
        ],
    }
}

const OFFLINE_THEORY: &[OfflineQuestion] = &[(
    "What is inflation?",
    ["A rise in general prices", "A drop in interest rates", "A type of tax", "A bank account"],
    "A",
)];

const OFFLINE_PRACTICE: &[OfflineQuestion] = &[(
    "You earn 1000 and spend 1100 every month. What should you do first?",
    ["Take another loan", "Review and cut expenses", "Buy on credit", "Ignore it"],
    "B",
)];

fn offline_questions(bank: &[OfflineQuestion]) -> Vec<GeneratedQuestion> {
    bank.iter()
        .map(|(prompt, options, correct)| GeneratedQuestion {
            prompt: prompt.to_string(),
            options: ["A", "B", "C", "D"]
                .iter()
                .zip(options.iter())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            correct: correct.to_string(),
            difficulty: Difficulty::Easy,
        })
        .collect()
}

/// Fixed-bank generator used when the service is unavailable.
///
/// Phrases rotate through the bank; question bundles are always the same.
#[derive(Debug, Default)]
pub struct OfflineGenerator {
    cursor: AtomicUsize,
}

impl OfflineGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produce(&self, kind: ContentKind) -> ContentPayload {
        match kind {
            ContentKind::Phrase => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % OFFLINE_PHRASES.len();
                let (sentence, keyword) = OFFLINE_PHRASES[idx];
                ContentPayload::Phrase(Phrase {
                    sentence: sentence.to_string(),
                    keyword: keyword.to_string(),
                })
            }
            ContentKind::QuestionBundle => {
                let topics = Dimension::ALL
                    .iter()
                    .map(|d| (d.as_str().to_string(), offline_questions(offline_topic_bank(*d))))
                    .collect();
                ContentPayload::QuestionBundle(QuestionBundle {
                    topics,
                    theory: offline_questions(OFFLINE_THEORY),
                    practice: offline_questions(OFFLINE_PRACTICE),
                })
            }
        }
    }
}

impl ContentGenerator for OfflineGenerator {
    fn generate(&self, kind: ContentKind) -> Result<ContentPayload, GenerationError> {
        Ok(self.produce(kind))
    }
}

/// The configured HTTP generator, or the offline one when it cannot be built
pub fn from_config(config: &GenerationConfig) -> Box<dyn ContentGenerator> {
    match HttpGenerator::from_config(config) {
        Ok(http) => Box::new(http),
        Err(e) => {
            debug!(reason = %e, "using offline content generator");
            Box::new(OfflineGenerator::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_clean_markdown() {
        assert_eq!(clean_markdown("The **TEA**  is  the _annual_ rate"), "The TEA is the annual rate");
    }

    #[test]
    fn test_parse_phrase_cleans_and_validates() {
        let raw = "```json\n{\"sentence\": \"**Inflation** reduces purchasing power\", \"keyword\": \"*Inflation*\"}\n```";
        let phrase = parse_phrase(raw).unwrap();
        assert_eq!(phrase.sentence, "Inflation reduces purchasing power");
        assert_eq!(phrase.keyword, "Inflation");
    }

    #[test]
    fn test_parse_phrase_rejects_missing_keyword() {
        let raw = r#"{"sentence": "Budgets help you plan", "keyword": "liquidity"}"#;
        assert!(matches!(parse_phrase(raw), Err(GenerationError::Invalid(_))));
        assert!(matches!(parse_phrase("not json"), Err(GenerationError::Malformed(_))));
    }

    #[test]
    fn test_parse_questions_normalises_keys() {
        let raw = r#"{"questions": [{"question": "Q?", "options": {"a": "x", "b": "y"}, "answer": " b ", "difficulty": "hard"}]}"#;
        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions[0].correct, "B");
        assert_eq!(questions[0].difficulty, Difficulty::Hard);
        assert!(questions[0].is_correct("b"));
    }

    #[test]
    fn test_parse_questions_rejects_answer_outside_options() {
        let raw = r#"{"questions": [{"question": "Q?", "options": {"A": "x", "B": "y"}, "answer": "E"}]}"#;
        assert!(matches!(parse_questions(raw), Err(GenerationError::Invalid(_))));
    }

    #[test]
    fn test_unknown_difficulty_is_unrated() {
        let raw = r#"{"questions": [{"question": "Q?", "options": {"A": "x", "B": "y"}, "answer": "A", "difficulty": "muy_facil"}]}"#;
        assert_eq!(parse_questions(raw).unwrap()[0].difficulty, Difficulty::Unrated);
    }

    #[test]
    fn test_offline_output_is_valid() {
        let offline = OfflineGenerator::new();
        for _ in 0..OFFLINE_PHRASES.len() {
            offline.produce(ContentKind::Phrase).validate().unwrap();
        }
        let bundle = offline.produce(ContentKind::QuestionBundle);
        bundle.validate().unwrap();
        assert_eq!(bundle.kind(), ContentKind::QuestionBundle);
    }

    #[test]
    fn test_offline_phrases_rotate() {
        let offline = OfflineGenerator::new();
        let first = offline.produce(ContentKind::Phrase);
        let second = offline.produce(ContentKind::Phrase);
        assert_ne!(first, second);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("questions".parse::<ContentKind>().unwrap(), ContentKind::QuestionBundle);
        assert_eq!("phrase".parse::<ContentKind>().unwrap(), ContentKind::Phrase);
        assert!("poem".parse::<ContentKind>().is_err());
    }

    #[test]
    fn test_unconfigured_http_generator() {
        let config = GenerationConfig::default();
        assert!(matches!(HttpGenerator::from_config(&config), Err(GenerationError::Unconfigured)));
    }
}
