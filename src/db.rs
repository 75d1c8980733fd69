//! SQLite database with Diesel ORM
//!
//! The transactional record store behind the engine: users, the expense
//! ledger, challenge enrollments, assessments, metrics snapshots,
//! achievements, storylines, game scores and precached content.
//!
//! Every operation that awards points runs as a read-check-write inside an
//! immediate (write-locking) transaction, and the write itself is a
//! compare-and-set on the guarding column, so two racing requests for the same
//! user can never award the same points twice.

use crate::ledger::CategoryFilter;
use crate::schema::*;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// Format a timestamp the way every table stores it.
///
/// Fixed microsecond precision with a `Z` suffix keeps lexicographic order
/// identical to chronological order, which the range filters rely on.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Walk up directory tree to find .pecunia folder (like git finds .git)
/// Can be overridden with PECUNIA_DB_PATH env var
fn get_db_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("PECUNIA_DB_PATH") {
        return std::path::PathBuf::from(path);
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let pecunia_dir = dir.join(".pecunia");
            if pecunia_dir.exists() && pecunia_dir.is_dir() {
                return pecunia_dir.join("pecunia.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    // `pecunia init` creates it here
    std::path::PathBuf::from(".pecunia/pecunia.db")
}

/// Current schema version for pecunia
pub const CURRENT_SCHEMA: StoreSchema = StoreSchema {
    major: 1,
    minor: 2,
    patch: 0,
    name: "progress-engine",
    features: &[
        "ledger",
        "challenges",
        "assessments",
        "user_metrics",
        "achievements",
        "storylines",
        "games",
        "precache",
    ],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct StoreSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl StoreSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(&feature)
    }
}

impl std::fmt::Display for StoreSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
struct NewSchemaVersion<'a> {
    version: &'a str,
    name: &'a str,
    features: &'a str,
    introduced_at: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUser<'a> {
    handle: &'a str,
    email: &'a str,
    display_name: &'a str,
    points: i32,
    best_trivia_score: i32,
    created_at: &'a str,
}

/// Queryable user
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub handle: String,
    pub email: String,
    pub display_name: String,
    pub points: i32,
    pub best_trivia_score: i32,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = expenses)]
struct NewExpense<'a> {
    user_id: i32,
    amount: f64,
    category: &'a str,
    store_name: &'a str,
    spent_at: &'a str,
}

/// Queryable ledger entry
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = expenses)]
pub struct ExpenseRecord {
    pub id: i32,
    pub user_id: i32,
    pub amount: f64,
    pub category: String,
    pub store_name: String,
    pub spent_at: String,
}

/// Insertable challenge definition (static reference data)
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = challenge_definitions)]
pub struct NewChallengeDefinition<'a> {
    pub code: &'a str,
    pub title: &'a str,
    pub kind: &'a str,
    pub goal_amount: f64,
    pub duration_days: i32,
    pub points: i32,
    pub is_active: bool,
}

/// Queryable challenge definition
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = challenge_definitions)]
pub struct ChallengeDefinition {
    pub id: i32,
    pub code: String,
    pub title: String,
    pub kind: String,
    pub goal_amount: f64,
    pub duration_days: i32,
    pub points: i32,
    pub is_active: bool,
}

#[derive(Insertable)]
#[diesel(table_name = challenge_enrollments)]
struct NewEnrollment<'a> {
    user_id: i32,
    definition_id: i32,
    started_at: &'a str,
    state: &'a str,
    earned_points: i32,
}

/// Queryable challenge enrollment
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = challenge_enrollments)]
pub struct Enrollment {
    pub id: i32,
    pub user_id: i32,
    pub definition_id: i32,
    pub started_at: String,
    pub state: String,
    pub earned_points: i32,
    pub closed_at: Option<String>,
}

/// Scored assessment fields, before a sequence number is assigned
#[derive(Debug, Clone)]
pub struct AssessmentDraft {
    pub budgeting: i32,
    pub saving: i32,
    pub credit: i32,
    pub investing: i32,
    pub fraud_awareness: i32,
    pub has_cards: bool,
    pub card_count: i32,
    pub debt_amount: f64,
    pub min_payment_frequency: i32,
    pub fraud_experience: bool,
    pub theory_score: i32,
    pub practice_score: i32,
    pub total_score: i32,
    pub level: String,
}

#[derive(Insertable)]
#[diesel(table_name = assessments)]
struct NewAssessment<'a> {
    user_id: i32,
    sequence_number: i32,
    taken_at: &'a str,
    budgeting: i32,
    saving: i32,
    credit: i32,
    investing: i32,
    fraud_awareness: i32,
    has_cards: bool,
    card_count: i32,
    debt_amount: f64,
    min_payment_frequency: i32,
    fraud_experience: bool,
    theory_score: i32,
    practice_score: i32,
    total_score: i32,
    level: &'a str,
}

/// Queryable assessment record
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = assessments)]
pub struct Assessment {
    pub id: i32,
    pub user_id: i32,
    pub sequence_number: i32,
    pub taken_at: String,
    pub budgeting: i32,
    pub saving: i32,
    pub credit: i32,
    pub investing: i32,
    pub fraud_awareness: i32,
    pub has_cards: bool,
    pub card_count: i32,
    pub debt_amount: f64,
    pub min_payment_frequency: i32,
    pub fraud_experience: bool,
    pub theory_score: i32,
    pub practice_score: i32,
    pub total_score: i32,
    pub level: String,
}

impl Assessment {
    /// Signed theory-practice gap
    pub fn gap(&self) -> i32 {
        self.theory_score - self.practice_score
    }
}

#[derive(Insertable)]
#[diesel(table_name = user_metrics)]
struct NewUserMetrics<'a> {
    user_id: i32,
    registered_at: &'a str,
    last_activity_at: &'a str,
    active_days: i32,
    total_sessions: i32,
    total_usage_hours: f64,
    initial_score: i32,
    current_score: i32,
    improvement_pct: f64,
    challenges_completed: i32,
    total_points: i32,
}

/// Queryable metrics snapshot (one per user)
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = user_metrics)]
pub struct UserMetrics {
    pub user_id: i32,
    pub registered_at: String,
    pub last_activity_at: String,
    pub active_days: i32,
    pub total_sessions: i32,
    pub total_usage_hours: f64,
    pub initial_score: i32,
    pub current_score: i32,
    pub improvement_pct: f64,
    pub challenges_completed: i32,
    pub total_points: i32,
}

/// Insertable achievement definition
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = achievement_definitions)]
pub struct NewAchievementDefinition<'a> {
    pub code: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub bonus_points: i32,
    pub rule_json: &'a str,
    pub is_active: bool,
}

/// Queryable achievement definition
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = achievement_definitions)]
pub struct AchievementDefinition {
    pub id: i32,
    pub code: String,
    pub title: String,
    pub description: String,
    pub bonus_points: i32,
    pub rule_json: String,
    pub is_active: bool,
}

#[derive(Insertable)]
#[diesel(table_name = achievement_unlocks)]
struct NewAchievementUnlock<'a> {
    user_id: i32,
    achievement_id: i32,
    unlocked_at: &'a str,
    progress: f64,
}

/// Queryable achievement unlock
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = achievement_unlocks)]
pub struct AchievementUnlock {
    pub id: i32,
    pub user_id: i32,
    pub achievement_id: i32,
    pub unlocked_at: String,
    pub progress: f64,
}

#[derive(Insertable)]
#[diesel(table_name = storylines)]
struct NewStoryline<'a> {
    chapter_number: i32,
    title: &'a str,
    body: &'a str,
}

/// Queryable storyline chapter
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = storylines)]
pub struct Storyline {
    pub id: i32,
    pub chapter_number: i32,
    pub title: String,
    pub body: String,
}

/// Queryable story progress row
#[derive(Queryable, Selectable, Insertable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = story_progress)]
pub struct StoryProgress {
    pub user_id: i32,
    pub storyline_id: i32,
    pub completed: bool,
    pub completed_at: Option<String>,
}

/// Queryable per-user game totals
#[derive(Queryable, Selectable, Insertable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = game_scores)]
pub struct GameScore {
    pub user_id: i32,
    pub game: String,
    pub total_points: i32,
    pub best_round: i32,
    pub rounds: i32,
    pub correct: i32,
    pub partial: i32,
    pub incorrect: i32,
    pub updated_at: String,
}

/// One finished game round, applied to the per-user totals
#[derive(Debug, Clone, Default)]
pub struct RoundTally {
    pub points: i32,
    pub correct: i32,
    pub partial: i32,
    pub incorrect: i32,
}

#[derive(Insertable)]
#[diesel(table_name = trivia_questions)]
struct NewTriviaQuestion<'a> {
    prompt: &'a str,
    options_json: &'a str,
    correct_key: &'a str,
}

/// Queryable trivia question
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = trivia_questions)]
pub struct TriviaQuestion {
    pub id: i32,
    pub prompt: String,
    pub options_json: String,
    pub correct_key: String,
}

#[derive(Insertable)]
#[diesel(table_name = precached_items)]
struct NewPrecachedItem<'a> {
    user_id: i32,
    kind: &'a str,
    payload_json: &'a str,
    used: bool,
    created_at: &'a str,
}

/// Queryable precached content item
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = precached_items)]
pub struct PrecachedItem {
    pub id: i32,
    pub user_id: i32,
    pub kind: String,
    pub payload_json: String,
    pub used: bool,
    pub created_at: String,
    pub used_at: Option<String>,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applied to every pooled connection on checkout
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
///
/// Cloning is cheap and shares the pool, so background workers get their own handle.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> std::path::PathBuf {
        get_db_path()
    }

    /// Create a new database at a custom path
    pub fn new(path: &str) -> Result<Self> {
        Self::open_at(path)
    }

    /// Open database at default path (respects PECUNIA_DB_PATH env var)
    pub fn open() -> Result<Self> {
        let path = get_db_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        debug!(path = %path_str, "opening store");
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        conn.batch_execute(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                handle TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                points INTEGER NOT NULL DEFAULT 0,
                best_trivia_score INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expenses (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                category TEXT NOT NULL,
                store_name TEXT NOT NULL,
                spent_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS challenge_definitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                kind TEXT NOT NULL,
                goal_amount REAL NOT NULL,
                duration_days INTEGER NOT NULL,
                points INTEGER NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS challenge_enrollments (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL,
                definition_id INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'active',
                earned_points INTEGER NOT NULL DEFAULT 0,
                closed_at TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (definition_id) REFERENCES challenge_definitions(id),
                UNIQUE(user_id, definition_id)
            );

            CREATE TABLE IF NOT EXISTS assessments (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL,
                sequence_number INTEGER NOT NULL,
                taken_at TEXT NOT NULL,
                budgeting INTEGER NOT NULL,
                saving INTEGER NOT NULL,
                credit INTEGER NOT NULL,
                investing INTEGER NOT NULL,
                fraud_awareness INTEGER NOT NULL,
                has_cards BOOLEAN NOT NULL,
                card_count INTEGER NOT NULL,
                debt_amount REAL NOT NULL,
                min_payment_frequency INTEGER NOT NULL,
                fraud_experience BOOLEAN NOT NULL,
                theory_score INTEGER NOT NULL,
                practice_score INTEGER NOT NULL,
                total_score INTEGER NOT NULL,
                level TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id),
                UNIQUE(user_id, sequence_number)
            );

            CREATE TABLE IF NOT EXISTS user_metrics (
                user_id INTEGER PRIMARY KEY NOT NULL,
                registered_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                active_days INTEGER NOT NULL DEFAULT 0,
                total_sessions INTEGER NOT NULL DEFAULT 0,
                total_usage_hours REAL NOT NULL DEFAULT 0,
                initial_score INTEGER NOT NULL DEFAULT 0,
                current_score INTEGER NOT NULL DEFAULT 0,
                improvement_pct REAL NOT NULL DEFAULT 0,
                challenges_completed INTEGER NOT NULL DEFAULT 0,
                total_points INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS activity_days (
                user_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                PRIMARY KEY (user_id, day),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS achievement_definitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                bonus_points INTEGER NOT NULL DEFAULT 0,
                rule_json TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS achievement_unlocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL,
                achievement_id INTEGER NOT NULL,
                unlocked_at TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 100,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (achievement_id) REFERENCES achievement_definitions(id),
                UNIQUE(user_id, achievement_id)
            );

            CREATE TABLE IF NOT EXISTS content_views (
                user_id INTEGER NOT NULL,
                content_id TEXT NOT NULL,
                viewed_at TEXT NOT NULL,
                PRIMARY KEY (user_id, content_id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS storylines (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                chapter_number INTEGER NOT NULL UNIQUE,
                title TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS story_progress (
                user_id INTEGER NOT NULL,
                storyline_id INTEGER NOT NULL,
                completed BOOLEAN NOT NULL DEFAULT 0,
                completed_at TEXT,
                PRIMARY KEY (user_id, storyline_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (storyline_id) REFERENCES storylines(id)
            );

            CREATE TABLE IF NOT EXISTS game_scores (
                user_id INTEGER NOT NULL,
                game TEXT NOT NULL,
                total_points INTEGER NOT NULL DEFAULT 0,
                best_round INTEGER NOT NULL DEFAULT 0,
                rounds INTEGER NOT NULL DEFAULT 0,
                correct INTEGER NOT NULL DEFAULT 0,
                partial INTEGER NOT NULL DEFAULT 0,
                incorrect INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, game),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS trivia_questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                prompt TEXT NOT NULL UNIQUE,
                options_json TEXT NOT NULL,
                correct_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS precached_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                used BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                used_at TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE INDEX IF NOT EXISTS idx_expenses_user_time ON expenses(user_id, spent_at);
            CREATE INDEX IF NOT EXISTS idx_expenses_category ON expenses(category);
            CREATE INDEX IF NOT EXISTS idx_enrollments_user_state ON challenge_enrollments(user_id, state);
            CREATE INDEX IF NOT EXISTS idx_assessments_user_seq ON assessments(user_id, sequence_number);
            CREATE INDEX IF NOT EXISTS idx_precached_queue ON precached_items(user_id, kind, used, created_at);
        "#)?;

        self.register_schema(&CURRENT_SCHEMA)?;
        Ok(())
    }

    fn register_schema(&self, schema: &StoreSchema) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = format_ts(Utc::now());
        let features_json = serde_json::to_string(&schema.features).unwrap_or_default();

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: &now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(&mut conn)?;

        Ok(())
    }

    fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32> {
        let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
            .first(conn)?;
        Ok(id)
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user with zero points; returns the new id
    pub fn create_user(&self, email: &str, display_name: &str) -> Result<i32> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(DbError::Validation(format!("'{}' is not a valid email address", email)));
        }

        let mut conn = self.get_conn()?;
        let now = format_ts(Utc::now());
        let handle = Uuid::new_v4().to_string();

        conn.immediate_transaction(|conn| {
            diesel::insert_into(users::table)
                .values(&NewUser {
                    handle: &handle,
                    email,
                    display_name,
                    points: 0,
                    best_trivia_score: 0,
                    created_at: &now,
                })
                .execute(conn)?;
            let id = Self::last_insert_id(conn)?;

            diesel::insert_or_ignore_into(user_metrics::table)
                .values(&NewUserMetrics {
                    user_id: id,
                    registered_at: &now,
                    last_activity_at: &now,
                    active_days: 0,
                    total_sessions: 0,
                    total_usage_hours: 0.0,
                    initial_score: 0,
                    current_score: 0,
                    improvement_pct: 0.0,
                    challenges_completed: 0,
                    total_points: 0,
                })
                .execute(conn)?;
            Ok(id)
        })
    }

    /// Get a user by id
    pub fn get_user(&self, user_id: i32) -> Result<Option<User>> {
        let mut conn = self.get_conn()?;
        let user = users::table
            .filter(users::id.eq(user_id))
            .select(User::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(user)
    }

    /// Get a user by id, failing with `NotFound` when absent
    pub fn require_user(&self, user_id: i32) -> Result<User> {
        self.get_user(user_id)?
            .ok_or_else(|| DbError::NotFound(format!("User {}", user_id)))
    }

    /// Look a user up by email
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut conn = self.get_conn()?;
        let user = users::table
            .filter(users::email.eq(email.trim()))
            .select(User::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(user)
    }

    /// Users ordered by cumulative points
    pub fn top_users_by_points(&self, limit: i64) -> Result<Vec<User>> {
        let mut conn = self.get_conn()?;
        let top = users::table
            .order((users::points.desc(), users::id.asc()))
            .limit(limit)
            .select(User::as_select())
            .load(&mut conn)?;
        Ok(top)
    }

    /// Users ordered by best trivia round, skipping users who never scored
    pub fn top_users_by_trivia(&self, limit: i64) -> Result<Vec<User>> {
        let mut conn = self.get_conn()?;
        let top = users::table
            .filter(users::best_trivia_score.gt(0))
            .order((users::best_trivia_score.desc(), users::id.asc()))
            .limit(limit)
            .select(User::as_select())
            .load(&mut conn)?;
        Ok(top)
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    /// Append a ledger entry; returns the new id
    pub fn insert_expense(
        &self,
        user_id: i32,
        amount: f64,
        category: &str,
        store_name: &str,
        spent_at: DateTime<Utc>,
    ) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let spent_at = format_ts(spent_at);

        diesel::insert_into(expenses::table)
            .values(&NewExpense {
                user_id,
                amount,
                category,
                store_name,
                spent_at: &spent_at,
            })
            .execute(&mut conn)?;

        Self::last_insert_id(&mut conn)
    }

    /// `sum(amount)` over an inclusive time window and a category filter
    pub fn sum_expenses(
        &self,
        user_id: i32,
        filter: CategoryFilter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64> {
        let mut conn = self.get_conn()?;
        let from = format_ts(from);
        let to = format_ts(to);

        let mut query = expenses::table
            .select(diesel::dsl::sum(expenses::amount))
            .filter(expenses::user_id.eq(user_id))
            .filter(expenses::spent_at.ge(from))
            .filter(expenses::spent_at.le(to))
            .into_boxed();

        query = match filter {
            CategoryFilter::Only(category) => query.filter(expenses::category.eq(category.as_str())),
            CategoryFilter::Except(category) => query.filter(expenses::category.ne(category.as_str())),
        };

        let total: Option<f64> = query.first(&mut conn)?;
        Ok(total.unwrap_or(0.0))
    }

    /// Recent ledger entries, newest first
    pub fn list_expenses(&self, user_id: i32, limit: i64) -> Result<Vec<ExpenseRecord>> {
        let mut conn = self.get_conn()?;
        let rows = expenses::table
            .filter(expenses::user_id.eq(user_id))
            .order((expenses::spent_at.desc(), expenses::id.desc()))
            .limit(limit)
            .select(ExpenseRecord::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// All entries in one category, oldest first
    pub fn expenses_in_category(&self, user_id: i32, category: &str) -> Result<Vec<ExpenseRecord>> {
        let mut conn = self.get_conn()?;
        let rows = expenses::table
            .filter(expenses::user_id.eq(user_id))
            .filter(expenses::category.eq(category))
            .order((expenses::spent_at.asc(), expenses::id.asc()))
            .select(ExpenseRecord::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    // ========================================================================
    // Challenges
    // ========================================================================

    /// Insert a challenge definition unless one with the same code exists
    pub fn upsert_challenge_definition(&self, def: &NewChallengeDefinition<'_>) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let inserted = diesel::insert_or_ignore_into(challenge_definitions::table)
            .values(def)
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    pub fn get_challenge_definition(&self, id: i32) -> Result<Option<ChallengeDefinition>> {
        let mut conn = self.get_conn()?;
        let def = challenge_definitions::table
            .filter(challenge_definitions::id.eq(id))
            .select(ChallengeDefinition::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(def)
    }

    pub fn find_challenge_definition(&self, code: &str) -> Result<Option<ChallengeDefinition>> {
        let mut conn = self.get_conn()?;
        let def = challenge_definitions::table
            .filter(challenge_definitions::code.eq(code))
            .select(ChallengeDefinition::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(def)
    }

    /// Active challenge catalogue
    pub fn list_challenge_definitions(&self) -> Result<Vec<ChallengeDefinition>> {
        let mut conn = self.get_conn()?;
        let defs = challenge_definitions::table
            .filter(challenge_definitions::is_active.eq(true))
            .order(challenge_definitions::id.asc())
            .select(ChallengeDefinition::as_select())
            .load(&mut conn)?;
        Ok(defs)
    }

    /// Create the (user, definition) enrollment if absent.
    ///
    /// Returns the stored enrollment and whether this call created it.
    pub fn enroll(&self, user_id: i32, definition_id: i32, started_at: DateTime<Utc>) -> Result<(Enrollment, bool)> {
        let mut conn = self.get_conn()?;
        let started_at = format_ts(started_at);

        conn.immediate_transaction(|conn| {
            let inserted = diesel::insert_or_ignore_into(challenge_enrollments::table)
                .values(&NewEnrollment {
                    user_id,
                    definition_id,
                    started_at: &started_at,
                    state: "active",
                    earned_points: 0,
                })
                .execute(conn)?;

            let enrollment = challenge_enrollments::table
                .filter(challenge_enrollments::user_id.eq(user_id))
                .filter(challenge_enrollments::definition_id.eq(definition_id))
                .select(Enrollment::as_select())
                .first(conn)?;
            Ok((enrollment, inserted == 1))
        })
    }

    /// Enrollments still in the `active` state, paired with their definitions
    pub fn active_enrollments(&self, user_id: i32) -> Result<Vec<(Enrollment, ChallengeDefinition)>> {
        let mut conn = self.get_conn()?;
        let rows = challenge_enrollments::table
            .inner_join(challenge_definitions::table.on(
                challenge_definitions::id.eq(challenge_enrollments::definition_id),
            ))
            .filter(challenge_enrollments::user_id.eq(user_id))
            .filter(challenge_enrollments::state.eq("active"))
            .order(challenge_enrollments::id.asc())
            .select((Enrollment::as_select(), ChallengeDefinition::as_select()))
            .load::<(Enrollment, ChallengeDefinition)>(&mut conn)?;
        Ok(rows)
    }

    /// Terminal enrollments, newest start first
    pub fn enrollment_history(&self, user_id: i32, limit: i64) -> Result<Vec<(Enrollment, ChallengeDefinition)>> {
        let mut conn = self.get_conn()?;
        let rows = challenge_enrollments::table
            .inner_join(challenge_definitions::table.on(
                challenge_definitions::id.eq(challenge_enrollments::definition_id),
            ))
            .filter(challenge_enrollments::user_id.eq(user_id))
            .filter(challenge_enrollments::state.ne("active"))
            .order((challenge_enrollments::started_at.desc(), challenge_enrollments::id.desc()))
            .limit(limit)
            .select((Enrollment::as_select(), ChallengeDefinition::as_select()))
            .load::<(Enrollment, ChallengeDefinition)>(&mut conn)?;
        Ok(rows)
    }

    pub fn get_enrollment(&self, enrollment_id: i32) -> Result<Option<Enrollment>> {
        let mut conn = self.get_conn()?;
        let row = challenge_enrollments::table
            .filter(challenge_enrollments::id.eq(enrollment_id))
            .select(Enrollment::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// Move an active enrollment to a terminal state and award its points.
    ///
    /// The state check is the last guard before the write: the update only
    /// matches rows still `active`, and the point increment happens in the
    /// same transaction only when that update hit a row. Returns `false` when
    /// the enrollment was already terminal (or not owned by `user_id`).
    pub fn settle_enrollment(
        &self,
        enrollment_id: i32,
        user_id: i32,
        terminal_state: &str,
        points: i32,
        closed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let closed_at = format_ts(closed_at);

        conn.immediate_transaction(|conn| {
            let updated = diesel::update(
                challenge_enrollments::table
                    .filter(challenge_enrollments::id.eq(enrollment_id))
                    .filter(challenge_enrollments::user_id.eq(user_id))
                    .filter(challenge_enrollments::state.eq("active")),
            )
            .set((
                challenge_enrollments::state.eq(terminal_state),
                challenge_enrollments::earned_points.eq(points),
                challenge_enrollments::closed_at.eq(Some(closed_at.as_str())),
            ))
            .execute(conn)?;

            if updated == 0 {
                return Ok(false);
            }

            if points != 0 {
                diesel::update(users::table.filter(users::id.eq(user_id)))
                    .set(users::points.eq(users::points + points))
                    .execute(conn)?;
            }
            Ok(true)
        })
    }

    /// Count completed enrollments, optionally restricted to one challenge kind
    pub fn count_completed_challenges(&self, user_id: i32, kind: Option<&str>) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let mut query = challenge_enrollments::table
            .inner_join(challenge_definitions::table.on(
                challenge_definitions::id.eq(challenge_enrollments::definition_id),
            ))
            .filter(challenge_enrollments::user_id.eq(user_id))
            .filter(challenge_enrollments::state.eq("completed"))
            .select(diesel::dsl::count_star())
            .into_boxed();
        if let Some(kind) = kind {
            query = query.filter(challenge_definitions::kind.eq(kind));
        }
        let count = query.get_result::<i64>(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Assessments and metrics
    // ========================================================================

    /// Persist a scored assessment and roll the metrics snapshot forward.
    ///
    /// The sequence number is `max + 1` for the user, assigned inside the same
    /// transaction as the insert. `rollup` recomputes the snapshot fields from
    /// the full ordered history and runs before commit.
    pub fn insert_assessment<F>(
        &self,
        user_id: i32,
        draft: &AssessmentDraft,
        taken_at: DateTime<Utc>,
        rollup: F,
    ) -> Result<(Assessment, UserMetrics)>
    where
        F: FnOnce(&[Assessment]) -> (i32, i32, f64),
    {
        let mut conn = self.get_conn()?;
        let taken_at = format_ts(taken_at);

        conn.immediate_transaction(|conn| {
            let last: Option<i32> = assessments::table
                .filter(assessments::user_id.eq(user_id))
                .select(diesel::dsl::max(assessments::sequence_number))
                .first(conn)?;
            let sequence_number = last.unwrap_or(0) + 1;

            diesel::insert_into(assessments::table)
                .values(&NewAssessment {
                    user_id,
                    sequence_number,
                    taken_at: &taken_at,
                    budgeting: draft.budgeting,
                    saving: draft.saving,
                    credit: draft.credit,
                    investing: draft.investing,
                    fraud_awareness: draft.fraud_awareness,
                    has_cards: draft.has_cards,
                    card_count: draft.card_count,
                    debt_amount: draft.debt_amount,
                    min_payment_frequency: draft.min_payment_frequency,
                    fraud_experience: draft.fraud_experience,
                    theory_score: draft.theory_score,
                    practice_score: draft.practice_score,
                    total_score: draft.total_score,
                    level: &draft.level,
                })
                .execute(conn)?;
            let id = Self::last_insert_id(conn)?;

            let history = Self::load_assessments(conn, user_id)?;
            let (initial, current, pct) = rollup(&history);
            Self::ensure_metrics_row(conn, user_id, &taken_at)?;
            diesel::update(user_metrics::table.filter(user_metrics::user_id.eq(user_id)))
                .set((
                    user_metrics::initial_score.eq(initial),
                    user_metrics::current_score.eq(current),
                    user_metrics::improvement_pct.eq(pct),
                ))
                .execute(conn)?;

            let record = history
                .into_iter()
                .find(|a| a.id == id)
                .ok_or_else(|| DbError::NotFound(format!("Assessment {}", id)))?;
            let metrics = Self::load_metrics(conn, user_id)?;
            Ok((record, metrics))
        })
    }

    fn load_assessments(conn: &mut SqliteConnection, user_id: i32) -> Result<Vec<Assessment>> {
        let rows = assessments::table
            .filter(assessments::user_id.eq(user_id))
            .order((assessments::sequence_number.asc(), assessments::taken_at.asc()))
            .select(Assessment::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// A user's assessments by sequence number ascending
    pub fn list_assessments(&self, user_id: i32) -> Result<Vec<Assessment>> {
        let mut conn = self.get_conn()?;
        Self::load_assessments(&mut conn, user_id)
    }

    fn ensure_metrics_row(conn: &mut SqliteConnection, user_id: i32, now: &str) -> Result<()> {
        diesel::insert_or_ignore_into(user_metrics::table)
            .values(&NewUserMetrics {
                user_id,
                registered_at: now,
                last_activity_at: now,
                active_days: 0,
                total_sessions: 0,
                total_usage_hours: 0.0,
                initial_score: 0,
                current_score: 0,
                improvement_pct: 0.0,
                challenges_completed: 0,
                total_points: 0,
            })
            .execute(conn)?;
        Ok(())
    }

    fn load_metrics(conn: &mut SqliteConnection, user_id: i32) -> Result<UserMetrics> {
        let metrics = user_metrics::table
            .filter(user_metrics::user_id.eq(user_id))
            .select(UserMetrics::as_select())
            .first(conn)?;
        Ok(metrics)
    }

    /// Metrics snapshot, created with zeroed counters if missing
    pub fn get_metrics(&self, user_id: i32) -> Result<UserMetrics> {
        let mut conn = self.get_conn()?;
        Self::ensure_metrics_row(&mut conn, user_id, &format_ts(Utc::now()))?;
        Self::load_metrics(&mut conn, user_id)
    }

    /// Overwrite the improvement fields of the snapshot
    pub fn set_improvement(&self, user_id: i32, initial: i32, current: i32, pct: f64) -> Result<()> {
        let mut conn = self.get_conn()?;
        Self::ensure_metrics_row(&mut conn, user_id, &format_ts(Utc::now()))?;
        diesel::update(user_metrics::table.filter(user_metrics::user_id.eq(user_id)))
            .set((
                user_metrics::initial_score.eq(initial),
                user_metrics::current_score.eq(current),
                user_metrics::improvement_pct.eq(pct),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Add one session's worth of engagement and mark the calendar day active
    pub fn record_session(&self, user_id: i32, hours: f64, at: DateTime<Utc>) -> Result<UserMetrics> {
        let mut conn = self.get_conn()?;
        let now = format_ts(at);
        let day = at.format("%Y-%m-%d").to_string();

        conn.immediate_transaction(|conn| {
            Self::ensure_metrics_row(conn, user_id, &now)?;
            diesel::insert_or_ignore_into(activity_days::table)
                .values((activity_days::user_id.eq(user_id), activity_days::day.eq(day.as_str())))
                .execute(conn)?;
            let active_days = activity_days::table
                .filter(activity_days::user_id.eq(user_id))
                .count()
                .get_result::<i64>(conn)?;

            diesel::update(user_metrics::table.filter(user_metrics::user_id.eq(user_id)))
                .set((
                    user_metrics::total_sessions.eq(user_metrics::total_sessions + 1),
                    user_metrics::total_usage_hours.eq(user_metrics::total_usage_hours + hours),
                    user_metrics::active_days.eq(active_days as i32),
                    user_metrics::last_activity_at.eq(now.as_str()),
                ))
                .execute(conn)?;
            Self::load_metrics(conn, user_id)
        })
    }

    /// Mark a calendar day active without counting a session
    pub fn mark_active_day(&self, user_id: i32, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let day = at.format("%Y-%m-%d").to_string();
        diesel::insert_or_ignore_into(activity_days::table)
            .values((activity_days::user_id.eq(user_id), activity_days::day.eq(day.as_str())))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Distinct active days, ascending (`YYYY-MM-DD`)
    pub fn activity_days(&self, user_id: i32) -> Result<Vec<String>> {
        let mut conn = self.get_conn()?;
        let days = activity_days::table
            .filter(activity_days::user_id.eq(user_id))
            .order(activity_days::day.asc())
            .select(activity_days::day)
            .load::<String>(&mut conn)?;
        Ok(days)
    }

    /// Mirror point totals and completed-challenge counts into the snapshot
    pub fn sync_gamification_counters(&self, user_id: i32) -> Result<UserMetrics> {
        let completed = self.count_completed_challenges(user_id, None)?;
        let mut conn = self.get_conn()?;
        Self::ensure_metrics_row(&mut conn, user_id, &format_ts(Utc::now()))?;
        let points: i32 = users::table
            .filter(users::id.eq(user_id))
            .select(users::points)
            .first(&mut conn)?;
        let active_days = activity_days::table
            .filter(activity_days::user_id.eq(user_id))
            .count()
            .get_result::<i64>(&mut conn)?;

        diesel::update(user_metrics::table.filter(user_metrics::user_id.eq(user_id)))
            .set((
                user_metrics::total_points.eq(points),
                user_metrics::challenges_completed.eq(completed as i32),
                user_metrics::active_days.eq(active_days as i32),
            ))
            .execute(&mut conn)?;
        Self::load_metrics(&mut conn, user_id)
    }

    // ========================================================================
    // Achievements and content views
    // ========================================================================

    /// Insert an achievement definition unless the code already exists
    pub fn upsert_achievement_definition(&self, def: &NewAchievementDefinition<'_>) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let inserted = diesel::insert_or_ignore_into(achievement_definitions::table)
            .values(def)
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    pub fn list_achievement_definitions(&self) -> Result<Vec<AchievementDefinition>> {
        let mut conn = self.get_conn()?;
        let defs = achievement_definitions::table
            .filter(achievement_definitions::is_active.eq(true))
            .order(achievement_definitions::id.asc())
            .select(AchievementDefinition::as_select())
            .load(&mut conn)?;
        Ok(defs)
    }

    pub fn list_unlocks(&self, user_id: i32) -> Result<Vec<AchievementUnlock>> {
        let mut conn = self.get_conn()?;
        let rows = achievement_unlocks::table
            .filter(achievement_unlocks::user_id.eq(user_id))
            .order(achievement_unlocks::id.asc())
            .select(AchievementUnlock::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Record an unlock and add its bonus points, at most once per pair.
    ///
    /// `INSERT OR IGNORE` against the `(user_id, achievement_id)` unique key
    /// decides whether this call created the unlock; bonus points are only
    /// added when it did. Returns whether the unlock is new.
    pub fn unlock_achievement(
        &self,
        user_id: i32,
        achievement_id: i32,
        bonus_points: i32,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);

        conn.immediate_transaction(|conn| {
            let inserted = diesel::insert_or_ignore_into(achievement_unlocks::table)
                .values(&NewAchievementUnlock {
                    user_id,
                    achievement_id,
                    unlocked_at: &at,
                    progress: 100.0,
                })
                .execute(conn)?;

            if inserted == 1 && bonus_points != 0 {
                diesel::update(users::table.filter(users::id.eq(user_id)))
                    .set(users::points.eq(users::points + bonus_points))
                    .execute(conn)?;
            }
            Ok(inserted == 1)
        })
    }

    /// Record that a user opened a content item; returns true on first view
    pub fn record_content_view(&self, user_id: i32, content_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);
        let inserted = diesel::insert_or_ignore_into(content_views::table)
            .values((
                content_views::user_id.eq(user_id),
                content_views::content_id.eq(content_id),
                content_views::viewed_at.eq(at.as_str()),
            ))
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    /// Content ids the user has opened, in first-view order
    pub fn list_content_views(&self, user_id: i32) -> Result<Vec<String>> {
        let mut conn = self.get_conn()?;
        let ids = content_views::table
            .filter(content_views::user_id.eq(user_id))
            .order(content_views::viewed_at.asc())
            .select(content_views::content_id)
            .load::<String>(&mut conn)?;
        Ok(ids)
    }

    pub fn count_content_views(&self, user_id: i32) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = content_views::table
            .filter(content_views::user_id.eq(user_id))
            .count()
            .get_result::<i64>(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Storylines
    // ========================================================================

    /// Insert a chapter unless its number is already taken
    pub fn upsert_storyline(&self, chapter_number: i32, title: &str, body: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let inserted = diesel::insert_or_ignore_into(storylines::table)
            .values(&NewStoryline { chapter_number, title, body })
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    pub fn list_storylines(&self) -> Result<Vec<Storyline>> {
        let mut conn = self.get_conn()?;
        let chapters = storylines::table
            .order(storylines::chapter_number.asc())
            .select(Storyline::as_select())
            .load(&mut conn)?;
        Ok(chapters)
    }

    pub fn story_progress(&self, user_id: i32) -> Result<Vec<StoryProgress>> {
        let mut conn = self.get_conn()?;
        let rows = story_progress::table
            .filter(story_progress::user_id.eq(user_id))
            .select(StoryProgress::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Mark a chapter completed and award points, once
    pub fn complete_storyline(&self, user_id: i32, storyline_id: i32, points: i32, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);

        conn.immediate_transaction(|conn| {
            diesel::insert_or_ignore_into(story_progress::table)
                .values(&StoryProgress {
                    user_id,
                    storyline_id,
                    completed: false,
                    completed_at: None,
                })
                .execute(conn)?;

            let updated = diesel::update(
                story_progress::table
                    .filter(story_progress::user_id.eq(user_id))
                    .filter(story_progress::storyline_id.eq(storyline_id))
                    .filter(story_progress::completed.eq(false)),
            )
            .set((
                story_progress::completed.eq(true),
                story_progress::completed_at.eq(Some(at.as_str())),
            ))
            .execute(conn)?;

            if updated == 1 && points != 0 {
                diesel::update(users::table.filter(users::id.eq(user_id)))
                    .set(users::points.eq(users::points + points))
                    .execute(conn)?;
            }
            Ok(updated == 1)
        })
    }

    // ========================================================================
    // Games
    // ========================================================================

    pub fn insert_trivia_question(&self, prompt: &str, options_json: &str, correct_key: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let inserted = diesel::insert_or_ignore_into(trivia_questions::table)
            .values(&NewTriviaQuestion { prompt, options_json, correct_key })
            .execute(&mut conn)?;
        Ok(inserted == 1)
    }

    pub fn list_trivia_questions(&self) -> Result<Vec<TriviaQuestion>> {
        let mut conn = self.get_conn()?;
        let rows = trivia_questions::table
            .order(trivia_questions::id.asc())
            .select(TriviaQuestion::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Apply one finished round to the user's totals for `game`
    pub fn record_game_round(&self, user_id: i32, game: &str, tally: &RoundTally, at: DateTime<Utc>) -> Result<GameScore> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);

        conn.immediate_transaction(|conn| {
            diesel::insert_or_ignore_into(game_scores::table)
                .values(&GameScore {
                    user_id,
                    game: game.to_string(),
                    total_points: 0,
                    best_round: 0,
                    rounds: 0,
                    correct: 0,
                    partial: 0,
                    incorrect: 0,
                    updated_at: at.clone(),
                })
                .execute(conn)?;

            let current = game_scores::table
                .filter(game_scores::user_id.eq(user_id))
                .filter(game_scores::game.eq(game))
                .select(GameScore::as_select())
                .first(conn)?;

            diesel::update(
                game_scores::table
                    .filter(game_scores::user_id.eq(user_id))
                    .filter(game_scores::game.eq(game)),
            )
            .set((
                game_scores::total_points.eq(current.total_points + tally.points),
                game_scores::best_round.eq(current.best_round.max(tally.points)),
                game_scores::rounds.eq(current.rounds + 1),
                game_scores::correct.eq(current.correct + tally.correct),
                game_scores::partial.eq(current.partial + tally.partial),
                game_scores::incorrect.eq(current.incorrect + tally.incorrect),
                game_scores::updated_at.eq(at.as_str()),
            ))
            .execute(conn)?;

            let score = game_scores::table
                .filter(game_scores::user_id.eq(user_id))
                .filter(game_scores::game.eq(game))
                .select(GameScore::as_select())
                .first(conn)?;
            Ok(score)
        })
    }

    pub fn get_game_score(&self, user_id: i32, game: &str) -> Result<Option<GameScore>> {
        let mut conn = self.get_conn()?;
        let score = game_scores::table
            .filter(game_scores::user_id.eq(user_id))
            .filter(game_scores::game.eq(game))
            .select(GameScore::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(score)
    }

    /// Leaderboard for one game by accumulated points
    pub fn top_game_scores(&self, game: &str, limit: i64) -> Result<Vec<GameScore>> {
        let mut conn = self.get_conn()?;
        let rows = game_scores::table
            .filter(game_scores::game.eq(game))
            .filter(game_scores::total_points.gt(0))
            .order((game_scores::total_points.desc(), game_scores::user_id.asc()))
            .limit(limit)
            .select(GameScore::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Raise the user's best trivia score if `score` beats it
    pub fn raise_best_trivia_score(&self, user_id: i32, score: i32) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let updated = diesel::update(
            users::table
                .filter(users::id.eq(user_id))
                .filter(users::best_trivia_score.lt(score)),
        )
        .set(users::best_trivia_score.eq(score))
        .execute(&mut conn)?;
        Ok(updated == 1)
    }

    // ========================================================================
    // Precached content
    // ========================================================================

    /// Append an unused item to the (user, kind) queue
    pub fn insert_precached(&self, user_id: i32, kind: &str, payload_json: &str, at: DateTime<Utc>) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);
        diesel::insert_into(precached_items::table)
            .values(&NewPrecachedItem {
                user_id,
                kind,
                payload_json,
                used: false,
                created_at: &at,
            })
            .execute(&mut conn)?;
        Self::last_insert_id(&mut conn)
    }

    /// Claim the earliest unused item for (user, kind).
    ///
    /// Selection and the `used = 1` flip run in one immediate transaction and
    /// the flip is conditional on `used = 0`, so an item is handed out at most once.
    pub fn take_precached(&self, user_id: i32, kind: &str, at: DateTime<Utc>) -> Result<Option<PrecachedItem>> {
        let mut conn = self.get_conn()?;
        let at = format_ts(at);

        conn.immediate_transaction(|conn| {
            let candidate = precached_items::table
                .filter(precached_items::user_id.eq(user_id))
                .filter(precached_items::kind.eq(kind))
                .filter(precached_items::used.eq(false))
                .order((precached_items::created_at.asc(), precached_items::id.asc()))
                .select(PrecachedItem::as_select())
                .first(conn)
                .optional()?;

            let Some(mut item) = candidate else {
                return Ok(None);
            };

            let claimed = diesel::update(
                precached_items::table
                    .filter(precached_items::id.eq(item.id))
                    .filter(precached_items::used.eq(false)),
            )
            .set((
                precached_items::used.eq(true),
                precached_items::used_at.eq(Some(at.as_str())),
            ))
            .execute(conn)?;

            if claimed == 0 {
                return Ok(None);
            }
            item.used = true;
            item.used_at = Some(at.clone());
            Ok(Some(item))
        })
    }

    pub fn count_unused_precached(&self, user_id: i32, kind: &str) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = precached_items::table
            .filter(precached_items::user_id.eq(user_id))
            .filter(precached_items::kind.eq(kind))
            .filter(precached_items::used.eq(false))
            .count()
            .get_result::<i64>(&mut conn)?;
        Ok(count)
    }
}

// ============================================================================
// Additional Types
// ============================================================================

/// Summary statistics for `pecunia init` / `pecunia user show`
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbSummary {
    pub users: i64,
    pub expenses: i64,
    pub enrollments: i64,
    pub assessments: i64,
}

impl Database {
    pub fn summary(&self) -> Result<DbSummary> {
        let mut conn = self.get_conn()?;
        Ok(DbSummary {
            users: users::table.count().get_result(&mut conn)?,
            expenses: expenses::table.count().get_result(&mut conn)?,
            enrollments: challenge_enrollments::table.count().get_result(&mut conn)?,
            assessments: assessments::table.count().get_result(&mut conn)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ExpenseCategory;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = a + Duration::microseconds(1);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(a)).unwrap(), a);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert!(matches!(parse_ts("yesterday"), Err(DbError::Corrupt(_))));
    }

    #[test]
    fn test_schema_display() {
        assert_eq!(CURRENT_SCHEMA.to_string(), "v1.2.0 (progress-engine)");
        assert!(CURRENT_SCHEMA.has_feature("precache"));
    }

    #[test]
    fn test_create_user_rejects_bad_email() {
        let (_dir, db) = temp_db();
        assert!(matches!(db.create_user("nobody", "No One"), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_create_user_starts_with_metrics_row() {
        let (_dir, db) = temp_db();
        let id = db.create_user("ana@example.com", "Ana").unwrap();
        let user = db.require_user(id).unwrap();
        assert_eq!(user.points, 0);
        let metrics = db.get_metrics(id).unwrap();
        assert_eq!(metrics.total_sessions, 0);
        assert_eq!(metrics.improvement_pct, 0.0);
    }

    #[test]
    fn test_sum_expenses_window_is_inclusive() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(7);

        db.insert_expense(user, 10.0, "savings", "bank", start).unwrap();
        db.insert_expense(user, 20.0, "savings", "bank", end).unwrap();
        db.insert_expense(user, 40.0, "savings", "bank", end + Duration::seconds(1)).unwrap();
        db.insert_expense(user, 5.0, "food", "market", start + Duration::days(1)).unwrap();

        let saved = db
            .sum_expenses(user, CategoryFilter::Only(ExpenseCategory::Savings), start, end)
            .unwrap();
        assert_eq!(saved, 30.0);
        let spent = db
            .sum_expenses(user, CategoryFilter::Except(ExpenseCategory::Savings), start, end)
            .unwrap();
        assert_eq!(spent, 5.0);
    }

    #[test]
    fn test_enroll_is_unique_per_pair() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        db.upsert_challenge_definition(&NewChallengeDefinition {
            code: "save-100",
            title: "Save 100",
            kind: "savings",
            goal_amount: 100.0,
            duration_days: 7,
            points: 30,
            is_active: true,
        })
        .unwrap();
        let def = db.find_challenge_definition("save-100").unwrap().unwrap();

        let (first, created) = db.enroll(user, def.id, Utc::now()).unwrap();
        assert!(created);
        let (second, created_again) = db.enroll(user, def.id, Utc::now()).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(first.started_at, second.started_at);
    }

    #[test]
    fn test_settle_enrollment_only_once() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        db.upsert_challenge_definition(&NewChallengeDefinition {
            code: "save-100",
            title: "Save 100",
            kind: "savings",
            goal_amount: 100.0,
            duration_days: 7,
            points: 30,
            is_active: true,
        })
        .unwrap();
        let def = db.find_challenge_definition("save-100").unwrap().unwrap();
        let (enrollment, _) = db.enroll(user, def.id, Utc::now()).unwrap();

        assert!(db.settle_enrollment(enrollment.id, user, "completed", 30, Utc::now()).unwrap());
        assert!(!db.settle_enrollment(enrollment.id, user, "completed", 30, Utc::now()).unwrap());
        assert!(!db.settle_enrollment(enrollment.id, user, "failed", 0, Utc::now()).unwrap());

        assert_eq!(db.require_user(user).unwrap().points, 30);
        let stored = db.get_enrollment(enrollment.id).unwrap().unwrap();
        assert_eq!(stored.state, "completed");
        assert!(stored.closed_at.is_some());
    }

    #[test]
    fn test_settle_enrollment_rejects_foreign_user() {
        let (_dir, db) = temp_db();
        let owner = db.create_user("ana@example.com", "Ana").unwrap();
        let intruder = db.create_user("leo@example.com", "Leo").unwrap();
        db.upsert_challenge_definition(&NewChallengeDefinition {
            code: "cap-50",
            title: "Cap 50",
            kind: "spending_cap",
            goal_amount: 50.0,
            duration_days: 3,
            points: 25,
            is_active: true,
        })
        .unwrap();
        let def = db.find_challenge_definition("cap-50").unwrap().unwrap();
        let (enrollment, _) = db.enroll(owner, def.id, Utc::now()).unwrap();

        assert!(!db.settle_enrollment(enrollment.id, intruder, "completed", 25, Utc::now()).unwrap());
        assert_eq!(db.require_user(intruder).unwrap().points, 0);
    }

    #[test]
    fn test_take_precached_is_fifo_and_single_use() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();

        let older = db.insert_precached(user, "phrase", "{\"n\":1}", t0).unwrap();
        let newer = db.insert_precached(user, "phrase", "{\"n\":2}", t0 + Duration::minutes(1)).unwrap();
        db.insert_precached(user, "question_bundle", "{}", t0 - Duration::days(1)).unwrap();

        let first = db.take_precached(user, "phrase", Utc::now()).unwrap().unwrap();
        assert_eq!(first.id, older);
        assert!(first.used);
        let second = db.take_precached(user, "phrase", Utc::now()).unwrap().unwrap();
        assert_eq!(second.id, newer);
        assert!(db.take_precached(user, "phrase", Utc::now()).unwrap().is_none());
        assert_eq!(db.count_unused_precached(user, "question_bundle").unwrap(), 1);
    }

    #[test]
    fn test_record_session_counts_distinct_days() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        let day1 = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap();

        db.record_session(user, 0.5, day1).unwrap();
        db.record_session(user, 0.25, day1 + Duration::hours(3)).unwrap();
        let metrics = db.record_session(user, 1.0, day1 + Duration::days(1)).unwrap();

        assert_eq!(metrics.total_sessions, 3);
        assert_eq!(metrics.active_days, 2);
        assert!((metrics.total_usage_hours - 1.75).abs() < 1e-9);
        assert_eq!(db.activity_days(user).unwrap(), vec!["2026-02-01", "2026-02-02"]);
    }

    #[test]
    fn test_record_game_round_accumulates() {
        let (_dir, db) = temp_db();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        let tally = RoundTally { points: 5, correct: 1, ..Default::default() };
        db.record_game_round(user, "phrases", &tally, Utc::now()).unwrap();
        let tally = RoundTally { points: 2, partial: 1, ..Default::default() };
        let score = db.record_game_round(user, "phrases", &tally, Utc::now()).unwrap();

        assert_eq!(score.total_points, 7);
        assert_eq!(score.best_round, 5);
        assert_eq!(score.rounds, 2);
        assert_eq!((score.correct, score.partial, score.incorrect), (1, 1, 0));
    }
}
