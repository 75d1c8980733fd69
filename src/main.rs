use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use colored::Colorize;
use pecunia::achievement::{self, UnlockedAchievement};
use pecunia::assessment::{self, AssessmentAnswers, QuizResponses, RecordedAssessment};
use pecunia::challenge::{self, CheckOutcome, Settlement};
use pecunia::games::{self, PhraseRound, TriviaAnswer, TriviaSession};
use pecunia::generator::{self, ContentGenerator, ContentKind, ContentPayload, GeneratedQuestion};
use pecunia::ledger::{self, ExpenseCategory, NewEntry};
use pecunia::precache::ContentPrecacheManager;
use pecunia::storyline::{self, ChapterCompletion};
use pecunia::{metrics, Config, Database, CURRENT_SCHEMA};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "pecunia")]
#[command(author, version, about = "Progress and gamification engine for personal-finance education")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create .pecunia/, the store, a config file and the stock catalogues
    Init,

    /// Insert the stock catalogues into an existing store
    Seed,

    /// Store location, schema version and row counts
    Status,

    /// Manage learners
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Record and list ledger entries
    Expense {
        #[command(subcommand)]
        action: ExpenseAction,
    },

    /// Join and check time-boxed challenges
    Challenge {
        #[command(subcommand)]
        action: ChallengeAction,
    },

    /// Score and store a questionnaire
    Assess {
        #[arg(long)]
        user: i32,

        /// Answers as JSON, a path to a JSON file, or '-' for stdin
        #[arg(long)]
        answers: String,
    },

    /// Take a generated quiz on stdin and record the graded assessment
    Quiz {
        #[arg(long)]
        user: i32,

        /// The learner holds credit cards
        #[arg(long)]
        has_cards: bool,

        #[arg(long, default_value_t = 0)]
        cards: i32,

        /// Outstanding card debt
        #[arg(long, default_value_t = 0.0)]
        debt: f64,

        /// How often only the minimum payment is made (0 = never)
        #[arg(long, default_value_t = 0)]
        min_payments: i32,

        #[arg(long)]
        fraud_experience: bool,
    },

    /// Show a learner's progress metrics
    Metrics {
        #[arg(long)]
        user: i32,
    },

    /// Record a usage session
    Session {
        #[arg(long)]
        user: i32,

        /// Session length in hours
        #[arg(long)]
        hours: f64,
    },

    /// Achievement catalogue and unlocks
    Achievements {
        #[command(subcommand)]
        action: AchievementAction,
    },

    /// Storyline chapters
    Story {
        #[command(subcommand)]
        action: StoryAction,
    },

    /// Learning content
    Content {
        #[command(subcommand)]
        action: ContentAction,
    },

    /// Trivia and fill-in-the-blank games
    Game {
        #[command(subcommand)]
        action: GameAction,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Register a learner
    Add { email: String, name: String },
    /// Profile, metrics and game totals
    Show { id: i32 },
    /// Leaderboard
    Ranking {
        #[arg(long, value_enum, default_value = "points")]
        by: RankingKey,
        #[arg(short = 'n', long, default_value = "10")]
        limit: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RankingKey {
    Points,
    Trivia,
}

#[derive(Subcommand, Debug)]
enum ExpenseAction {
    /// Append an entry; challenges and achievements are re-evaluated
    Add {
        #[arg(long)]
        user: i32,
        amount: f64,
        /// food, education, clothing, other or savings
        category: ExpenseCategory,
        #[arg(long, default_value = "")]
        store: String,
        /// RFC3339 timestamp (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Most recent entries first
    List {
        #[arg(long)]
        user: i32,
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },
    /// Savings totals per month
    Monthly {
        #[arg(long)]
        user: i32,
    },
}

#[derive(Subcommand, Debug)]
enum ChallengeAction {
    /// Catalogue of challenges
    List,
    /// Enroll in a challenge by code
    Join {
        #[arg(long)]
        user: i32,
        code: String,
    },
    /// Settle what can settle and show progress; pass an id to check one enrollment
    Check {
        #[arg(long)]
        user: i32,
        enrollment: Option<i32>,
    },
    /// Finished challenges
    History {
        #[arg(long)]
        user: i32,
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum AchievementAction {
    /// Unlocked and locked achievements with progress
    List {
        #[arg(long)]
        user: i32,
    },
    /// Unlock anything the learner now qualifies for
    Check {
        #[arg(long)]
        user: i32,
    },
}

#[derive(Subcommand, Debug)]
enum StoryAction {
    /// Chapters with lock state
    List {
        #[arg(long)]
        user: i32,
    },
    /// Complete an unlocked chapter
    Complete {
        #[arg(long)]
        user: i32,
        chapter: i32,
    },
}

#[derive(Subcommand, Debug)]
enum ContentAction {
    /// Mark a content item as viewed (prefix fraud content with 'fraud/')
    View {
        #[arg(long)]
        user: i32,
        id: String,
    },
    /// Take one precached item, generating it if the queue is empty
    Fetch {
        #[arg(long)]
        user: i32,
        /// questions or phrase
        #[arg(default_value = "questions")]
        kind: ContentKind,
    },
}

#[derive(Subcommand, Debug)]
enum GameAction {
    /// Answer multiple-choice questions until too many misses
    Trivia {
        #[arg(long)]
        user: i32,
    },
    /// Fill in the missing word of a finance sentence
    Phrase {
        #[arg(long)]
        user: i32,
        /// Answer non-interactively
        #[arg(long)]
        answer: Option<String>,
    },
    /// Best players of a game
    Ranking {
        /// trivia or phrases
        #[arg(default_value = games::TRIVIA_GAME)]
        game: String,
        #[arg(short = 'n', long, default_value = "10")]
        limit: i64,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = Config::load();
    init_logging(&config);

    if let Err(e) = run(cli, &config) {
        eprintln!("{} {}", "Error:".red(), e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_env("PECUNIA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli, config: &Config) -> CliResult {
    let json = cli.json;
    match cli.command {
        Command::Init => pecunia::init::init_project().map_err(Into::into),
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "pecunia", &mut io::stdout());
            Ok(())
        }
        Command::Seed => {
            let db = Database::open()?;
            let report = pecunia::init::seed_catalogues(&db)?;
            emit(json, &report, || {
                println!(
                    "{} {} challenges, {} achievements, {} chapters, {} trivia questions",
                    "Seeded".green(),
                    report.challenges,
                    report.achievements,
                    report.chapters,
                    report.trivia
                );
            })
        }
        Command::Status => {
            let db = Database::open()?;
            let summary = db.summary()?;
            emit(json, &summary, || {
                println!("Store:       {}", Database::db_path().display());
                println!("Schema:      {}", CURRENT_SCHEMA);
                println!("Users:       {}", summary.users);
                println!("Entries:     {}", summary.expenses);
                println!("Enrollments: {}", summary.enrollments);
                println!("Assessments: {}", summary.assessments);
            })
        }
        Command::User { action } => run_user(action, json),
        Command::Expense { action } => run_expense(action, json),
        Command::Challenge { action } => run_challenge(action, json),
        Command::Assess { user, answers } => {
            let db = Database::open()?;
            let answers: AssessmentAnswers = serde_json::from_str(&read_answers(&answers)?)?;
            let recorded = assessment::record_assessment(&db, user, &answers)?;
            let unlocked = achievement::unlock_for_user(&db, user, Utc::now())?;
            emit(json, &recorded, || print_recorded(&recorded, &unlocked))
        }
        Command::Quiz {
            user,
            has_cards,
            cards,
            debt,
            min_payments,
            fraud_experience,
        } => {
            let db = Database::open()?;
            db.require_user(user)?;
            let manager = precache_manager(&db, config);
            let fetched = manager.fetch_or_generate(user, ContentKind::QuestionBundle)?;
            let ContentPayload::QuestionBundle(bundle) = fetched.payload else {
                return Err("question queue returned a different kind of content".into());
            };

            // Under --json the questions go to stderr so stdout stays parseable
            let mut out: Box<dyn Write> = if json {
                Box::new(io::stderr())
            } else {
                Box::new(io::stdout())
            };
            let stdin = io::stdin();
            let mut lines = stdin.lock().lines();

            let mut responses = QuizResponses {
                has_cards,
                card_count: cards,
                debt_amount: debt,
                min_payment_frequency: min_payments,
                fraud_experience,
                ..Default::default()
            };
            for (topic, questions) in &bundle.topics {
                let picks = ask_questions(out.as_mut(), &mut lines, topic, questions)?;
                responses.topics.insert(topic.clone(), picks);
            }
            responses.theory = ask_questions(out.as_mut(), &mut lines, "theory", &bundle.theory)?;
            responses.practice = ask_questions(out.as_mut(), &mut lines, "practice", &bundle.practice)?;

            let recorded = assessment::record_quiz(&db, user, &bundle, &responses)?;
            let unlocked = achievement::unlock_for_user(&db, user, Utc::now())?;
            let shown = emit(json, &recorded, || print_recorded(&recorded, &unlocked));
            manager.shutdown();
            shown
        }
        Command::Metrics { user } => {
            let db = Database::open()?;
            let m = metrics::metrics_for(&db, user)?;
            let streak = metrics::longest_consecutive_active_days(&db, user)?;
            emit(json, &m, || {
                println!("Registered:     {}", m.registered_at);
                println!("Last activity:  {}", m.last_activity_at);
                println!("Active days:    {} (longest streak {})", m.active_days, streak);
                println!("Sessions:       {} ({:.1} h)", m.total_sessions, m.total_usage_hours);
                println!(
                    "Score:          {} -> {} ({:+.1}%)",
                    m.initial_score, m.current_score, m.improvement_pct
                );
                println!("Challenges won: {}", m.challenges_completed);
                println!("Points:         {}", m.total_points.to_string().yellow());
            })
        }
        Command::Session { user, hours } => {
            let db = Database::open()?;
            let m = metrics::record_session(&db, user, hours)?;
            emit(json, &m, || {
                println!(
                    "{} session ({} total, {:.1} h)",
                    "Recorded".green(),
                    m.total_sessions,
                    m.total_usage_hours
                );
            })
        }
        Command::Achievements { action } => run_achievements(action, json),
        Command::Story { action } => run_story(action, config, json),
        Command::Content { action } => run_content(action, config, json),
        Command::Game { action } => run_game(action, config, json),
    }
}

fn run_user(action: UserAction, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        UserAction::Add { email, name } => {
            let id = db.create_user(&email, &name)?;
            let user = db.require_user(id)?;
            emit(json, &user, || {
                println!("{} user {} ({})", "Created".green(), id, user.email);
            })
        }
        UserAction::Show { id } => {
            let user = db.require_user(id)?;
            let m = metrics::metrics_for(&db, id)?;
            let trivia = db.get_game_score(id, games::TRIVIA_GAME)?;
            let phrases = db.get_game_score(id, games::PHRASE_GAME)?;
            let content_views = db.count_content_views(id)?;

            #[derive(Serialize)]
            struct Profile<'a> {
                user: &'a pecunia::User,
                metrics: &'a pecunia::UserMetrics,
                trivia: Option<&'a pecunia::GameScore>,
                phrases: Option<&'a pecunia::GameScore>,
                content_views: i64,
            }
            let profile = Profile {
                user: &user,
                metrics: &m,
                trivia: trivia.as_ref(),
                phrases: phrases.as_ref(),
                content_views,
            };
            emit(json, &profile, || {
                println!("{} <{}>", user.display_name.bold(), user.email);
                println!("   id {} / handle {}", user.id, user.handle.dimmed());
                println!("   points {}", user.points.to_string().yellow());
                println!("   current score {} ({:+.1}%)", m.current_score, m.improvement_pct);
                println!("   best trivia round {}", user.best_trivia_score);
                println!("   lessons opened {}", content_views);
                for score in [&trivia, &phrases].into_iter().flatten() {
                    println!(
                        "   {}: {} pts over {} rounds",
                        score.game, score.total_points, score.rounds
                    );
                }
            })
        }
        UserAction::Ranking { by, limit } => {
            let users = match by {
                RankingKey::Points => db.top_users_by_points(limit)?,
                RankingKey::Trivia => db.top_users_by_trivia(limit)?,
            };
            emit(json, &users, || {
                for (rank, u) in users.iter().enumerate() {
                    let value = match by {
                        RankingKey::Points => u.points,
                        RankingKey::Trivia => u.best_trivia_score,
                    };
                    println!("{:>3}. {:<24} {}", rank + 1, u.display_name, value);
                }
            })
        }
    }
}

fn run_expense(action: ExpenseAction, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        ExpenseAction::Add {
            user,
            amount,
            category,
            store,
            at,
        } => {
            let spent_at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| format!("invalid --at '{}': {}", raw, e))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let outcome = ledger::register_expense(
                &db,
                &NewEntry {
                    user_id: user,
                    amount,
                    category,
                    store_name: store,
                    spent_at,
                },
            )?;
            emit(json, &outcome, || {
                println!("{} entry {} ({:.2} {})", "Recorded".green(), outcome.expense_id, amount, category);
                print_settlements(&outcome.settled);
                print_unlocks(&outcome.unlocked);
            })
        }
        ExpenseAction::List { user, limit } => {
            let rows = db.list_expenses(user, limit)?;
            emit(json, &rows, || {
                if rows.is_empty() {
                    println!("No entries.");
                }
                for r in &rows {
                    println!(
                        "{:>5}  {}  {:>10.2}  {:<10} {}",
                        r.id,
                        r.spent_at.dimmed(),
                        r.amount,
                        r.category,
                        r.store_name
                    );
                }
            })
        }
        ExpenseAction::Monthly { user } => {
            db.require_user(user)?;
            let months = ledger::monthly_savings(&db, user)?;
            emit(json, &months, || {
                for (month, total) in &months {
                    println!("{}  {:>10.2}", month, total);
                }
            })
        }
    }
}

fn run_challenge(action: ChallengeAction, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        ChallengeAction::List => {
            let defs = db.list_challenge_definitions()?;
            emit(json, &defs, || {
                for d in &defs {
                    let status = if d.is_active { "" } else { " (retired)" };
                    println!(
                        "{:<20} {:<12} goal {:>8.2} in {:>2} days, {} pts  {}{}",
                        d.code.cyan(),
                        d.kind,
                        d.goal_amount,
                        d.duration_days,
                        d.points,
                        d.title,
                        status
                    );
                }
            })
        }
        ChallengeAction::Join { user, code } => {
            let joined = challenge::join_challenge(&db, user, &code)?;
            emit(json, &joined, || {
                if joined.created {
                    println!("{} {} (enrollment {})", "Joined".green(), code, joined.enrollment.id);
                } else {
                    println!(
                        "{} already enrolled in {} (enrollment {})",
                        "Skipping".yellow(),
                        code,
                        joined.enrollment.id
                    );
                }
            })
        }
        ChallengeAction::Check { user, enrollment: Some(id) } => {
            let outcome = challenge::check_enrollment(&db, user, id)?;
            emit(json, &outcome, || match &outcome {
                CheckOutcome::Settled(s) => print_settlements(std::slice::from_ref(s)),
                CheckOutcome::Active(p) => println!(
                    "{}: {:.2} / {:.2} ({:.0}%), {} days left",
                    p.title, p.aggregate, p.goal_amount, p.percent, p.days_left
                ),
                CheckOutcome::Closed { state, earned_points } => {
                    println!("Enrollment {} already {} ({} pts)", id, state, earned_points)
                }
                CheckOutcome::StateLost => {
                    println!("{} enrollment {} is not yours; list your challenges again", "Lost".yellow(), id)
                }
            })
        }
        ChallengeAction::Check { user, enrollment: None } => {
            let (settled, active) = challenge::challenge_progress(&db, user)?;

            #[derive(Serialize)]
            struct Progress<'a> {
                settled: &'a [Settlement],
                active: &'a [challenge::ChallengeProgress],
            }
            emit(json, &Progress { settled: &settled, active: &active }, || {
                print_settlements(&settled);
                if active.is_empty() && settled.is_empty() {
                    println!("No active challenges.");
                }
                for p in &active {
                    println!(
                        "{:>4}  {:<32} {:>8.2} / {:<8.2} {:>3.0}%  {} days left",
                        p.enrollment_id, p.title, p.aggregate, p.goal_amount, p.percent, p.days_left
                    );
                }
            })
        }
        ChallengeAction::History { user, limit } => {
            let history = challenge::challenge_history(&db, user, limit)?;
            emit(json, &history, || {
                for h in &history {
                    println!(
                        "{:>4}  {:<32} {:<10} {:>4} pts  {}",
                        h.enrollment_id,
                        h.title,
                        h.state,
                        h.earned_points,
                        h.closed_at.as_deref().unwrap_or("-")
                    );
                }
            })
        }
    }
}

fn run_achievements(action: AchievementAction, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        AchievementAction::List { user } => {
            let overview = achievement::achievement_overview(&db, user)?;
            emit(json, &overview, || {
                println!("{:.0}% complete", overview.percent_complete);
                for a in &overview.unlocked {
                    println!("  {} {:<28} +{}", "✓".green(), a.title, a.bonus_points);
                }
                for a in &overview.locked {
                    println!("  {} {:<28} {:>3.0}%", "·".dimmed(), a.title, a.progress);
                }
            })
        }
        AchievementAction::Check { user } => {
            db.require_user(user)?;
            let unlocked = achievement::unlock_for_user(&db, user, Utc::now())?;
            emit(json, &unlocked, || {
                if unlocked.is_empty() {
                    println!("Nothing new.");
                }
                print_unlocks(&unlocked);
            })
        }
    }
}

fn run_story(action: StoryAction, config: &Config, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        StoryAction::List { user } => {
            let chapters = storyline::chapters_for(&db, user)?;
            emit(json, &chapters, || {
                for c in &chapters {
                    let mark = if c.completed {
                        "done".green()
                    } else if c.unlocked {
                        "open".cyan()
                    } else {
                        "locked".dimmed()
                    };
                    println!("{:>2}. {:<36} {}", c.chapter.chapter_number, c.chapter.title, mark);
                }
            })
        }
        StoryAction::Complete { user, chapter } => {
            let result =
                storyline::complete_chapter(&db, user, chapter, config.story.chapter_completion_points)?;
            emit(json, &result, || match &result {
                ChapterCompletion::Completed { points } => {
                    println!("{} chapter {} (+{} pts)", "Completed".green(), chapter, points)
                }
                ChapterCompletion::AlreadyCompleted => {
                    println!("{} chapter {} (already completed)", "Skipping".yellow(), chapter)
                }
                ChapterCompletion::Locked => {
                    println!("Chapter {} is locked; finish chapter {} first", chapter, chapter - 1)
                }
            })
        }
    }
}

fn run_content(action: ContentAction, config: &Config, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        ContentAction::View { user, id } => {
            let (first_view, unlocked) = achievement::view_content(&db, user, &id)?;

            #[derive(Serialize)]
            struct Viewed<'a> {
                first_view: bool,
                unlocked: &'a [UnlockedAchievement],
            }
            emit(json, &Viewed { first_view, unlocked: &unlocked }, || {
                if first_view {
                    println!("{} {}", "Viewed".green(), id);
                } else {
                    println!("{} {} (seen before)", "Viewed".yellow(), id);
                }
                print_unlocks(&unlocked);
            })
        }
        ContentAction::Fetch { user, kind } => {
            db.require_user(user)?;
            let manager = precache_manager(&db, config);
            let fetched = manager.fetch_or_generate(user, kind)?;
            let shown = emit(json, &fetched, || {
                println!("{} ({:?})", kind.to_string().bold(), fetched.source);
                print_payload(&fetched.payload);
            });
            manager.shutdown();
            shown
        }
    }
}

fn run_game(action: GameAction, config: &Config, json: bool) -> CliResult {
    let db = Database::open()?;
    match action {
        GameAction::Trivia { user } => {
            db.require_user(user)?;
            let bank = db.list_trivia_questions()?;
            if bank.is_empty() {
                return Err("no trivia questions; run `pecunia seed` first".into());
            }
            let mut session = TriviaSession::new();
            let mut rng = rand::thread_rng();
            let stdin = io::stdin();
            let mut lines = stdin.lock().lines();

            while let Some(question) = session.next_question(&bank, &mut rng) {
                println!("\n{}", question.prompt.bold());
                for (key, text) in games::trivia_options(question)? {
                    println!("  {}) {}", key, text);
                }
                print!("> ");
                io::stdout().flush()?;
                let Some(line) = lines.next() else {
                    break;
                };
                match session.answer(&bank, &line?, &config.games) {
                    TriviaAnswer::Scored {
                        correct,
                        correct_key,
                        round_over,
                        ..
                    } => {
                        if correct {
                            println!("{}", "Correct!".green());
                        } else {
                            println!("{} the answer was {}", "Wrong:".red(), correct_key);
                        }
                        if round_over {
                            break;
                        }
                    }
                    TriviaAnswer::StateLost => println!("{}", "Round restarted.".yellow()),
                }
            }

            let summary = games::finish_trivia_round(&db, user, &mut session)?;
            emit(json, &summary, || {
                println!("\nRound score: {}", summary.score.to_string().bold());
                if summary.new_best {
                    println!("{}", "New personal best!".green());
                }
            })
        }
        GameAction::Phrase { user, answer } => {
            db.require_user(user)?;
            let manager = precache_manager(&db, config);
            let fetched = manager.fetch_or_generate(user, ContentKind::Phrase)?;
            let ContentPayload::Phrase(phrase) = fetched.payload else {
                return Err("phrase queue returned a different kind of content".into());
            };
            let round = PhraseRound::from(phrase);

            let answer = match answer {
                Some(a) => a,
                None => {
                    println!("{}", round.blanked());
                    print!("> ");
                    io::stdout().flush()?;
                    let mut line = String::new();
                    io::stdin().lock().read_line(&mut line)?;
                    line
                }
            };
            let result = games::play_phrase(&db, user, &round, &answer, &config.games)?;
            let shown = emit(json, &result, || {
                println!(
                    "{:?}: the word was {} (+{} pts, {} total)",
                    result.verdict,
                    result.keyword.bold(),
                    result.points,
                    result.totals.total_points
                );
            });
            // The refill may still be running; only wait once the round is over
            manager.shutdown();
            shown
        }
        GameAction::Ranking { game, limit } => {
            let scores = db.top_game_scores(&game, limit)?;
            emit(json, &scores, || {
                for (rank, s) in scores.iter().enumerate() {
                    println!("{:>3}. user {:<6} {:>6} pts  best {}", rank + 1, s.user_id, s.total_points, s.best_round);
                }
            })
        }
    }
}

fn precache_manager(db: &Database, config: &Config) -> ContentPrecacheManager {
    let content: Arc<dyn ContentGenerator> = Arc::from(generator::from_config(&config.generation));
    ContentPrecacheManager::new(db.clone(), content, config.precache.effective_workers())
}

/// Show each question and read one option key per line; blank or EOF skips
fn ask_questions(
    out: &mut dyn Write,
    lines: &mut impl Iterator<Item = io::Result<String>>,
    title: &str,
    questions: &[GeneratedQuestion],
) -> io::Result<Vec<Option<String>>> {
    writeln!(out, "\n{}", title.cyan().bold())?;
    let mut picks = Vec::with_capacity(questions.len());
    for question in questions {
        writeln!(out, "{}", question.prompt.bold())?;
        for (key, text) in &question.options {
            writeln!(out, "  {}) {}", key, text)?;
        }
        write!(out, "> ")?;
        out.flush()?;
        let pick = lines
            .next()
            .transpose()?
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty());
        picks.push(pick);
    }
    Ok(picks)
}

fn print_recorded(recorded: &RecordedAssessment, unlocked: &[UnlockedAchievement]) {
    println!(
        "{} assessment #{}: {} ({})",
        "Recorded".green(),
        recorded.assessment.sequence_number,
        recorded.assessment.total_score.to_string().bold(),
        recorded.level
    );
    println!("   Improvement: {:.1}%", recorded.metrics.improvement_pct);
    print_unlocks(unlocked);
}

fn read_answers(arg: &str) -> Result<String, Box<dyn std::error::Error>> {
    let trimmed = arg.trim();
    if trimmed == "-" {
        let mut buf = String::new();
        io::Read::read_to_string(&mut io::stdin(), &mut buf)?;
        Ok(buf)
    } else if trimmed.starts_with('{') {
        Ok(trimmed.to_string())
    } else {
        Ok(std::fs::read_to_string(trimmed)?)
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> CliResult {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn print_settlements(settled: &[Settlement]) {
    for s in settled {
        let state = match s.state {
            pecunia::EnrollmentState::Completed => s.state.to_string().green(),
            _ => s.state.to_string().red(),
        };
        println!("   Challenge {} {} (+{} pts)", s.title.bold(), state, s.earned_points);
    }
}

fn print_unlocks(unlocked: &[UnlockedAchievement]) {
    for a in unlocked {
        println!("   {} {} (+{} pts)", "Unlocked".yellow().bold(), a.title, a.bonus_points);
    }
}

fn print_payload(payload: &ContentPayload) {
    match payload {
        ContentPayload::Phrase(p) => println!("{}\n   keyword: {}", p.sentence, p.keyword),
        ContentPayload::QuestionBundle(bundle) => {
            for (topic, questions) in &bundle.topics {
                println!("{} ({} questions)", topic.cyan(), questions.len());
            }
            println!("theory ({} questions)", bundle.theory.len());
            println!("practice ({} questions)", bundle.practice.len());
        }
    }
}
