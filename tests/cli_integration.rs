//! Integration tests for the pecunia CLI
//!
//! These tests exercise the full CLI workflow using a temporary database.
//! They verify that commands work end-to-end without mocking.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Helper to run pecunia CLI with a specific database path
fn run_pecunia(args: &[&str], db_path: &PathBuf) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .args(args)
        .env("PECUNIA_DB_PATH", db_path)
        .env("PECUNIA_LOG", "warn")
        .output()
        .expect("Failed to execute pecunia")
}

/// Helper to get stdout as string
fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to get stderr as string
fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Run with --json and parse stdout
fn run_json(args: &[&str], db_path: &PathBuf) -> serde_json::Value {
    let mut full = vec!["--json"];
    full.extend_from_slice(args);
    let output = run_pecunia(&full, db_path);
    assert!(output.status.success(), "{:?} failed: {}", args, stderr(&output));
    serde_json::from_str(&stdout(&output)).expect("stdout should be JSON")
}

/// Seeded store with one learner; returns the learner id as a string
fn seeded(db_path: &PathBuf) -> String {
    let output = run_pecunia(&["seed"], db_path);
    assert!(output.status.success(), "seed failed: {}", stderr(&output));
    let user = run_json(&["user", "add", "ana@example.com", "Ana"], db_path);
    user["id"].as_i64().expect("user id").to_string()
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("pecunia"));
    assert!(out.contains("gamification"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("pecunia"));
}

#[test]
fn test_status_on_fresh_store() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");

    let summary = run_json(&["status"], &db_path);
    assert_eq!(summary["users"], 0);
    assert_eq!(summary["expenses"], 0);
}

// =============================================================================
// Shell Completion Tests
// =============================================================================

#[test]
fn test_completion_zsh() {
    let output = Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .args(["completion", "zsh"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion zsh failed: {}",
        stderr(&output)
    );
    assert!(
        stdout(&output).contains("#compdef pecunia"),
        "zsh completion should contain #compdef"
    );
}

#[test]
fn test_completion_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .args(["completion", "bash"])
        .output()
        .expect("Failed to execute");

    assert!(output.status.success(), "completion bash failed: {}", stderr(&output));
    assert!(
        stdout(&output).contains("_pecunia"),
        "bash completion should contain _pecunia function"
    );
}

#[test]
fn test_completion_fish() {
    let output = Command::new(env!("CARGO_BIN_EXE_pecunia"))
        .args(["completion", "fish"])
        .output()
        .expect("Failed to execute");

    assert!(output.status.success(), "completion fish failed: {}", stderr(&output));
    assert!(
        stdout(&output).contains("complete -c pecunia"),
        "fish completion should contain complete command"
    );
}

// =============================================================================
// Users and Ledger
// =============================================================================

#[test]
fn test_add_and_show_user() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let output = run_pecunia(&["user", "show", &user], &db_path);
    assert!(output.status.success(), "show failed: {}", stderr(&output));
    assert!(stdout(&output).contains("ana@example.com"));

    let profile = run_json(&["user", "show", &user], &db_path);
    assert_eq!(profile["user"]["points"], 0);
    assert_eq!(profile["metrics"]["total_sessions"], 0);
    assert_eq!(profile["content_views"], 0);
}

#[test]
fn test_duplicate_email_rejected() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    seeded(&db_path);

    let output = run_pecunia(&["user", "add", "ana@example.com", "Other Ana"], &db_path);
    assert!(!output.status.success());
}

#[test]
fn test_expense_add_and_list() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let added = run_json(
        &["expense", "add", "--user", &user, "12.50", "food", "--store", "Market"],
        &db_path,
    );
    assert!(added["expense_id"].as_i64().is_some());

    let rows = run_json(&["expense", "list", "--user", &user], &db_path);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["category"], "food");
    assert_eq!(rows[0]["store_name"], "Market");
}

#[test]
fn test_invalid_category_rejected() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let output = run_pecunia(&["expense", "add", "--user", &user, "10", "groceries"], &db_path);
    assert!(!output.status.success());
}

#[test]
fn test_non_positive_amount_rejected() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let output = run_pecunia(&["expense", "add", "--user", &user, "0", "food"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("amount"));
}

// =============================================================================
// Challenges and Achievements
// =============================================================================

#[test]
fn test_join_and_complete_savings_challenge() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let joined = run_json(&["challenge", "join", "--user", &user, "save-50-week"], &db_path);
    assert_eq!(joined["created"], true);

    let again = run_json(&["challenge", "join", "--user", &user, "save-50-week"], &db_path);
    assert_eq!(again["created"], false);
    assert_eq!(again["enrollment"]["id"], joined["enrollment"]["id"]);

    let outcome = run_json(&["expense", "add", "--user", &user, "75", "savings"], &db_path);
    assert_eq!(outcome["settled"][0]["state"], "completed");
    assert_eq!(outcome["settled"][0]["earned_points"], 30);

    let history = run_json(&["challenge", "history", "--user", &user], &db_path);
    assert_eq!(history.as_array().unwrap().len(), 1);

    let progress = run_json(&["challenge", "check", "--user", &user], &db_path);
    assert!(progress["settled"].as_array().unwrap().is_empty());
    assert!(progress["active"].as_array().unwrap().is_empty());
}

#[test]
fn test_join_unknown_challenge_fails() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let output = run_pecunia(&["challenge", "join", "--user", &user, "no-such-code"], &db_path);
    assert!(!output.status.success());
}

#[test]
fn test_assessment_unlocks_first_achievement() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let answers = r#"{"budgeting":3,"saving":3,"credit":3,"investing":3,"fraud_awareness":3,"has_cards":false,"theory":3,"practice":3}"#;
    let recorded = run_json(&["assess", "--user", &user, "--answers", answers], &db_path);
    assert_eq!(recorded["assessment"]["total_score"], 100);
    assert_eq!(recorded["level"], "high");

    let overview = run_json(&["achievements", "list", "--user", &user], &db_path);
    let unlocked: Vec<&str> = overview["unlocked"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["code"].as_str())
        .collect();
    assert_eq!(unlocked, vec!["first-step"]);

    let nothing = run_json(&["achievements", "check", "--user", &user], &db_path);
    assert!(nothing.as_array().unwrap().is_empty());
}

#[test]
fn test_quiz_without_answers_records_default_ratings() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    // stdin is closed, so every question is left unanswered
    let recorded = run_json(&["quiz", "--user", &user], &db_path);
    assert_eq!(recorded["assessment"]["sequence_number"], 1);
    assert_eq!(recorded["assessment"]["theory_score"], 1);
    assert_eq!(recorded["assessment"]["practice_score"], 3);
    // 20 + 20 + 18
    assert_eq!(recorded["assessment"]["total_score"], 58);
    assert_eq!(recorded["level"], "medium");

    // the refill left a bundle behind for the next quiz
    let next = run_json(&["content", "fetch", "--user", &user, "questions"], &db_path);
    assert_eq!(next["source"], "cache");
}

#[test]
fn test_quiz_records_card_profile() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let recorded = run_json(
        &["quiz", "--user", &user, "--has-cards", "--cards", "2", "--debt", "5000"],
        &db_path,
    );
    assert_eq!(recorded["assessment"]["has_cards"], true);
    assert_eq!(recorded["assessment"]["card_count"], 2);
    // 20 + 15 + 18
    assert_eq!(recorded["assessment"]["total_score"], 53);
}

// =============================================================================
// Story, Content and Games
// =============================================================================

#[test]
fn test_story_chapters_unlock_in_order() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let locked = run_json(&["story", "complete", "--user", &user, "2"], &db_path);
    assert_eq!(locked["outcome"], "locked");

    let done = run_json(&["story", "complete", "--user", &user, "1"], &db_path);
    assert_eq!(done["outcome"], "completed");

    let chapters = run_json(&["story", "list", "--user", &user], &db_path);
    assert_eq!(chapters[1]["unlocked"], true);
    assert_eq!(chapters[2]["unlocked"], false);
}

#[test]
fn test_content_view_is_counted_once() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let first = run_json(&["content", "view", "--user", &user, "fraud/phishing-101"], &db_path);
    assert_eq!(first["first_view"], true);
    let second = run_json(&["content", "view", "--user", &user, "fraud/phishing-101"], &db_path);
    assert_eq!(second["first_view"], false);

    let profile = run_json(&["user", "show", &user], &db_path);
    assert_eq!(profile["content_views"], 1);
}

#[test]
fn test_content_fetch_serves_offline_questions() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let fetched = run_json(&["content", "fetch", "--user", &user, "questions"], &db_path);
    assert_eq!(fetched["payload"]["kind"], "question_bundle");
    assert!(fetched["source"] == "generated" || fetched["source"] == "fallback");

    // The background refill left one item for the next fetch
    let next = run_json(&["content", "fetch", "--user", &user, "questions"], &db_path);
    assert_eq!(next["source"], "cache");
}

#[test]
fn test_phrase_game_with_answer_flag() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let user = seeded(&db_path);

    let result = run_json(
        &["game", "phrase", "--user", &user, "--answer", "definitely-not-the-word"],
        &db_path,
    );
    assert_eq!(result["verdict"], "incorrect");
    assert_eq!(result["points"], 0);
    assert_eq!(result["totals"]["rounds"], 1);
}

#[test]
fn test_unknown_user_fails() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    seeded(&db_path);

    let output = run_pecunia(&["metrics", "--user", "999"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Error"));
}
