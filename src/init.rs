//! Workspace initialization for pecunia
//!
//! `pecunia init` creates the `.pecunia` directory, the store, a config file
//! and the stock catalogues.

use crate::config::Config;
use crate::db::Database;
use crate::{achievement, challenge, games, storyline};
use colored::Colorize;
use std::fs;
use std::path::Path;

/// Rows inserted by [`seed_catalogues`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SeedReport {
    pub challenges: usize,
    pub achievements: usize,
    pub chapters: usize,
    pub trivia: usize,
}

/// Insert every stock catalogue. Safe to run repeatedly.
pub fn seed_catalogues(db: &Database) -> crate::db::Result<SeedReport> {
    Ok(SeedReport {
        challenges: challenge::seed_default_challenges(db)?,
        achievements: achievement::seed_default_achievements(db)?,
        chapters: storyline::seed_default_storylines(db)?,
        trivia: games::seed_default_trivia(db)?,
    })
}

/// Initialize in the current directory
pub fn init_project() -> Result<(), String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Could not get current directory: {}", e))?;
    init_project_in(&cwd)
}

pub fn init_project_in(root: &Path) -> Result<(), String> {
    println!("\n{}", "Initializing Pecunia...".cyan().bold());
    println!("   Directory: {}\n", root.display());

    let pecunia_dir = root.join(".pecunia");
    create_dir_if_missing(&pecunia_dir)?;

    let config_path = pecunia_dir.join("config.toml");
    write_file_if_missing(&config_path, Config::template(), ".pecunia/config.toml")?;

    // PECUNIA_DB_PATH still wins, so tests can point init at a scratch store
    let db_path = match std::env::var("PECUNIA_DB_PATH") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => pecunia_dir.join("pecunia.db"),
    };
    let db = Database::open_at(&db_path)
        .map_err(|e| format!("Could not open {}: {}", db_path.display(), e))?;
    println!("   {} {}", "Opened".green(), db_path.display());

    let seeded = seed_catalogues(&db).map_err(|e| format!("Could not seed catalogues: {}", e))?;
    println!(
        "   {} {} challenges, {} achievements, {} chapters, {} trivia questions",
        "Seeded".green(),
        seeded.challenges,
        seeded.achievements,
        seeded.chapters,
        seeded.trivia
    );

    add_to_gitignore(root)?;

    println!("\n{}", "Pecunia initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Run {} to create a learner", "pecunia user add <email> <name>".cyan());
    println!("  2. Run {} to take the first assessment", "pecunia assess --user <id> --answers <file>".cyan());
    println!("  3. Set {} in .pecunia/config.toml for generated content", "generation.endpoint".cyan());
    println!();

    Ok(())
}

fn create_dir_if_missing(path: &Path) -> Result<(), String> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Could not create {}: {}", path.display(), e))?;
        println!("   {} {}", "Creating".green(), path.display());
    }
    Ok(())
}

fn write_file_if_missing(path: &Path, content: &str, display_name: &str) -> Result<(), String> {
    if path.exists() {
        println!("   {} {} (already exists)", "Skipping".yellow(), display_name);
    } else {
        fs::write(path, content)
            .map_err(|e| format!("Could not write {}: {}", display_name, e))?;
        println!("   {} {}", "Creating".green(), display_name);
    }
    Ok(())
}

fn add_to_gitignore(root: &Path) -> Result<(), String> {
    let gitignore_path = root.join(".gitignore");
    let entry = ".pecunia/";

    if gitignore_path.exists() {
        let existing = fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Could not read .gitignore: {}", e))?;

        if existing.lines().any(|line| line.trim() == entry || line.trim() == ".pecunia") {
            return Ok(());
        }

        let new_content = format!("{}\n\n# Pecunia store (local)\n{}\n", existing.trim_end(), entry);
        fs::write(&gitignore_path, new_content)
            .map_err(|e| format!("Could not update .gitignore: {}", e))?;
        println!("   {} .gitignore (added .pecunia/)", "Updated".green());
    } else {
        let content = format!("# Pecunia store (local)\n{}\n", entry);
        fs::write(&gitignore_path, content)
            .map_err(|e| format!("Could not create .gitignore: {}", e))?;
        println!("   {} .gitignore", "Creating".green());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seed_catalogues_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("seed.db")).unwrap();
        let first = seed_catalogues(&db).unwrap();
        assert!(first.challenges > 0);
        assert!(first.achievements > 0);
        assert_eq!(first.chapters, 6);
        assert!(first.trivia > 0);
        assert_eq!(seed_catalogues(&db).unwrap(), SeedReport::default());
    }

    #[test]
    fn test_gitignore_entry_added_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        add_to_gitignore(dir.path()).unwrap();
        add_to_gitignore(dir.path()).unwrap();
        let contents = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(contents.starts_with("target/"));
        assert_eq!(contents.matches(".pecunia/").count(), 1);
    }
}
