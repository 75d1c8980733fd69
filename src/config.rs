//! Configuration file support for pecunia
//!
//! Reads from .pecunia/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// External content generation service
    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub precache: PrecacheConfig,

    /// Scoring for the trivia and phrase games
    #[serde(default)]
    pub games: GamesConfig,

    #[serde(default)]
    pub story: StoryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// Default filter when neither PECUNIA_LOG nor RUST_LOG is set
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    /// Gateway URL. Without it content comes from the offline bank.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Name of the environment variable holding the API key
    /// Default: "PECUNIA_GENERATION_KEY"
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Questions requested per assessment topic
    #[serde(default = "default_questions_per_topic")]
    pub questions_per_topic: u32,

    /// Questions requested for each of the theory and practice sets
    #[serde(default = "default_gap_questions")]
    pub gap_questions: u32,
}

fn default_api_key_env() -> String {
    "PECUNIA_GENERATION_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_questions_per_topic() -> u32 {
    10
}

fn default_gap_questions() -> u32 {
    5
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            questions_per_topic: default_questions_per_topic(),
            gap_questions: default_gap_questions(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PrecacheConfig {
    /// Background generation threads
    /// Default: 2
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// When false, nothing is generated ahead of time
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_workers() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            enabled: true,
        }
    }
}

impl PrecacheConfig {
    /// Worker count actually used; zero when disabled
    pub fn effective_workers(&self) -> usize {
        if self.enabled {
            self.workers
        } else {
            0
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GamesConfig {
    #[serde(default = "default_trivia_points")]
    pub trivia_points_per_hit: i32,

    /// Misses that end a trivia round
    #[serde(default = "default_trivia_misses")]
    pub trivia_max_misses: u32,

    #[serde(default = "default_phrase_exact")]
    pub phrase_exact_points: i32,

    #[serde(default = "default_phrase_partial")]
    pub phrase_partial_points: i32,
}

fn default_trivia_points() -> i32 {
    100
}

fn default_trivia_misses() -> u32 {
    3
}

fn default_phrase_exact() -> i32 {
    5
}

fn default_phrase_partial() -> i32 {
    2
}

impl Default for GamesConfig {
    fn default() -> Self {
        Self {
            trivia_points_per_hit: default_trivia_points(),
            trivia_max_misses: default_trivia_misses(),
            phrase_exact_points: default_phrase_exact(),
            phrase_partial_points: default_phrase_partial(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoryConfig {
    #[serde(default = "default_chapter_points")]
    pub chapter_completion_points: i32,
}

fn default_chapter_points() -> i32 {
    50
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            chapter_completion_points: default_chapter_points(),
        }
    }
}

impl Config {
    /// Load config from .pecunia/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("warning: ignoring {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".pecunia").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Config file written by `pecunia init`
    pub fn template() -> &'static str {
        r#"# Pecunia configuration

[log]
level = "info"

[generation]
# endpoint = "https://generation.example.com/v1/complete"
api_key_env = "PECUNIA_GENERATION_KEY"
timeout_secs = 20
questions_per_topic = 10
gap_questions = 5

[precache]
workers = 2
enabled = true

[games]
trivia_points_per_hit = 100
trivia_max_misses = 3
phrase_exact_points = 5
phrase_partial_points = 2

[story]
chapter_completion_points = 50
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert!(config.generation.endpoint.is_none());
        assert_eq!(config.generation.api_key_env, "PECUNIA_GENERATION_KEY");
        assert_eq!(config.precache.effective_workers(), 2);
        assert_eq!(config.games.trivia_points_per_hit, 100);
        assert_eq!(config.story.chapter_completion_points, 50);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[generation]
endpoint = "http://localhost:8080/complete"
timeout_secs = 5

[precache]
enabled = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.generation.endpoint.as_deref(), Some("http://localhost:8080/complete"));
        assert_eq!(config.generation.timeout_secs, 5);
        assert_eq!(config.generation.questions_per_topic, 10);
        assert_eq!(config.precache.effective_workers(), 0);
        assert_eq!(config.games.trivia_max_misses, 3);
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(Config::template()).unwrap();
        assert_eq!(config.games.phrase_exact_points, 5);
        assert_eq!(config.games.phrase_partial_points, 2);
        assert!(config.precache.enabled);
    }
}
