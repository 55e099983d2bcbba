//! Configuration: a TOML file for behavior, environment variables for
//! credentials and wiring.
//!
//! The file is loaded once at startup and never mutated; workers pick up
//! changes only on restart. The two feedback-loop thresholds
//! (`feedback_window_days`, `feedback_min_occurrences`) are read at each
//! scoring request so they can be tuned live via config reload + restart of
//! the scorer alone.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub issue_copy: IssueCopyConfig,
    #[serde(default)]
    pub issue_scoring: IssueScoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!("Config file {} not found — using defaults", path.display());
            Ok(Self::default())
        }
    }
}

// ── PR review ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// `pull_request` actions that trigger a review.
    #[serde(default = "default_review_triggers")]
    pub triggers: Vec<String>,
    /// Skip draft pull requests.
    #[serde(default = "default_true")]
    pub skip_draft: bool,
    /// Apply the auto-review label after a successful review.
    #[serde(default = "default_true")]
    pub auto_label: bool,
    /// Label marking a PR as already auto-reviewed.
    #[serde(default = "default_auto_label_name")]
    pub auto_label_name: String,
    /// Aspects the reviewer is asked to focus on.
    #[serde(default = "default_focus_areas")]
    pub focus_areas: Vec<String>,
    /// Language the review should be written in.
    #[serde(default = "default_language")]
    pub language: String,
    /// AI CLI timeout in seconds.
    #[serde(default = "default_review_timeout")]
    pub timeout_secs: u64,
    /// Character budget for the rendered diff before truncation.
    #[serde(default = "default_max_diff_chars")]
    pub max_diff_chars: usize,
    /// Worker pool size.
    #[serde(default = "default_review_workers")]
    pub workers: usize,
    /// Queue depth before webhooks are rejected with 503.
    #[serde(default = "default_review_queue")]
    pub queue_depth: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            triggers: default_review_triggers(),
            skip_draft: true,
            auto_label: true,
            auto_label_name: default_auto_label_name(),
            focus_areas: default_focus_areas(),
            language: default_language(),
            timeout_secs: default_review_timeout(),
            max_diff_chars: default_max_diff_chars(),
            workers: default_review_workers(),
            queue_depth: default_review_queue(),
        }
    }
}

// ── Issue copying ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCopyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The one repository whose issues are replicated.
    #[serde(default)]
    pub source_repo: String,
    /// `issues` actions that trigger replication.
    #[serde(default = "default_copy_triggers")]
    pub triggers: Vec<String>,
    /// Label name → target repository full name.
    #[serde(default)]
    pub label_to_repo: BTreeMap<String, String>,
    /// Target when no label matches (optional).
    #[serde(default)]
    pub default_target_repo: Option<String>,
    /// Prepend a "source:" reference block to the copied body.
    #[serde(default = "default_true")]
    pub add_source_reference: bool,
    /// Copy labels that exist on the target repo.
    #[serde(default = "default_true")]
    pub copy_labels: bool,
    /// Download images and re-upload them to the target's assets branch.
    #[serde(default = "default_true")]
    pub reupload_images: bool,
    /// Post a "copied to" comment on the source issue.
    #[serde(default = "default_true")]
    pub add_copy_comment: bool,
    #[serde(default = "default_copier_workers")]
    pub workers: usize,
    #[serde(default = "default_copier_queue")]
    pub queue_depth: usize,
}

impl Default for IssueCopyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_repo: String::new(),
            triggers: default_copy_triggers(),
            label_to_repo: BTreeMap::new(),
            default_target_repo: None,
            add_source_reference: true,
            copy_labels: true,
            reupload_images: true,
            add_copy_comment: true,
            workers: default_copier_workers(),
            queue_depth: default_copier_queue(),
        }
    }
}

// ── Issue scoring ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueScoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Repositories whose issues/comments are scored.
    #[serde(default)]
    pub target_repos: Vec<String>,
    /// `issues` actions that trigger scoring.
    #[serde(default = "default_scoring_triggers")]
    pub triggers: Vec<String>,
    /// `issue_comment` actions that trigger scoring.
    #[serde(default = "default_comment_triggers")]
    pub comment_triggers: Vec<String>,
    /// Post the score as a comment (scores are recorded either way).
    #[serde(default = "default_true")]
    pub auto_comment: bool,
    #[serde(default = "default_language")]
    pub language: String,
    /// Feedback patterns older than this are not injected into prompts.
    #[serde(default = "default_feedback_window_days")]
    pub feedback_window_days: i64,
    /// Patterns need at least this many occurrences to be injected.
    #[serde(default = "default_feedback_min_occurrences")]
    pub feedback_min_occurrences: i64,
    /// AI CLI timeout in seconds.
    #[serde(default = "default_scoring_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scorer_workers")]
    pub workers: usize,
    #[serde(default = "default_scorer_queue")]
    pub queue_depth: usize,
}

impl Default for IssueScoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_repos: Vec::new(),
            triggers: default_scoring_triggers(),
            comment_triggers: default_comment_triggers(),
            auto_comment: true,
            language: default_language(),
            feedback_window_days: default_feedback_window_days(),
            feedback_min_occurrences: default_feedback_min_occurrences(),
            timeout_secs: default_scoring_timeout(),
            workers: default_scorer_workers(),
            queue_depth: default_scorer_queue(),
        }
    }
}

// ── Logging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional log file; stdout when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

// ── Environment wiring ──────────────────────────────────────────

/// Process-environment settings: credentials and service addresses.
/// Kept separate from [`Config`] so secrets never live in the config file.
#[derive(Debug, Clone)]
pub struct Env {
    pub github_token: String,
    pub webhook_secret: Option<String>,
    pub web_username: String,
    pub web_password: Option<String>,
    pub db_path: PathBuf,
    pub agent_cli_path: PathBuf,
    pub pr_reviewer_url: String,
    pub issue_copier_url: String,
    pub issue_scorer_url: String,
    pub github_api_url: String,
}

impl Env {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            github_token: var("GITHUB_TOKEN").unwrap_or_default(),
            webhook_secret: var("WEBHOOK_SECRET"),
            web_username: var("WEB_USERNAME").unwrap_or_else(|| "admin".into()),
            web_password: var("WEB_PASSWORD"),
            db_path: var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/octomon/tasks.db")),
            agent_cli_path: var("AGENT_CLI_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("claude")),
            pr_reviewer_url: var("PR_REVIEWER_URL")
                .unwrap_or_else(|| "http://pr-reviewer:8081".into()),
            issue_copier_url: var("ISSUE_COPIER_URL")
                .unwrap_or_else(|| "http://issue-copier:8082".into()),
            issue_scorer_url: var("ISSUE_SCORER_URL")
                .unwrap_or_else(|| "http://issue-scorer:8083".into()),
            github_api_url: var("GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".into()),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.web_password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

// ── serde defaults ──────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_review_triggers() -> Vec<String> {
    vec!["opened".into(), "synchronize".into(), "reopened".into()]
}

fn default_auto_label_name() -> String {
    "auto-reviewed".into()
}

fn default_focus_areas() -> Vec<String> {
    vec![
        "code quality".into(),
        "potential bugs".into(),
        "performance".into(),
        "security".into(),
        "best practices".into(),
    ]
}

fn default_language() -> String {
    "en".into()
}

fn default_review_timeout() -> u64 {
    300
}

fn default_max_diff_chars() -> usize {
    60_000
}

fn default_review_workers() -> usize {
    2
}

fn default_review_queue() -> usize {
    64
}

fn default_copy_triggers() -> Vec<String> {
    vec!["opened".into(), "labeled".into()]
}

fn default_copier_workers() -> usize {
    4
}

fn default_copier_queue() -> usize {
    128
}

fn default_scoring_triggers() -> Vec<String> {
    vec!["opened".into()]
}

fn default_comment_triggers() -> Vec<String> {
    vec!["created".into()]
}

fn default_feedback_window_days() -> i64 {
    30
}

fn default_feedback_min_occurrences() -> i64 {
    2
}

fn default_scoring_timeout() -> u64 {
    300
}

fn default_scorer_workers() -> usize {
    2
}

fn default_scorer_queue() -> usize {
    64
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.review.triggers, vec!["opened", "synchronize", "reopened"]);
        assert!(config.review.skip_draft);
        assert_eq!(config.review.workers, 2);
        assert_eq!(config.issue_copy.workers, 4);
        assert_eq!(config.issue_scoring.feedback_window_days, 30);
        assert_eq!(config.issue_scoring.feedback_min_occurrences, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_label_mapping() {
        let raw = r#"
            [issue_copy]
            source_repo = "Acme/src"
            default_target_repo = "Acme/fallback"

            [issue_copy.label_to_repo]
            "OS3" = "Acme/OS3OS4"
            "OS5" = "Acme/OS5"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.issue_copy.source_repo, "Acme/src");
        assert_eq!(
            config.issue_copy.label_to_repo.get("OS3").map(String::as_str),
            Some("Acme/OS3OS4")
        );
        assert_eq!(
            config.issue_copy.default_target_repo.as_deref(),
            Some("Acme/fallback")
        );
    }

    #[test]
    fn parses_scoring_section() {
        let raw = r#"
            [issue_scoring]
            target_repos = ["Acme/qa", "Acme/fw"]
            auto_comment = false
            language = "zh-TW"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.issue_scoring.target_repos.len(), 2);
        assert!(!config.issue_scoring.auto_comment);
        assert_eq!(config.issue_scoring.language, "zh-TW");
        // Untouched fields keep their defaults.
        assert_eq!(config.issue_scoring.triggers, vec!["opened"]);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let raw = r#"
            [review]
            skip_draft = false
            some_future_knob = 3
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(!config.review.skip_draft);
    }
}
