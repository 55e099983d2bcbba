//! Durable task store.
//!
//! One SQLite database shared by all services, holding review tasks, issue
//! copy records, comment sync records, score records, and the feedback
//! pattern library. Uniqueness constraints on the domain keys are what make
//! webhook re-delivery safe; see the per-table modules.
//!
//! The connection sits behind a `parking_lot::Mutex` and every call is a
//! short-lived transaction. Callers never hold the lock across I/O.

mod copies;
mod feedback;
mod review;
mod scores;

pub use copies::{
    CommentSyncRecord, CommentSyncStats, CopyRecord, CopyStats, CopyStatus, ImageReupload,
};
pub use feedback::{FeedbackPattern, FeedbackSnapshot};
pub use review::{task_id_for, AuthorReviewHistory, ReviewTask, TaskStats, TaskStatus, UpsertOutcome};
pub use scores::{
    score_id_for, AuthorScoreHistory, ContentType, DimensionScore, ScoreRecord, ScoreSet,
    ScoreStats, ScoreStatus,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

/// Direction of an author's recent scores relative to their earlier ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    #[default]
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Stable => "stable",
        }
    }
}

/// Compare the newer half of a score series against the older half.
/// Too few scores to split meaningfully reads as stable.
pub(crate) fn trend_of(scores_newest_first: &[i64]) -> Trend {
    if scores_newest_first.len() < 4 {
        return Trend::Stable;
    }
    let (recent, older) = scores_newest_first.split_at(scores_newest_first.len() / 2);
    let avg = |s: &[i64]| s.iter().sum::<i64>() as f64 / s.len() as f64;
    let delta = avg(recent) - avg(older);
    if delta > 5.0 {
        Trend::Improving
    } else if delta < -5.0 {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

/// Outcome of inserting a row guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The row is ours; proceed with the outbound work.
    Claimed,
    /// Another delivery already owns (or finished) this key; do nothing.
    Duplicate,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;

        tracing::info!("Store initialized at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS review_tasks (
                task_id        TEXT PRIMARY KEY,
                pr_number      INTEGER NOT NULL,
                repo           TEXT NOT NULL,
                pr_title       TEXT NOT NULL DEFAULT '',
                pr_author      TEXT NOT NULL DEFAULT '',
                pr_url         TEXT NOT NULL DEFAULT '',
                status         TEXT NOT NULL,
                progress       INTEGER NOT NULL DEFAULT 0,
                message        TEXT NOT NULL DEFAULT '',
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                completed_at   TEXT,
                error_message  TEXT,
                review_content TEXT,
                score          INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON review_tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON review_tasks(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_repo_pr ON review_tasks(repo, pr_number);

            CREATE TABLE IF NOT EXISTS copy_records (
                record_id           TEXT PRIMARY KEY,
                source_repo         TEXT NOT NULL,
                source_issue_number INTEGER NOT NULL,
                source_issue_title  TEXT NOT NULL DEFAULT '',
                source_issue_url    TEXT NOT NULL DEFAULT '',
                labels_copied       TEXT NOT NULL DEFAULT '[]',
                images_reuploaded   TEXT NOT NULL DEFAULT '[]',
                target_repo         TEXT NOT NULL,
                target_issue_number INTEGER,
                target_issue_url    TEXT,
                status              TEXT NOT NULL,
                error_message       TEXT,
                created_at          TEXT NOT NULL,
                completed_at        TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_copy_unique_source_target
                ON copy_records(source_repo, source_issue_number, target_repo);
            CREATE INDEX IF NOT EXISTS idx_copy_status ON copy_records(status);
            CREATE INDEX IF NOT EXISTS idx_copy_created_at ON copy_records(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_copy_source
                ON copy_records(source_repo, source_issue_number);

            CREATE TABLE IF NOT EXISTS comment_sync_records (
                sync_id             TEXT PRIMARY KEY,
                source_comment_id   INTEGER NOT NULL,
                source_repo         TEXT NOT NULL,
                source_issue_number INTEGER NOT NULL,
                source_comment_url  TEXT NOT NULL DEFAULT '',
                comment_author      TEXT NOT NULL DEFAULT '',
                target_repo         TEXT NOT NULL,
                target_issue_number INTEGER NOT NULL,
                target_comment_id   INTEGER,
                status              TEXT NOT NULL,
                error_message       TEXT,
                created_at          TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_unique_comment_target
                ON comment_sync_records(source_comment_id, target_repo, target_issue_number);
            CREATE INDEX IF NOT EXISTS idx_sync_created_at
                ON comment_sync_records(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sync_source
                ON comment_sync_records(source_repo, source_issue_number);

            CREATE TABLE IF NOT EXISTS score_records (
                score_id               TEXT PRIMARY KEY,
                repo                   TEXT NOT NULL,
                issue_number           INTEGER NOT NULL,
                comment_id             INTEGER,
                content_type           TEXT NOT NULL,
                title                  TEXT NOT NULL DEFAULT '',
                body                   TEXT NOT NULL DEFAULT '',
                author                 TEXT NOT NULL DEFAULT '',
                issue_url              TEXT NOT NULL DEFAULT '',
                format_score           INTEGER,
                format_feedback        TEXT,
                content_score          INTEGER,
                content_feedback       TEXT,
                clarity_score          INTEGER,
                clarity_feedback       TEXT,
                actionability_score    INTEGER,
                actionability_feedback TEXT,
                overall_score          INTEGER,
                suggestions            TEXT,
                status                 TEXT NOT NULL,
                error_message          TEXT,
                user_feedback          TEXT,
                created_at             TEXT NOT NULL,
                completed_at           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_scores_status ON score_records(status);
            CREATE INDEX IF NOT EXISTS idx_scores_created_at ON score_records(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_scores_repo ON score_records(repo, issue_number);
            CREATE INDEX IF NOT EXISTS idx_scores_author ON score_records(author);

            CREATE TABLE IF NOT EXISTS feedback_patterns (
                pattern_id           TEXT PRIMARY KEY,
                pattern_type         TEXT NOT NULL,
                dimension            TEXT NOT NULL,
                occurrence_count     INTEGER NOT NULL DEFAULT 1,
                deviation_sum        REAL NOT NULL DEFAULT 0,
                avg_score_deviation  REAL NOT NULL DEFAULT 0,
                example_feedbacks    TEXT NOT NULL DEFAULT '[]',
                identified_issue     TEXT NOT NULL DEFAULT '',
                suggested_adjustment TEXT NOT NULL DEFAULT '',
                last_seen            TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_last_seen
                ON feedback_patterns(last_seen DESC);

            CREATE TABLE IF NOT EXISTS feedback_snapshots (
                snapshot_id        TEXT PRIMARY KEY,
                snapshot_date      TEXT NOT NULL,
                total_feedbacks    INTEGER NOT NULL DEFAULT 0,
                positive_count     INTEGER NOT NULL DEFAULT 0,
                negative_count     INTEGER NOT NULL DEFAULT 0,
                neutral_count      INTEGER NOT NULL DEFAULT 0,
                top_issues         TEXT NOT NULL DEFAULT '[]',
                learning_insights  TEXT NOT NULL DEFAULT '{}',
                prompt_adjustments TEXT NOT NULL DEFAULT '[]',
                created_at         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_date
                ON feedback_snapshots(snapshot_date DESC);",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_needs_enough_scores() {
        assert_eq!(trend_of(&[]), Trend::Stable);
        assert_eq!(trend_of(&[90, 50, 40]), Trend::Stable);
    }

    #[test]
    fn trend_detects_direction() {
        // Newest first: recent half well above the older half.
        assert_eq!(trend_of(&[90, 88, 70, 68]), Trend::Improving);
        assert_eq!(trend_of(&[60, 62, 85, 88]), Trend::Declining);
        assert_eq!(trend_of(&[80, 78, 80, 82]), Trend::Stable);
    }
}
