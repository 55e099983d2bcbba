//! Review task records.
//!
//! One row per (repo, PR). Status only moves forward along
//! queued → processing → {completed, failed}; progress never decreases
//! within a lifetime. A terminal task can be re-queued, which starts a new
//! lifetime with progress reset to zero.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::util::now_rfc3339;

use super::{trend_of, Store, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTask {
    pub task_id: String,
    pub pr_number: i64,
    pub repo: String,
    pub pr_title: String,
    pub pr_author: String,
    pub pr_url: String,
    pub status: TaskStatus,
    pub progress: i64,
    pub message: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub review_content: Option<String>,
    pub score: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl TaskStats {
    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.completed + self.failed
    }
}

/// An author's track record across their past reviewed PRs, used to
/// condition the review prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorReviewHistory {
    pub total_prs: i64,
    pub scored_prs: i64,
    pub avg_score: f64,
    pub min_score: i64,
    pub max_score: i64,
    /// Up to the last five extracted scores, newest first.
    pub recent_scores: Vec<i64>,
    pub trend: Trend,
}

/// Result of [`Store::upsert_review_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A fresh row was inserted; the caller should enqueue the job.
    Created,
    /// A terminal row was reset to queued; enqueue the job.
    Requeued,
    /// The task is already queued or in flight; drop the event.
    AlreadyActive,
}

/// Task id for a (repo, PR) pair: `repo#pr`.
pub fn task_id_for(repo: &str, pr_number: u64) -> String {
    format!("{repo}#{pr_number}")
}

impl Store {
    /// Insert a queued task, or re-queue a terminal one. Queued/in-flight
    /// tasks swallow the event so enqueue stays idempotent for callers.
    pub fn upsert_review_task(
        &self,
        task_id: &str,
        repo: &str,
        pr_number: u64,
        pr_title: &str,
        pr_author: &str,
        pr_url: &str,
    ) -> Result<UpsertOutcome> {
        let now = now_rfc3339();
        let conn = self.conn();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO review_tasks
                (task_id, pr_number, repo, pr_title, pr_author, pr_url,
                 status, progress, message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0, 'waiting for review', ?7, ?7)",
            params![task_id, pr_number as i64, repo, pr_title, pr_author, pr_url, now],
        )?;
        if inserted > 0 {
            return Ok(UpsertOutcome::Created);
        }

        // Row exists. Only terminal tasks start over; anything else is
        // already being handled and the in-flight run fetches the latest
        // PR head on its own.
        let requeued = conn.execute(
            "UPDATE review_tasks
             SET status = 'queued', progress = 0, message = 'waiting for review',
                 pr_title = ?2, pr_author = ?3, pr_url = ?4,
                 updated_at = ?5, completed_at = NULL,
                 error_message = NULL, review_content = NULL, score = NULL
             WHERE task_id = ?1 AND status IN ('completed', 'failed')",
            params![task_id, pr_title, pr_author, pr_url, now],
        )?;
        if requeued > 0 {
            Ok(UpsertOutcome::Requeued)
        } else {
            Ok(UpsertOutcome::AlreadyActive)
        }
    }

    /// queued → processing. Returns false if the task was not queued.
    pub fn mark_task_processing(&self, task_id: &str, message: &str) -> Result<bool> {
        let now = now_rfc3339();
        let updated = self.conn().execute(
            "UPDATE review_tasks
             SET status = 'processing', progress = MAX(progress, 10),
                 message = ?2, updated_at = ?3
             WHERE task_id = ?1 AND status = 'queued'",
            params![task_id, message, now],
        )?;
        Ok(updated > 0)
    }

    /// Bump progress (monotone) on an in-flight task.
    pub fn set_task_progress(&self, task_id: &str, progress: i64, message: &str) -> Result<()> {
        let now = now_rfc3339();
        self.conn().execute(
            "UPDATE review_tasks
             SET progress = MAX(progress, ?2), message = ?3, updated_at = ?4
             WHERE task_id = ?1 AND status = 'processing'",
            params![task_id, progress, message, now],
        )?;
        Ok(())
    }

    /// processing → completed.
    pub fn complete_task(
        &self,
        task_id: &str,
        review_content: &str,
        score: Option<i64>,
    ) -> Result<bool> {
        let now = now_rfc3339();
        let message = match score {
            Some(s) => format!("review complete (score: {s}/100)"),
            None => "review complete".to_owned(),
        };
        let updated = self.conn().execute(
            "UPDATE review_tasks
             SET status = 'completed', progress = 100, message = ?2,
                 review_content = ?3, score = ?4,
                 updated_at = ?5, completed_at = ?5
             WHERE task_id = ?1 AND status = 'processing'",
            params![task_id, message, review_content, score, now],
        )?;
        Ok(updated > 0)
    }

    /// {queued, processing} → failed.
    pub fn fail_task(&self, task_id: &str, error_message: &str) -> Result<bool> {
        let now = now_rfc3339();
        let updated = self.conn().execute(
            "UPDATE review_tasks
             SET status = 'failed', message = 'review failed',
                 error_message = ?2, updated_at = ?3, completed_at = ?3
             WHERE task_id = ?1 AND status IN ('queued', 'processing')",
            params![task_id, error_message, now],
        )?;
        Ok(updated > 0)
    }

    pub fn get_review_task(&self, task_id: &str) -> Result<Option<ReviewTask>> {
        let conn = self.conn();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM review_tasks WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list_review_tasks(
        &self,
        limit: u32,
        offset: u32,
        status: Option<TaskStatus>,
    ) -> Result<Vec<ReviewTask>> {
        let conn = self.conn();
        let mut tasks = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM review_tasks
                     WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows =
                    stmt.query_map(params![status.as_str(), limit, offset], row_to_task)?;
                for row in rows {
                    tasks.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM review_tasks
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset], row_to_task)?;
                for row in rows {
                    tasks.push(row?);
                }
            }
        }
        Ok(tasks)
    }

    pub fn review_task_stats(&self) -> Result<TaskStats> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM review_tasks GROUP BY status")?;
        let mut stats = TaskStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match TaskStatus::from_str_lossy(&status) {
                TaskStatus::Queued => stats.queued = count,
                TaskStatus::Processing => stats.processing = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Summarize an author's past reviews: total PRs seen, score stats over
    /// the most recent `limit` scored reviews, and the score trend.
    pub fn author_review_history(&self, author: &str, limit: u32) -> Result<AuthorReviewHistory> {
        let conn = self.conn();

        let total_prs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM review_tasks WHERE pr_author = ?1",
            params![author],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT score FROM review_tasks
             WHERE pr_author = ?1 AND score IS NOT NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![author, limit], |row| row.get::<_, i64>(0))?;
        let mut scores = Vec::new();
        for row in rows {
            scores.push(row?);
        }

        if scores.is_empty() {
            return Ok(AuthorReviewHistory {
                total_prs,
                ..AuthorReviewHistory::default()
            });
        }

        let sum: i64 = scores.iter().sum();
        Ok(AuthorReviewHistory {
            total_prs,
            scored_prs: scores.len() as i64,
            avg_score: sum as f64 / scores.len() as f64,
            min_score: *scores.iter().min().unwrap_or(&0),
            max_score: *scores.iter().max().unwrap_or(&0),
            trend: trend_of(&scores),
            recent_scores: scores.into_iter().take(5).collect(),
        })
    }

    /// Drop terminal tasks older than `days` days.
    pub fn delete_old_tasks(&self, days: i64) -> Result<usize> {
        let threshold = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let deleted = self.conn().execute(
            "DELETE FROM review_tasks
             WHERE created_at < ?1 AND status IN ('completed', 'failed')",
            params![threshold],
        )?;
        if deleted > 0 {
            tracing::info!("Pruned {deleted} old review tasks");
        }
        Ok(deleted)
    }
}

const TASK_COLUMNS: &str = "task_id, pr_number, repo, pr_title, pr_author, pr_url, \
     status, progress, message, created_at, updated_at, completed_at, \
     error_message, review_content, score";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ReviewTask> {
    Ok(ReviewTask {
        task_id: row.get(0)?,
        pr_number: row.get(1)?,
        repo: row.get(2)?,
        pr_title: row.get(3)?,
        pr_author: row.get(4)?,
        pr_url: row.get(5)?,
        status: TaskStatus::from_str_lossy(&row.get::<_, String>(6)?),
        progress: row.get(7)?,
        message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
        error_message: row.get(12)?,
        review_content: row.get(13)?,
        score: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn upsert(store: &Store, repo: &str, pr: u64) -> UpsertOutcome {
        let id = task_id_for(repo, pr);
        store
            .upsert_review_task(&id, repo, pr, "Fix bug", "alice", "https://x/pr")
            .unwrap()
    }

    #[test]
    fn task_id_format() {
        assert_eq!(task_id_for("Acme/foo", 42), "Acme/foo#42");
    }

    #[test]
    fn create_then_duplicate_is_dropped() {
        let (_tmp, store) = temp_store();
        assert_eq!(upsert(&store, "Acme/foo", 42), UpsertOutcome::Created);
        assert_eq!(upsert(&store, "Acme/foo", 42), UpsertOutcome::AlreadyActive);

        let task = store.get_review_task("Acme/foo#42").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn terminal_task_is_requeued() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 1);
        store.mark_task_processing("Acme/foo#1", "working").unwrap();
        store.complete_task("Acme/foo#1", "LGTM", Some(90)).unwrap();

        assert_eq!(upsert(&store, "Acme/foo", 1), UpsertOutcome::Requeued);
        let task = store.get_review_task("Acme/foo#1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert!(task.review_content.is_none());
    }

    #[test]
    fn status_only_moves_forward() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 7);

        // Cannot complete a queued task.
        assert!(!store.complete_task("Acme/foo#7", "x", None).unwrap());

        assert!(store.mark_task_processing("Acme/foo#7", "working").unwrap());
        // Cannot re-enter processing.
        assert!(!store.mark_task_processing("Acme/foo#7", "again").unwrap());

        assert!(store.complete_task("Acme/foo#7", "done", None).unwrap());
        // Terminal tasks cannot fail afterwards.
        assert!(!store.fail_task("Acme/foo#7", "oops").unwrap());
    }

    #[test]
    fn progress_is_monotone() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 3);
        store.mark_task_processing("Acme/foo#3", "start").unwrap();
        store.set_task_progress("Acme/foo#3", 80, "almost").unwrap();
        store.set_task_progress("Acme/foo#3", 50, "stale update").unwrap();

        let task = store.get_review_task("Acme/foo#3").unwrap().unwrap();
        assert_eq!(task.progress, 80);
    }

    #[test]
    fn failed_task_records_error() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 9);
        store.mark_task_processing("Acme/foo#9", "working").unwrap();
        assert!(store.fail_task("Acme/foo#9", "CLI exited with 1").unwrap());

        let task = store.get_review_task("Acme/foo#9").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("CLI exited with 1"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn stats_count_by_status() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 1);
        upsert(&store, "Acme/foo", 2);
        store.mark_task_processing("Acme/foo#2", "working").unwrap();
        upsert(&store, "Acme/bar", 1);
        store.mark_task_processing("Acme/bar#1", "working").unwrap();
        store.complete_task("Acme/bar#1", "fine", None).unwrap();

        let stats = store.review_task_stats().unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn author_history_aggregates_scored_reviews() {
        let (_tmp, store) = temp_store();
        for (pr, score) in [(1u64, 90), (2, 88), (3, 70), (4, 68)] {
            let id = task_id_for("Acme/foo", pr);
            store
                .upsert_review_task(&id, "Acme/foo", pr, "Fix", "alice", "https://x")
                .unwrap();
            store.mark_task_processing(&id, "working").unwrap();
            store.complete_task(&id, "done", Some(score)).unwrap();
        }
        // One unscored (failed) PR still counts toward the total.
        upsert(&store, "Acme/foo", 5);
        store.fail_task("Acme/foo#5", "CLI died").unwrap();

        let history = store.author_review_history("alice", 10).unwrap();
        assert_eq!(history.total_prs, 5);
        assert_eq!(history.scored_prs, 4);
        assert_eq!(history.min_score, 68);
        assert_eq!(history.max_score, 90);
        assert!((history.avg_score - 79.0).abs() < 1e-9);
        // Newest first: PR 4 completed last.
        assert_eq!(history.recent_scores, vec![68, 70, 88, 90]);
        assert_eq!(history.trend, crate::store::Trend::Declining);

        let unknown = store.author_review_history("nobody", 10).unwrap();
        assert_eq!(unknown.total_prs, 0);
        assert_eq!(unknown.scored_prs, 0);
        assert!(unknown.recent_scores.is_empty());
    }

    #[test]
    fn list_filters_by_status() {
        let (_tmp, store) = temp_store();
        upsert(&store, "Acme/foo", 1);
        upsert(&store, "Acme/foo", 2);
        store.mark_task_processing("Acme/foo#1", "working").unwrap();

        let queued = store
            .list_review_tasks(10, 0, Some(TaskStatus::Queued))
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].task_id, "Acme/foo#2");

        let all = store.list_review_tasks(10, 0, None).unwrap();
        assert_eq!(all.len(), 2);
    }
}
