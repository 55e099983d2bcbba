//! Score records.
//!
//! One row per scoring subject: the primary key embeds (repo, issue,
//! comment-or-issue), so a re-delivered webhook cannot double-score.
//! User feedback accumulates on the row and is mined asynchronously into
//! `feedback_patterns`.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::util::now_rfc3339;

use super::{trend_of, Store, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ScoreStatus {
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
}

/// What kind of content a score record covers. Issues are classified into
/// the first four; comments always score as `Comment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Bug,
    Task,
    Feature,
    TestResult,
    Comment,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Task => "task",
            Self::Feature => "feature",
            Self::TestResult => "test_result",
            Self::Comment => "comment",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "task" => Self::Task,
            "feature" => Self::Feature,
            "test_result" => Self::TestResult,
            "comment" => Self::Comment,
            _ => Self::Bug,
        }
    }
}

/// One scored dimension: an integer 0-100 plus the model's rationale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionScore {
    pub score: i64,
    pub feedback: String,
}

/// The complete result of one scoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSet {
    pub format: DimensionScore,
    pub content: DimensionScore,
    pub clarity: DimensionScore,
    pub actionability: DimensionScore,
    pub overall_score: i64,
    pub suggestions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub score_id: String,
    pub repo: String,
    pub issue_number: i64,
    pub comment_id: Option<i64>,
    pub content_type: ContentType,
    pub title: String,
    pub body: String,
    pub author: String,
    pub issue_url: String,
    pub format_score: Option<i64>,
    pub format_feedback: Option<String>,
    pub content_score: Option<i64>,
    pub content_feedback: Option<String>,
    pub clarity_score: Option<i64>,
    pub clarity_feedback: Option<String>,
    pub actionability_score: Option<i64>,
    pub actionability_feedback: Option<String>,
    pub overall_score: Option<i64>,
    pub suggestions: Option<String>,
    pub status: ScoreStatus,
    pub error_message: Option<String>,
    pub user_feedback: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScoreStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// An author's track record across their past scored issues/comments, used
/// to condition the scoring prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorScoreHistory {
    pub total_scored: i64,
    pub avg_overall: f64,
    pub avg_format: f64,
    pub avg_content: f64,
    pub avg_clarity: f64,
    pub avg_actionability: f64,
    pub min_score: i64,
    pub max_score: i64,
    /// Up to the last five overall scores, newest first.
    pub recent_scores: Vec<i64>,
    pub trend: Trend,
}

impl ScoreStats {
    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.completed + self.failed
    }
}

/// Score id for a scoring subject: `repo#issue@comment_id` or `repo#issue@issue`.
pub fn score_id_for(repo: &str, issue_number: u64, comment_id: Option<u64>) -> String {
    match comment_id {
        Some(id) => format!("{repo}#{issue_number}@{id}"),
        None => format!("{repo}#{issue_number}@issue"),
    }
}

impl Store {
    /// Insert a queued score record. Returns false when the subject was
    /// already scored (webhook re-delivery).
    #[allow(clippy::too_many_arguments)]
    pub fn create_score_record(
        &self,
        score_id: &str,
        repo: &str,
        issue_number: u64,
        comment_id: Option<u64>,
        content_type: ContentType,
        title: &str,
        body: &str,
        author: &str,
        issue_url: &str,
    ) -> Result<bool> {
        let now = now_rfc3339();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO score_records
                (score_id, repo, issue_number, comment_id, content_type,
                 title, body, author, issue_url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'queued', ?10)",
            params![
                score_id,
                repo,
                issue_number as i64,
                comment_id.map(|id| id as i64),
                content_type.as_str(),
                title,
                body,
                author,
                issue_url,
                now
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn mark_score_processing(&self, score_id: &str) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE score_records SET status = 'processing'
             WHERE score_id = ?1 AND status = 'queued'",
            params![score_id],
        )?;
        Ok(updated > 0)
    }

    pub fn complete_score(&self, score_id: &str, scores: &ScoreSet) -> Result<()> {
        let now = now_rfc3339();
        self.conn().execute(
            "UPDATE score_records
             SET status = 'completed',
                 format_score = ?2, format_feedback = ?3,
                 content_score = ?4, content_feedback = ?5,
                 clarity_score = ?6, clarity_feedback = ?7,
                 actionability_score = ?8, actionability_feedback = ?9,
                 overall_score = ?10, suggestions = ?11, completed_at = ?12
             WHERE score_id = ?1",
            params![
                score_id,
                scores.format.score,
                scores.format.feedback,
                scores.content.score,
                scores.content.feedback,
                scores.clarity.score,
                scores.clarity.feedback,
                scores.actionability.score,
                scores.actionability.feedback,
                scores.overall_score,
                scores.suggestions,
                now
            ],
        )?;
        Ok(())
    }

    pub fn fail_score(&self, score_id: &str, error_message: &str) -> Result<()> {
        let now = now_rfc3339();
        self.conn().execute(
            "UPDATE score_records
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE score_id = ?1",
            params![score_id, error_message, now],
        )?;
        Ok(())
    }

    /// Append free-text user feedback to a score record. Returns false when
    /// the record does not exist.
    pub fn append_user_feedback(&self, score_id: &str, feedback: &str) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE score_records
             SET user_feedback = CASE
                 WHEN user_feedback IS NULL OR user_feedback = '' THEN ?2
                 ELSE user_feedback || char(10) || '---' || char(10) || ?2
             END
             WHERE score_id = ?1",
            params![score_id, feedback],
        )?;
        Ok(updated > 0)
    }

    /// Remove a record whose job could not be enqueued, so a webhook
    /// re-delivery can start over.
    pub fn delete_score_record(&self, score_id: &str) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM score_records WHERE score_id = ?1 AND status = 'queued'",
            params![score_id],
        )?;
        Ok(deleted > 0)
    }

    /// Refresh the stored title when an issue is edited (no re-score).
    pub fn update_score_title(&self, repo: &str, issue_number: u64, title: &str) -> Result<usize> {
        let updated = self.conn().execute(
            "UPDATE score_records SET title = ?3
             WHERE repo = ?1 AND issue_number = ?2",
            params![repo, issue_number as i64, title],
        )?;
        Ok(updated)
    }

    pub fn get_score_record(&self, score_id: &str) -> Result<Option<ScoreRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {SCORE_COLUMNS} FROM score_records WHERE score_id = ?1"),
                params![score_id],
                row_to_score,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_score_records(
        &self,
        limit: u32,
        status: Option<ScoreStatus>,
    ) -> Result<Vec<ScoreRecord>> {
        let conn = self.conn();
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCORE_COLUMNS} FROM score_records
                     WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], row_to_score)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCORE_COLUMNS} FROM score_records
                     ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_score)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    pub fn score_stats(&self) -> Result<ScoreStats> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM score_records GROUP BY status")?;
        let mut stats = ScoreStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match ScoreStatus::from_str_lossy(&status) {
                ScoreStatus::Queued => stats.queued = count,
                ScoreStatus::Processing => stats.processing = count,
                ScoreStatus::Completed => stats.completed = count,
                ScoreStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Summarize an author's most recent `limit` completed scores:
    /// per-dimension averages, range, and the overall-score trend.
    pub fn author_score_history(&self, author: &str, limit: u32) -> Result<AuthorScoreHistory> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT overall_score, format_score, content_score,
                    clarity_score, actionability_score
             FROM score_records
             WHERE author = ?1 AND status = 'completed' AND overall_score IS NOT NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![author, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            ))
        })?;

        let mut overall = Vec::new();
        let (mut format, mut content, mut clarity, mut actionability) = (0i64, 0i64, 0i64, 0i64);
        for row in rows {
            let (o, f, c, cl, a) = row?;
            overall.push(o);
            format += f;
            content += c;
            clarity += cl;
            actionability += a;
        }

        if overall.is_empty() {
            return Ok(AuthorScoreHistory::default());
        }

        let n = overall.len() as f64;
        Ok(AuthorScoreHistory {
            total_scored: overall.len() as i64,
            avg_overall: overall.iter().sum::<i64>() as f64 / n,
            avg_format: format as f64 / n,
            avg_content: content as f64 / n,
            avg_clarity: clarity as f64 / n,
            avg_actionability: actionability as f64 / n,
            min_score: *overall.iter().min().unwrap_or(&0),
            max_score: *overall.iter().max().unwrap_or(&0),
            trend: trend_of(&overall),
            recent_scores: overall.into_iter().take(5).collect(),
        })
    }

    /// Records carrying user feedback newer than `cutoff` (RFC 3339).
    pub fn scores_with_feedback_since(&self, cutoff: &str) -> Result<Vec<ScoreRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCORE_COLUMNS} FROM score_records
             WHERE user_feedback IS NOT NULL AND user_feedback != ''
               AND created_at >= ?1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![cutoff], row_to_score)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

const SCORE_COLUMNS: &str = "score_id, repo, issue_number, comment_id, content_type, title, body, \
     author, issue_url, format_score, format_feedback, content_score, \
     content_feedback, clarity_score, clarity_feedback, actionability_score, \
     actionability_feedback, overall_score, suggestions, status, \
     error_message, user_feedback, created_at, completed_at";

fn row_to_score(row: &Row<'_>) -> rusqlite::Result<ScoreRecord> {
    Ok(ScoreRecord {
        score_id: row.get(0)?,
        repo: row.get(1)?,
        issue_number: row.get(2)?,
        comment_id: row.get(3)?,
        content_type: ContentType::from_str_lossy(&row.get::<_, String>(4)?),
        title: row.get(5)?,
        body: row.get(6)?,
        author: row.get(7)?,
        issue_url: row.get(8)?,
        format_score: row.get(9)?,
        format_feedback: row.get(10)?,
        content_score: row.get(11)?,
        content_feedback: row.get(12)?,
        clarity_score: row.get(13)?,
        clarity_feedback: row.get(14)?,
        actionability_score: row.get(15)?,
        actionability_feedback: row.get(16)?,
        overall_score: row.get(17)?,
        suggestions: row.get(18)?,
        status: ScoreStatus::from_str_lossy(&row.get::<_, String>(19)?),
        error_message: row.get(20)?,
        user_feedback: row.get(21)?,
        created_at: row.get(22)?,
        completed_at: row.get(23)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn sample_scores() -> ScoreSet {
        ScoreSet {
            format: DimensionScore {
                score: 85,
                feedback: "well structured".into(),
            },
            content: DimensionScore {
                score: 90,
                feedback: "complete".into(),
            },
            clarity: DimensionScore {
                score: 80,
                feedback: "clear".into(),
            },
            actionability: DimensionScore {
                score: 88,
                feedback: "reproducible".into(),
            },
            overall_score: 86,
            suggestions: "add logs".into(),
        }
    }

    fn create(store: &Store, issue: u64, comment: Option<u64>) -> (String, bool) {
        let id = score_id_for("Acme/qa", issue, comment);
        let created = store
            .create_score_record(
                &id,
                "Acme/qa",
                issue,
                comment,
                ContentType::Bug,
                "Boot failure",
                "## Description\nit broke",
                "alice",
                "https://github.com/Acme/qa/issues/1",
            )
            .unwrap();
        (id, created)
    }

    #[test]
    fn score_id_shape() {
        assert_eq!(score_id_for("Acme/qa", 5, None), "Acme/qa#5@issue");
        assert_eq!(score_id_for("Acme/qa", 5, Some(99)), "Acme/qa#5@99");
    }

    #[test]
    fn duplicate_delivery_does_not_double_score() {
        let (_tmp, store) = temp_store();
        let (_, created) = create(&store, 1, None);
        assert!(created);
        let (_, created_again) = create(&store, 1, None);
        assert!(!created_again);

        // A comment on the same issue is a different subject.
        let (_, comment_created) = create(&store, 1, Some(7));
        assert!(comment_created);
    }

    #[test]
    fn lifecycle_to_completed() {
        let (_tmp, store) = temp_store();
        let (id, _) = create(&store, 2, None);
        assert!(store.mark_score_processing(&id).unwrap());
        store.complete_score(&id, &sample_scores()).unwrap();

        let record = store.get_score_record(&id).unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Completed);
        assert_eq!(record.format_score, Some(85));
        assert_eq!(record.overall_score, Some(86));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn failed_score_keeps_error() {
        let (_tmp, store) = temp_store();
        let (id, _) = create(&store, 3, None);
        store.mark_score_processing(&id).unwrap();
        store.fail_score(&id, "CLI timed out").unwrap();

        let record = store.get_score_record(&id).unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("CLI timed out"));
    }

    #[test]
    fn user_feedback_accumulates() {
        let (_tmp, store) = temp_store();
        let (id, _) = create(&store, 4, None);
        assert!(store.append_user_feedback(&id, "too strict, +10").unwrap());
        assert!(store.append_user_feedback(&id, "still too strict").unwrap());
        assert!(!store.append_user_feedback("missing", "x").unwrap());

        let record = store.get_score_record(&id).unwrap().unwrap();
        let feedback = record.user_feedback.unwrap();
        assert!(feedback.contains("too strict, +10"));
        assert!(feedback.contains("---"));
        assert!(feedback.contains("still too strict"));
    }

    #[test]
    fn edited_issue_updates_title_only() {
        let (_tmp, store) = temp_store();
        let (id, _) = create(&store, 5, None);
        store.mark_score_processing(&id).unwrap();
        store.complete_score(&id, &sample_scores()).unwrap();

        let updated = store.update_score_title("Acme/qa", 5, "Boot failure (rev 2)").unwrap();
        assert_eq!(updated, 1);
        let record = store.get_score_record(&id).unwrap().unwrap();
        assert_eq!(record.title, "Boot failure (rev 2)");
        assert_eq!(record.status, ScoreStatus::Completed);
    }

    #[test]
    fn author_history_averages_completed_scores() {
        let (_tmp, store) = temp_store();
        for (issue, overall) in [(10u64, 70), (11, 72), (12, 88), (13, 90)] {
            let (id, _) = create(&store, issue, None);
            store.mark_score_processing(&id).unwrap();
            let mut scores = sample_scores();
            scores.overall_score = overall;
            store.complete_score(&id, &scores).unwrap();
        }
        // A failed record never contributes.
        let (failed_id, _) = create(&store, 14, None);
        store.mark_score_processing(&failed_id).unwrap();
        store.fail_score(&failed_id, "CLI died").unwrap();

        let history = store.author_score_history("alice", 10).unwrap();
        assert_eq!(history.total_scored, 4);
        assert!((history.avg_overall - 80.0).abs() < 1e-9);
        assert!((history.avg_format - 85.0).abs() < 1e-9);
        assert_eq!(history.min_score, 70);
        assert_eq!(history.max_score, 90);
        // Newest first: issue 13 completed last.
        assert_eq!(history.recent_scores, vec![90, 88, 72, 70]);
        assert_eq!(history.trend, crate::store::Trend::Improving);

        let unknown = store.author_score_history("nobody", 10).unwrap();
        assert_eq!(unknown.total_scored, 0);
        assert!(unknown.recent_scores.is_empty());
    }

    #[test]
    fn feedback_window_query() {
        let (_tmp, store) = temp_store();
        let (id, _) = create(&store, 6, None);
        store.append_user_feedback(&id, "helpful").unwrap();
        create(&store, 7, None); // no feedback

        let old_cutoff = "2000-01-01T00:00:00+00:00";
        let hits = store.scores_with_feedback_since(old_cutoff).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score_id, id);

        let future_cutoff = "2999-01-01T00:00:00+00:00";
        assert!(store.scores_with_feedback_since(future_cutoff).unwrap().is_empty());
    }
}
