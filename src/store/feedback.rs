//! Feedback patterns and snapshots.
//!
//! A pattern row aggregates every analyzed feedback item that mapped to the
//! same `{feedback_type}:{dimension}` key. The running mean of score
//! deviations is kept exact by storing the sum alongside the count.

use anyhow::Result;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::util::now_rfc3339;

use super::Store;

/// Example feedbacks kept per pattern; oldest dropped beyond this.
const EXAMPLE_CAP: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPattern {
    pub pattern_id: String,
    pub pattern_type: String,
    pub dimension: String,
    pub occurrence_count: i64,
    pub deviation_sum: f64,
    pub avg_score_deviation: f64,
    pub example_feedbacks: Vec<String>,
    pub identified_issue: String,
    pub suggested_adjustment: String,
    pub last_seen: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSnapshot {
    pub snapshot_id: String,
    pub snapshot_date: String,
    pub total_feedbacks: i64,
    pub positive_count: i64,
    pub negative_count: i64,
    pub neutral_count: i64,
    pub top_issues: Vec<String>,
    pub learning_insights: serde_json::Value,
    pub prompt_adjustments: Vec<String>,
    pub created_at: String,
}

impl Store {
    /// Fold one analyzed feedback item into its pattern row. Creates the row
    /// on first sight; otherwise increments the count, updates the running
    /// mean, and appends the example (capped, oldest dropped). Callers pass
    /// a truncated example; the full text stays on the score record.
    pub fn record_feedback_pattern(
        &self,
        pattern_type: &str,
        dimension: &str,
        score_deviation: f64,
        example: &str,
        identified_issue: &str,
        suggested_adjustment: &str,
    ) -> Result<()> {
        let pattern_id = format!("{pattern_type}:{dimension}");
        let now = now_rfc3339();
        let conn = self.conn();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO feedback_patterns
                (pattern_id, pattern_type, dimension, occurrence_count,
                 deviation_sum, avg_score_deviation, example_feedbacks,
                 identified_issue, suggested_adjustment,
                 last_seen, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4, ?5, ?6, ?7, ?8, ?8, ?8)",
            params![
                pattern_id,
                pattern_type,
                dimension,
                score_deviation,
                serde_json::to_string(&[example])?,
                identified_issue,
                suggested_adjustment,
                now
            ],
        )?;
        if inserted > 0 {
            return Ok(());
        }

        // Locked read-modify-write; the connection mutex serializes writers.
        let (count, sum, examples_raw): (i64, f64, String) = conn.query_row(
            "SELECT occurrence_count, deviation_sum, example_feedbacks
             FROM feedback_patterns WHERE pattern_id = ?1",
            params![pattern_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let new_count = count + 1;
        let new_sum = sum + score_deviation;
        let new_avg = new_sum / new_count as f64;

        let mut examples: Vec<String> = serde_json::from_str(&examples_raw).unwrap_or_default();
        examples.push(example.to_owned());
        if examples.len() > EXAMPLE_CAP {
            let drop = examples.len() - EXAMPLE_CAP;
            examples.drain(..drop);
        }

        conn.execute(
            "UPDATE feedback_patterns
             SET occurrence_count = ?2, deviation_sum = ?3,
                 avg_score_deviation = ?4, example_feedbacks = ?5,
                 identified_issue = ?6, suggested_adjustment = ?7,
                 last_seen = ?8, updated_at = ?8
             WHERE pattern_id = ?1",
            params![
                pattern_id,
                new_count,
                new_sum,
                new_avg,
                serde_json::to_string(&examples)?,
                identified_issue,
                suggested_adjustment,
                now
            ],
        )?;
        Ok(())
    }

    /// Patterns seen since `cutoff` with at least `min_occurrences` hits,
    /// highest occurrence first.
    pub fn feedback_patterns_since(
        &self,
        cutoff: &str,
        min_occurrences: i64,
    ) -> Result<Vec<FeedbackPattern>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM feedback_patterns
             WHERE last_seen >= ?1 AND occurrence_count >= ?2
             ORDER BY occurrence_count DESC, pattern_id ASC
             LIMIT 10"
        ))?;
        let rows = stmt.query_map(params![cutoff, min_occurrences], row_to_pattern)?;
        let mut patterns = Vec::new();
        for row in rows {
            patterns.push(row?);
        }
        Ok(patterns)
    }

    pub fn all_feedback_patterns(&self) -> Result<Vec<FeedbackPattern>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM feedback_patterns
             ORDER BY occurrence_count DESC, pattern_id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_pattern)?;
        let mut patterns = Vec::new();
        for row in rows {
            patterns.push(row?);
        }
        Ok(patterns)
    }

    /// Self-consistency check over the pattern table. Returns one message
    /// per corrupt row; empty means healthy.
    pub fn verify_feedback_patterns(&self) -> Result<Vec<String>> {
        let patterns = self.all_feedback_patterns()?;
        let mut anomalies = Vec::new();
        for p in &patterns {
            if p.occurrence_count < 1 {
                anomalies.push(format!(
                    "{}: occurrence_count {} < 1",
                    p.pattern_id, p.occurrence_count
                ));
            }
            if p.last_seen < p.created_at {
                anomalies.push(format!(
                    "{}: last_seen {} earlier than created_at {}",
                    p.pattern_id, p.last_seen, p.created_at
                ));
            }
            let expected = p.deviation_sum / p.occurrence_count.max(1) as f64;
            if (expected - p.avg_score_deviation).abs() > 1e-6 {
                anomalies.push(format!(
                    "{}: avg_score_deviation {} does not match sum/count {}",
                    p.pattern_id, p.avg_score_deviation, expected
                ));
            }
        }
        Ok(anomalies)
    }

    // ── snapshots ───────────────────────────────────────────────

    pub fn insert_feedback_snapshot(&self, snapshot: &FeedbackSnapshot) -> Result<()> {
        self.conn().execute(
            "INSERT INTO feedback_snapshots
                (snapshot_id, snapshot_date, total_feedbacks, positive_count,
                 negative_count, neutral_count, top_issues, learning_insights,
                 prompt_adjustments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot.snapshot_id,
                snapshot.snapshot_date,
                snapshot.total_feedbacks,
                snapshot.positive_count,
                snapshot.negative_count,
                snapshot.neutral_count,
                serde_json::to_string(&snapshot.top_issues)?,
                serde_json::to_string(&snapshot.learning_insights)?,
                serde_json::to_string(&snapshot.prompt_adjustments)?,
                snapshot.created_at
            ],
        )?;
        Ok(())
    }

    pub fn list_feedback_snapshots(&self, limit: u32) -> Result<Vec<FeedbackSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, snapshot_date, total_feedbacks, positive_count,
                    negative_count, neutral_count, top_issues, learning_insights,
                    prompt_adjustments, created_at
             FROM feedback_snapshots ORDER BY snapshot_date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let top_raw: String = row.get(6)?;
            let insights_raw: String = row.get(7)?;
            let adjustments_raw: String = row.get(8)?;
            Ok(FeedbackSnapshot {
                snapshot_id: row.get(0)?,
                snapshot_date: row.get(1)?,
                total_feedbacks: row.get(2)?,
                positive_count: row.get(3)?,
                negative_count: row.get(4)?,
                neutral_count: row.get(5)?,
                top_issues: serde_json::from_str(&top_raw).unwrap_or_default(),
                learning_insights: serde_json::from_str(&insights_raw)
                    .unwrap_or(serde_json::Value::Null),
                prompt_adjustments: serde_json::from_str(&adjustments_raw).unwrap_or_default(),
                created_at: row.get(9)?,
            })
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }
}

const PATTERN_COLUMNS: &str = "pattern_id, pattern_type, dimension, occurrence_count, deviation_sum, \
     avg_score_deviation, example_feedbacks, identified_issue, \
     suggested_adjustment, last_seen, created_at, updated_at";

fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<FeedbackPattern> {
    let examples_raw: String = row.get(6)?;
    Ok(FeedbackPattern {
        pattern_id: row.get(0)?,
        pattern_type: row.get(1)?,
        dimension: row.get(2)?,
        occurrence_count: row.get(3)?,
        deviation_sum: row.get(4)?,
        avg_score_deviation: row.get(5)?,
        example_feedbacks: serde_json::from_str(&examples_raw).unwrap_or_default(),
        identified_issue: row.get(7)?,
        suggested_adjustment: row.get(8)?,
        last_seen: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn record(store: &Store, deviation: f64, example: &str) {
        store
            .record_feedback_pattern(
                "too_harsh",
                "format",
                deviation,
                example,
                "scores on format run low",
                "loosen format scoring",
            )
            .unwrap();
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let (_tmp, store) = temp_store();
        record(&store, 10.0, "too strict, +10");
        record(&store, 5.0, "score should be higher by 5");
        record(&store, 12.0, "too harsh, +12");

        let patterns = store.all_feedback_patterns().unwrap();
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.pattern_id, "too_harsh:format");
        assert_eq!(p.occurrence_count, 3);
        assert!((p.avg_score_deviation - 9.0).abs() < 1e-9);
        assert_eq!(p.example_feedbacks.len(), 3);
    }

    #[test]
    fn examples_capped_at_five_oldest_dropped() {
        let (_tmp, store) = temp_store();
        for i in 0..7 {
            record(&store, 1.0, &format!("feedback {i}"));
        }
        let p = &store.all_feedback_patterns().unwrap()[0];
        assert_eq!(p.occurrence_count, 7);
        assert_eq!(p.example_feedbacks.len(), 5);
        assert_eq!(p.example_feedbacks[0], "feedback 2");
        assert_eq!(p.example_feedbacks[4], "feedback 6");
    }

    #[test]
    fn distinct_keys_are_separate_patterns() {
        let (_tmp, store) = temp_store();
        record(&store, 10.0, "a");
        store
            .record_feedback_pattern("too_lenient", "format", -5.0, "b", "", "")
            .unwrap();
        store
            .record_feedback_pattern("too_harsh", "clarity", 3.0, "c", "", "")
            .unwrap();

        let patterns = store.all_feedback_patterns().unwrap();
        assert_eq!(patterns.len(), 3);
    }

    #[test]
    fn window_query_respects_min_occurrences() {
        let (_tmp, store) = temp_store();
        record(&store, 10.0, "a");
        record(&store, 8.0, "b");
        store
            .record_feedback_pattern("missed_issue", "content", 0.0, "c", "", "")
            .unwrap();

        let old_cutoff = "2000-01-01T00:00:00+00:00";
        let frequent = store.feedback_patterns_since(old_cutoff, 2).unwrap();
        assert_eq!(frequent.len(), 1);
        assert_eq!(frequent[0].pattern_id, "too_harsh:format");

        let all = store.feedback_patterns_since(old_cutoff, 1).unwrap();
        assert_eq!(all.len(), 2);

        let future = store.feedback_patterns_since("2999-01-01T00:00:00+00:00", 1).unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn verify_reports_healthy_table() {
        let (_tmp, store) = temp_store();
        record(&store, 10.0, "a");
        record(&store, 2.0, "b");
        assert!(store.verify_feedback_patterns().unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let (_tmp, store) = temp_store();
        let snapshot = FeedbackSnapshot {
            snapshot_id: "snapshot-1".into(),
            snapshot_date: "2026-08-02".into(),
            total_feedbacks: 4,
            positive_count: 1,
            negative_count: 2,
            neutral_count: 1,
            top_issues: vec!["too_harsh on format (3x)".into()],
            learning_insights: serde_json::json!({"summary": "loosen format"}),
            prompt_adjustments: vec!["format: consider loosening".into()],
            created_at: crate::util::now_rfc3339(),
        };
        store.insert_feedback_snapshot(&snapshot).unwrap();

        let listed = store.list_feedback_snapshots(5).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].total_feedbacks, 4);
        assert_eq!(listed[0].top_issues.len(), 1);
        assert_eq!(listed[0].learning_insights["summary"], "loosen format");
    }
}
