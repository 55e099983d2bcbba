//! Issue copy records and comment sync records.
//!
//! `copy_records` has a UNIQUE index on (source_repo, source_issue_number,
//! target_repo): a claim row with status `pending` is inserted before any
//! GitHub call, so concurrent deliveries of the same webhook serialize on the
//! index and only one performs the replication. `comment_sync_records` works
//! the same way per (source_comment, target issue).
//!
//! Failed rows may be reclaimed in place on re-delivery; success/partial rows
//! are final.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::util::now_rfc3339;

use super::{ClaimOutcome, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    /// Claim row: replication in flight.
    Pending,
    Success,
    /// Issue created, but some images or labels were skipped.
    Partial,
    Failed,
}

impl CopyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_replicated(self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

/// One re-hosted image: where it was, where it lives now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReupload {
    pub original_url: String,
    pub new_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRecord {
    pub record_id: String,
    pub source_repo: String,
    pub source_issue_number: i64,
    pub source_issue_title: String,
    pub source_issue_url: String,
    pub labels_copied: Vec<String>,
    pub images_reuploaded: Vec<ImageReupload>,
    pub target_repo: String,
    pub target_issue_number: Option<i64>,
    pub target_issue_url: Option<String>,
    pub status: CopyStatus,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CopyStats {
    pub total: i64,
    pub success: i64,
    pub partial: i64,
    pub failed: i64,
    pub pending: i64,
    pub total_images: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentSyncRecord {
    pub sync_id: String,
    pub source_comment_id: i64,
    pub source_repo: String,
    pub source_issue_number: i64,
    pub source_comment_url: String,
    pub comment_author: String,
    pub target_repo: String,
    pub target_issue_number: i64,
    pub target_comment_id: Option<i64>,
    pub status: CopyStatus,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CommentSyncStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
}

impl Store {
    // ── copy records ────────────────────────────────────────────

    /// Claim the (source issue → target repo) slot. `Duplicate` means another
    /// delivery already replicated (or is replicating) this pair.
    #[allow(clippy::too_many_arguments)]
    pub fn claim_copy(
        &self,
        record_id: &str,
        source_repo: &str,
        source_issue_number: u64,
        source_issue_title: &str,
        source_issue_url: &str,
        target_repo: &str,
    ) -> Result<ClaimOutcome> {
        let now = now_rfc3339();
        let conn = self.conn();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO copy_records
                (record_id, source_repo, source_issue_number, source_issue_title,
                 source_issue_url, target_repo, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                record_id,
                source_repo,
                source_issue_number as i64,
                source_issue_title,
                source_issue_url,
                target_repo,
                now
            ],
        )?;
        if inserted > 0 {
            return Ok(ClaimOutcome::Claimed);
        }

        // Slot taken. Failed rows are retried in place; everything else is
        // a duplicate and the webhook is a no-op for this target.
        let reclaimed = conn.execute(
            "UPDATE copy_records
             SET status = 'pending', error_message = NULL,
                 source_issue_title = ?4, created_at = ?5, completed_at = NULL
             WHERE source_repo = ?1 AND source_issue_number = ?2
               AND target_repo = ?3 AND status = 'failed'",
            params![
                source_repo,
                source_issue_number as i64,
                target_repo,
                source_issue_title,
                now
            ],
        )?;
        if reclaimed > 0 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Duplicate)
        }
    }

    /// Finish a claimed copy as success or partial.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_copy(
        &self,
        source_repo: &str,
        source_issue_number: u64,
        target_repo: &str,
        target_issue_number: u64,
        target_issue_url: &str,
        labels_copied: &[String],
        images_reuploaded: &[ImageReupload],
        status: CopyStatus,
    ) -> Result<()> {
        let now = now_rfc3339();
        self.conn().execute(
            "UPDATE copy_records
             SET status = ?4, target_issue_number = ?5, target_issue_url = ?6,
                 labels_copied = ?7, images_reuploaded = ?8, completed_at = ?9
             WHERE source_repo = ?1 AND source_issue_number = ?2 AND target_repo = ?3",
            params![
                source_repo,
                source_issue_number as i64,
                target_repo,
                status.as_str(),
                target_issue_number as i64,
                target_issue_url,
                serde_json::to_string(labels_copied)?,
                serde_json::to_string(images_reuploaded)?,
                now
            ],
        )?;
        Ok(())
    }

    pub fn fail_copy(
        &self,
        source_repo: &str,
        source_issue_number: u64,
        target_repo: &str,
        error_message: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        self.conn().execute(
            "UPDATE copy_records
             SET status = 'failed', error_message = ?4, completed_at = ?5
             WHERE source_repo = ?1 AND source_issue_number = ?2 AND target_repo = ?3",
            params![
                source_repo,
                source_issue_number as i64,
                target_repo,
                error_message,
                now
            ],
        )?;
        Ok(())
    }

    /// All replicated (success/partial) copies of a source issue.
    pub fn replicated_copies(
        &self,
        source_repo: &str,
        source_issue_number: u64,
    ) -> Result<Vec<CopyRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COPY_COLUMNS} FROM copy_records
             WHERE source_repo = ?1 AND source_issue_number = ?2
               AND status IN ('success', 'partial')
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![source_repo, source_issue_number as i64],
            row_to_copy,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn get_copy_record(
        &self,
        source_repo: &str,
        source_issue_number: u64,
        target_repo: &str,
    ) -> Result<Option<CopyRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {COPY_COLUMNS} FROM copy_records
                     WHERE source_repo = ?1 AND source_issue_number = ?2
                       AND target_repo = ?3"
                ),
                params![source_repo, source_issue_number as i64, target_repo],
                row_to_copy,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_copy_records(
        &self,
        limit: u32,
        status: Option<CopyStatus>,
    ) -> Result<Vec<CopyRecord>> {
        let conn = self.conn();
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COPY_COLUMNS} FROM copy_records
                     WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], row_to_copy)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COPY_COLUMNS} FROM copy_records
                     ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_copy)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    pub fn copy_stats(&self) -> Result<CopyStats> {
        let conn = self.conn();
        let stats = conn.query_row(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'partial' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END)
             FROM copy_records",
            [],
            |row| {
                Ok(CopyStats {
                    total: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    success: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    partial: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    pending: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    total_images: 0,
                })
            },
        )?;

        // Image count lives inside the JSON column.
        let mut stmt = conn.prepare(
            "SELECT images_reuploaded FROM copy_records
             WHERE status IN ('success', 'partial')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut total_images = 0i64;
        for row in rows {
            let raw = row?;
            let images: Vec<ImageReupload> = serde_json::from_str(&raw).unwrap_or_default();
            total_images += images.len() as i64;
        }

        Ok(CopyStats {
            total_images,
            ..stats
        })
    }

    // ── comment sync records ────────────────────────────────────

    /// Claim the (source comment → target issue) slot.
    #[allow(clippy::too_many_arguments)]
    pub fn claim_comment_sync(
        &self,
        sync_id: &str,
        source_comment_id: u64,
        source_repo: &str,
        source_issue_number: u64,
        source_comment_url: &str,
        comment_author: &str,
        target_repo: &str,
        target_issue_number: u64,
    ) -> Result<ClaimOutcome> {
        let now = now_rfc3339();
        let conn = self.conn();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO comment_sync_records
                (sync_id, source_comment_id, source_repo, source_issue_number,
                 source_comment_url, comment_author, target_repo,
                 target_issue_number, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                sync_id,
                source_comment_id as i64,
                source_repo,
                source_issue_number as i64,
                source_comment_url,
                comment_author,
                target_repo,
                target_issue_number as i64,
                now
            ],
        )?;
        if inserted > 0 {
            return Ok(ClaimOutcome::Claimed);
        }

        let reclaimed = conn.execute(
            "UPDATE comment_sync_records
             SET status = 'pending', error_message = NULL, created_at = ?4
             WHERE source_comment_id = ?1 AND target_repo = ?2
               AND target_issue_number = ?3 AND status = 'failed'",
            params![
                source_comment_id as i64,
                target_repo,
                target_issue_number as i64,
                now
            ],
        )?;
        if reclaimed > 0 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Duplicate)
        }
    }

    pub fn complete_comment_sync(
        &self,
        source_comment_id: u64,
        target_repo: &str,
        target_issue_number: u64,
        target_comment_id: u64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE comment_sync_records
             SET status = 'success', target_comment_id = ?4
             WHERE source_comment_id = ?1 AND target_repo = ?2
               AND target_issue_number = ?3",
            params![
                source_comment_id as i64,
                target_repo,
                target_issue_number as i64,
                target_comment_id as i64
            ],
        )?;
        Ok(())
    }

    pub fn fail_comment_sync(
        &self,
        source_comment_id: u64,
        target_repo: &str,
        target_issue_number: u64,
        error_message: &str,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE comment_sync_records
             SET status = 'failed', error_message = ?4
             WHERE source_comment_id = ?1 AND target_repo = ?2
               AND target_issue_number = ?3",
            params![
                source_comment_id as i64,
                target_repo,
                target_issue_number as i64,
                error_message
            ],
        )?;
        Ok(())
    }

    pub fn list_comment_syncs(&self, limit: u32) -> Result<Vec<CommentSyncRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sync_id, source_comment_id, source_repo, source_issue_number,
                    source_comment_url, comment_author, target_repo,
                    target_issue_number, target_comment_id, status,
                    error_message, created_at
             FROM comment_sync_records ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(CommentSyncRecord {
                sync_id: row.get(0)?,
                source_comment_id: row.get(1)?,
                source_repo: row.get(2)?,
                source_issue_number: row.get(3)?,
                source_comment_url: row.get(4)?,
                comment_author: row.get(5)?,
                target_repo: row.get(6)?,
                target_issue_number: row.get(7)?,
                target_comment_id: row.get(8)?,
                status: CopyStatus::from_str_lossy(&row.get::<_, String>(9)?),
                error_message: row.get(10)?,
                created_at: row.get(11)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn comment_sync_stats(&self) -> Result<CommentSyncStats> {
        let conn = self.conn();
        let stats = conn.query_row(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
             FROM comment_sync_records",
            [],
            |row| {
                Ok(CommentSyncStats {
                    total: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    success: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            },
        )?;
        Ok(stats)
    }
}

const COPY_COLUMNS: &str = "record_id, source_repo, source_issue_number, source_issue_title, \
     source_issue_url, labels_copied, images_reuploaded, target_repo, \
     target_issue_number, target_issue_url, status, error_message, \
     created_at, completed_at";

fn row_to_copy(row: &Row<'_>) -> rusqlite::Result<CopyRecord> {
    let labels_raw: String = row.get(5)?;
    let images_raw: String = row.get(6)?;
    Ok(CopyRecord {
        record_id: row.get(0)?,
        source_repo: row.get(1)?,
        source_issue_number: row.get(2)?,
        source_issue_title: row.get(3)?,
        source_issue_url: row.get(4)?,
        labels_copied: serde_json::from_str(&labels_raw).unwrap_or_default(),
        images_reuploaded: serde_json::from_str(&images_raw).unwrap_or_default(),
        target_repo: row.get(7)?,
        target_issue_number: row.get(8)?,
        target_issue_url: row.get(9)?,
        status: CopyStatus::from_str_lossy(&row.get::<_, String>(10)?),
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn claim(store: &Store, issue: u64, target: &str) -> ClaimOutcome {
        store
            .claim_copy(
                &format!("Acme/src#{issue}->{target}"),
                "Acme/src",
                issue,
                "Boot failure",
                "https://github.com/Acme/src/issues/100",
                target,
            )
            .unwrap()
    }

    #[test]
    fn copy_claim_is_unique_per_triple() {
        let (_tmp, store) = temp_store();
        assert_eq!(claim(&store, 100, "Acme/OS3OS4"), ClaimOutcome::Claimed);
        assert_eq!(claim(&store, 100, "Acme/OS3OS4"), ClaimOutcome::Duplicate);
        // Other targets of the same issue are independent slots.
        assert_eq!(claim(&store, 100, "Acme/OS5"), ClaimOutcome::Claimed);
    }

    #[test]
    fn successful_copy_is_never_reclaimed() {
        let (_tmp, store) = temp_store();
        claim(&store, 100, "Acme/OS5");
        store
            .complete_copy(
                "Acme/src",
                100,
                "Acme/OS5",
                7,
                "https://github.com/Acme/OS5/issues/7",
                &["OS5".to_owned()],
                &[],
                CopyStatus::Success,
            )
            .unwrap();

        assert_eq!(claim(&store, 100, "Acme/OS5"), ClaimOutcome::Duplicate);
        let stats = store.copy_stats().unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn failed_copy_is_reclaimed_in_place() {
        let (_tmp, store) = temp_store();
        claim(&store, 100, "Acme/OS5");
        store
            .fail_copy("Acme/src", 100, "Acme/OS5", "target repo 404")
            .unwrap();

        assert_eq!(claim(&store, 100, "Acme/OS5"), ClaimOutcome::Claimed);
        // Still exactly one row for the triple.
        let records = store.list_copy_records(10, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CopyStatus::Pending);
        assert!(records[0].error_message.is_none());
    }

    #[test]
    fn partial_status_and_image_count() {
        let (_tmp, store) = temp_store();
        claim(&store, 100, "Acme/OS5");
        store
            .complete_copy(
                "Acme/src",
                100,
                "Acme/OS5",
                7,
                "https://github.com/Acme/OS5/issues/7",
                &[],
                &[ImageReupload {
                    original_url: "https://imgur.com/a.png".into(),
                    new_url: "https://github.com/Acme/OS5/blob/assets/images/a.png?raw=true".into(),
                }],
                CopyStatus::Partial,
            )
            .unwrap();

        let stats = store.copy_stats().unwrap();
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.total_images, 1);

        let replicated = store.replicated_copies("Acme/src", 100).unwrap();
        assert_eq!(replicated.len(), 1);
        assert_eq!(replicated[0].images_reuploaded.len(), 1);
    }

    #[test]
    fn comment_sync_at_most_once() {
        let (_tmp, store) = temp_store();
        let claim = || {
            store
                .claim_comment_sync(
                    "Acme/src#100@999->Acme/OS5#7",
                    999,
                    "Acme/src",
                    100,
                    "https://github.com/Acme/src/issues/100#issuecomment-999",
                    "bob",
                    "Acme/OS5",
                    7,
                )
                .unwrap()
        };
        assert_eq!(claim(), ClaimOutcome::Claimed);
        store
            .complete_comment_sync(999, "Acme/OS5", 7, 1234)
            .unwrap();
        // The webhook fires twice; the second delivery is a no-op.
        assert_eq!(claim(), ClaimOutcome::Duplicate);

        let records = store.list_comment_syncs(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target_comment_id, Some(1234));

        let stats = store.comment_sync_stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
    }

    #[test]
    fn same_comment_different_targets_are_independent() {
        let (_tmp, store) = temp_store();
        let claim = |target: &str, issue: u64| {
            store
                .claim_comment_sync(
                    &format!("Acme/src#100@999->{target}#{issue}"),
                    999,
                    "Acme/src",
                    100,
                    "",
                    "bob",
                    target,
                    issue,
                )
                .unwrap()
        };
        assert_eq!(claim("Acme/OS5", 7), ClaimOutcome::Claimed);
        assert_eq!(claim("Acme/OS3OS4", 12), ClaimOutcome::Claimed);
    }
}
