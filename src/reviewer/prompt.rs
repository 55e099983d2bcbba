//! Review prompt assembly: diff rendering with a character budget, the
//! prompt text, and score extraction from the CLI's reply.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::ReviewConfig;
use crate::github::{PullFile, PullRequest};
use crate::store::{AuthorReviewHistory, Trend};

/// Marker appended when the rendered diff exceeds its budget.
pub const TRUNCATION_MARKER: &str = "\n\n… [diff truncated — change set exceeds the review budget]";

/// Render per-file unified patches under a total character budget.
pub fn render_diff(files: &[PullFile], max_chars: usize) -> String {
    let mut out = String::new();
    for file in files {
        let mut block = String::new();
        block.push_str(&format!(
            "\n### {} ({}, +{}/-{})\n",
            file.filename, file.status, file.additions, file.deletions
        ));
        match &file.patch {
            Some(patch) => {
                block.push_str("```diff\n");
                block.push_str(patch);
                block.push_str("\n```\n");
            }
            None => block.push_str("(no patch — likely a binary file)\n"),
        }

        if out.len() + block.len() > max_chars {
            out.push_str(TRUNCATION_MARKER);
            break;
        }
        out.push_str(&block);
    }
    out
}

/// One line per changed file, for the prompt header.
pub fn files_summary(files: &[PullFile]) -> String {
    files
        .iter()
        .map(|f| {
            format!(
                "- {} ({}, +{}/-{})",
                f.filename, f.status, f.additions, f.deletions
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the author's track record for the prompt, or None when the
/// author has no scored reviews yet.
pub fn author_history_block(author: &str, history: &AuthorReviewHistory) -> Option<String> {
    if history.scored_prs == 0 {
        return None;
    }
    let trend_line = match history.trend {
        Trend::Improving => "📈 improving — recent PRs score better than earlier ones",
        Trend::Declining => "📉 declining — recent PRs score below earlier ones",
        Trend::Stable => "➡️ stable",
    };
    let recent = history
        .recent_scores
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "## Author history\n\n\
         **Author**: {author}\n\
         - **Past PRs**: {total} ({scored} scored)\n\
         - **Average score**: {avg:.0}/100 (min {min}, max {max})\n\
         - **Trend**: {trend_line}\n\
         - **Last scores, newest first**: {recent}\n\n\
         Keep the scoring standard consistent with this record. If the author\n\
         keeps improving, acknowledge it in the summary; if the record is\n\
         declining or stays low, make the improvement suggestions concrete,\n\
         and watch for issues the author has repeated before.",
        total = history.total_prs,
        scored = history.scored_prs,
        avg = history.avg_score,
        min = history.min_score,
        max = history.max_score,
    ))
}

/// Build the review prompt. Always carries: PR metadata, the file-scoped
/// diff, the focus-area list, and the reply-language directive.
/// `author_history` is the pre-rendered track-record block, when one exists.
pub fn build_review_prompt(
    pr: &PullRequest,
    files: &[PullFile],
    diff: &str,
    author_history: Option<&str>,
    config: &ReviewConfig,
) -> String {
    let description = pr
        .body
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or("(no description)");
    // A PR without a real description gets one proposed by the reviewer.
    let needs_description = description == "(no description)" || description.len() <= 10;

    let focus_areas = config
        .focus_areas
        .iter()
        .map(|area| format!("- {area}"))
        .collect::<Vec<_>>()
        .join("\n");

    let description_guide = if needs_description {
        "\n## Note: this PR lacks a description\n\n\
         Based on the code changes, open the suggestions section with a complete\n\
         proposed PR description (summary, motivation, main changes, testing notes).\n"
    } else {
        ""
    };

    let history = match author_history {
        Some(block) => format!("\n{block}\n"),
        None => String::new(),
    };

    format!(
        "You are an experienced code reviewer. Review the following pull request carefully.\n\n\
         ## PR information\n\
         - **Title**: {title}\n\
         - **Author**: {author}\n\
         - **Branches**: {head} → {base}\n\
         - **Files changed**: {changed} (+{additions}/-{deletions})\n\
         {history}\n\
         ## PR description\n\
         {description}\n\
         {description_guide}\n\
         ## Changed files\n\
         {summary}\n\n\
         ## Code changes\n\
         {diff}\n\n\
         ## Review focus\n\
         {focus_areas}\n\n\
         ## Output format\n\n\
         Respond in {language}. Provide, in order:\n\n\
         ### Overall score\n\
         A table scoring code quality, security, and maintainability, each 0-100,\n\
         then a line `Overall score: NN/100` (the rounded average — always the\n\
         0-100 scale, never X/10 or X/5).\n\n\
         ### Summary\n\
         ### Issues found\n\
         Ordered by severity (critical / moderate / minor).\n\
         ### Suggestions\n\
         ### Strengths\n\
         ### Verdict\n\
         Approve / approve after changes / needs major rework.\n\n\
         Important: output only the final review report. Do not repeat the diff,\n\
         and do not include your analysis process.",
        title = pr.title,
        author = pr.user.login,
        head = pr.head.name,
        base = pr.base.name,
        changed = pr.changed_files,
        additions = pr.additions,
        deletions = pr.deletions,
        description = description,
        description_guide = description_guide,
        summary = files_summary(files),
        diff = diff,
        focus_areas = focus_areas,
        language = config.language,
    )
}

/// Pull the 0-100 overall score out of a review, if the reviewer provided
/// one in a recognized shape.
pub fn extract_score(review: &str) -> Option<i64> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)overall score[：:]\s*\*{0,2}(\d{1,3})\s*/\s*100").unwrap(),
            Regex::new(r"總分[：:]\s*\*{0,2}(\d{1,3})\s*/\s*100").unwrap(),
            Regex::new(r"總分[：:]\s*\*{0,2}(\d{1,3})").unwrap(),
            Regex::new(r"(?i)score[：:]\s*\*{0,2}(\d{1,3})\s*/\s*100").unwrap(),
        ]
    });

    for pattern in patterns {
        if let Some(captures) = pattern.captures(review) {
            if let Ok(score) = captures[1].parse::<i64>() {
                if (0..=100).contains(&score) {
                    return Some(score);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{GitRef, UserRef};

    fn file(name: &str, patch: Option<&str>) -> PullFile {
        PullFile {
            filename: name.to_owned(),
            status: "modified".into(),
            additions: 3,
            deletions: 1,
            patch: patch.map(str::to_owned),
        }
    }

    fn pr() -> PullRequest {
        PullRequest {
            number: 42,
            title: "Fix the frobnicator".into(),
            body: Some("Rewrites the retry loop.".into()),
            html_url: "https://github.com/Acme/foo/pull/42".into(),
            draft: false,
            user: UserRef {
                login: "alice".into(),
            },
            labels: vec![],
            base: GitRef {
                name: "main".into(),
            },
            head: GitRef {
                name: "fix/frob".into(),
            },
            changed_files: 2,
            additions: 10,
            deletions: 4,
        }
    }

    #[test]
    fn render_diff_includes_patches_and_binary_note() {
        let files = vec![
            file("src/lib.rs", Some("@@ -1 +1 @@\n-a\n+b")),
            file("logo.png", None),
        ];
        let diff = render_diff(&files, 10_000);
        assert!(diff.contains("### src/lib.rs (modified, +3/-1)"));
        assert!(diff.contains("```diff"));
        assert!(diff.contains("@@ -1 +1 @@"));
        assert!(diff.contains("binary file"));
        assert!(!diff.contains(TRUNCATION_MARKER.trim_start()));
    }

    #[test]
    fn render_diff_truncates_over_budget() {
        let big_patch = "x".repeat(500);
        let files = vec![
            file("a.rs", Some(&big_patch)),
            file("b.rs", Some(&big_patch)),
            file("c.rs", Some(&big_patch)),
        ];
        let diff = render_diff(&files, 700);
        assert!(diff.contains("a.rs"));
        assert!(diff.contains("[diff truncated"));
        assert!(!diff.contains("c.rs"));
    }

    #[test]
    fn prompt_carries_required_parts() {
        let files = vec![file("src/lib.rs", Some("@@"))];
        let config = ReviewConfig {
            language: "zh-TW".into(),
            ..ReviewConfig::default()
        };
        let diff = render_diff(&files, 10_000);
        let prompt = build_review_prompt(&pr(), &files, &diff, None, &config);

        assert!(prompt.contains("Fix the frobnicator"));
        assert!(prompt.contains("alice"));
        assert!(prompt.contains("fix/frob → main"));
        assert!(prompt.contains("- code quality"));
        assert!(prompt.contains("Respond in zh-TW"));
        assert!(prompt.contains("src/lib.rs"));
        assert!(prompt.contains("Rewrites the retry loop."));
        assert!(!prompt.contains("lacks a description"));
        assert!(!prompt.contains("Author history"));
    }

    #[test]
    fn prompt_asks_for_description_when_missing() {
        let mut pr = pr();
        pr.body = None;
        let files = vec![file("src/lib.rs", Some("@@"))];
        let diff = render_diff(&files, 10_000);
        let prompt = build_review_prompt(&pr, &files, &diff, None, &ReviewConfig::default());
        assert!(prompt.contains("(no description)"));
        assert!(prompt.contains("lacks a description"));
    }

    #[test]
    fn history_block_elided_without_scored_prs() {
        let history = AuthorReviewHistory {
            total_prs: 3,
            ..AuthorReviewHistory::default()
        };
        assert!(author_history_block("alice", &history).is_none());
    }

    #[test]
    fn history_block_carries_stats_and_trend() {
        let history = AuthorReviewHistory {
            total_prs: 12,
            scored_prs: 8,
            avg_score: 84.2,
            min_score: 70,
            max_score: 95,
            recent_scores: vec![90, 88, 85, 80, 72],
            trend: Trend::Improving,
        };
        let block = author_history_block("alice", &history).unwrap();
        assert!(block.contains("**Author**: alice"));
        assert!(block.contains("12 (8 scored)"));
        assert!(block.contains("84/100 (min 70, max 95)"));
        assert!(block.contains("📈 improving"));
        assert!(block.contains("90, 88, 85, 80, 72"));
    }

    #[test]
    fn prompt_includes_history_block_verbatim() {
        let files = vec![file("src/lib.rs", Some("@@"))];
        let diff = render_diff(&files, 10_000);
        let history = AuthorReviewHistory {
            total_prs: 4,
            scored_prs: 4,
            avg_score: 75.0,
            min_score: 60,
            max_score: 88,
            recent_scores: vec![60, 70, 82, 88],
            trend: Trend::Declining,
        };
        let block = author_history_block("alice", &history).unwrap();
        let prompt =
            build_review_prompt(&pr(), &files, &diff, Some(&block), &ReviewConfig::default());
        assert!(prompt.contains("## Author history"));
        assert!(prompt.contains("📉 declining"));
    }

    #[test]
    fn score_extraction_variants() {
        assert_eq!(extract_score("**Overall score: 85/100**"), Some(85));
        assert_eq!(extract_score("overall score: 7/100"), Some(7));
        assert_eq!(extract_score("總分：92/100"), Some(92));
        assert_eq!(extract_score("總分: **88**"), Some(88));
        assert_eq!(extract_score("Score: 73/100 overall"), Some(73));
        assert_eq!(extract_score("no score here"), None);
        // Out-of-range numbers are not scores.
        assert_eq!(extract_score("Overall score: 850/100"), None);
    }
}
