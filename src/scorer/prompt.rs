//! Scoring prompt assembly and response parsing.
//!
//! Each content type gets a tailored rubric, but every prompt demands the
//! same fenced-JSON reply: four dimensions with score + feedback, an overall
//! score, and suggestions. Parsing tolerates prose around the fence; a
//! second, stricter attempt asks for the JSON alone.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::store::{AuthorScoreHistory, ContentType, DimensionScore, ScoreSet, Trend};

/// Overall must sit within [min, max] of the dimensions, widened by this.
const OVERALL_TOLERANCE: i64 = 10;

/// Classify an issue from its labels first, then title tags, then body
/// structure. Comments are always [`ContentType::Comment`] (callers decide).
pub fn classify_issue(title: &str, body: &str, labels: &[String]) -> ContentType {
    let lowered_labels: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
    for label in &lowered_labels {
        if label.contains("bug") {
            return ContentType::Bug;
        }
        if label.contains("task") {
            return ContentType::Task;
        }
        if label.contains("feature") || label.contains("enhancement") {
            return ContentType::Feature;
        }
        if label.contains("test") {
            return ContentType::TestResult;
        }
    }

    let title = title.to_lowercase();
    if title.contains("[task]") {
        return ContentType::Task;
    }
    if title.contains("[request") || title.contains("request for features") {
        return ContentType::Feature;
    }
    if title.contains("[test]") || title.contains("test result") {
        return ContentType::TestResult;
    }
    if title.contains("[bug]") || title.contains("bug report") {
        return ContentType::Bug;
    }

    let body = body.to_lowercase();
    if body.contains("## todo") || body.contains("- [ ]") {
        return ContentType::Task;
    }
    if body.contains("## specification") || body.contains("## reference") {
        return ContentType::Feature;
    }
    if body.contains("test case")
        || (body.contains("## issue overview")
            && (body.contains("## test result") || body.contains("## test environment")))
    {
        return ContentType::TestResult;
    }

    ContentType::Bug
}

fn rubric_for(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Bug => {
            "This is a bug report. Required sections: Links (related issues), \
             Environment (FW/HW versions, hardware model), Description, \
             To Reproduce (numbered steps, at least 3), Expected Behavior, \
             Screenshots/Attachments where visual.\n\
             Red flags: template placeholders left in place (\"Go to '...'\"), \
             unfilled HTML comments, missing environment details, \
             un-numbered reproduction steps."
        }
        ContentType::Task => {
            "This is a task. Required structure: Description (background and \
             goal), Todo checklist (- [ ] items), Links, a deadline.\n\
             Red flags: vague todo items, no completion criteria, leftover \
             template placeholders, missing assignees."
        }
        ContentType::Feature => {
            "This is a feature request. Required structure: Problem \
             Description, Product Info (series/model/platform), Firmware \
             Version, Specification, Reference (prior art on other products).\n\
             Red flags: no concrete specification, missing product/version \
             info, requirements too vague to estimate."
        }
        ContentType::TestResult => {
            "This is a test result report. Required structure: Issue \
             Overview, Test Result (pass/fail per test case, tables or \
             lists), Test Environment (FW/HW versions, devices), details for \
             every failed case (messages, screenshots, logs).\n\
             Red flags: results without environment info, failed cases \
             without reproduction detail, no test scope statement."
        }
        ContentType::Comment => {
            "This is a comment on an issue. Judge it as a contribution to \
             the discussion: correct Markdown, complete information, clear \
             reasoning, and whether it moves the issue toward resolution."
        }
    }
}

const JSON_CONTRACT: &str = r#"Reply with a fenced JSON object in exactly this shape:

```json
{
  "format": {"score": 85, "feedback": "..."},
  "content": {"score": 90, "feedback": "..."},
  "clarity": {"score": 80, "feedback": "..."},
  "actionability": {"score": 88, "feedback": "..."},
  "overall_score": 86,
  "suggestions": "..."
}
```

Every score is an integer from 0 to 100. `suggestions` is a short list of
concrete improvements, newline-separated, in one string."#;

/// Render the author's scoring track record for the prompt, or None when
/// nothing of theirs has been scored yet.
pub fn author_history_block(author: &str, history: &AuthorScoreHistory) -> Option<String> {
    if history.total_scored == 0 {
        return None;
    }
    let trend_line = match history.trend {
        Trend::Improving => "📈 improving — recent items score better than earlier ones",
        Trend::Declining => "📉 declining — recent items score below earlier ones",
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
         - **Past scored issues/comments**: {total}\n\
         - **Average overall**: {avg:.0}/100\n\
         - **Dimension averages**: format {format:.0}, content {content:.0}, \
           clarity {clarity:.0}, actionability {actionability:.0}\n\
         - **Score range**: {min} - {max}\n\
         - **Trend**: {trend_line}\n\
         - **Last scores, newest first**: {recent}\n\n\
         Score consistently against this record: acknowledge sustained\n\
         improvement in the feedback, and when the record is declining or\n\
         stays low, spell out concrete directions for improvement.",
        total = history.total_scored,
        avg = history.avg_overall,
        format = history.avg_format,
        content = history.avg_content,
        clarity = history.avg_clarity,
        actionability = history.avg_actionability,
        min = history.min_score,
        max = history.max_score,
    ))
}

/// Build the scoring prompt. `author_history` is the author's pre-rendered
/// track record; `insight_block` is the feedback-calibration text. Either
/// section is absent entirely when there is no data behind it.
#[allow(clippy::too_many_arguments)]
pub fn build_scoring_prompt(
    content_type: ContentType,
    title: &str,
    body: &str,
    author: &str,
    labels: &[String],
    author_history: Option<&str>,
    insight_block: Option<&str>,
    language: &str,
) -> String {
    let label_list = if labels.is_empty() {
        "(none)".to_owned()
    } else {
        labels.join(", ")
    };

    let history = match author_history {
        Some(block) => format!("\n{block}\n"),
        None => String::new(),
    };

    let calibration = match insight_block {
        Some(block) => format!(
            "\n{block}\n\nTreat these calibration signals as guidance: they come \
             from user feedback on your recent scores, with per-dimension \
             deviations. Stay objective, but lean in the indicated direction.\n"
        ),
        None => String::new(),
    };

    format!(
        "You are a quality assessor for GitHub content.\n\n\
         {rubric}\n\n\
         ## Content under review\n\
         - **Type**: {kind}\n\
         - **Author**: {author}\n\
         - **Labels**: {label_list}\n\
         - **Title**: {title}\n\n\
         {body}\n\
         {history}\
         {calibration}\n\
         Score the content on four dimensions, each 0-100:\n\
         1. **format** — structure, Markdown correctness, adherence to the template\n\
         2. **content** — completeness of the required information\n\
         3. **clarity** — precision and readability of the writing\n\
         4. **actionability** — can a developer act on it directly\n\n\
         {json_contract}\n\n\
         Write the feedback strings and suggestions in {language}. Be objective and fair.",
        rubric = rubric_for(content_type),
        kind = content_type.as_str(),
        author = author,
        label_list = label_list,
        title = title,
        body = body,
        calibration = calibration,
        json_contract = JSON_CONTRACT,
        language = language,
    )
}

/// The follow-up prompt after an unparseable reply.
pub fn strict_json_reprompt(original_prompt: &str) -> String {
    format!(
        "{original_prompt}\n\nIMPORTANT: your previous reply could not be parsed. \
         Respond with ONLY the JSON object — no prose, no explanation, nothing \
         outside the braces."
    )
}

// ── Response parsing ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawDimension {
    score: i64,
    #[serde(default)]
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct RawScores {
    format: RawDimension,
    content: RawDimension,
    clarity: RawDimension,
    actionability: RawDimension,
    overall_score: i64,
    #[serde(default)]
    suggestions: String,
}

/// Extract a JSON object from CLI output, tolerating fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

    if let Some(captures) = fenced.captures(text) {
        if let Ok(value) = serde_json::from_str(&captures[1]) {
            return Some(value);
        }
    }
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    // Last resort: the widest brace span.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        serde_json::from_str(&text[start..=end]).ok()
    } else {
        None
    }
}

/// Parse and validate a scoring reply into a [`ScoreSet`].
pub fn parse_scores(text: &str) -> Option<ScoreSet> {
    let value = extract_json(text)?;
    let raw: RawScores = serde_json::from_value(value).ok()?;
    Some(validate(raw))
}

fn clamp(score: i64) -> i64 {
    score.clamp(0, 100)
}

/// Clamp each dimension into [0,100]; accept the model's overall only when
/// it sits within the dimensions' [min,max] widened by the tolerance,
/// otherwise replace it with the rounded mean.
fn validate(raw: RawScores) -> ScoreSet {
    let format = clamp(raw.format.score);
    let content = clamp(raw.content.score);
    let clarity = clamp(raw.clarity.score);
    let actionability = clamp(raw.actionability.score);

    let dims = [format, content, clarity, actionability];
    let lo = *dims.iter().min().unwrap_or(&0);
    let hi = *dims.iter().max().unwrap_or(&100);
    let mean = ((dims.iter().sum::<i64>() as f64) / 4.0).round() as i64;

    let overall = clamp(raw.overall_score);
    let overall = if overall < lo - OVERALL_TOLERANCE || overall > hi + OVERALL_TOLERANCE {
        mean
    } else {
        overall
    };

    ScoreSet {
        format: DimensionScore {
            score: format,
            feedback: raw.format.feedback,
        },
        content: DimensionScore {
            score: content,
            feedback: raw.content.feedback,
        },
        clarity: DimensionScore {
            score: clarity,
            feedback: raw.clarity.feedback,
        },
        actionability: DimensionScore {
            score: actionability,
            feedback: raw.actionability.feedback,
        },
        overall_score: overall,
        suggestions: raw.suggestions,
    }
}
