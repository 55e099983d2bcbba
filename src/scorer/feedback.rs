//! The feedback-learning loop.
//!
//! Free-text feedback on a score is analyzed (AI first, bilingual keyword
//! rules as fallback) into a structured verdict, folded into the pattern
//! library, and periodically synthesized into an insight block that
//! conditions future scoring prompts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::store::{FeedbackPattern, ScoreRecord};
use crate::util::truncate_with_ellipsis;

use super::prompt::extract_json;

/// Deviations this close to zero produce no adjustment line.
const DEVIATION_EPSILON: f64 = 0.5;

pub const FEEDBACK_TYPES: &[&str] = &[
    "too_harsh",
    "too_lenient",
    "missed_issue",
    "good_feedback",
    "unclear",
    "other",
];

pub const DIMENSIONS: &[&str] = &["format", "content", "clarity", "actionability", "overall"];

/// Structured verdict over one feedback item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackAnalysis {
    pub sentiment: String,
    pub feedback_type: String,
    pub dimension: String,
    #[serde(default)]
    pub score_deviation: f64,
    #[serde(default)]
    pub identified_issue: String,
    #[serde(default)]
    pub suggested_adjustment: String,
}

impl FeedbackAnalysis {
    /// Clamp free-form model output onto the known vocabularies.
    pub fn normalized(mut self) -> Self {
        if !FEEDBACK_TYPES.contains(&self.feedback_type.as_str()) {
            self.feedback_type = "other".to_owned();
        }
        if !DIMENSIONS.contains(&self.dimension.as_str()) {
            self.dimension = "overall".to_owned();
        }
        if !["positive", "negative", "neutral"].contains(&self.sentiment.as_str()) {
            self.sentiment = "neutral".to_owned();
        }
        self
    }
}

/// Prompt asking the AI to classify one feedback item.
pub fn build_analysis_prompt(feedback_text: &str, record: &ScoreRecord) -> String {
    format!(
        "A user left feedback on an automated quality score. Classify it.\n\n\
         ## Original score\n\
         - format: {format}/100\n\
         - content: {content}/100\n\
         - clarity: {clarity}/100\n\
         - actionability: {actionability}/100\n\
         - overall: {overall}/100\n\n\
         ## User feedback\n\
         {feedback}\n\n\
         Reply with ONLY a JSON object:\n\
         {{\n\
           \"sentiment\": \"positive|negative|neutral\",\n\
           \"feedback_type\": \"too_harsh|too_lenient|missed_issue|good_feedback|unclear|other\",\n\
           \"dimension\": \"format|content|clarity|actionability|overall\",\n\
           \"score_deviation\": 0,\n\
           \"identified_issue\": \"one sentence\",\n\
           \"suggested_adjustment\": \"one sentence\"\n\
         }}\n\n\
         `score_deviation` is a signed integer: how much HIGHER (positive) or \
         LOWER (negative) the user thinks the score should be. Use 0 when the \
         feedback names no amount.",
        format = record.format_score.unwrap_or(0),
        content = record.content_score.unwrap_or(0),
        clarity = record.clarity_score.unwrap_or(0),
        actionability = record.actionability_score.unwrap_or(0),
        overall = record.overall_score.unwrap_or(0),
        feedback = feedback_text,
    )
}

/// Parse the AI's analysis reply; None sends callers to the rule fallback.
pub fn parse_analysis(text: &str) -> Option<FeedbackAnalysis> {
    let value = extract_json(text)?;
    let analysis: FeedbackAnalysis = serde_json::from_value(value).ok()?;
    Some(analysis.normalized())
}

// ── Rule-based fallback ─────────────────────────────────────────

struct KeywordSets {
    too_harsh: Vec<&'static str>,
    too_lenient: Vec<&'static str>,
    missed_issue: Vec<&'static str>,
    good_feedback: Vec<&'static str>,
    dimensions: Vec<(&'static str, Vec<&'static str>)>,
}

fn keywords() -> &'static KeywordSets {
    static SETS: OnceLock<KeywordSets> = OnceLock::new();
    SETS.get_or_init(|| KeywordSets {
        too_harsh: vec![
            "too harsh", "too strict", "too low", "should be higher", "unfair",
            "太嚴格", "太嚴厲", "評分太低", "過於苛刻", "太苛刻", "太低了", "評太低", "不公平",
        ],
        too_lenient: vec![
            "too lenient", "too generous", "too high", "should be lower", "not strict enough",
            "太寬鬆", "太寬容", "評分太高", "過於寬容", "太高了", "評太高", "不夠嚴格",
        ],
        missed_issue: vec![
            "missed", "overlooked", "didn't notice", "failed to mention", "should have pointed",
            "沒注意到", "忽略了", "漏掉了", "沒發現", "應該指出", "未提及", "沒提到",
        ],
        good_feedback: vec![
            "accurate", "helpful", "spot on", "fair", "useful",
            "準確", "中肯", "很好", "有幫助", "很有用", "精準", "到位",
        ],
        dimensions: vec![
            ("format", vec!["format", "layout", "template", "title", "格式", "排版", "標題"]),
            ("content", vec!["content", "completeness", "detail", "內容", "完整性", "詳細"]),
            ("clarity", vec!["clarity", "clear", "wording", "expression", "清晰", "表達", "理解"]),
            (
                "actionability",
                vec!["actionable", "specific", "steps", "reproduce", "可操作", "具體", "步驟"],
            ),
        ],
    })
}

/// Pull a signed deviation out of the feedback text.
fn extract_deviation(text: &str, overall_score: Option<i64>) -> f64 {
    static SIGNED: OnceLock<Regex> = OnceLock::new();
    static HIGHER_BY: OnceLock<Regex> = OnceLock::new();
    static LOWER_BY: OnceLock<Regex> = OnceLock::new();
    static SHOULD_BE: OnceLock<Regex> = OnceLock::new();

    let signed = SIGNED.get_or_init(|| Regex::new(r"([+-]\d{1,3})\b").unwrap());
    let higher_by =
        HIGHER_BY.get_or_init(|| Regex::new(r"(?i)(?:higher|raise[d]?|up)\s+by\s+(\d{1,3})").unwrap());
    let lower_by =
        LOWER_BY.get_or_init(|| Regex::new(r"(?i)(?:lower|reduce[d]?|down)\s+by\s+(\d{1,3})").unwrap());
    let should_be = SHOULD_BE
        .get_or_init(|| Regex::new(r"(?i)(?:should be|deserves?|至少|應該)\s*(\d{1,3})\b").unwrap());

    if let Some(captures) = signed.captures(text) {
        if let Ok(n) = captures[1].parse::<f64>() {
            return n;
        }
    }
    if let Some(captures) = higher_by.captures(text) {
        if let Ok(n) = captures[1].parse::<f64>() {
            return n;
        }
    }
    if let Some(captures) = lower_by.captures(text) {
        if let Ok(n) = captures[1].parse::<f64>() {
            return -n;
        }
    }
    if let (Some(captures), Some(overall)) = (should_be.captures(text), overall_score) {
        if let Ok(suggested) = captures[1].parse::<i64>() {
            if (0..=100).contains(&suggested) && suggested != overall {
                return (suggested - overall) as f64;
            }
        }
    }
    0.0
}

/// Keyword classification when the AI is unavailable. Same output shape,
/// lower confidence.
pub fn rule_based_analysis(feedback_text: &str, overall_score: Option<i64>) -> FeedbackAnalysis {
    let sets = keywords();
    let lowered = feedback_text.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|kw| lowered.contains(kw));

    let feedback_type = if matches(&sets.too_harsh) {
        "too_harsh"
    } else if matches(&sets.too_lenient) {
        "too_lenient"
    } else if matches(&sets.missed_issue) {
        "missed_issue"
    } else if matches(&sets.good_feedback) {
        "good_feedback"
    } else if feedback_text.trim().len() < 10 {
        "unclear"
    } else {
        "other"
    };

    let sentiment = match feedback_type {
        "good_feedback" => "positive",
        "too_harsh" | "too_lenient" | "missed_issue" => "negative",
        _ => "neutral",
    };

    let dimension = sets
        .dimensions
        .iter()
        .find(|(_, keywords)| matches(keywords))
        .map(|(name, _)| *name)
        .unwrap_or("overall");

    let score_deviation = extract_deviation(feedback_text, overall_score);

    FeedbackAnalysis {
        sentiment: sentiment.to_owned(),
        feedback_type: feedback_type.to_owned(),
        dimension: dimension.to_owned(),
        score_deviation,
        identified_issue: truncate_with_ellipsis(feedback_text.trim(), 100),
        suggested_adjustment: suggested_adjustment(feedback_type, dimension),
    }
}

fn suggested_adjustment(feedback_type: &str, dimension: &str) -> String {
    match feedback_type {
        "too_harsh" => format!("consider loosening the {dimension} standard"),
        "too_lenient" => format!("consider tightening the {dimension} standard"),
        "missed_issue" => format!("check {dimension} more thoroughly"),
        "good_feedback" => "keep the current calibration".to_owned(),
        _ => format!("review the {dimension} scoring standard"),
    }
}

// ── Insight synthesis ───────────────────────────────────────────

/// Render the calibration block injected into scoring prompts. `None` when
/// there is nothing qualifying — the prompt then carries no block at all.
pub fn format_insight_block(
    patterns: &[FeedbackPattern],
    total_feedbacks: i64,
    window_days: i64,
) -> Option<String> {
    if patterns.is_empty() {
        return None;
    }

    let mut lines = vec![
        "## Calibration signals from recent user feedback".to_owned(),
        format!("Feedback items in the last {window_days} days: {total_feedbacks}"),
        String::new(),
        "Top recurring issues:".to_owned(),
    ];
    for pattern in patterns.iter().take(5) {
        lines.push(format!(
            "- {} on {} (seen {} times)",
            pattern.pattern_type, pattern.dimension, pattern.occurrence_count
        ));
    }

    let adjustments = dimension_adjustments(patterns);
    if !adjustments.is_empty() {
        lines.push(String::new());
        lines.push("Per-dimension adjustments:".to_owned());
        lines.extend(adjustments);
    }

    Some(lines.join("\n"))
}

/// One adjustment line per dimension, weighted across its patterns.
pub fn dimension_adjustments(patterns: &[FeedbackPattern]) -> Vec<String> {
    let mut lines = Vec::new();
    for dimension in DIMENSIONS {
        let group: Vec<&FeedbackPattern> = patterns
            .iter()
            .filter(|p| p.dimension == *dimension)
            .collect();
        if group.is_empty() {
            continue;
        }
        let count: i64 = group.iter().map(|p| p.occurrence_count).sum();
        let sum: f64 = group.iter().map(|p| p.deviation_sum).sum();
        if count == 0 {
            continue;
        }
        let mean = sum / count as f64;
        if mean.abs() < DEVIATION_EPSILON {
            continue;
        }
        let rounded = mean.abs().round() as i64;
        if mean > 0.0 {
            lines.push(format!(
                "- {dimension}: consider loosening; users think scores are on average {rounded} points too low"
            ));
        } else {
            lines.push(format!(
                "- {dimension}: consider tightening; users think scores are on average {rounded} points too high"
            ));
        }
    }
    lines
}

/// Count distinct feedback items on a record (they accumulate separated by
/// `---` lines).
pub fn split_feedback_items(accumulated: &str) -> Vec<&str> {
    accumulated
        .split("\n---\n")
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_rfc3339;

    fn pattern(
        pattern_type: &str,
        dimension: &str,
        count: i64,
        deviation_sum: f64,
    ) -> FeedbackPattern {
        FeedbackPattern {
            pattern_id: format!("{pattern_type}:{dimension}"),
            pattern_type: pattern_type.to_owned(),
            dimension: dimension.to_owned(),
            occurrence_count: count,
            deviation_sum,
            avg_score_deviation: deviation_sum / count as f64,
            example_feedbacks: vec![],
            identified_issue: String::new(),
            suggested_adjustment: String::new(),
            last_seen: now_rfc3339(),
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    #[test]
    fn rule_based_detects_too_harsh_with_deviation() {
        let analysis = rule_based_analysis("format scoring is too strict, +10", Some(70));
        assert_eq!(analysis.feedback_type, "too_harsh");
        assert_eq!(analysis.sentiment, "negative");
        assert_eq!(analysis.dimension, "format");
        assert_eq!(analysis.score_deviation, 10.0);
    }

    #[test]
    fn rule_based_higher_by_phrase() {
        let analysis = rule_based_analysis("score should be higher by 5", Some(70));
        assert_eq!(analysis.feedback_type, "too_harsh");
        assert_eq!(analysis.score_deviation, 5.0);
        assert_eq!(analysis.dimension, "overall");
    }

    #[test]
    fn rule_based_lenient_and_negative_deviation() {
        let analysis = rule_based_analysis("way too generous, lower by 15", Some(90));
        assert_eq!(analysis.feedback_type, "too_lenient");
        assert_eq!(analysis.score_deviation, -15.0);
    }

    #[test]
    fn rule_based_should_be_uses_overall_delta() {
        let analysis = rule_based_analysis("this deserves 95", Some(80));
        assert_eq!(analysis.score_deviation, 15.0);
    }

    #[test]
    fn rule_based_chinese_keywords() {
        let analysis = rule_based_analysis("評分太低，格式其實沒問題", Some(60));
        assert_eq!(analysis.feedback_type, "too_harsh");
        assert_eq!(analysis.dimension, "format");
    }

    #[test]
    fn rule_based_positive_and_neutral() {
        let positive = rule_based_analysis("very accurate and helpful", Some(80));
        assert_eq!(positive.feedback_type, "good_feedback");
        assert_eq!(positive.sentiment, "positive");
        assert_eq!(positive.score_deviation, 0.0);

        let unclear = rule_based_analysis("hm", Some(80));
        assert_eq!(unclear.feedback_type, "unclear");
        assert_eq!(unclear.sentiment, "neutral");
    }

    #[test]
    fn analysis_normalization_clamps_vocabulary() {
        let analysis = FeedbackAnalysis {
            sentiment: "angry".into(),
            feedback_type: "rage".into(),
            dimension: "vibes".into(),
            score_deviation: 3.0,
            identified_issue: String::new(),
            suggested_adjustment: String::new(),
        }
        .normalized();
        assert_eq!(analysis.sentiment, "neutral");
        assert_eq!(analysis.feedback_type, "other");
        assert_eq!(analysis.dimension, "overall");
    }

    #[test]
    fn parse_analysis_accepts_fenced_json() {
        let reply = r#"Sure:
```json
{"sentiment": "negative", "feedback_type": "too_harsh", "dimension": "format",
 "score_deviation": 9, "identified_issue": "format runs low", "suggested_adjustment": "loosen"}
```"#;
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.feedback_type, "too_harsh");
        assert_eq!(analysis.score_deviation, 9.0);
    }

    #[test]
    fn insight_block_elided_without_patterns() {
        assert!(format_insight_block(&[], 5, 30).is_none());
    }

    #[test]
    fn insight_block_wording_for_positive_deviation() {
        // Three items averaging +9 on format.
        let patterns = vec![pattern("too_harsh", "format", 3, 27.0)];
        let block = format_insight_block(&patterns, 3, 30).unwrap();
        assert!(block.contains("Feedback items in the last 30 days: 3"));
        assert!(block.contains("- too_harsh on format (seen 3 times)"));
        assert!(block.contains(
            "format: consider loosening; users think scores are on average 9 points too low"
        ));
    }

    #[test]
    fn insight_block_wording_for_negative_deviation() {
        let patterns = vec![pattern("too_lenient", "clarity", 2, -12.0)];
        let block = format_insight_block(&patterns, 2, 30).unwrap();
        assert!(block.contains(
            "clarity: consider tightening; users think scores are on average 6 points too high"
        ));
    }

    #[test]
    fn near_zero_deviation_produces_no_adjustment_line() {
        let patterns = vec![pattern("good_feedback", "overall", 4, 0.4)];
        let block = format_insight_block(&patterns, 4, 30).unwrap();
        assert!(block.contains("good_feedback on overall"));
        assert!(!block.contains("consider"));
    }

    #[test]
    fn adjustments_weight_across_patterns_of_a_dimension() {
        // format: (3 items, +27) and (1 item, -3) → mean +6.
        let patterns = vec![
            pattern("too_harsh", "format", 3, 27.0),
            pattern("too_lenient", "format", 1, -3.0),
        ];
        let lines = dimension_adjustments(&patterns);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("6 points too low"));
    }

    #[test]
    fn split_accumulated_feedback() {
        let accumulated = "first item\n---\nsecond item\n---\n";
        assert_eq!(split_feedback_items(accumulated), vec!["first item", "second item"]);
        assert_eq!(split_feedback_items("single"), vec!["single"]);
        assert!(split_feedback_items("").is_empty());
    }
}
