//! Issue-scorer worker service.
//!
//! Scores issues and comments on the configured repositories along four
//! dimensions, posts the result as a comment, and closes the loop: user
//! feedback on scores is mined into patterns whose aggregate deviations are
//! injected into future scoring prompts.

pub mod feedback;
pub mod prompt;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::agent::CliAgent;
use crate::config::{Config, Env, IssueScoringConfig};
use crate::github::GithubClient;
use crate::pool::WorkerPool;
use crate::store::{score_id_for, ContentType, FeedbackSnapshot, ScoreRecord, Store};
use crate::webhook::{EventKind, IssueCommentEvent, IssuesEvent};

const MAX_BODY_SIZE: usize = 1_048_576;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Hidden marker identifying the scorer's own comments (loop protection).
pub const SCORE_MARKER: &str = "<!-- octomon-score -->";

/// Trailing line on posted score comments.
pub const ATTRIBUTION: &str = "*Automated scoring by octomon*";

pub struct ScorerCtx {
    pub store: Store,
    pub github: GithubClient,
    pub agent: CliAgent,
    pub config: IssueScoringConfig,
}

#[derive(Clone)]
struct ScorerState {
    ctx: Arc<ScorerCtx>,
    pool: Arc<WorkerPool<ScorerJob>>,
}

enum ScorerJob {
    Score { score_id: String },
    AnalyzeFeedback { score_id: String, feedback: String },
}

pub async fn run(host: &str, port: u16, config: Config, env: Env) -> Result<()> {
    let ctx = Arc::new(ScorerCtx {
        store: Store::open(&env.db_path)?,
        github: GithubClient::new(&env.github_api_url, &env.github_token)?,
        agent: CliAgent::new(
            env.agent_cli_path.clone(),
            Duration::from_secs(config.issue_scoring.timeout_secs),
        ),
        config: config.issue_scoring.clone(),
    });

    let pool = {
        let ctx = Arc::clone(&ctx);
        Arc::new(WorkerPool::new(
            "issue-scorer",
            ctx.config.workers,
            ctx.config.queue_depth,
            move |job: ScorerJob| {
                let ctx = Arc::clone(&ctx);
                async move {
                    match job {
                        ScorerJob::Score { score_id } => process_score(&ctx, &score_id).await,
                        ScorerJob::AnalyzeFeedback { score_id, feedback } => {
                            process_feedback(&ctx, &score_id, &feedback).await;
                        }
                    }
                }
            },
        ))
    };

    let state = ScorerState { ctx, pool };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("🦀 octomon issue-scorer listening on http://{host}:{port}");

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .route("/api/stats", get(handle_stats))
        .route("/api/scores", get(handle_list_scores))
        .route("/api/scores/{score_id}", get(handle_get_score))
        .route("/api/scores/{score_id}/feedback", post(handle_feedback))
        .route("/api/feedback/patterns", get(handle_patterns))
        .route("/api/feedback/insights", get(handle_insights))
        .route("/api/feedback/snapshot", post(handle_snapshot))
        .route("/issue-scores", get(handle_scores_page))
        .route("/feedback-analytics", get(handle_analytics_page))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    axum::serve(listener, app).await?;
    Ok(())
}

// ── Webhook intake ──────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "octomon issue-scorer",
        "timestamp": crate::util::now_rfc3339(),
    }))
}

async fn handle_webhook(
    State(state): State<ScorerState>,
    headers: HeaderMap,
    raw: axum::body::Bytes,
) -> Response {
    let event_name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let kind = EventKind::from_header(event_name);

    if !state.ctx.config.enabled {
        return ignored(event_name, "scoring disabled");
    }

    match kind {
        EventKind::Issues => match serde_json::from_slice::<IssuesEvent>(&raw) {
            Ok(event) => handle_issue_event(&state, event).await,
            Err(e) => {
                tracing::warn!("Unparseable issues payload — ignored: {e}");
                ignored(event_name, "unparseable payload")
            }
        },
        EventKind::IssueComment => match serde_json::from_slice::<IssueCommentEvent>(&raw) {
            Ok(event) => handle_comment_event(&state, event).await,
            Err(e) => {
                tracing::warn!("Unparseable issue_comment payload — ignored: {e}");
                ignored(event_name, "unparseable payload")
            }
        },
        _ => ignored(event_name, "unsupported event"),
    }
}

fn ignored(event: &str, reason: &str) -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ignored", "event": event, "reason": reason})),
    )
        .into_response()
}

async fn handle_issue_event(state: &ScorerState, event: IssuesEvent) -> Response {
    let repo = &event.repository.full_name;
    if !state.ctx.config.target_repos.iter().any(|r| r == repo) {
        return ignored("issues", "repository not scored");
    }

    // Edits refresh the stored title; no re-score.
    if event.action == "edited" {
        match state
            .ctx
            .store
            .update_score_title(repo, event.issue.number, &event.issue.title)
        {
            Ok(updated) => {
                return (
                    StatusCode::OK,
                    Json(json!({"status": "updated", "records": updated})),
                )
                    .into_response()
            }
            Err(e) => {
                tracing::error!("Title refresh failed: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    if !state.ctx.config.triggers.iter().any(|t| t == &event.action) {
        return ignored("issues", "action not in triggers");
    }

    let issue = &event.issue;
    let body = issue.body.clone().unwrap_or_default();
    let labels = issue.label_names();
    let content_type = prompt::classify_issue(&issue.title, &body, &labels);
    // The sender performed the action; a reposted issue is attributed to the
    // reposter, falling back to the original author.
    let author = if event.sender.login.is_empty() {
        issue.user.login.clone()
    } else {
        event.sender.login.clone()
    };

    enqueue_score(
        state,
        repo,
        issue.number,
        None,
        content_type,
        &issue.title,
        &body,
        &author,
        &issue.html_url,
    )
}

async fn handle_comment_event(state: &ScorerState, event: IssueCommentEvent) -> Response {
    let repo = &event.repository.full_name;
    if !state.ctx.config.target_repos.iter().any(|r| r == repo) {
        return ignored("issue_comment", "repository not scored");
    }
    if !state
        .ctx
        .config
        .comment_triggers
        .iter()
        .any(|t| t == &event.action)
    {
        return ignored("issue_comment", "action not in triggers");
    }

    let body = event.comment.body.clone().unwrap_or_default();
    // Never score our own score comments.
    if body.contains(SCORE_MARKER) {
        return ignored("issue_comment", "scorer's own comment");
    }

    let author = if event.sender.login.is_empty() {
        event.comment.user.login.clone()
    } else {
        event.sender.login.clone()
    };

    enqueue_score(
        state,
        repo,
        event.issue.number,
        Some(event.comment.id),
        ContentType::Comment,
        &event.issue.title,
        &body,
        &author,
        &event.comment.html_url,
    )
}

#[allow(clippy::too_many_arguments)]
fn enqueue_score(
    state: &ScorerState,
    repo: &str,
    issue_number: u64,
    comment_id: Option<u64>,
    content_type: ContentType,
    title: &str,
    body: &str,
    author: &str,
    url: &str,
) -> Response {
    let score_id = score_id_for(repo, issue_number, comment_id);

    let created = match state.ctx.store.create_score_record(
        &score_id,
        repo,
        issue_number,
        comment_id,
        content_type,
        title,
        body,
        author,
        url,
    ) {
        Ok(created) => created,
        Err(e) => {
            tracing::error!(%score_id, "Failed to record score request: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if !created {
        tracing::info!(%score_id, "Subject already scored — duplicate delivery");
        return (
            StatusCode::OK,
            Json(json!({"status": "duplicate", "score_id": score_id})),
        )
            .into_response();
    }

    let job = ScorerJob::Score {
        score_id: score_id.clone(),
    };
    if state.pool.try_enqueue(job).is_err() {
        // Roll the claim back so the re-delivered webhook starts over.
        let _ = state.ctx.store.delete_score_record(&score_id);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "queue full"})),
        )
            .into_response();
    }

    tracing::info!(%score_id, kind = content_type.as_str(), "Scoring enqueued");
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "score_id": score_id})),
    )
        .into_response()
}

// ── Scoring pipeline ────────────────────────────────────────────

async fn process_score(ctx: &ScorerCtx, score_id: &str) {
    if let Err(e) = run_score(ctx, score_id).await {
        tracing::error!(score_id, "Scoring failed: {e}");
        let _ = ctx.store.fail_score(score_id, &e.to_string());
    }
}

async fn run_score(ctx: &ScorerCtx, score_id: &str) -> Result<()> {
    let started = ctx.store.mark_score_processing(score_id)?;
    if !started {
        tracing::warn!(score_id, "Score no longer queued — skipping run");
        return Ok(());
    }
    let Some(record) = ctx.store.get_score_record(score_id)? else {
        anyhow::bail!("score record vanished");
    };

    // Thresholds are read per request so operators can tune them live.
    let insight_block = current_insight_block(ctx)?;

    // The author's record calibrates the scorer; losing it never blocks
    // the scoring itself.
    let history = ctx
        .store
        .author_score_history(&record.author, 10)
        .unwrap_or_else(|e| {
            tracing::warn!(score_id, "Author history lookup failed: {e}");
            Default::default()
        });
    let history_block = prompt::author_history_block(&record.author, &history);

    let scoring_prompt = prompt::build_scoring_prompt(
        record.content_type,
        &record.title,
        &record.body,
        &record.author,
        &[],
        history_block.as_deref(),
        insight_block.as_deref(),
        &ctx.config.language,
    );

    let reply = ctx.agent.run(&scoring_prompt).await?;
    let scores = match prompt::parse_scores(&reply) {
        Some(scores) => scores,
        None => {
            // One stricter retry, then give up.
            tracing::warn!(score_id, "Unparseable scoring reply — reprompting for strict JSON");
            let strict = prompt::strict_json_reprompt(&scoring_prompt);
            let retry_reply = ctx.agent.run(&strict).await?;
            prompt::parse_scores(&retry_reply)
                .ok_or_else(|| anyhow::anyhow!("scoring reply was not valid JSON after reprompt"))?
        }
    };

    if ctx.config.auto_comment {
        let comment = format_score_comment(&record, &scores);
        ctx.github
            .create_issue_comment(&record.repo, record.issue_number as u64, &comment)
            .await?;
    } else {
        tracing::info!(score_id, "auto_comment disabled — score recorded without posting");
    }

    ctx.store.complete_score(score_id, &scores)?;
    tracing::info!(score_id, overall = scores.overall_score, "Scoring completed");
    Ok(())
}

/// Build the calibration block from qualifying patterns, or None when the
/// window holds nothing above the occurrence threshold.
fn current_insight_block(ctx: &ScorerCtx) -> Result<Option<String>> {
    let window_days = ctx.config.feedback_window_days;
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(window_days)).to_rfc3339();
    let patterns = ctx
        .store
        .feedback_patterns_since(&cutoff, ctx.config.feedback_min_occurrences)?;

    let total_feedbacks: i64 = ctx
        .store
        .scores_with_feedback_since(&cutoff)?
        .iter()
        .map(|record| {
            record
                .user_feedback
                .as_deref()
                .map(|raw| feedback::split_feedback_items(raw).len() as i64)
                .unwrap_or(0)
        })
        .sum();

    Ok(feedback::format_insight_block(
        &patterns,
        total_feedbacks,
        window_days,
    ))
}

fn format_score_comment(record: &ScoreRecord, scores: &crate::store::ScoreSet) -> String {
    let kind_display = match record.content_type {
        ContentType::Comment => "Comment",
        _ => "Issue",
    };
    let suggestions = if scores.suggestions.trim().is_empty() {
        "(none)".to_owned()
    } else {
        scores
            .suggestions
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| format!("- {}", line.trim_start_matches(['-', ' '])))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "{marker}\n@{author}\n\n\
         ## 📊 {kind_display} quality score\n\n\
         **Scored content**: {url}\n\n\
         | Dimension | Score | Feedback |\n\
         |-----------|-------|----------|\n\
         | 📝 Format | **{format}/100** | {format_fb} |\n\
         | 📋 Content | **{content}/100** | {content_fb} |\n\
         | 🎯 Clarity | **{clarity}/100** | {clarity_fb} |\n\
         | ⚙️ Actionability | **{actionability}/100** | {actionability_fb} |\n\n\
         ### Overall: **{overall}/100**\n\n\
         ### 💡 Suggestions\n\n\
         {suggestions}\n\n\
         ---\n{attribution}",
        marker = SCORE_MARKER,
        author = record.author,
        kind_display = kind_display,
        url = record.issue_url,
        format = scores.format.score,
        format_fb = scores.format.feedback,
        content = scores.content.score,
        content_fb = scores.content.feedback,
        clarity = scores.clarity.score,
        clarity_fb = scores.clarity.feedback,
        actionability = scores.actionability.score,
        actionability_fb = scores.actionability.feedback,
        overall = scores.overall_score,
        suggestions = suggestions,
        attribution = ATTRIBUTION,
    )
}

// ── Feedback intake and analysis ────────────────────────────────

#[derive(serde::Deserialize)]
struct FeedbackBody {
    #[serde(alias = "feedback")]
    user_feedback: String,
}

async fn handle_feedback(
    State(state): State<ScorerState>,
    Path(score_id): Path<String>,
    body: Result<Json<FeedbackBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "expected {\"user_feedback\": \"...\"}"})),
        )
            .into_response();
    };
    let feedback_text = payload.user_feedback.trim().to_owned();
    if feedback_text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "feedback is empty"})),
        )
            .into_response();
    }

    // Persist first: the raw text survives even if analysis never runs.
    match state.ctx.store.append_user_feedback(&score_id, &feedback_text) {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "score not found"})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(%score_id, "Failed to store feedback: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let job = ScorerJob::AnalyzeFeedback {
        score_id: score_id.clone(),
        feedback: feedback_text,
    };
    if state.pool.try_enqueue(job).is_err() {
        // The raw feedback is stored; analysis can be redone later.
        tracing::warn!(%score_id, "Analyzer queue full — feedback kept for re-analysis");
    }

    (
        StatusCode::OK,
        Json(json!({"status": "success", "score_id": score_id})),
    )
        .into_response()
}

async fn process_feedback(ctx: &ScorerCtx, score_id: &str, feedback_text: &str) {
    let record = match ctx.store.get_score_record(score_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::error!(score_id, "Feedback for unknown score record");
            return;
        }
        Err(e) => {
            tracing::error!(score_id, "Score lookup failed: {e}");
            return;
        }
    };

    // AI analysis first; keyword rules when the CLI is unavailable or
    // answers garbage. Raw feedback already sits on the record either way.
    let analysis = match ctx
        .agent
        .run(&feedback::build_analysis_prompt(feedback_text, &record))
        .await
    {
        Ok(reply) => match feedback::parse_analysis(&reply) {
            Some(analysis) => analysis,
            None => {
                tracing::warn!(score_id, "Unparseable analysis reply — rule-based fallback");
                feedback::rule_based_analysis(feedback_text, record.overall_score)
            }
        },
        Err(e) => {
            tracing::warn!(score_id, "Analyzer AI unavailable ({e}) — rule-based fallback");
            feedback::rule_based_analysis(feedback_text, record.overall_score)
        }
    };

    // Stored examples stay short; the full text lives on the score record.
    let example = crate::util::truncate_with_ellipsis(feedback_text, 200);
    if let Err(e) = ctx.store.record_feedback_pattern(
        &analysis.feedback_type,
        &analysis.dimension,
        analysis.score_deviation,
        &example,
        &analysis.identified_issue,
        &analysis.suggested_adjustment,
    ) {
        tracing::error!(score_id, "Pattern update failed: {e}");
        return;
    }
    tracing::info!(
        score_id,
        feedback_type = %analysis.feedback_type,
        dimension = %analysis.dimension,
        deviation = analysis.score_deviation,
        "Feedback folded into pattern library"
    );
}

// ── Read APIs ───────────────────────────────────────────────────

async fn handle_stats(State(state): State<ScorerState>) -> Response {
    match state.ctx.store.score_stats() {
        Ok(stats) => Json(json!({
            "queued": stats.queued,
            "processing": stats.processing,
            "completed": stats.completed,
            "failed": stats.failed,
            "total": stats.total(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Stats query failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(serde::Deserialize, Default)]
struct ListQuery {
    limit: Option<u32>,
}

async fn handle_list_scores(
    State(state): State<ScorerState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100).min(500);
    match (
        state.ctx.store.list_score_records(limit, None),
        state.ctx.store.score_stats(),
    ) {
        (Ok(scores), Ok(stats)) => Json(json!({
            "total": scores.len(),
            "scores": scores,
            "stats": {
                "queued": stats.queued,
                "processing": stats.processing,
                "completed": stats.completed,
                "failed": stats.failed,
            },
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Score listing failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_get_score(
    State(state): State<ScorerState>,
    Path(score_id): Path<String>,
) -> Response {
    match state.ctx.store.get_score_record(&score_id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "score not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Score lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(serde::Deserialize, Default)]
struct WindowQuery {
    days: Option<i64>,
}

async fn handle_patterns(
    State(state): State<ScorerState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = query.days.unwrap_or(state.ctx.config.feedback_window_days);
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    match (
        state.ctx.store.feedback_patterns_since(&cutoff, 1),
        state.ctx.store.verify_feedback_patterns(),
    ) {
        (Ok(patterns), Ok(anomalies)) => Json(json!({
            "total": patterns.len(),
            "patterns": patterns,
            "anomalies": anomalies,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Pattern query failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_insights(State(state): State<ScorerState>) -> Response {
    match current_insight_block(&state.ctx) {
        Ok(block) => Json(json!({
            "has_insights": block.is_some(),
            "block": block,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Insight synthesis failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_snapshot(State(state): State<ScorerState>) -> Response {
    match compute_snapshot(&state.ctx) {
        Ok(Some(snapshot)) => Json(json!({"status": "success", "snapshot": snapshot})).into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(json!({"status": "skipped", "reason": "no feedback in the last 24 hours"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Snapshot failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Aggregate the trailing 24 hours of feedback into a persisted snapshot.
fn compute_snapshot(ctx: &ScorerCtx) -> Result<Option<FeedbackSnapshot>> {
    let now = chrono::Utc::now();
    let cutoff = (now - chrono::Duration::hours(24)).to_rfc3339();

    let records = ctx.store.scores_with_feedback_since(&cutoff)?;
    let mut total = 0i64;
    let (mut positive, mut negative, mut neutral) = (0i64, 0i64, 0i64);
    for record in &records {
        let Some(ref raw) = record.user_feedback else {
            continue;
        };
        for item in feedback::split_feedback_items(raw) {
            total += 1;
            match feedback::rule_based_analysis(item, record.overall_score)
                .sentiment
                .as_str()
            {
                "positive" => positive += 1,
                "negative" => negative += 1,
                _ => neutral += 1,
            }
        }
    }
    if total == 0 {
        return Ok(None);
    }

    let patterns = ctx.store.feedback_patterns_since(&cutoff, 1)?;
    let top_issues: Vec<String> = patterns
        .iter()
        .take(5)
        .map(|p| {
            format!(
                "{} on {} (seen {} times)",
                p.pattern_type, p.dimension, p.occurrence_count
            )
        })
        .collect();
    let prompt_adjustments = feedback::dimension_adjustments(&patterns);
    let insights = json!({
        "summary": format!(
            "{total} feedback items in the last 24 hours across {} patterns",
            patterns.len()
        ),
        "block": feedback::format_insight_block(&patterns, total, 1),
    });

    let snapshot = FeedbackSnapshot {
        snapshot_id: format!("snapshot-{}", uuid::Uuid::new_v4()),
        snapshot_date: now.format("%Y-%m-%d").to_string(),
        total_feedbacks: total,
        positive_count: positive,
        negative_count: negative,
        neutral_count: neutral,
        top_issues,
        learning_insights: insights,
        prompt_adjustments,
        created_at: now.to_rfc3339(),
    };
    ctx.store.insert_feedback_snapshot(&snapshot)?;
    tracing::info!(
        snapshot_id = %snapshot.snapshot_id,
        total,
        "Feedback snapshot created"
    );
    Ok(Some(snapshot))
}

async fn handle_scores_page() -> Html<&'static str> {
    Html(SCORES_HTML)
}

async fn handle_analytics_page() -> Html<&'static str> {
    Html(ANALYTICS_HTML)
}

const SCORES_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>octomon — issue scores</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; }
    td, th { padding: 0.3rem 0.7rem; text-align: left; border-bottom: 1px solid #eee; }
    .failed { color: #c00; } .completed { color: #080; }
  </style>
</head>
<body>
  <h1>Issue quality scores</h1>
  <table id="scores"><tr><th>subject</th><th>type</th><th>author</th><th>overall</th><th>status</th></tr></table>
  <script>
    async function load() {
      const res = await fetch('/api/scores');
      const data = await res.json();
      let html = '<tr><th>subject</th><th>type</th><th>author</th><th>overall</th><th>status</th></tr>';
      for (const s of data.scores) {
        html += `<tr><td><a href="${s.issue_url}">${s.score_id}</a></td><td>${s.content_type}</td>
          <td>${s.author}</td><td>${s.overall_score ?? '-'}</td>
          <td class="${s.status}">${s.status}</td></tr>`;
      }
      document.getElementById('scores').innerHTML = html;
    }
    load();
    setInterval(load, 30000);
  </script>
</body>
</html>
"#;

const ANALYTICS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>octomon — feedback analytics</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; }
    td, th { padding: 0.3rem 0.7rem; text-align: left; border-bottom: 1px solid #eee; }
    pre { background: #f6f6f6; padding: 1rem; border-radius: 6px; }
  </style>
</head>
<body>
  <h1>Feedback learning</h1>
  <h2>Active calibration block</h2>
  <pre id="block">(loading)</pre>
  <h2>Patterns</h2>
  <table id="patterns"><tr><th>pattern</th><th>count</th><th>avg deviation</th><th>last seen</th></tr></table>
  <script>
    async function load() {
      const insights = await (await fetch('/api/feedback/insights')).json();
      document.getElementById('block').textContent =
        insights.block || '(not enough recent feedback to condition prompts)';
      const data = await (await fetch('/api/feedback/patterns')).json();
      let html = '<tr><th>pattern</th><th>count</th><th>avg deviation</th><th>last seen</th></tr>';
      for (const p of data.patterns) {
        html += `<tr><td>${p.pattern_id}</td><td>${p.occurrence_count}</td>
          <td>${p.avg_score_deviation.toFixed(1)}</td><td>${p.last_seen}</td></tr>`;
      }
      document.getElementById('patterns').innerHTML = html;
    }
    load();
    setInterval(load, 30000);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DimensionScore, ScoreSet, ScoreStatus};

    fn record() -> ScoreRecord {
        ScoreRecord {
            score_id: "Acme/qa#5@issue".into(),
            repo: "Acme/qa".into(),
            issue_number: 5,
            comment_id: None,
            content_type: ContentType::Bug,
            title: "Boot failure".into(),
            body: "it broke".into(),
            author: "alice".into(),
            issue_url: "https://github.com/Acme/qa/issues/5".into(),
            format_score: None,
            format_feedback: None,
            content_score: None,
            content_feedback: None,
            clarity_score: None,
            clarity_feedback: None,
            actionability_score: None,
            actionability_feedback: None,
            overall_score: None,
            suggestions: None,
            status: ScoreStatus::Processing,
            error_message: None,
            user_feedback: None,
            created_at: crate::util::now_rfc3339(),
            completed_at: None,
        }
    }

    fn scores() -> ScoreSet {
        ScoreSet {
            format: DimensionScore {
                score: 85,
                feedback: "solid structure".into(),
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
            suggestions: "add logs\nlink the firmware version".into(),
        }
    }

    #[test]
    fn score_comment_carries_marker_mention_and_table() {
        let comment = format_score_comment(&record(), &scores());
        assert!(comment.starts_with(SCORE_MARKER));
        assert!(comment.contains("@alice"));
        assert!(comment.contains("Issue quality score"));
        assert!(comment.contains("**85/100** | solid structure"));
        assert!(comment.contains("Overall: **86/100**"));
        assert!(comment.contains("- add logs"));
        assert!(comment.contains("- link the firmware version"));
        assert!(comment.trim_end().ends_with(ATTRIBUTION));
    }

    #[test]
    fn score_comment_for_comments_says_comment() {
        let mut record = record();
        record.content_type = ContentType::Comment;
        let comment = format_score_comment(&record, &scores());
        assert!(comment.contains("Comment quality score"));
    }

    #[test]
    fn empty_suggestions_render_placeholder() {
        let mut scores = scores();
        scores.suggestions = "  ".into();
        let comment = format_score_comment(&record(), &scores);
        assert!(comment.contains("(none)"));
    }

    // The marker guard is what breaks the scorer's feedback loop with
    // itself: its own comments always contain SCORE_MARKER.
    #[test]
    fn own_comments_are_recognizable() {
        let comment = format_score_comment(&record(), &scores());
        assert!(comment.contains(SCORE_MARKER));
    }
}
