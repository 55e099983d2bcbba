//! PR-review worker service.
//!
//! Receives `pull_request` events (already verified and routed by the
//! gateway), keeps one durable task per (repo, PR), and drives each task
//! through a small worker pool: fetch diff → build prompt → run the AI CLI →
//! post the review comment.

pub mod prompt;

use anyhow::Result;
use axum::{
    extract::{Path, State},
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
use crate::config::{Config, Env, ReviewConfig};
use crate::github::GithubClient;
use crate::pool::WorkerPool;
use crate::store::{task_id_for, Store, TaskStatus, UpsertOutcome};
use crate::webhook::{EventKind, PullRequestEvent};

const MAX_BODY_SIZE: usize = 1_048_576;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Trailing line appended to every posted review.
pub const ATTRIBUTION: &str = "*Automated review by octomon*";

/// Everything a review run needs; shared by handlers and pool workers.
pub struct ReviewerCtx {
    pub store: Store,
    pub github: GithubClient,
    pub agent: CliAgent,
    pub config: ReviewConfig,
}

#[derive(Clone)]
struct ReviewerState {
    ctx: Arc<ReviewerCtx>,
    pool: Arc<WorkerPool<ReviewJob>>,
}

#[derive(Debug, Clone)]
struct ReviewJob {
    task_id: String,
    repo: String,
    pr_number: u64,
}

/// Outcome of the webhook gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Accept,
    Skip(&'static str),
}

/// Decide whether a `pull_request` event deserves a review task.
pub fn review_gate(event: &PullRequestEvent, config: &ReviewConfig) -> Gate {
    if !config.triggers.iter().any(|t| t == &event.action) {
        return Gate::Skip("action not in triggers");
    }
    if config.skip_draft && event.pull_request.draft {
        return Gate::Skip("draft PR");
    }
    // A labeled PR was already reviewed; only fresh pushes re-trigger.
    if event.pull_request.has_label(&config.auto_label_name) && event.action != "synchronize" {
        return Gate::Skip("already auto-reviewed");
    }
    Gate::Accept
}

pub async fn run(host: &str, port: u16, config: Config, env: Env) -> Result<()> {
    let ctx = Arc::new(ReviewerCtx {
        store: Store::open(&env.db_path)?,
        github: GithubClient::new(&env.github_api_url, &env.github_token)?,
        agent: CliAgent::new(
            env.agent_cli_path.clone(),
            Duration::from_secs(config.review.timeout_secs),
        ),
        config: config.review.clone(),
    });

    let pool = {
        let ctx = Arc::clone(&ctx);
        Arc::new(WorkerPool::new(
            "pr-reviewer",
            ctx.config.workers,
            ctx.config.queue_depth,
            move |job: ReviewJob| {
                let ctx = Arc::clone(&ctx);
                async move {
                    process_review(&ctx, &job).await;
                }
            },
        ))
    };

    let state = ReviewerState { ctx, pool };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("🦀 octomon pr-reviewer listening on http://{host}:{port}");

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .route("/api/stats", get(handle_stats))
        .route("/api/tasks", get(handle_list_tasks))
        .route("/api/tasks/{*task_id}", get(handle_get_task))
        .route("/pr-tasks", get(handle_tasks_page))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    axum::serve(listener, app).await?;
    Ok(())
}

// ── HTTP handlers ───────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "octomon pr-reviewer",
        "timestamp": crate::util::now_rfc3339(),
    }))
}

async fn handle_webhook(
    State(state): State<ReviewerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let event_name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if EventKind::from_header(event_name) != EventKind::PullRequest {
        return (
            StatusCode::OK,
            Json(json!({"status": "ignored", "event": event_name})),
        )
            .into_response();
    }

    let event: PullRequestEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Unparseable pull_request payload — ignored: {e}");
            return (
                StatusCode::OK,
                Json(json!({"status": "ignored", "reason": "unparseable payload"})),
            )
                .into_response();
        }
    };

    if let Gate::Skip(reason) = review_gate(&event, &state.ctx.config) {
        tracing::info!(
            repo = %event.repository.full_name,
            pr = event.pull_request.number,
            action = %event.action,
            reason,
            "Review skipped"
        );
        return (
            StatusCode::OK,
            Json(json!({"status": "skipped", "reason": reason})),
        )
            .into_response();
    }

    let repo = event.repository.full_name.clone();
    let pr = &event.pull_request;
    let task_id = task_id_for(&repo, pr.number);

    let outcome = match state.ctx.store.upsert_review_task(
        &task_id,
        &repo,
        pr.number,
        &pr.title,
        &pr.user.login,
        &pr.html_url,
    ) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%task_id, "Failed to record review task: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store failure"})),
            )
                .into_response();
        }
    };

    if outcome == UpsertOutcome::AlreadyActive {
        // The in-flight run observes the latest head on its own fetch.
        tracing::info!(%task_id, "Task already queued or in flight — collapsed");
        return (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "task_id": task_id})),
        )
            .into_response();
    }

    let job = ReviewJob {
        task_id: task_id.clone(),
        repo,
        pr_number: pr.number,
    };
    if state.pool.try_enqueue(job).is_err() {
        // Undo the claim so the retry re-queues cleanly.
        let _ = state.ctx.store.fail_task(&task_id, "worker queue overflow");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "queue full"})),
        )
            .into_response();
    }

    tracing::info!(%task_id, "Review task enqueued");
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "task_id": task_id})),
    )
        .into_response()
}

async fn handle_stats(State(state): State<ReviewerState>) -> Response {
    match state.ctx.store.review_task_stats() {
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
    offset: Option<u32>,
    status: Option<String>,
}

async fn handle_list_tasks(
    State(state): State<ReviewerState>,
    axum::extract::Query(query): axum::extract::Query<ListQuery>,
) -> Response {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::from_str_lossy);
    let limit = query.limit.unwrap_or(100).min(500);
    let offset = query.offset.unwrap_or(0);
    match (
        state.ctx.store.list_review_tasks(limit, offset, status),
        state.ctx.store.review_task_stats(),
    ) {
        (Ok(tasks), Ok(stats)) => Json(json!({
            "total": tasks.len(),
            "tasks": tasks,
            "stats": {
                "queued": stats.queued,
                "processing": stats.processing,
                "completed": stats.completed,
                "failed": stats.failed,
            },
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Task listing failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_get_task(
    State(state): State<ReviewerState>,
    Path(task_id): Path<String>,
) -> Response {
    match state.ctx.store.get_review_task(&task_id) {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Task lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_tasks_page() -> Html<&'static str> {
    Html(TASKS_HTML)
}

// ── Review pipeline ─────────────────────────────────────────────

async fn process_review(ctx: &ReviewerCtx, job: &ReviewJob) {
    if let Err(e) = run_review(ctx, job).await {
        tracing::error!(task_id = %job.task_id, "Review failed: {e}");
        let _ = ctx.store.fail_task(&job.task_id, &e.to_string());
    }
}

async fn run_review(ctx: &ReviewerCtx, job: &ReviewJob) -> Result<()> {
    let started = ctx
        .store
        .mark_task_processing(&job.task_id, "fetching PR context")?;
    if !started {
        // Task left the queued state behind our back (e.g. marked failed on
        // queue overflow); nothing to do.
        tracing::warn!(task_id = %job.task_id, "Task no longer queued — skipping run");
        return Ok(());
    }

    let pr = ctx.github.get_pull(&job.repo, job.pr_number).await?;
    let files = ctx.github.list_pull_files(&job.repo, job.pr_number).await?;

    let diff = prompt::render_diff(&files, ctx.config.max_diff_chars);
    if diff.trim().is_empty() {
        anyhow::bail!("PR has no diff content");
    }

    // The author's record calibrates the reviewer; losing it never blocks
    // the review itself.
    let history = ctx
        .store
        .author_review_history(&pr.user.login, 10)
        .unwrap_or_else(|e| {
            tracing::warn!(task_id = %job.task_id, "Author history lookup failed: {e}");
            Default::default()
        });
    let history_block = prompt::author_history_block(&pr.user.login, &history);

    let review_prompt =
        prompt::build_review_prompt(&pr, &files, &diff, history_block.as_deref(), &ctx.config);
    ctx.store
        .set_task_progress(&job.task_id, 50, "running AI review")?;

    let review = ctx.agent.run(&review_prompt).await?;

    ctx.store
        .set_task_progress(&job.task_id, 80, "publishing review")?;

    let score = prompt::extract_score(&review);
    let comment = format!("## 🤖 AI Code Review\n\n{review}\n\n---\n{ATTRIBUTION}");
    ctx.github
        .create_issue_comment(&job.repo, job.pr_number, &comment)
        .await?;

    if ctx.config.auto_label {
        if let Err(e) = ctx
            .github
            .add_labels(
                &job.repo,
                job.pr_number,
                &[ctx.config.auto_label_name.clone()],
            )
            .await
        {
            // Label failures never fail the review itself.
            tracing::warn!(task_id = %job.task_id, "Failed to apply auto-review label: {e}");
        }
    }

    ctx.store.complete_task(&job.task_id, &review, score)?;
    tracing::info!(task_id = %job.task_id, ?score, "Review completed");
    Ok(())
}

const TASKS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>octomon — PR reviews</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; }
    td, th { padding: 0.3rem 0.7rem; text-align: left; border-bottom: 1px solid #eee; }
    .failed { color: #c00; } .completed { color: #080; }
  </style>
</head>
<body>
  <h1>PR review tasks</h1>
  <table id="tasks"><tr><th>task</th><th>title</th><th>author</th><th>status</th><th>progress</th></tr></table>
  <script>
    async function load() {
      const res = await fetch('/api/tasks');
      const data = await res.json();
      let html = '<tr><th>task</th><th>title</th><th>author</th><th>status</th><th>progress</th></tr>';
      for (const t of data.tasks) {
        html += `<tr><td><a href="${t.pr_url}">${t.task_id}</a></td><td>${t.pr_title}</td>
          <td>${t.pr_author}</td><td class="${t.status}">${t.status}</td><td>${t.progress}%</td></tr>`;
      }
      document.getElementById('tasks').innerHTML = html;
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
    use crate::webhook::{Account, BranchRef, Label, PullRequestPayload, Repository};

    fn event(action: &str, draft: bool, labels: &[&str]) -> PullRequestEvent {
        PullRequestEvent {
            action: action.to_owned(),
            pull_request: PullRequestPayload {
                number: 42,
                title: "Fix".into(),
                body: None,
                html_url: "https://github.com/Acme/foo/pull/42".into(),
                draft,
                user: Account {
                    login: "alice".into(),
                },
                labels: labels
                    .iter()
                    .map(|name| Label {
                        name: (*name).to_owned(),
                    })
                    .collect(),
                base: BranchRef::default(),
                head: BranchRef::default(),
            },
            repository: Repository {
                full_name: "Acme/foo".into(),
                default_branch: "main".into(),
            },
        }
    }

    #[test]
    fn accepts_default_triggers() {
        let config = ReviewConfig::default();
        for action in ["opened", "synchronize", "reopened"] {
            assert_eq!(review_gate(&event(action, false, &[]), &config), Gate::Accept);
        }
    }

    #[test]
    fn skips_untriggered_actions() {
        let config = ReviewConfig::default();
        assert_eq!(
            review_gate(&event("closed", false, &[]), &config),
            Gate::Skip("action not in triggers")
        );
        assert_eq!(
            review_gate(&event("labeled", false, &[]), &config),
            Gate::Skip("action not in triggers")
        );
    }

    #[test]
    fn skips_draft_when_configured() {
        let config = ReviewConfig::default();
        assert_eq!(
            review_gate(&event("opened", true, &[]), &config),
            Gate::Skip("draft PR")
        );

        let lenient = ReviewConfig {
            skip_draft: false,
            ..ReviewConfig::default()
        };
        assert_eq!(review_gate(&event("opened", true, &[]), &lenient), Gate::Accept);
    }

    #[test]
    fn auto_label_blocks_everything_but_synchronize() {
        let config = ReviewConfig::default();
        assert_eq!(
            review_gate(&event("opened", false, &["auto-reviewed"]), &config),
            Gate::Skip("already auto-reviewed")
        );
        assert_eq!(
            review_gate(&event("reopened", false, &["auto-reviewed"]), &config),
            Gate::Skip("already auto-reviewed")
        );
        // A new push still re-reviews.
        assert_eq!(
            review_gate(&event("synchronize", false, &["auto-reviewed"]), &config),
            Gate::Accept
        );
    }
}
