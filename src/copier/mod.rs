//! Issue-copier worker service.
//!
//! Watches one source repository and replicates its issues to target
//! repositories chosen by label. Copied bodies get their images re-hosted on
//! the target's `assets` branch and their bare `#n` references qualified so
//! links keep resolving. New comments on a replicated issue are mirrored to
//! every copy.

pub mod body;

use anyhow::Result;
use axum::{
    extract::State,
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

use crate::config::{Config, Env, IssueCopyConfig};
use crate::github::{GithubClient, GithubError};
use crate::pool::WorkerPool;
use crate::store::{ClaimOutcome, CopyStatus, ImageReupload, Store};
use crate::webhook::{EventKind, IssueCommentEvent, IssuesEvent};

const MAX_BODY_SIZE: usize = 1_048_576;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Branch holding re-hosted images on every target repository.
pub const ASSETS_BRANCH: &str = "assets";

/// Trailing line on comments the copier posts.
pub const ATTRIBUTION: &str = "*Automated copy by octomon*";

pub struct CopierCtx {
    pub store: Store,
    pub github: GithubClient,
    pub config: IssueCopyConfig,
}

#[derive(Clone)]
struct CopierState {
    ctx: Arc<CopierCtx>,
    pool: Arc<WorkerPool<CopierJob>>,
}

enum CopierJob {
    Issue(IssuesEvent),
    Comment(IssueCommentEvent),
}

/// Map issue labels to target repositories. Deterministic: label order
/// decides target order, duplicates collapse, and the default target (when
/// configured) applies only when nothing matched.
pub fn resolve_targets(labels: &[String], config: &IssueCopyConfig) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for label in labels {
        if let Some(repo) = config.label_to_repo.get(label) {
            if !targets.contains(repo) {
                targets.push(repo.clone());
            }
        }
    }
    if targets.is_empty() {
        if let Some(ref default) = config.default_target_repo {
            if !default.is_empty() {
                targets.push(default.clone());
            }
        }
    }
    targets
}

pub async fn run(host: &str, port: u16, config: Config, env: Env) -> Result<()> {
    let ctx = Arc::new(CopierCtx {
        store: Store::open(&env.db_path)?,
        github: GithubClient::new(&env.github_api_url, &env.github_token)?,
        config: config.issue_copy.clone(),
    });

    if ctx.config.source_repo.is_empty() {
        // Warned once here; webhook handling stays a no-op.
        tracing::warn!("issue_copy.source_repo not configured — all issue events will be ignored");
    }

    let pool = {
        let ctx = Arc::clone(&ctx);
        Arc::new(WorkerPool::new(
            "issue-copier",
            ctx.config.workers,
            ctx.config.queue_depth,
            move |job: CopierJob| {
                let ctx = Arc::clone(&ctx);
                async move {
                    match job {
                        CopierJob::Issue(event) => process_issue_event(&ctx, event).await,
                        CopierJob::Comment(event) => process_comment_event(&ctx, event).await,
                    }
                }
            },
        ))
    };

    let state = CopierState { ctx, pool };

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("🦀 octomon issue-copier listening on http://{host}:{port}");

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .route("/api/stats", get(handle_stats))
        .route("/api/issue-copies", get(handle_list_copies))
        .route("/api/issue-copies/stats", get(handle_copy_stats))
        .route("/api/comment-syncs", get(handle_list_syncs))
        .route("/issue-copies", get(handle_copies_page))
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
        "service": "octomon issue-copier",
        "timestamp": crate::util::now_rfc3339(),
    }))
}

async fn handle_webhook(
    State(state): State<CopierState>,
    headers: HeaderMap,
    raw: axum::body::Bytes,
) -> Response {
    let event_name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let kind = EventKind::from_header(event_name);

    if !state.ctx.config.enabled || state.ctx.config.source_repo.is_empty() {
        return ignored(event_name, "copier disabled or unconfigured");
    }

    let job = match kind {
        EventKind::Issues => match serde_json::from_slice::<IssuesEvent>(&raw) {
            Ok(event) => {
                if event.repository.full_name != state.ctx.config.source_repo {
                    return ignored(event_name, "not the source repository");
                }
                if !state.ctx.config.triggers.iter().any(|t| t == &event.action) {
                    return ignored(event_name, "action not in triggers");
                }
                CopierJob::Issue(event)
            }
            Err(e) => {
                tracing::warn!("Unparseable issues payload — ignored: {e}");
                return ignored(event_name, "unparseable payload");
            }
        },
        EventKind::IssueComment => match serde_json::from_slice::<IssueCommentEvent>(&raw) {
            Ok(event) => {
                if event.repository.full_name != state.ctx.config.source_repo {
                    return ignored(event_name, "not the source repository");
                }
                if event.action != "created" {
                    return ignored(event_name, "only created comments are mirrored");
                }
                CopierJob::Comment(event)
            }
            Err(e) => {
                tracing::warn!("Unparseable issue_comment payload — ignored: {e}");
                return ignored(event_name, "unparseable payload");
            }
        },
        _ => return ignored(event_name, "unsupported event"),
    };

    if state.pool.try_enqueue(job).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "queue full"})),
        )
            .into_response();
    }
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
}

fn ignored(event: &str, reason: &str) -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ignored", "event": event, "reason": reason})),
    )
        .into_response()
}

async fn handle_stats(State(state): State<CopierState>) -> Response {
    match state.ctx.store.copy_stats() {
        Ok(stats) => Json(json!({
            "queued": stats.pending,
            "processing": 0,
            "completed": stats.success + stats.partial,
            "failed": stats.failed,
            "total": stats.total,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Stats query failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_list_copies(State(state): State<CopierState>) -> Response {
    match (
        state.ctx.store.list_copy_records(100, None),
        state.ctx.store.copy_stats(),
    ) {
        (Ok(records), Ok(stats)) => Json(json!({
            "total": records.len(),
            "records": records,
            "stats": stats,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Copy listing failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_copy_stats(State(state): State<CopierState>) -> Response {
    match state.ctx.store.copy_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!("Stats query failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_list_syncs(State(state): State<CopierState>) -> Response {
    match (
        state.ctx.store.list_comment_syncs(100),
        state.ctx.store.comment_sync_stats(),
    ) {
        (Ok(records), Ok(stats)) => Json(json!({
            "total": records.len(),
            "records": records,
            "stats": stats,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Sync listing failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_copies_page() -> Html<&'static str> {
    Html(COPIES_HTML)
}

// ── Issue replication ───────────────────────────────────────────

async fn process_issue_event(ctx: &CopierCtx, event: IssuesEvent) {
    let repo = &event.repository.full_name;
    let issue = &event.issue;
    let labels = issue.label_names();

    let targets = resolve_targets(&labels, &ctx.config);
    if targets.is_empty() {
        tracing::info!(
            issue = issue.number,
            ?labels,
            "No matching target repository and no default — nothing to copy"
        );
        return;
    }

    let mut copied_urls = Vec::new();
    for target in &targets {
        match replicate_issue(ctx, &event, target).await {
            Ok(Some(url)) => copied_urls.push(url),
            Ok(None) => {} // duplicate, already replicated
            Err(e) => {
                // One bad target must not block the others.
                tracing::error!(issue = issue.number, %target, "Replication failed: {e}");
                let _ = ctx
                    .store
                    .fail_copy(repo, issue.number, target, &e.to_string());
            }
        }
    }

    if !copied_urls.is_empty() && ctx.config.add_copy_comment {
        if let Err(e) = post_copy_comment(ctx, repo, issue.number, &copied_urls).await {
            tracing::warn!(issue = issue.number, "Failed to post copy notice: {e}");
        }
    }
}

/// Replicate one issue into one target repo. `Ok(None)` means the unique
/// claim found an existing replication (idempotent no-op).
async fn replicate_issue(
    ctx: &CopierCtx,
    event: &IssuesEvent,
    target_repo: &str,
) -> Result<Option<String>> {
    let source_repo = &event.repository.full_name;
    let issue = &event.issue;
    let record_id = format!("{source_repo}#{}->{target_repo}", issue.number);

    let claim = ctx.store.claim_copy(
        &record_id,
        source_repo,
        issue.number,
        &issue.title,
        &issue.html_url,
        target_repo,
    )?;
    if claim == ClaimOutcome::Duplicate {
        tracing::info!(
            issue = issue.number,
            target_repo,
            "Already replicated — skipping"
        );
        return Ok(None);
    }

    let source_body = issue.body.clone().unwrap_or_default();

    // Transformation order matters: images first (URL replacement), then
    // reference qualification over the final text.
    let (rehosted_body, images, image_failures) = if ctx.config.reupload_images {
        rehost_images(ctx, target_repo, &source_body).await
    } else {
        (source_body.clone(), Vec::new(), 0)
    };
    let rewritten = body::rewrite_issue_references(&rehosted_body, source_repo);

    let new_body = if ctx.config.add_source_reference {
        format!(
            "---\n**Source**: [{source_repo} #{num}]({url})\n\n---\n\n{rewritten}",
            num = issue.number,
            url = issue.html_url,
        )
    } else {
        rewritten
    };
    let new_title = format!("[SRC#{}] {}", issue.number, issue.title);

    let created = ctx
        .github
        .create_issue(target_repo, &new_title, &new_body)
        .await?;
    tracing::info!(
        issue = issue.number,
        target_repo,
        target_issue = created.number,
        "Issue replicated"
    );

    // Labels: only those existing on the target; missing ones are skipped.
    let source_labels = issue.label_names();
    let mut labels_copied = Vec::new();
    let mut labels_missing = 0usize;
    if ctx.config.copy_labels && !source_labels.is_empty() {
        match ctx.github.list_repo_labels(target_repo).await {
            Ok(target_labels) => {
                let (present, missing): (Vec<String>, Vec<String>) = source_labels
                    .into_iter()
                    .partition(|l| target_labels.contains(l));
                labels_missing = missing.len();
                if !missing.is_empty() {
                    tracing::warn!(
                        target_repo,
                        ?missing,
                        "Labels missing on target repo — skipped"
                    );
                }
                if !present.is_empty() {
                    if let Err(e) = ctx
                        .github
                        .add_labels(target_repo, created.number, &present)
                        .await
                    {
                        tracing::warn!(target_repo, "Failed to copy labels: {e}");
                        labels_missing += present.len();
                    } else {
                        labels_copied = present;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target_repo, "Failed to list target labels: {e}");
                labels_missing = 1;
            }
        }
    }

    let status = if image_failures > 0 || labels_missing > 0 {
        CopyStatus::Partial
    } else {
        CopyStatus::Success
    };
    ctx.store.complete_copy(
        source_repo,
        issue.number,
        target_repo,
        created.number,
        &created.html_url,
        &labels_copied,
        &images,
        status,
    )?;

    Ok(Some(created.html_url.clone()))
}

/// Download foreign images and re-upload them to the target's assets
/// branch, replacing URLs in the body. Per-image failures are logged and
/// counted; the body keeps the original URL for those.
async fn rehost_images(
    ctx: &CopierCtx,
    target_repo: &str,
    text: &str,
) -> (String, Vec<ImageReupload>, usize) {
    let urls = body::extract_foreign_image_urls(text);
    if urls.is_empty() {
        return (text.to_owned(), Vec::new(), 0);
    }

    let mut out = text.to_owned();
    let mut uploaded = Vec::new();
    let mut failures = 0usize;
    let mut branch_ready = false;

    for url in urls {
        if !branch_ready {
            match ensure_assets_branch(ctx, target_repo).await {
                Ok(()) => branch_ready = true,
                Err(e) => {
                    tracing::error!(target_repo, "Assets branch unavailable: {e}");
                    failures += 1;
                    continue;
                }
            }
        }

        let bytes = match ctx.github.download(&url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%url, "Image download failed — keeping original URL: {e}");
                failures += 1;
                continue;
            }
        };

        let asset_path = body::asset_path_for(&url);
        let existing = match ctx
            .github
            .content_sha(target_repo, &asset_path, ASSETS_BRANCH)
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                tracing::warn!(%url, "Asset lookup failed: {e}");
                failures += 1;
                continue;
            }
        };

        let message = format!("Upload image {asset_path}");
        if let Err(e) = ctx
            .github
            .put_content(
                target_repo,
                &asset_path,
                ASSETS_BRANCH,
                &message,
                &bytes,
                existing.as_deref(),
            )
            .await
        {
            tracing::warn!(%url, "Image upload failed: {e}");
            failures += 1;
            continue;
        }

        let new_url = body::raw_asset_url(target_repo, &asset_path);
        out = out.replace(&url, &new_url);
        tracing::info!(%url, %new_url, "Image re-hosted");
        uploaded.push(ImageReupload {
            original_url: url,
            new_url,
        });
    }

    (out, uploaded, failures)
}

/// Make sure the target has an `assets` branch, creating it from the
/// default branch when absent.
async fn ensure_assets_branch(ctx: &CopierCtx, repo: &str) -> Result<()> {
    match ctx.github.branch_sha(repo, ASSETS_BRANCH).await {
        Ok(_) => return Ok(()),
        Err(GithubError::Status { status: 404, .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let default_branch = ctx
        .github
        .get_repo(repo)
        .await
        .map(|r| r.default_branch)
        .unwrap_or_default();

    let mut base_sha = None;
    for candidate in [default_branch.as_str(), "main", "master"] {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(sha) = ctx.github.branch_sha(repo, candidate).await {
            base_sha = Some(sha);
            break;
        }
    }
    let Some(sha) = base_sha else {
        anyhow::bail!("no base branch found for {repo}");
    };

    ctx.github.create_branch(repo, ASSETS_BRANCH, &sha).await?;
    tracing::info!(repo, "Created assets branch");
    Ok(())
}

async fn post_copy_comment(
    ctx: &CopierCtx,
    source_repo: &str,
    issue_number: u64,
    target_urls: &[String],
) -> Result<()> {
    let mut lines = vec![
        "## 🤖 Issue replicated".to_owned(),
        String::new(),
        "This issue was automatically copied to:".to_owned(),
        String::new(),
    ];
    for url in target_urls {
        // https://github.com/owner/repo/issues/123
        let parts: Vec<&str> = url.split('/').collect();
        if parts.len() >= 7 {
            lines.push(format!("- [{}/{} #{}]({url})", parts[3], parts[4], parts[6]));
        } else {
            lines.push(format!("- {url}"));
        }
    }
    lines.push(String::new());
    lines.push("---".to_owned());
    lines.push(ATTRIBUTION.to_owned());

    ctx.github
        .create_issue_comment(source_repo, issue_number, &lines.join("\n"))
        .await?;
    Ok(())
}

// ── Comment mirroring ───────────────────────────────────────────

async fn process_comment_event(ctx: &CopierCtx, event: IssueCommentEvent) {
    let source_repo = &event.repository.full_name;
    let issue_number = event.issue.number;

    let copies = match ctx.store.replicated_copies(source_repo, issue_number) {
        Ok(copies) => copies,
        Err(e) => {
            tracing::error!(issue = issue_number, "Copy lookup failed: {e}");
            return;
        }
    };
    if copies.is_empty() {
        tracing::info!(issue = issue_number, "No replicated copies — comment not mirrored");
        return;
    }

    let comment = &event.comment;
    let comment_body = comment.body.clone().unwrap_or_default();

    for copy in &copies {
        let (Some(target_issue), target_repo) = (copy.target_issue_number, &copy.target_repo)
        else {
            continue;
        };
        let target_issue = target_issue as u64;
        let sync_id = format!("{source_repo}#{issue_number}@{}->{target_repo}#{target_issue}", comment.id);

        let claim = match ctx.store.claim_comment_sync(
            &sync_id,
            comment.id,
            source_repo,
            issue_number,
            &comment.html_url,
            &comment.user.login,
            target_repo,
            target_issue,
        ) {
            Ok(claim) => claim,
            Err(e) => {
                tracing::error!(%sync_id, "Sync claim failed: {e}");
                continue;
            }
        };
        if claim == ClaimOutcome::Duplicate {
            tracing::info!(%sync_id, "Comment already mirrored — skipping");
            continue;
        }

        match mirror_comment(ctx, &event, target_repo, target_issue, &comment_body).await {
            Ok(posted_id) => {
                let _ = ctx
                    .store
                    .complete_comment_sync(comment.id, target_repo, target_issue, posted_id);
                tracing::info!(%sync_id, "Comment mirrored");
            }
            Err(e) => {
                tracing::error!(%sync_id, "Comment mirror failed: {e}");
                let _ = ctx
                    .store
                    .fail_comment_sync(comment.id, target_repo, target_issue, &e.to_string());
            }
        }
    }
}

async fn mirror_comment(
    ctx: &CopierCtx,
    event: &IssueCommentEvent,
    target_repo: &str,
    target_issue: u64,
    comment_body: &str,
) -> Result<u64> {
    let source_repo = &event.repository.full_name;

    let (rehosted, _, _) = if ctx.config.reupload_images {
        rehost_images(ctx, target_repo, comment_body).await
    } else {
        (comment_body.to_owned(), Vec::new(), 0)
    };
    let transformed = body::rewrite_issue_references(&rehosted, source_repo);

    let mut mirrored = format!(
        "**{author}** commented on the source issue:\n\n{url}\n\n---\n\n{transformed}",
        author = event.comment.user.login,
        url = event.comment.html_url,
    );
    if body::has_media(comment_body) {
        mirrored.push_str(
            "\n\n---\n\nImages or attachments above may have been updated on the \
             source issue — check the original comment for the latest versions.",
        );
    }

    let posted = ctx
        .github
        .create_issue_comment(target_repo, target_issue, &mirrored)
        .await?;
    Ok(posted.id)
}

const COPIES_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>octomon — issue copies</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; }
    td, th { padding: 0.3rem 0.7rem; text-align: left; border-bottom: 1px solid #eee; }
    .failed { color: #c00; } .success { color: #080; } .partial { color: #a60; }
  </style>
</head>
<body>
  <h1>Issue copy records</h1>
  <table id="records"><tr><th>source</th><th>target</th><th>status</th><th>images</th></tr></table>
  <script>
    async function load() {
      const res = await fetch('/api/issue-copies');
      const data = await res.json();
      let html = '<tr><th>source</th><th>target</th><th>status</th><th>images</th></tr>';
      for (const r of data.records) {
        html += `<tr><td><a href="${r.source_issue_url}">${r.source_repo}#${r.source_issue_number}</a></td>
          <td>${r.target_issue_url ? `<a href="${r.target_issue_url}">${r.target_repo}#${r.target_issue_number}</a>` : r.target_repo}</td>
          <td class="${r.status}">${r.status}</td><td>${r.images_reuploaded.length}</td></tr>`;
      }
      document.getElementById('records').innerHTML = html;
    }
    load();
    setInterval(load, 30000);
  </script>
</body>
</html>
"#;
