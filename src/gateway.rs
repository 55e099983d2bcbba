//! Public ingress gateway.
//!
//! The only component GitHub talks to. Verifies `X-Hub-Signature-256`,
//! demultiplexes by `X-GitHub-Event`, and forwards the raw body to the
//! workers that care about it. Also aggregates worker dashboards and
//! reverse-proxies their UI pages behind HTTP basic auth.
//!
//! Stateless by design; nothing here survives a request except the reqwest
//! connection pool, so replicas can sit behind one load balancer.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::{Config, Env};
use crate::util::constant_time_eq;
use crate::webhook::EventKind;

/// Webhook bodies beyond this are rejected by the body-limit layer.
const MAX_BODY_SIZE: usize = 1_048_576;
const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Budget for forwarding one webhook to one worker.
const FORWARD_TIMEOUT_SECS: u64 = 10;
/// Budget per worker when aggregating the dashboard.
const STATS_TIMEOUT_SECS: u64 = 2;

#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    http: reqwest::Client,
    webhook_secret: Option<String>,
    web_username: String,
    web_password: Option<String>,
    pr_reviewer_url: String,
    issue_copier_url: String,
    issue_scorer_url: String,
    routes: RoutingRules,
}

/// Which repositories matter to which workers.
#[derive(Debug, Clone, Default)]
pub struct RoutingRules {
    pub copy_source_repo: String,
    pub scoring_repos: Vec<String>,
}

/// A webhook's downstream audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    PrReviewer,
    IssueCopier,
    IssueScorer,
}

impl Worker {
    fn key(self) -> &'static str {
        match self {
            Self::PrReviewer => "pr_reviewer",
            Self::IssueCopier => "issue_copier",
            Self::IssueScorer => "issue_scorer",
        }
    }
}

/// Decide which workers receive an event. Deterministic on
/// (event kind, repository, rules); unknown events go nowhere.
pub fn route_targets(kind: EventKind, repo: &str, rules: &RoutingRules) -> Vec<Worker> {
    let scored = rules.scoring_repos.iter().any(|r| r == repo);
    let mut targets = Vec::new();
    match kind {
        EventKind::PullRequest => {
            targets.push(Worker::PrReviewer);
            if scored {
                targets.push(Worker::IssueScorer);
            }
        }
        EventKind::Issues | EventKind::IssueComment => {
            if !rules.copy_source_repo.is_empty() && repo == rules.copy_source_repo {
                targets.push(Worker::IssueCopier);
            }
            if scored {
                targets.push(Worker::IssueScorer);
            }
        }
        EventKind::Ping | EventKind::Other => {}
    }
    targets
}

/// Verify a GitHub `X-Hub-Signature-256` header against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Check an `Authorization: Basic ...` header against the configured pair.
pub fn check_basic_auth(header_value: Option<&str>, username: &str, password: &str) -> bool {
    let Some(value) = header_value else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = pair.split_once(':') else {
        return false;
    };
    // Single combined check keeps the comparison constant-time over both.
    constant_time_eq(user, username) & constant_time_eq(pass, password)
}

pub async fn run(host: &str, port: u16, config: Config, env: Env) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if env.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set — webhook signature verification disabled");
    }
    if !env.auth_enabled() {
        tracing::warn!("WEB_PASSWORD not set — dashboard auth disabled");
    }

    let state = GatewayState {
        inner: Arc::new(GatewayInner {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(FORWARD_TIMEOUT_SECS))
                .build()?,
            webhook_secret: env.webhook_secret.clone(),
            web_username: env.web_username.clone(),
            web_password: env.web_password.clone(),
            pr_reviewer_url: env.pr_reviewer_url.clone(),
            issue_copier_url: env.issue_copier_url.clone(),
            issue_scorer_url: env.issue_scorer_url.clone(),
            routes: RoutingRules {
                copy_source_repo: config.issue_copy.source_repo.clone(),
                scoring_repos: config.issue_scoring.target_repos.clone(),
            },
        }),
    };

    println!("🦀 octomon gateway listening on http://{host}:{port}");
    println!("  POST /webhook        — GitHub webhook ingress");
    println!("  GET  /health         — health check (no auth)");
    println!("  GET  /               — dashboard");
    println!("  GET  /api/dashboard  — aggregated worker stats");

    let protected = Router::new()
        .route("/", get(handle_index))
        .route("/api/dashboard", get(handle_dashboard))
        .route("/pr-tasks", get(proxy_pr_tasks))
        .route("/issue-copies", get(proxy_issue_copies))
        .route("/issue-scores", get(proxy_issue_scores))
        .route("/feedback-analytics", get(proxy_feedback_analytics))
        .route("/api/scores/{score_id}/feedback", post(proxy_score_feedback))
        .route("/api/feedback/snapshot", post(proxy_feedback_snapshot))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .merge(protected)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    axum::serve(listener, app).await?;
    Ok(())
}

// ── Middleware ──────────────────────────────────────────────────

async fn require_auth(
    State(state): State<GatewayState>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let Some(ref password) = state.inner.web_password else {
        // Explicit insecure bootstrap mode, visible via /health.
        return next.run(request).await;
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if check_basic_auth(header_value, &state.inner.web_username, password) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"octomon\"")],
        Json(json!({"error": "authentication required"})),
    )
        .into_response()
}

// ── Handlers ────────────────────────────────────────────────────

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "octomon gateway",
        "auth_enabled": state.inner.web_password.as_deref().is_some_and(|p| !p.is_empty()),
        "timestamp": crate::util::now_rfc3339(),
    }))
}

async fn handle_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // ── Signature ──
    if let Some(ref secret) = state.inner.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            tracing::warn!(
                "Webhook rejected — {} signature",
                if signature.is_empty() { "missing" } else { "invalid" }
            );
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "signature"})),
            )
                .into_response();
        }
    }

    let event_name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let delivery = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let kind = EventKind::from_header(&event_name);
    if kind == EventKind::Ping {
        return (StatusCode::OK, Json(json!({"status": "success", "event": "ping"})))
            .into_response();
    }
    if kind == EventKind::Other {
        return (
            StatusCode::OK,
            Json(json!({"status": "ignored", "event": event_name})),
        )
            .into_response();
    }

    // Only the repository name is needed for routing; workers parse the rest.
    let repo = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("repository")
                .and_then(|r| r.get("full_name"))
                .and_then(|n| n.as_str())
                .map(str::to_owned)
        });
    let Some(repo) = repo else {
        tracing::warn!(event = %event_name, "Webhook payload missing repository.full_name — ignored");
        return (
            StatusCode::OK,
            Json(json!({"status": "ignored", "event": event_name, "reason": "unparseable payload"})),
        )
            .into_response();
    };

    let targets = route_targets(kind, &repo, &state.inner.routes);
    tracing::info!(event = %event_name, %repo, targets = targets.len(), "Webhook received");
    if targets.is_empty() {
        return (
            StatusCode::OK,
            Json(json!({"status": "ignored", "event": event_name})),
        )
            .into_response();
    }

    // ── Forward; every target must acknowledge the enqueue ──
    let mut results = serde_json::Map::new();
    let mut overloaded = false;
    let mut unreachable = false;
    for target in &targets {
        let base = state.worker_url(*target);
        let outcome = state
            .inner
            .http
            .post(format!("{base}/webhook"))
            .header("X-GitHub-Event", &event_name)
            .header("X-GitHub-Delivery", &delivery)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                let payload: serde_json::Value = response.json().await.unwrap_or(json!({}));
                results.insert(target.key().to_owned(), json!({"status": "accepted", "response": payload}));
            }
            Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                tracing::warn!(worker = target.key(), "Worker queue full");
                results.insert(target.key().to_owned(), json!({"status": "overloaded"}));
                overloaded = true;
            }
            Ok(response) => {
                tracing::error!(worker = target.key(), status = %response.status(), "Worker rejected webhook");
                results.insert(
                    target.key().to_owned(),
                    json!({"status": "error", "http_status": response.status().as_u16()}),
                );
                unreachable = true;
            }
            Err(e) => {
                tracing::error!(worker = target.key(), "Worker unreachable: {e}");
                results.insert(target.key().to_owned(), json!({"status": "unreachable"}));
                unreachable = true;
            }
        }
    }

    // 503 → GitHub retries against a full queue; 502 → retries an outage.
    let status = if overloaded {
        StatusCode::SERVICE_UNAVAILABLE
    } else if unreachable {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "success" } else { "error" },
            "event": event_name,
            "results": results,
        })),
    )
        .into_response()
}

async fn handle_dashboard(State(state): State<GatewayState>) -> impl IntoResponse {
    let workers = [Worker::PrReviewer, Worker::IssueCopier, Worker::IssueScorer];
    let mut aggregate = serde_json::Map::new();

    // One slow worker must not hide the others; each fetch gets its own
    // short budget and failures degrade to reachable=false.
    for worker in workers {
        let base = state.worker_url(worker);
        let fetch = state.inner.http.get(format!("{base}/api/stats")).send();
        let entry = match tokio::time::timeout(Duration::from_secs(STATS_TIMEOUT_SECS), fetch).await
        {
            Ok(Ok(response)) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(stats) => json!({"reachable": true, "stats": stats}),
                    Err(_) => json!({"reachable": false}),
                }
            }
            _ => json!({"reachable": false}),
        };
        aggregate.insert(worker.key().to_owned(), entry);
    }

    aggregate.insert("timestamp".to_owned(), json!(crate::util::now_rfc3339()));
    Json(serde_json::Value::Object(aggregate))
}

async fn handle_index() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

// ── Reverse proxies ─────────────────────────────────────────────

impl GatewayState {
    fn worker_url(&self, worker: Worker) -> &str {
        match worker {
            Worker::PrReviewer => &self.inner.pr_reviewer_url,
            Worker::IssueCopier => &self.inner.issue_copier_url,
            Worker::IssueScorer => &self.inner.issue_scorer_url,
        }
    }
}

async fn proxy_get(state: &GatewayState, worker: Worker, path: &str) -> Response {
    let url = format!("{}{path}", state.worker_url(worker));
    match state.inner.http.get(&url).send().await {
        Ok(response) => relay(response).await,
        Err(e) => {
            tracing::error!(worker = worker.key(), "Proxy failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("{} unreachable", worker.key())})),
            )
                .into_response()
        }
    }
}

async fn relay(response: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_owned();
    match response.bytes().await {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}

async fn proxy_pr_tasks(State(state): State<GatewayState>) -> Response {
    proxy_get(&state, Worker::PrReviewer, "/pr-tasks").await
}

async fn proxy_issue_copies(State(state): State<GatewayState>) -> Response {
    proxy_get(&state, Worker::IssueCopier, "/issue-copies").await
}

async fn proxy_issue_scores(State(state): State<GatewayState>) -> Response {
    proxy_get(&state, Worker::IssueScorer, "/issue-scores").await
}

async fn proxy_feedback_analytics(State(state): State<GatewayState>) -> Response {
    proxy_get(&state, Worker::IssueScorer, "/feedback-analytics").await
}

async fn proxy_score_feedback(
    State(state): State<GatewayState>,
    Path(score_id): Path<String>,
    body: Bytes,
) -> Response {
    let url = format!(
        "{}/api/scores/{}/feedback",
        state.inner.issue_scorer_url,
        urlencode(&score_id)
    );
    match state
        .inner
        .http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(response) => relay(response).await,
        Err(e) => {
            tracing::error!("Feedback proxy failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "issue_scorer unreachable"})),
            )
                .into_response()
        }
    }
}

async fn proxy_feedback_snapshot(State(state): State<GatewayState>) -> Response {
    let url = format!("{}/api/feedback/snapshot", state.inner.issue_scorer_url);
    match state.inner.http.post(&url).send().await {
        Ok(response) => relay(response).await,
        Err(e) => {
            tracing::error!("Snapshot proxy failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "issue_scorer unreachable"})),
            )
                .into_response()
        }
    }
}

/// Percent-encode a path segment (score ids contain `#` and `/`).
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>octomon — dashboard</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; }
    nav a { margin-right: 1rem; }
    .card { border: 1px solid #ddd; border-radius: 8px; padding: 1rem; margin: 1rem 0; }
    .offline { color: #c00; }
    .online { color: #080; }
    td, th { padding: 0.25rem 0.75rem; text-align: left; }
  </style>
</head>
<body>
  <h1>octomon</h1>
  <nav>
    <a href="/pr-tasks">PR reviews</a>
    <a href="/issue-copies">Issue copies</a>
    <a href="/issue-scores">Issue scores</a>
    <a href="/feedback-analytics">Feedback analytics</a>
  </nav>
  <div id="services"></div>
  <script>
    async function load() {
      const res = await fetch('/api/dashboard');
      const data = await res.json();
      const names = {pr_reviewer: 'PR Reviewer', issue_copier: 'Issue Copier', issue_scorer: 'Issue Scorer'};
      let html = '';
      for (const key of Object.keys(names)) {
        const w = data[key] || {};
        const s = w.stats || {};
        html += `<div class="card"><h2>${names[key]}
          <small class="${w.reachable ? 'online' : 'offline'}">${w.reachable ? 'online' : 'offline'}</small></h2>
          <table><tr><th>queued</th><th>processing</th><th>completed</th><th>failed</th><th>total</th></tr>
          <tr><td>${s.queued ?? '-'}</td><td>${s.processing ?? '-'}</td>
          <td>${s.completed ?? '-'}</td><td>${s.failed ?? '-'}</td><td>${s.total ?? '-'}</td></tr></table></div>`;
      }
      document.getElementById('services').innerHTML = html;
    }
    load();
    setInterval(load, 5000);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RoutingRules {
        RoutingRules {
            copy_source_repo: "Acme/src".into(),
            scoring_repos: vec!["Acme/qa".into(), "Acme/src".into()],
        }
    }

    #[test]
    fn signature_round_trip() {
        let secret = "shared-secret";
        let body = br#"{"zen":"Design for failure."}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, body, &header));
        assert!(!verify_signature(secret, b"tampered", &header));
        assert!(!verify_signature("wrong-secret", body, &header));
        assert!(!verify_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_signature(secret, body, "sha1=whatever"));
        assert!(!verify_signature(secret, body, ""));
    }

    #[test]
    fn pull_request_routes_to_reviewer() {
        let targets = route_targets(EventKind::PullRequest, "Acme/other", &rules());
        assert_eq!(targets, vec![Worker::PrReviewer]);
    }

    #[test]
    fn pull_request_on_scored_repo_also_routes_to_scorer() {
        let targets = route_targets(EventKind::PullRequest, "Acme/qa", &rules());
        assert_eq!(targets, vec![Worker::PrReviewer, Worker::IssueScorer]);
    }

    #[test]
    fn issues_route_by_source_and_scoring() {
        // Source repo, also scored.
        let targets = route_targets(EventKind::Issues, "Acme/src", &rules());
        assert_eq!(targets, vec![Worker::IssueCopier, Worker::IssueScorer]);

        // Scored only.
        let targets = route_targets(EventKind::IssueComment, "Acme/qa", &rules());
        assert_eq!(targets, vec![Worker::IssueScorer]);

        // Neither.
        assert!(route_targets(EventKind::Issues, "Acme/other", &rules()).is_empty());
    }

    #[test]
    fn unset_copy_source_never_routes_to_copier() {
        let rules = RoutingRules {
            copy_source_repo: String::new(),
            scoring_repos: vec![],
        };
        assert!(route_targets(EventKind::Issues, "", &rules).is_empty());
    }

    #[test]
    fn ping_and_unknown_route_nowhere() {
        assert!(route_targets(EventKind::Ping, "Acme/src", &rules()).is_empty());
        assert!(route_targets(EventKind::Other, "Acme/src", &rules()).is_empty());
    }

    #[test]
    fn basic_auth_accepts_correct_pair() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:s3cret");
        let header = format!("Basic {encoded}");
        assert!(check_basic_auth(Some(&header), "admin", "s3cret"));
    }

    #[test]
    fn basic_auth_rejects_bad_input() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        let header = format!("Basic {encoded}");
        assert!(!check_basic_auth(Some(&header), "admin", "s3cret"));
        assert!(!check_basic_auth(None, "admin", "s3cret"));
        assert!(!check_basic_auth(Some("Bearer token"), "admin", "s3cret"));
        assert!(!check_basic_auth(Some("Basic not-base64!!"), "admin", "s3cret"));
    }

    #[test]
    fn urlencode_score_ids() {
        assert_eq!(urlencode("Acme/qa#5@issue"), "Acme%2Fqa%235%40issue");
        assert_eq!(urlencode("plain-id_1.2~x"), "plain-id_1.2~x");
    }
}
