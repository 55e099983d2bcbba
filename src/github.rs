//! GitHub REST client.
//!
//! Thin typed wrapper over the REST v3 endpoints the workers use. Every call
//! has a 30 s timeout; transient failures (transport errors, 5xx, 429) are
//! retried up to three times with exponential backoff and jitter, permanent
//! ones (other 4xx) surface immediately.

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use base64::Engine;

const PER_CALL_TIMEOUT_SECS: u64 = 30;
const RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("GitHub returned {status} for {context}")]
    Status { status: u16, context: String },
    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected GitHub response: {0}")]
    Decode(String),
}

impl GithubError {
    /// Worth retrying? 5xx, 429, and transport-level failures are; other
    /// 4xx are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(e) => !e.is_builder(),
            Self::Decode(_) => false,
        }
    }
}

pub type GithubResult<T> = Result<T, GithubError>;

// ── Response types ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref", default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub user: UserRef,
    #[serde(default)]
    pub labels: Vec<LabelRef>,
    #[serde(default)]
    pub base: GitRef,
    #[serde(default)]
    pub head: GitRef,
    #[serde(default)]
    pub changed_files: u64,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RefObject {
    object: RefTarget,
}

#[derive(Debug, Clone, Deserialize)]
struct RefTarget {
    sha: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentFile {
    sha: String,
}

// ── Client ──────────────────────────────────────────────────────

pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(base_url: &str, token: &str) -> GithubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(PER_CALL_TIMEOUT_SECS))
            .user_agent("octomon")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> GithubResult<T> {
        self.with_retry(path, || async {
            let response = self
                .http
                .get(self.url(path))
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await?;
            decode(path, response).await
        })
        .await
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> GithubResult<T> {
        self.with_retry(path, || async {
            let response = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json")
                .json(body)
                .send()
                .await?;
            decode(path, response).await
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, context: &str, call: F) -> GithubResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = GithubResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        context,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient GitHub error, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Repositories / pulls ────────────────────────────────────

    pub async fn get_repo(&self, repo: &str) -> GithubResult<Repo> {
        self.get_json(&format!("/repos/{repo}")).await
    }

    pub async fn get_pull(&self, repo: &str, number: u64) -> GithubResult<PullRequest> {
        self.get_json(&format!("/repos/{repo}/pulls/{number}")).await
    }

    pub async fn list_pull_files(&self, repo: &str, number: u64) -> GithubResult<Vec<PullFile>> {
        self.get_json(&format!("/repos/{repo}/pulls/{number}/files?per_page=100"))
            .await
    }

    // ── Issues / comments / labels ──────────────────────────────

    pub async fn create_issue(&self, repo: &str, title: &str, body: &str) -> GithubResult<Issue> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/repos/{repo}/issues"),
            &json!({"title": title, "body": body}),
        )
        .await
    }

    /// Posts on issues and pull requests alike (the issues comment API).
    pub async fn create_issue_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> GithubResult<Comment> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/repos/{repo}/issues/{number}/comments"),
            &json!({"body": body}),
        )
        .await
    }

    pub async fn list_repo_labels(&self, repo: &str) -> GithubResult<Vec<String>> {
        let labels: Vec<LabelRef> = self
            .get_json(&format!("/repos/{repo}/labels?per_page=100"))
            .await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    pub async fn add_labels(&self, repo: &str, number: u64, labels: &[String]) -> GithubResult<()> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{number}/labels"),
                &json!({"labels": labels}),
            )
            .await?;
        Ok(())
    }

    // ── Branches / contents (assets branch) ─────────────────────

    pub async fn branch_sha(&self, repo: &str, branch: &str) -> GithubResult<String> {
        let git_ref: RefObject = self
            .get_json(&format!("/repos/{repo}/git/ref/heads/{branch}"))
            .await?;
        Ok(git_ref.object.sha)
    }

    pub async fn create_branch(&self, repo: &str, branch: &str, sha: &str) -> GithubResult<()> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{repo}/git/refs"),
                &json!({"ref": format!("refs/heads/{branch}"), "sha": sha}),
            )
            .await?;
        Ok(())
    }

    /// SHA of an existing file on a branch, or None for 404.
    pub async fn content_sha(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> GithubResult<Option<String>> {
        let result: GithubResult<ContentFile> = self
            .get_json(&format!("/repos/{repo}/contents/{path}?ref={branch}"))
            .await;
        match result {
            Ok(file) => Ok(Some(file.sha)),
            Err(GithubError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create or update a file on a branch via the contents API.
    pub async fn put_content(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        bytes: &[u8],
        existing_sha: Option<&str>,
    ) -> GithubResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let mut body = json!({
            "message": message,
            "content": encoded,
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            body["sha"] = json!(sha);
        }
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &format!("/repos/{repo}/contents/{path}"),
                &body,
            )
            .await?;
        Ok(())
    }

    /// Plain download (image URLs live outside the API host; no auth sent).
    pub async fn download(&self, url: &str) -> GithubResult<Vec<u8>> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::Status {
                status: status.as_u16(),
                context: url.to_owned(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    context: &str,
    response: reqwest::Response,
) -> GithubResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(GithubError::Status {
            status: status.as_u16(),
            context: context.to_owned(),
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GithubError::Decode(format!("{context}: {e}")))
}

fn backoff_delay(attempt: u32) -> Duration {
    // 1s, 4s, 16s base with +-30% jitter.
    let base_secs = 4u64.saturating_pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(0.7..1.3);
    Duration::from_millis((base_secs as f64 * 1000.0 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let server_error = GithubError::Status {
            status: 502,
            context: "x".into(),
        };
        let rate_limited = GithubError::Status {
            status: 429,
            context: "x".into(),
        };
        let not_found = GithubError::Status {
            status: 404,
            context: "x".into(),
        };
        let forbidden = GithubError::Status {
            status: 403,
            context: "x".into(),
        };
        assert!(server_error.is_transient());
        assert!(rate_limited.is_transient());
        assert!(!not_found.is_transient());
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let first = backoff_delay(1);
        let second = backoff_delay(2);
        let third = backoff_delay(3);
        assert!(first >= Duration::from_millis(700) && first <= Duration::from_millis(1300));
        assert!(second >= Duration::from_millis(2800) && second <= Duration::from_millis(5200));
        assert!(third >= Duration::from_millis(11_200) && third <= Duration::from_millis(20_800));
    }

    #[test]
    fn url_building_strips_trailing_slash() {
        let client = GithubClient::new("https://api.github.com/", "t").unwrap();
        assert_eq!(
            client.url("/repos/Acme/foo"),
            "https://api.github.com/repos/Acme/foo"
        );
    }
}
