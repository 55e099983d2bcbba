//! Typed GitHub webhook payloads.
//!
//! Only the subset of each event the services actually use is modeled;
//! unknown keys are ignored by serde. A payload missing a required key fails
//! to parse, which callers log and answer as an ignored event rather than an
//! error back to GitHub.

use serde::Deserialize;

/// The `X-GitHub-Event` values the system handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ping,
    PullRequest,
    Issues,
    IssueComment,
    Other,
}

impl EventKind {
    pub fn from_header(value: &str) -> Self {
        match value {
            "ping" => Self::Ping,
            "pull_request" => Self::PullRequest,
            "issues" => Self::Issues,
            "issue_comment" => Self::IssueComment,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref", default)]
    pub name: String,
}

// ── pull_request ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    #[serde(default)]
    pub action: String,
    pub pull_request: PullRequestPayload,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
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
    pub user: Account,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub base: BranchRef,
    #[serde(default)]
    pub head: BranchRef,
}

impl PullRequestPayload {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

// ── issues ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct IssuesEvent {
    #[serde(default)]
    pub action: String,
    pub issue: IssuePayload,
    pub repository: Repository,
    #[serde(default)]
    pub sender: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Account,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl IssuePayload {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

// ── issue_comment ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    #[serde(default)]
    pub action: String,
    pub comment: CommentPayload,
    pub issue: IssuePayload,
    pub repository: Repository,
    #[serde(default)]
    pub sender: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentPayload {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Account,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_from_header() {
        assert_eq!(EventKind::from_header("ping"), EventKind::Ping);
        assert_eq!(EventKind::from_header("pull_request"), EventKind::PullRequest);
        assert_eq!(EventKind::from_header("issues"), EventKind::Issues);
        assert_eq!(EventKind::from_header("issue_comment"), EventKind::IssueComment);
        assert_eq!(EventKind::from_header("workflow_run"), EventKind::Other);
    }

    #[test]
    fn parses_pull_request_event_with_unknown_keys() {
        let raw = serde_json::json!({
            "action": "opened",
            "number": 42,
            "pull_request": {
                "number": 42,
                "title": "Fix the frobnicator",
                "body": null,
                "html_url": "https://github.com/Acme/foo/pull/42",
                "draft": false,
                "user": {"login": "alice", "id": 9},
                "labels": [{"name": "bug", "color": "ff0000"}],
                "base": {"ref": "main", "sha": "abc"},
                "head": {"ref": "fix/frob", "sha": "def"},
                "mergeable": true
            },
            "repository": {"full_name": "Acme/foo", "default_branch": "main"},
            "sender": {"login": "alice"}
        });
        let event: PullRequestEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.action, "opened");
        assert_eq!(event.pull_request.number, 42);
        assert_eq!(event.pull_request.user.login, "alice");
        assert!(event.pull_request.has_label("bug"));
        assert!(!event.pull_request.has_label("auto-reviewed"));
        assert_eq!(event.pull_request.base.name, "main");
    }

    #[test]
    fn missing_required_key_is_an_error() {
        // No `repository` — the handler logs and ignores this delivery.
        let raw = serde_json::json!({
            "action": "opened",
            "issue": {"number": 1}
        });
        assert!(serde_json::from_value::<IssuesEvent>(raw).is_err());
    }

    #[test]
    fn parses_issue_comment_event() {
        let raw = serde_json::json!({
            "action": "created",
            "comment": {
                "id": 999,
                "body": "looks wrong to me",
                "html_url": "https://github.com/Acme/src/issues/100#issuecomment-999",
                "user": {"login": "bob"}
            },
            "issue": {
                "number": 100,
                "title": "Boot failure",
                "html_url": "https://github.com/Acme/src/issues/100",
                "labels": []
            },
            "repository": {"full_name": "Acme/src"},
            "sender": {"login": "bob"}
        });
        let event: IssueCommentEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.comment.id, 999);
        assert_eq!(event.issue.number, 100);
        assert_eq!(event.sender.login, "bob");
    }
}
