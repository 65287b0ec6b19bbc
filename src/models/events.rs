use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

// ─── Event Vocabulary ─────────────────────────────────

/// The sealed set of event kinds a subscription can select.
///
/// Each kind maps a user-facing short name ("pr", "commits", …) to the
/// upstream webhook event name and the polled feed type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Pr,
    Issues,
    Commits,
    Releases,
    Ci,
    Comments,
    Reviews,
    Branches,
    /// Polling feed only; GitHub does not route these to App webhooks
    /// with our event filter.
    ReviewComments,
    Stars,
    Forks,
}

/// The literal "all" in a stored event_types list stands for every kind.
pub const ALL_EVENTS: &str = "all";

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::Pr,
        EventKind::Issues,
        EventKind::Commits,
        EventKind::Releases,
        EventKind::Ci,
        EventKind::Comments,
        EventKind::Reviews,
        EventKind::Branches,
        EventKind::ReviewComments,
        EventKind::Stars,
        EventKind::Forks,
    ];

    pub fn short_name(self) -> &'static str {
        match self {
            EventKind::Pr => "pr",
            EventKind::Issues => "issues",
            EventKind::Commits => "commits",
            EventKind::Releases => "releases",
            EventKind::Ci => "ci",
            EventKind::Comments => "comments",
            EventKind::Reviews => "reviews",
            EventKind::Branches => "branches",
            EventKind::ReviewComments => "review_comments",
            EventKind::Stars => "stars",
            EventKind::Forks => "forks",
        }
    }

    pub fn from_short_name(name: &str) -> Option<EventKind> {
        match name {
            "pr" => Some(EventKind::Pr),
            "issues" => Some(EventKind::Issues),
            "commits" => Some(EventKind::Commits),
            "releases" => Some(EventKind::Releases),
            "ci" => Some(EventKind::Ci),
            "comments" => Some(EventKind::Comments),
            "reviews" => Some(EventKind::Reviews),
            "branches" => Some(EventKind::Branches),
            "review_comments" => Some(EventKind::ReviewComments),
            "stars" => Some(EventKind::Stars),
            "forks" => Some(EventKind::Forks),
            _ => None,
        }
    }

    /// Map an X-GitHub-Event header value to a kind.
    pub fn from_webhook(event: &str) -> Option<EventKind> {
        match event {
            "pull_request" => Some(EventKind::Pr),
            "issues" => Some(EventKind::Issues),
            "push" => Some(EventKind::Commits),
            "release" => Some(EventKind::Releases),
            "workflow_run" => Some(EventKind::Ci),
            "issue_comment" => Some(EventKind::Comments),
            "pull_request_review" => Some(EventKind::Reviews),
            "create" | "delete" => Some(EventKind::Branches),
            "fork" => Some(EventKind::Forks),
            "watch" => Some(EventKind::Stars),
            _ => None,
        }
    }

    /// Map a polled events-feed `type` field to a kind.
    pub fn from_feed_type(feed_type: &str) -> Option<EventKind> {
        match feed_type {
            "PullRequestEvent" => Some(EventKind::Pr),
            "IssuesEvent" => Some(EventKind::Issues),
            "PushEvent" => Some(EventKind::Commits),
            "ReleaseEvent" => Some(EventKind::Releases),
            "WorkflowRunEvent" => Some(EventKind::Ci),
            "IssueCommentEvent" => Some(EventKind::Comments),
            "PullRequestReviewEvent" => Some(EventKind::Reviews),
            "PullRequestReviewCommentEvent" => Some(EventKind::ReviewComments),
            "CreateEvent" | "DeleteEvent" => Some(EventKind::Branches),
            "ForkEvent" => Some(EventKind::Forks),
            "WatchEvent" => Some(EventKind::Stars),
            _ => None,
        }
    }
}

// ─── Validated Event Envelope ─────────────────────────

/// A webhook or feed payload that passed shape validation, normalized to the
/// webhook field layout so the renderers and filters have a single input
/// shape. Malformed payloads are dropped at construction.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub repo_full_name: String,
    /// Set only for branch-bearing events (push, branch create/delete,
    /// workflow_run); tag create/delete carries None and bypasses the
    /// branch filter.
    pub branch: Option<String>,
    /// The repository's default branch when the payload carries it
    /// (webhook payloads do, feed events don't).
    pub default_branch: Option<String>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Build from a webhook delivery. Returns None when the event name is
    /// outside the vocabulary or the payload is missing the fields the
    /// renderer for that kind relies on.
    pub fn from_webhook(event_name: &str, body: &Value) -> Option<EventEnvelope> {
        let kind = EventKind::from_webhook(event_name)?;
        let repo_full_name = body["repository"]["full_name"].as_str()?.to_string();

        if !payload_shape_ok(kind, body) {
            return None;
        }

        let mut payload = body.clone();
        // create/delete webhook payloads carry no action field; normalize so
        // the renderer doesn't have to guess the verb from payload shape.
        if kind == EventKind::Branches && payload["action"].is_null() {
            payload["action"] = Value::String(
                if event_name == "delete" { "deleted" } else { "created" }.to_string(),
            );
        }

        Some(EventEnvelope {
            kind,
            repo_full_name,
            branch: extract_branch(kind, &payload),
            default_branch: payload["repository"]["default_branch"]
                .as_str()
                .map(String::from),
            payload,
        })
    }

    /// Build from one entry of the polled events feed. The feed nests the
    /// event body under `payload` and reports the actor separately; both are
    /// folded into the webhook layout here.
    pub fn from_feed(event: &FeedEvent) -> Option<EventEnvelope> {
        let kind = EventKind::from_feed_type(&event.event_type)?;
        let repo_full_name = event.repo.as_ref()?.name.clone();

        let mut payload = event.payload.clone();
        if !payload.is_object() {
            return None;
        }
        if let Some(actor) = &event.actor {
            payload["sender"] = serde_json::json!({ "login": actor.login });
        }
        if kind == EventKind::Branches && payload["action"].is_null() {
            payload["action"] = Value::String(
                if event.event_type == "DeleteEvent" {
                    "deleted"
                } else {
                    "created"
                }
                .to_string(),
            );
        }

        if !payload_shape_ok(kind, &payload) {
            return None;
        }

        Some(EventEnvelope {
            kind,
            repo_full_name,
            branch: extract_branch(kind, &payload),
            default_branch: None,
            payload,
        })
    }

    pub fn actor(&self) -> &str {
        self.payload["sender"]["login"].as_str().unwrap_or("someone")
    }

    pub fn action(&self) -> &str {
        self.payload["action"].as_str().unwrap_or("")
    }
}

/// Kind-specific required fields; everything else the renderers tolerate.
fn payload_shape_ok(kind: EventKind, payload: &Value) -> bool {
    match kind {
        EventKind::Pr => payload["pull_request"]["number"].is_u64(),
        EventKind::Issues => payload["issue"]["number"].is_u64(),
        EventKind::Commits => payload["ref"].is_string() && payload["commits"].is_array(),
        EventKind::Releases => payload["release"].is_object(),
        EventKind::Ci => payload["workflow_run"].is_object(),
        EventKind::Comments => {
            payload["comment"].is_object() && payload["issue"]["number"].is_u64()
        }
        EventKind::Reviews => {
            payload["review"].is_object() && payload["pull_request"]["number"].is_u64()
        }
        EventKind::ReviewComments => {
            payload["comment"].is_object() && payload["pull_request"]["number"].is_u64()
        }
        EventKind::Branches => payload["ref"].is_string() && payload["ref_type"].is_string(),
        EventKind::Stars | EventKind::Forks => true,
    }
}

fn extract_branch(kind: EventKind, payload: &Value) -> Option<String> {
    match kind {
        EventKind::Commits => payload["ref"]
            .as_str()
            .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r).to_string()),
        EventKind::Branches => {
            if payload["ref_type"].as_str() == Some("branch") {
                payload["ref"].as_str().map(String::from)
            } else {
                None
            }
        }
        EventKind::Ci => payload["workflow_run"]["head_branch"]
            .as_str()
            .map(String::from),
        _ => None,
    }
}

// ─── Polled Feed Page ─────────────────────────────────

/// One entry of `GET /repos/{owner}/{repo}/events`, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: Option<FeedActor>,
    pub repo: Option<FeedRepo>,
    #[serde(default)]
    pub payload: Value,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedActor {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRepo {
    /// "owner/repo"
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vocabulary_round_trips() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_short_name(kind.short_name()), Some(kind));
        }
        assert_eq!(EventKind::from_short_name("all"), None);
        assert_eq!(EventKind::from_short_name("nope"), None);
    }

    #[test]
    fn webhook_names_map_to_kinds() {
        assert_eq!(EventKind::from_webhook("pull_request"), Some(EventKind::Pr));
        assert_eq!(EventKind::from_webhook("push"), Some(EventKind::Commits));
        assert_eq!(EventKind::from_webhook("create"), Some(EventKind::Branches));
        assert_eq!(EventKind::from_webhook("delete"), Some(EventKind::Branches));
        assert_eq!(EventKind::from_webhook("watch"), Some(EventKind::Stars));
        assert_eq!(EventKind::from_webhook("ping"), None);
        assert_eq!(EventKind::from_webhook("installation"), None);
    }

    #[test]
    fn feed_types_map_to_kinds() {
        assert_eq!(
            EventKind::from_feed_type("PullRequestReviewCommentEvent"),
            Some(EventKind::ReviewComments)
        );
        assert_eq!(EventKind::from_feed_type("PushEvent"), Some(EventKind::Commits));
        assert_eq!(EventKind::from_feed_type("GollumEvent"), None);
    }

    #[test]
    fn push_envelope_extracts_branch() {
        let body = json!({
            "ref": "refs/heads/release/v1",
            "commits": [{"id": "abc123", "message": "fix"}],
            "repository": {"full_name": "acme/widget", "default_branch": "main"},
            "sender": {"login": "octocat"}
        });
        let env = EventEnvelope::from_webhook("push", &body).unwrap();
        assert_eq!(env.kind, EventKind::Commits);
        assert_eq!(env.branch.as_deref(), Some("release/v1"));
        assert_eq!(env.default_branch.as_deref(), Some("main"));
        assert_eq!(env.actor(), "octocat");
    }

    #[test]
    fn tag_create_has_no_branch() {
        let body = json!({
            "ref": "v1.0.0",
            "ref_type": "tag",
            "repository": {"full_name": "acme/widget"}
        });
        let env = EventEnvelope::from_webhook("create", &body).unwrap();
        assert_eq!(env.kind, EventKind::Branches);
        assert_eq!(env.branch, None);
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let body = json!({
            "repository": {"full_name": "acme/widget"},
            "pull_request": {"number": "not-a-number"}
        });
        assert!(EventEnvelope::from_webhook("pull_request", &body).is_none());
        assert!(EventEnvelope::from_webhook("deployment", &json!({})).is_none());
    }

    #[test]
    fn feed_event_folds_actor_into_payload() {
        let feed: FeedEvent = serde_json::from_value(json!({
            "id": "987654",
            "type": "WatchEvent",
            "actor": {"login": "stargazer"},
            "repo": {"name": "acme/widget"},
            "payload": {"action": "started"},
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let env = EventEnvelope::from_feed(&feed).unwrap();
        assert_eq!(env.kind, EventKind::Stars);
        assert_eq!(env.actor(), "stargazer");
        assert_eq!(env.repo_full_name, "acme/widget");
    }
}
