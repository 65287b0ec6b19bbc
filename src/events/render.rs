//! Pure renderers: one validated event envelope in, one chat message out.
//!
//! Returning None means the event is real but not worth a message (noisy
//! pull_request actions like `synchronize`, unfinished workflow runs, …).

use serde_json::Value;

use crate::models::events::{EventEnvelope, EventKind};

const MAX_COMMITS_SHOWN: usize = 5;
const MAX_BODY_CHARS: usize = 200;

pub fn render(envelope: &EventEnvelope) -> Option<String> {
    let repo = &envelope.repo_full_name;
    let payload = &envelope.payload;
    match envelope.kind {
        EventKind::Pr => render_pull_request(repo, payload),
        EventKind::Issues => render_issue(repo, payload),
        EventKind::Commits => render_push(repo, envelope.branch.as_deref(), payload),
        EventKind::Releases => render_release(repo, payload),
        EventKind::Ci => render_workflow_run(repo, payload),
        EventKind::Comments => render_issue_comment(repo, payload),
        EventKind::Reviews => render_review(repo, payload),
        EventKind::ReviewComments => render_review_comment(repo, payload),
        EventKind::Branches => render_ref_change(repo, payload),
        EventKind::Stars => render_star(repo, payload),
        EventKind::Forks => render_fork(repo, payload),
    }
}

fn render_pull_request(repo: &str, payload: &Value) -> Option<String> {
    let pr = &payload["pull_request"];
    let number = pr["number"].as_u64()?;
    let title = pr["title"].as_str().unwrap_or("(untitled)");
    let url = pr["html_url"].as_str().unwrap_or("");
    let author = pr["user"]["login"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");

    let verb = match payload["action"].as_str().unwrap_or("") {
        "opened" => "opened",
        "reopened" => "reopened",
        "ready_for_review" => "marked ready for review",
        "closed" if pr["merged"].as_bool() == Some(true) => "merged",
        "closed" => "closed",
        _ => return None,
    };

    Some(format!(
        "🔀 **{}**: pull request [#{} {}]({}) {} by {}",
        repo, number, title, url, verb, author
    ))
}

fn render_issue(repo: &str, payload: &Value) -> Option<String> {
    let issue = &payload["issue"];
    let number = issue["number"].as_u64()?;
    let title = issue["title"].as_str().unwrap_or("(untitled)");
    let url = issue["html_url"].as_str().unwrap_or("");
    let author = issue["user"]["login"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");

    let verb = match payload["action"].as_str().unwrap_or("") {
        "opened" => "opened",
        "reopened" => "reopened",
        "closed" => "closed",
        _ => return None,
    };

    Some(format!(
        "🐛 **{}**: issue [#{} {}]({}) {} by {}",
        repo, number, title, url, verb, author
    ))
}

fn render_push(repo: &str, branch: Option<&str>, payload: &Value) -> Option<String> {
    let commits = payload["commits"].as_array()?;
    if commits.is_empty() {
        return None;
    }
    let branch = branch.unwrap_or("unknown");
    let pusher = payload["pusher"]["name"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");

    let mut message = format!(
        "📦 **{}**: {} new commit{} to `{}` by {}",
        repo,
        commits.len(),
        if commits.len() == 1 { "" } else { "s" },
        branch,
        pusher
    );

    for commit in commits.iter().take(MAX_COMMITS_SHOWN) {
        // webhook payloads use "id", the events feed uses "sha"
        let sha = commit["id"]
            .as_str()
            .or_else(|| commit["sha"].as_str())
            .unwrap_or("");
        let short_sha: String = sha.chars().take(7).collect();
        let subject = commit["message"]
            .as_str()
            .unwrap_or("")
            .lines()
            .next()
            .unwrap_or("");
        message.push_str(&format!("\n• `{}` {}", short_sha, truncate(subject, 80)));
    }
    if commits.len() > MAX_COMMITS_SHOWN {
        message.push_str(&format!("\n… and {} more", commits.len() - MAX_COMMITS_SHOWN));
    }
    if let Some(compare) = payload["compare"].as_str() {
        message.push_str(&format!("\n[Compare changes]({})", compare));
    }
    Some(message)
}

fn render_release(repo: &str, payload: &Value) -> Option<String> {
    if payload["action"].as_str() != Some("published") {
        return None;
    }
    let release = &payload["release"];
    let name = release["name"]
        .as_str()
        .filter(|n| !n.is_empty())
        .or_else(|| release["tag_name"].as_str())
        .unwrap_or("(unnamed)");
    let url = release["html_url"].as_str().unwrap_or("");
    Some(format!(
        "🚀 **{}**: release [{}]({}) published",
        repo, name, url
    ))
}

fn render_workflow_run(repo: &str, payload: &Value) -> Option<String> {
    if payload["action"].as_str() != Some("completed") {
        return None;
    }
    let run = &payload["workflow_run"];
    let name = run["name"].as_str().unwrap_or("workflow");
    let branch = run["head_branch"].as_str().unwrap_or("unknown");
    let url = run["html_url"].as_str().unwrap_or("");
    let (icon, conclusion) = match run["conclusion"].as_str().unwrap_or("") {
        "success" => ("✅", "succeeded"),
        "failure" => ("❌", "failed"),
        "cancelled" => ("⚪", "was cancelled"),
        "timed_out" => ("❌", "timed out"),
        _ => return None,
    };
    Some(format!(
        "{} **{}**: workflow [{}]({}) {} on `{}`",
        icon, repo, name, url, conclusion, branch
    ))
}

fn render_issue_comment(repo: &str, payload: &Value) -> Option<String> {
    if payload["action"].as_str() != Some("created") {
        return None;
    }
    let issue = &payload["issue"];
    let comment = &payload["comment"];
    let number = issue["number"].as_u64()?;
    let title = issue["title"].as_str().unwrap_or("(untitled)");
    let url = comment["html_url"].as_str().unwrap_or("");
    let author = comment["user"]["login"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");
    let body = truncate(comment["body"].as_str().unwrap_or(""), MAX_BODY_CHARS);
    Some(format!(
        "💬 **{}**: {} [commented]({}) on #{} {}\n> {}",
        repo, author, url, number, title, body
    ))
}

fn render_review(repo: &str, payload: &Value) -> Option<String> {
    if payload["action"].as_str() != Some("submitted") {
        return None;
    }
    let review = &payload["review"];
    let pr = &payload["pull_request"];
    let number = pr["number"].as_u64()?;
    let title = pr["title"].as_str().unwrap_or("(untitled)");
    let url = review["html_url"]
        .as_str()
        .or_else(|| pr["html_url"].as_str())
        .unwrap_or("");
    let reviewer = review["user"]["login"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");
    let verdict = match review["state"].as_str().unwrap_or("") {
        "approved" => "approved",
        "changes_requested" => "requested changes on",
        "commented" => "commented on",
        _ => return None,
    };
    Some(format!(
        "👀 **{}**: {} [{}]({}) pull request #{} {}",
        repo, reviewer, verdict, url, number, title
    ))
}

fn render_review_comment(repo: &str, payload: &Value) -> Option<String> {
    if payload["action"].as_str() != Some("created") {
        return None;
    }
    let pr = &payload["pull_request"];
    let comment = &payload["comment"];
    let number = pr["number"].as_u64()?;
    let url = comment["html_url"].as_str().unwrap_or("");
    let author = comment["user"]["login"]
        .as_str()
        .or_else(|| payload["sender"]["login"].as_str())
        .unwrap_or("someone");
    let body = truncate(comment["body"].as_str().unwrap_or(""), MAX_BODY_CHARS);
    Some(format!(
        "💬 **{}**: {} left a [review comment]({}) on #{}\n> {}",
        repo, author, url, number, body
    ))
}

fn render_ref_change(repo: &str, payload: &Value) -> Option<String> {
    let ref_name = payload["ref"].as_str()?;
    let ref_type = payload["ref_type"].as_str()?;
    let actor = payload["sender"]["login"].as_str().unwrap_or("someone");
    // the envelope normalizes the missing action field to created/deleted
    let verb = match payload["action"].as_str().unwrap_or("created") {
        "deleted" => "deleted",
        _ => "created",
    };
    Some(format!(
        "🌿 **{}**: {} `{}` {} by {}",
        repo, ref_type, ref_name, verb, actor
    ))
}

fn render_star(repo: &str, payload: &Value) -> Option<String> {
    let user = payload["sender"]["login"].as_str().unwrap_or("someone");
    Some(format!("⭐ **{}**: starred by {}", repo, user))
}

fn render_fork(repo: &str, payload: &Value) -> Option<String> {
    let forkee = &payload["forkee"];
    let user = payload["sender"]["login"]
        .as_str()
        .or_else(|| forkee["owner"]["login"].as_str())
        .unwrap_or("someone");
    let full = forkee["full_name"].as_str().unwrap_or("a fork");
    let url = forkee["html_url"].as_str().unwrap_or("");
    Some(format!("🍴 **{}**: forked by {} → [{}]({})", repo, user, full, url))
}

/// Char-boundary-safe truncation with an ellipsis.
fn truncate(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (count, ch) in text.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            return out;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: &str, body: serde_json::Value) -> EventEnvelope {
        EventEnvelope::from_webhook(event, &body).expect("envelope should validate")
    }

    #[test]
    fn pull_request_opened_renders() {
        let env = envelope(
            "pull_request",
            json!({
                "action": "opened",
                "repository": {"full_name": "acme/widget"},
                "pull_request": {
                    "number": 7,
                    "title": "Add feature",
                    "html_url": "https://github.com/acme/widget/pull/7",
                    "user": {"login": "octocat"}
                }
            }),
        );
        let message = render(&env).unwrap();
        assert!(message.contains("#7 Add feature"));
        assert!(message.contains("opened by octocat"));
    }

    #[test]
    fn pull_request_synchronize_is_silent() {
        let env = envelope(
            "pull_request",
            json!({
                "action": "synchronize",
                "repository": {"full_name": "acme/widget"},
                "pull_request": {"number": 7}
            }),
        );
        assert!(render(&env).is_none());
    }

    #[test]
    fn merged_pr_says_merged() {
        let env = envelope(
            "pull_request",
            json!({
                "action": "closed",
                "repository": {"full_name": "acme/widget"},
                "pull_request": {"number": 7, "merged": true, "title": "x",
                                 "html_url": "", "user": {"login": "octocat"}}
            }),
        );
        assert!(render(&env).unwrap().contains("merged by octocat"));
    }

    #[test]
    fn push_lists_commits_and_caps_at_five() {
        let commits: Vec<_> = (0..8)
            .map(|i| json!({"id": format!("{:040}", i), "message": format!("commit {}\nbody", i)}))
            .collect();
        let env = envelope(
            "push",
            json!({
                "ref": "refs/heads/main",
                "commits": commits,
                "compare": "https://github.com/acme/widget/compare/a...b",
                "repository": {"full_name": "acme/widget", "default_branch": "main"},
                "pusher": {"name": "octocat"}
            }),
        );
        let message = render(&env).unwrap();
        assert!(message.contains("8 new commits to `main` by octocat"));
        assert!(message.contains("… and 3 more"));
        assert!(message.contains("commit 0"));
        assert!(!message.contains("body"));
        assert!(message.contains("Compare changes"));
    }

    #[test]
    fn workflow_run_only_on_completion() {
        let base = json!({
            "repository": {"full_name": "acme/widget"},
            "workflow_run": {"name": "CI", "head_branch": "main",
                             "html_url": "", "conclusion": "failure"}
        });
        let mut requested = base.clone();
        requested["action"] = json!("requested");
        assert!(render(&envelope("workflow_run", requested)).is_none());

        let mut completed = base;
        completed["action"] = json!("completed");
        let message = render(&envelope("workflow_run", completed)).unwrap();
        assert!(message.starts_with("❌"));
        assert!(message.contains("failed on `main`"));
    }

    #[test]
    fn long_comment_bodies_are_truncated() {
        let env = envelope(
            "issue_comment",
            json!({
                "action": "created",
                "repository": {"full_name": "acme/widget"},
                "issue": {"number": 3, "title": "bug"},
                "comment": {"body": "x".repeat(500), "html_url": "",
                            "user": {"login": "octocat"}}
            }),
        );
        let message = render(&env).unwrap();
        assert!(message.chars().count() < 300);
        assert!(message.ends_with('…'));
    }

    #[test]
    fn star_and_fork_render() {
        let star = envelope(
            "watch",
            json!({
                "action": "started",
                "repository": {"full_name": "acme/widget"},
                "sender": {"login": "fan"}
            }),
        );
        assert_eq!(render(&star).unwrap(), "⭐ **acme/widget**: starred by fan");

        let fork = envelope(
            "fork",
            json!({
                "repository": {"full_name": "acme/widget"},
                "sender": {"login": "fan"},
                "forkee": {"full_name": "fan/widget", "html_url": "https://github.com/fan/widget"}
            }),
        );
        assert!(render(&fork).unwrap().contains("[fan/widget]"));
    }
}
