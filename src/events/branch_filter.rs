//! Branch filter semantics.
//!
//! A subscription's branch_filter selects which branch-bearing events reach
//! the channel: `None` matches only the repository's default branch, `"all"`
//! (or `"*"`) matches any branch, anything else is a comma-separated list of
//! exact names and `*` glob patterns matched against the full branch name.

/// Returns true when `branch` passes `filter`.
///
/// With `filter = None` the default branch must be known; an unknown default
/// (lookup failed upstream) matches nothing rather than everything.
pub fn branch_matches(filter: Option<&str>, branch: &str, default_branch: Option<&str>) -> bool {
    match filter {
        None => default_branch == Some(branch),
        Some("all") | Some("*") => true,
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| pattern_matches(p, branch)),
    }
}

fn pattern_matches(pattern: &str, branch: &str) -> bool {
    if pattern.contains('*') {
        glob_match(pattern, branch)
    } else {
        pattern == branch
    }
}

/// Anchored glob match where `*` spans any character run.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_filter_matches_only_default_branch() {
        assert!(branch_matches(None, "main", Some("main")));
        assert!(!branch_matches(None, "dev", Some("main")));
        assert!(!branch_matches(None, "main", None));
    }

    #[test]
    fn all_matches_anything() {
        assert!(branch_matches(Some("all"), "release/v1", Some("main")));
        assert!(branch_matches(Some("*"), "anything-at-all", None));
    }

    #[test]
    fn literal_components_match_exactly() {
        assert!(branch_matches(Some("main,develop"), "develop", Some("main")));
        assert!(!branch_matches(Some("main,develop"), "dev", Some("main")));
        assert!(!branch_matches(Some("main"), "Main", Some("main")));
    }

    #[test]
    fn glob_components_span_segments() {
        assert!(branch_matches(Some("release/*"), "release/v1", None));
        assert!(branch_matches(Some("release/*"), "release/v1/hotfix", None));
        assert!(!branch_matches(Some("release/*"), "main", None));
        assert!(branch_matches(Some("*-stable"), "v2-stable", None));
        assert!(branch_matches(Some("feat/*/wip"), "feat/login/wip", None));
        assert!(!branch_matches(Some("feat/*/wip"), "feat/login", None));
    }

    #[test]
    fn mixed_list_takes_first_match() {
        let filter = Some("main, release/*, hotfix-*");
        assert!(branch_matches(filter, "main", None));
        assert!(branch_matches(filter, "release/2.0", None));
        assert!(branch_matches(filter, "hotfix-urgent", None));
        assert!(!branch_matches(filter, "develop", None));
    }

    #[test]
    fn empty_components_are_ignored() {
        assert!(branch_matches(Some("main,,"), "main", None));
        assert!(!branch_matches(Some(",,"), "main", None));
    }

    #[test]
    fn star_backtracking() {
        assert!(glob_match("a*b*c", "aXbYbZc"));
        assert!(!glob_match("a*b*c", "aXbY"));
        assert!(glob_match("*", ""));
        assert!(glob_match("**", "x"));
        assert!(!glob_match("a*", "b"));
    }
}
