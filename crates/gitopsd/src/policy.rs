use glob::Pattern;

use crate::artifact::{Artifact, GitEvent};
use crate::manifest::{Cleanup, Deploy};

/// Decides whether an artifact should be released to an environment.
///
/// A policy with no branch, no tag, and no event never matches. Branch
/// policies only apply to push/pr builds, tag policies only to tag builds.
pub fn deploy_trigger(artifact: &Artifact, deploy: Option<&Deploy>) -> bool {
    let Some(policy) = deploy else {
        return false;
    };

    if policy.branch.is_empty() && policy.tag.is_empty() && policy.event.is_none() {
        return false;
    }

    if !policy.branch.is_empty()
        && !matches!(policy.event, Some(GitEvent::Push) | Some(GitEvent::Pr))
    {
        return false;
    }

    if !policy.tag.is_empty() && policy.event != Some(GitEvent::Tag) {
        return false;
    }

    if !policy.tag.is_empty() && !pattern_matches(&policy.tag, &artifact.version.tag) {
        return false;
    }

    if !policy.branch.is_empty() && !pattern_matches(&policy.branch, &artifact.version.branch) {
        return false;
    }

    if let Some(event) = policy.event {
        if event != artifact.version.event {
            return false;
        }
    }

    true
}

/// Decides whether a deleted branch should remove its preview app. Requires
/// both the target app and a branch pattern on the policy.
pub fn cleanup_trigger(branch: &str, cleanup: Option<&Cleanup>) -> bool {
    let Some(policy) = cleanup else {
        return false;
    };

    if policy.branch.is_empty() || policy.app.is_empty() {
        return false;
    }

    pattern_matches(&policy.branch, branch)
}

/// Shell-style glob match with optional leading `!` negation: strip the
/// negation, match by exact equality or glob, then apply negate XOR match.
fn pattern_matches(policy_pattern: &str, value: &str) -> bool {
    let (negate, pattern) = match policy_pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, policy_pattern),
    };

    let glob_match = Pattern::new(pattern).map(|p| p.matches(value)).unwrap_or(false);
    let matched = pattern == value || glob_match;

    negate != matched
}
