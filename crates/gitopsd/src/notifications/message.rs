use serde_json::json;

use crate::worker::outcome::{DeleteOutcome, DeployOutcome, OutcomeStatus, RollbackOutcome};

/// A notification about a release-pipeline outcome. Tagged by event kind;
/// each kind knows its chat rendering and its commit-status rendering (or
/// that it has none).
#[derive(Debug, Clone)]
pub enum Message {
    Deploy(DeployOutcome),
    Rollback(RollbackOutcome),
    Delete(DeleteOutcome),
}

/// Chat rendering: markdown text plus the block payload chat APIs take.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub blocks: serde_json::Value,
}

/// Commit-status rendering in the git-host REST shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitStatus {
    pub context: String,
    pub state: String,
    pub description: String,
    pub target_url: String,
}

impl Message {
    /// The `owner/name` of the application repository this message is about.
    pub fn repository_name(&self) -> &str {
        match self {
            Message::Deploy(d) => &d.version.repository_name,
            Message::Rollback(_) => "",
            Message::Delete(d) => &d.repository,
        }
    }

    pub fn sha(&self) -> &str {
        match self {
            Message::Deploy(d) => &d.version.sha,
            _ => "",
        }
    }

    pub fn env(&self) -> &str {
        match self {
            Message::Deploy(d) => &d.manifest.env,
            Message::Rollback(r) => &r.request.env,
            Message::Delete(d) => &d.env,
        }
    }

    pub fn as_chat_message(&self) -> Option<ChatMessage> {
        let text = match self {
            Message::Deploy(d) => match d.status {
                OutcomeStatus::Success => format!(
                    ":rocket: *{}* deployed to *{}* from {} by {}",
                    d.manifest.app,
                    d.manifest.env,
                    short_sha(&d.version.sha),
                    d.triggered_by
                ),
                OutcomeStatus::Failure => format!(
                    ":exclamation: *{}* deploy to *{}* failed: {}",
                    d.manifest.app, d.manifest.env, d.status_desc
                ),
            },
            Message::Rollback(r) => match r.status {
                OutcomeStatus::Success => format!(
                    ":arrow_backward: *{}* in *{}* rolled back to {} by {}",
                    r.request.app,
                    r.request.env,
                    short_sha(&r.request.target_sha),
                    r.request.triggered_by
                ),
                OutcomeStatus::Failure => format!(
                    ":exclamation: rollback of *{}* in *{}* failed: {}",
                    r.request.app, r.request.env, r.status_desc
                ),
            },
            Message::Delete(d) => match d.status {
                OutcomeStatus::Success => format!(
                    ":wastebasket: *{}/{}* removed, branch `{}` was deleted",
                    d.env, d.app, d.branch
                ),
                OutcomeStatus::Failure => format!(
                    ":exclamation: removing *{}/{}* failed: {}",
                    d.env, d.app, d.status_desc
                ),
            },
        };
        let blocks = json!([
            {"type": "section", "text": {"type": "mrkdwn", "text": text}}
        ]);
        Some(ChatMessage { text, blocks })
    }

    /// Only deploys map onto a commit status; rollbacks and deletes have no
    /// single app-repo commit to annotate.
    pub fn as_commit_status(&self) -> Option<CommitStatus> {
        match self {
            Message::Deploy(d) => {
                let state = match d.status {
                    OutcomeStatus::Success => "success",
                    OutcomeStatus::Failure => "failure",
                };
                let description = match d.status {
                    OutcomeStatus::Success => format!("deployed to {}", d.manifest.env),
                    // commit status descriptions are capped by the git host
                    OutcomeStatus::Failure => truncate(&d.status_desc, 140),
                };
                Some(CommitStatus {
                    context: format!("gitops/{}", d.manifest.env),
                    state: state.to_string(),
                    description,
                    target_url: String::new(),
                })
            }
            _ => None,
        }
    }
}

fn short_sha(sha: &str) -> &str {
    if sha.len() >= 8 {
        &sha[..8]
    } else {
        sha
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
