use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::message::CommitStatus;
use super::{Message, Provider};
use crate::scm::TokenManager;

/// Pushes commit statuses to the git host. Before posting it lists the
/// commit's existing statuses and skips identical ones, so re-processed
/// events do not spam the status timeline.
pub struct CommitStatusProvider {
    token_manager: Arc<dyn TokenManager>,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Deserialize, Debug)]
struct ExistingStatus {
    context: Option<String>,
    state: Option<String>,
    description: Option<String>,
}

impl CommitStatusProvider {
    pub fn new(token_manager: Arc<dyn TokenManager>, api_base: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("gitopsd")
            .build()
            .map_err(|e| anyhow!("cannot build http client {}", e))?;
        Ok(Self { token_manager, api_base, http })
    }

    async fn post(&self, owner: &str, repo: &str, sha: &str, status: &CommitStatus) -> Result<()> {
        let (token, _) = self.token_manager.token().await?;

        let list_url = format!(
            "{}/repos/{}/{}/commits/{}/statuses?per_page=50",
            self.api_base, owner, repo, sha
        );
        let existing: Vec<ExistingStatus> = self
            .http
            .get(&list_url)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| anyhow!("could not list commit statuses: {}", e))?
            .json()
            .await?;
        if status_exists(&existing, status) {
            return Ok(());
        }

        let create_url = format!("{}/repos/{}/{}/statuses/{}", self.api_base, owner, repo, sha);
        let mut body = json!({
            "state": status.state,
            "context": status.context,
            "description": status.description,
        });
        if !status.target_url.is_empty() {
            body["target_url"] = json!(status.target_url);
        }
        self.http
            .post(&create_url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| anyhow!("could not create commit status: {}", e))?;
        Ok(())
    }
}

/// The newest status per context wins: an identical `(context, state,
/// description)` tuple means nothing to do, while the same context with a
/// different state or description means the status moved on and an update
/// must be posted.
fn status_exists(existing: &[ExistingStatus], status: &CommitStatus) -> bool {
    for s in existing {
        if s.context.as_deref() == Some(status.context.as_str()) {
            return s.state.as_deref() == Some(status.state.as_str())
                && s.description.as_deref() == Some(status.description.as_str());
        }
    }
    false
}

#[async_trait]
impl Provider for CommitStatusProvider {
    fn name(&self) -> &'static str {
        "commit-status"
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let Some(status) = msg.as_commit_status() else {
            return Ok(());
        };
        let sha = msg.sha();
        if sha.is_empty() {
            return Ok(());
        }

        let repository = msg.repository_name();
        let parts: Vec<&str> = repository.split('/').collect();
        let [owner, repo] = parts.as_slice() else {
            bail!("cannot determine repo owner and name");
        };

        self.post(owner, repo, sha, &status).await
    }
}
