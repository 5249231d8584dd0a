use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use git2::Repository;
use tracing::{debug, warn};

use crate::artifact::Release;
use crate::gitrepo::{ops, RepoCache};
use crate::telemetry::RELEASES;

const WALK_INTERVAL: Duration = Duration::from_secs(30);

/// Read-only reporter: periodically walks the GitOps repo head and publishes
/// the latest release per (env, app) as a gauge.
pub struct ReleaseStateWorker {
    repo_cache: Arc<RepoCache>,
}

impl ReleaseStateWorker {
    pub fn new(repo_cache: Arc<RepoCache>) -> Self {
        Self { repo_cache }
    }

    pub async fn run(self) {
        loop {
            if let Err(e) = self.walk() {
                warn!(error=%e, "release state walk failed");
            }
            tokio::time::sleep(WALK_INTERVAL).await;
        }
    }

    /// One pass over the head: refreshes the release gauge for every
    /// `<env>/<app>` pair.
    pub fn walk(&self) -> Result<()> {
        let repo = self.repo_cache.instance_for_read()?;
        RELEASES.reset();
        for (env, app) in env_app_pairs(&repo)? {
            match latest_release(&repo, &env, &app) {
                Ok(Some((sha, time, release))) => {
                    if let Some(release) = release {
                        debug!(%env, %app, artifact_id=%release.artifact_id, triggered_by=%release.triggered_by, "release at head");
                    }
                    RELEASES.with_label_values(&[&env, &app, &sha]).set(time as f64);
                }
                Ok(None) => {}
                Err(e) => warn!(%env, %app, error=%e, "cannot resolve latest release"),
            }
        }
        Ok(())
    }
}

/// The `<env>/<app>` directory pairs present at HEAD.
fn env_app_pairs(repo: &Repository) -> Result<Vec<(String, String)>> {
    let head = repo.head()?.peel_to_tree()?;
    let mut pairs = Vec::new();
    for env_entry in head.iter() {
        let Some(env_name) = env_entry.name() else { continue };
        let Ok(env_tree) = env_entry.to_object(repo).and_then(|o| o.peel_to_tree()) else {
            continue;
        };
        for app_entry in env_tree.iter() {
            if app_entry.kind() != Some(git2::ObjectType::Tree) {
                continue;
            }
            if let Some(app_name) = app_entry.name() {
                pairs.push((env_name.to_string(), app_name.to_string()));
            }
        }
    }
    Ok(pairs)
}

/// The most recent commit touching `<env>/<app>`, with the release trailer
/// parsed out of its message when one is embedded.
fn latest_release(
    repo: &Repository,
    env: &str,
    app: &str,
) -> Result<Option<(String, i64, Option<Release>)>> {
    let prefix = format!("{env}/{app}");
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    for oid in walk {
        let commit = repo.find_commit(oid?)?;
        if !ops::commit_touches_path(repo, &commit, &prefix)? {
            continue;
        }
        let release = commit
            .message()
            .and_then(|m| m.lines().last())
            .filter(|line| line.starts_with('{'))
            .and_then(|line| serde_json::from_str::<Release>(line).ok());
        return Ok(Some((commit.id().to_string(), commit.time().seconds(), release)));
    }
    Ok(None)
}
