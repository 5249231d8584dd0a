use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};

use crate::artifact::{Artifact, BranchDeletedEvent, Release, ReleaseRequest, RollbackRequest};
use crate::chart::{self, ChartRenderer};
use crate::gitrepo::{ops, RepoCache, WriteInstance};
use crate::manifest::{Cleanup, Manifest};
use crate::model::{Event, EventStatus, TYPE_ARTIFACT, TYPE_BRANCH_DELETED, TYPE_RELEASE, TYPE_ROLLBACK};
use crate::notifications::{Broadcaster, Message};
use crate::policy::{cleanup_trigger, deploy_trigger};
use crate::store::Store;
use crate::telemetry::EVENTS_PROCESSED;
use crate::worker::outcome::{DeleteOutcome, DeployOutcome, OutcomeStatus, RollbackOutcome};

const PUSH_ATTEMPTS: u32 = 5;

/// The single reactor that turns queued events into GitOps commits. Only
/// this worker mutates the GitOps repo; everything else just enqueues.
pub struct GitopsWorker {
    store: Store,
    gitops_repo: String,
    deploy_key_path: String,
    git_author: (String, String),
    renderer: Arc<dyn ChartRenderer>,
    notifications: Broadcaster,
    repo_cache: Arc<RepoCache>,
}

impl GitopsWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        gitops_repo: String,
        deploy_key_path: String,
        git_author: (String, String),
        renderer: Arc<dyn ChartRenderer>,
        notifications: Broadcaster,
        repo_cache: Arc<RepoCache>,
    ) -> Self {
        Self {
            store,
            gitops_repo,
            deploy_key_path,
            git_author,
            renderer,
            notifications,
            repo_cache,
        }
    }

    pub async fn run(self) {
        loop {
            let events = match self.store.unprocessed_events().await {
                Ok(events) => events,
                Err(e) => {
                    error!(error=%e, "could not fetch unprocessed events");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for event in events {
                EVENTS_PROCESSED.inc();
                self.process_event(&event).await;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Processes one event to a terminal status. A single event may produce
    /// several gitops commits (one per matching environment); every produced
    /// outcome is broadcast and its ref recorded, even when a later
    /// environment fails.
    pub async fn process_event(&self, event: &Event) {
        let mut gitops_hashes: Vec<String> = Vec::new();

        let result = match event.event_type.as_str() {
            TYPE_ARTIFACT => {
                let (outcomes, result) = self.process_artifact_event(event).await;
                for outcome in outcomes {
                    set_gitops_hash(&mut gitops_hashes, &outcome.gitops_ref);
                    self.notifications.broadcast(Message::Deploy(outcome));
                }
                result
            }
            TYPE_RELEASE => {
                let (outcomes, result) = self.process_release_event(event).await;
                for outcome in outcomes {
                    set_gitops_hash(&mut gitops_hashes, &outcome.gitops_ref);
                    self.notifications.broadcast(Message::Deploy(outcome));
                }
                result
            }
            TYPE_ROLLBACK => {
                let (outcome, result) = self.process_rollback_event(event).await;
                for sha in &outcome.gitops_refs {
                    set_gitops_hash(&mut gitops_hashes, sha);
                }
                // a rollback is always announced, failed ones included
                self.notifications.broadcast(Message::Rollback(outcome));
                result
            }
            TYPE_BRANCH_DELETED => {
                let (outcomes, result) = self.process_branch_deleted_event(event).await;
                for outcome in outcomes {
                    set_gitops_hash(&mut gitops_hashes, &outcome.gitops_ref);
                    self.notifications.broadcast(Message::Delete(outcome));
                }
                result
            }
            other => {
                warn!(event_type = other, id=%event.id, "skipping event of unknown type");
                Ok(())
            }
        };

        let hashes_json = serde_json::to_string(&gitops_hashes).unwrap_or_else(|_| "[]".to_string());
        let status_update = match &result {
            Ok(()) => {
                self.store
                    .update_event_status(&event.id, EventStatus::Processed, "", &hashes_json)
                    .await
            }
            Err(e) => {
                error!(id=%event.id, error=%e, "error in processing event");
                self.store
                    .update_event_status(&event.id, EventStatus::Error, &e.to_string(), &hashes_json)
                    .await
            }
        };
        if let Err(e) = status_update {
            warn!(id=%event.id, error=%e, "could not update event status");
        }
    }

    async fn process_artifact_event(&self, event: &Event) -> (Vec<DeployOutcome>, Result<()>) {
        let mut outcomes = Vec::new();
        let artifact = match event.to_artifact() {
            Ok(artifact) => artifact,
            Err(e) => return (outcomes, Err(e)),
        };

        if artifact.has_cleanup_policy() {
            self.keep_repos_with_cleanup_policy_up_to_date(&artifact).await;
        }

        for env in &artifact.environments {
            if !deploy_trigger(&artifact, env.deploy.as_ref()) {
                continue;
            }

            let (outcome, result) = self.clone_template_write_and_push(&artifact, env, "policy").await;
            outcomes.push(outcome);
            if result.is_err() {
                return (outcomes, result);
            }
        }

        (outcomes, Ok(()))
    }

    async fn process_release_event(&self, event: &Event) -> (Vec<DeployOutcome>, Result<()>) {
        let mut outcomes = Vec::new();
        let request: ReleaseRequest = match serde_json::from_str(&event.blob) {
            Ok(request) => request,
            Err(_) => {
                return (outcomes, Err(anyhow!("cannot parse release request with id: {}", event.id)))
            }
        };

        let artifact_event = match self.store.artifact(&request.artifact_id).await {
            Ok(e) => e,
            Err(_) => {
                return (
                    outcomes,
                    Err(anyhow!("cannot find artifact with id: {}", request.artifact_id)),
                )
            }
        };
        let artifact = match artifact_event.to_artifact() {
            Ok(artifact) => artifact,
            Err(e) => return (outcomes, Err(e)),
        };

        for env in &artifact.environments {
            if env.env != request.env {
                continue;
            }
            // resolve into a fresh copy: the app filter below compares
            // against the resolved app name
            let mut env = env.clone();
            if let Err(e) = env.resolve_vars(&artifact.vars()) {
                return (outcomes, Err(e));
            }
            if !request.app.is_empty() && env.app != request.app {
                continue;
            }

            let (outcome, result) =
                self.clone_template_write_and_push(&artifact, &env, &request.triggered_by).await;
            outcomes.push(outcome);
            if result.is_err() {
                return (outcomes, result);
            }
        }

        (outcomes, Ok(()))
    }

    async fn process_rollback_event(&self, event: &Event) -> (RollbackOutcome, Result<()>) {
        let request: RollbackRequest = match serde_json::from_str(&event.blob) {
            Ok(request) => request,
            Err(_) => {
                let mut outcome = RollbackOutcome {
                    request: RollbackRequest::default(),
                    status: OutcomeStatus::Failure,
                    status_desc: String::new(),
                    gitops_refs: vec![],
                    gitops_repo: self.gitops_repo.clone(),
                };
                let err = anyhow!("cannot parse release request with id: {}", event.id);
                outcome.fail(err.to_string());
                return (outcome, Err(err));
            }
        };

        let mut outcome = RollbackOutcome {
            request: request.clone(),
            status: OutcomeStatus::Success,
            status_desc: String::new(),
            gitops_refs: vec![],
            gitops_repo: self.gitops_repo.clone(),
        };

        let write = match self.repo_cache.instance_for_write() {
            Ok(write) => write,
            Err(e) => {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
        };

        let head_before = match head_sha(&write) {
            Ok(sha) => sha,
            Err(e) => {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
        };

        if let Err(e) = self.revert_to(&request.env, &request.app, &write, &request.target_sha).await {
            outcome.fail(e.to_string());
            return (outcome, Err(e));
        }

        let (hashes, branch) = match since_and_branch(&write, &head_before) {
            Ok(pair) => pair,
            Err(e) => {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
        };

        if let Err(e) = ops::native_push(write.path(), &self.deploy_key_path, &branch).await {
            outcome.fail(e.to_string());
            return (outcome, Err(e));
        }
        self.repo_cache.invalidate();

        outcome.gitops_refs = hashes;
        (outcome, Ok(()))
    }

    /// Synthesizes reverse commits until `target_sha` becomes the effective
    /// state under `<env>/<app>/`. The target commit itself is the new tip
    /// and is not reverted; prior rollback commits and commits that already
    /// have a revert in history are skipped.
    async fn revert_to(
        &self,
        env: &str,
        app: &str,
        write: &WriteInstance,
        target_sha: &str,
    ) -> Result<()> {
        let path_prefix = format!("{env}/{app}");

        let to_revert: Vec<String> = {
            let repo = write.open()?;
            let mut walk = repo.revwalk()?;
            walk.push_head()?;
            let mut commits = Vec::new();
            for oid in walk {
                let oid = oid?;
                let commit = repo.find_commit(oid)?;
                if !ops::commit_touches_path(&repo, &commit, &path_prefix)? {
                    continue;
                }
                if oid.to_string() == target_sha {
                    break;
                }
                if !ops::is_rollback_commit(&commit) {
                    commits.push(oid.to_string());
                }
            }
            let mut fresh = Vec::new();
            for sha in commits {
                if !ops::has_been_reverted(&repo, &sha)? {
                    fresh.push(sha);
                }
            }
            fresh
        };

        for sha in to_revert {
            info!(%sha, "reverting");
            ops::native_revert(write.path(), &sha, self.author())
                .await
                .map_err(|e| anyhow!("could not revert: {}", e))?;
        }
        Ok(())
    }

    async fn process_branch_deleted_event(&self, event: &Event) -> (Vec<DeleteOutcome>, Result<()>) {
        let mut outcomes = Vec::new();
        let branch_deleted: BranchDeletedEvent = match serde_json::from_str(&event.blob) {
            Ok(parsed) => parsed,
            Err(_) => {
                return (outcomes, Err(anyhow!("cannot parse delete request with id: {}", event.id)))
            }
        };

        for manifest in &branch_deleted.manifests {
            let Some(cleanup) = &manifest.cleanup else {
                continue;
            };

            let mut cleanup = cleanup.clone();
            let mut outcome = DeleteOutcome {
                env: manifest.env.clone(),
                app: cleanup.app.clone(),
                repository: branch_deleted.repository.clone(),
                branch: branch_deleted.branch.clone(),
                triggered_by: "policy".to_string(),
                status: OutcomeStatus::Success,
                status_desc: String::new(),
                gitops_ref: String::new(),
                gitops_repo: self.gitops_repo.clone(),
            };

            let vars = HashMap::from([("BRANCH".to_string(), branch_deleted.branch.clone())]);
            if let Err(e) = cleanup.resolve_vars(&vars) {
                outcome.fail(e.to_string());
                outcomes.push(outcome);
                return (outcomes, Err(e));
            }
            outcome.app = cleanup.app.clone();

            if !cleanup_trigger(&branch_deleted.branch, Some(&cleanup)) {
                continue;
            }

            let (produced, result) =
                self.clone_template_delete_and_push(&cleanup, &manifest.env, "policy", outcome).await;
            if let Some(produced) = produced {
                outcomes.push(produced);
            }
            if result.is_err() {
                return (outcomes, result);
            }
        }

        (outcomes, Ok(()))
    }

    /// Removes `<env>/<app>/` from the GitOps repo. Returns no outcome when
    /// the directory was already gone (nothing to commit).
    async fn clone_template_delete_and_push(
        &self,
        cleanup: &Cleanup,
        env: &str,
        triggered_by: &str,
        mut outcome: DeleteOutcome,
    ) -> (Option<DeleteOutcome>, Result<()>) {
        let write = match self.repo_cache.instance_for_write() {
            Ok(write) => write,
            Err(e) => {
                outcome.fail(e.to_string());
                return (Some(outcome), Err(e));
            }
        };

        let committed = {
            let delete_dir = || -> Result<Option<(String, String)>> {
                let repo = write.open()?;
                let path = format!("{}/{}", env, cleanup.app);
                ops::del_dir(&repo, &path)?;
                if ops::nothing_to_commit(&repo)? {
                    return Ok(None);
                }
                let message =
                    format!("[gitopsd delete] {}/{} deleted by {}", env, cleanup.app, triggered_by);
                let sha = ops::commit(&repo, &message, self.author())?;
                let branch = ops::head_branch(&repo)?;
                Ok(Some((sha, branch)))
            };
            match delete_dir() {
                Ok(committed) => committed,
                Err(e) => {
                    outcome.fail(e.to_string());
                    return (Some(outcome), Err(e));
                }
            }
        };
        let Some((sha, branch)) = committed else {
            return (None, Ok(()));
        };

        if !sha.is_empty() {
            if let Err(e) = ops::native_push(write.path(), &self.deploy_key_path, &branch).await {
                outcome.fail(e.to_string());
                return (Some(outcome), Err(e));
            }
            self.repo_cache.invalidate();
            outcome.gitops_ref = sha;
        }

        (Some(outcome), Ok(()))
    }

    /// The full release cycle for one environment: resolve vars, render the
    /// chart, write the files, commit with the release trailer, push with
    /// backoff. An unchanged tree short-circuits with an empty ref.
    pub async fn clone_template_write_and_push(
        &self,
        artifact: &Artifact,
        env: &Manifest,
        triggered_by: &str,
    ) -> (DeployOutcome, Result<()>) {
        let mut outcome = DeployOutcome {
            manifest: env.clone(),
            version: artifact.version.clone(),
            artifact_id: artifact.id.clone(),
            triggered_by: triggered_by.to_string(),
            status: OutcomeStatus::Success,
            status_desc: String::new(),
            gitops_ref: String::new(),
            gitops_repo: self.gitops_repo.clone(),
        };

        let write = match self.repo_cache.instance_for_write() {
            Ok(write) => write,
            Err(e) => {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
        };

        let mut env = env.clone();
        if let Err(e) = env.resolve_vars(&artifact.vars()) {
            let err = anyhow!("cannot resolve manifest vars {}", e);
            outcome.fail(err.to_string());
            return (outcome, Err(err));
        }
        outcome.manifest = env.clone();

        let release = Release {
            app: env.app.clone(),
            env: env.env.clone(),
            artifact_id: artifact.id.clone(),
            version: artifact.version.clone(),
            triggered_by: triggered_by.to_string(),
        };

        let sha = match self.template_and_write(&write, &env, &release).await {
            Ok(sha) => sha,
            Err(e) => {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
        };

        if !sha.is_empty() {
            let branch = match write.open().and_then(|repo| ops::head_branch(&repo)) {
                Ok(branch) => branch,
                Err(e) => {
                    outcome.fail(e.to_string());
                    return (outcome, Err(e));
                }
            };

            let mut pushed = Ok(());
            for attempt in 0..PUSH_ATTEMPTS {
                pushed = ops::native_push(write.path(), &self.deploy_key_path, &branch).await;
                match &pushed {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(attempt, error=%e, "push failed, backing off");
                        if attempt + 1 < PUSH_ATTEMPTS {
                            backoff(attempt).await;
                        }
                    }
                }
            }
            if let Err(e) = pushed {
                outcome.fail(e.to_string());
                return (outcome, Err(e));
            }
            self.repo_cache.invalidate();

            outcome.gitops_ref = sha;
        }

        (outcome, Ok(()))
    }

    async fn template_and_write(
        &self,
        write: &WriteInstance,
        env: &Manifest,
        release: &Release,
    ) -> Result<String> {
        let mut rendered = self.renderer.template(env).await?;

        if !env.strategic_merge_patches.is_empty() {
            rendered = chart::apply_patches(&env.strategic_merge_patches, &rendered)
                .map_err(|e| anyhow!("cannot apply patches to chart {}", e))?;
        }

        let files = chart::split_rendered(&rendered)?;
        let release_json = serde_json::to_string(release)
            .map_err(|e| anyhow!("cannot marshal release meta data {}", e))?;

        let repo = write.open()?;
        ops::commit_files_to_git(
            &repo,
            &files,
            &env.env,
            &env.app,
            "automated deploy",
            &release_json,
            self.author(),
        )
        .map_err(|e| anyhow!("cannot write to git: {}", e))
    }

    /// Membership-additive: repositories are recorded the first time one of
    /// their artifacts declares a cleanup policy and never removed here.
    async fn keep_repos_with_cleanup_policy_up_to_date(&self, artifact: &Artifact) {
        let mut repos = match self.store.repos_with_cleanup_policy().await {
            Ok(repos) => repos,
            Err(e) => {
                warn!(error=%e, "could not load repos with cleanup policy");
                return;
            }
        };

        let repo = &artifact.version.repository_name;
        if repos.iter().any(|r| r == repo) {
            return;
        }
        repos.push(repo.clone());
        if let Err(e) = self.store.save_repos_with_cleanup_policy(&repos).await {
            warn!(error=%e, "could not update repos with cleanup policy");
        }
    }

    fn author(&self) -> (&str, &str) {
        (&self.git_author.0, &self.git_author.1)
    }
}

fn head_sha(write: &WriteInstance) -> Result<String> {
    let repo = write.open()?;
    let head = repo.head()?.peel_to_commit()?;
    Ok(head.id().to_string())
}

fn since_and_branch(write: &WriteInstance, head_before: &str) -> Result<(Vec<String>, String)> {
    let repo = write.open()?;
    let hashes = ops::shas_since(&repo, head_before)?;
    let branch = ops::head_branch(&repo)?;
    Ok((hashes, branch))
}

fn set_gitops_hash(hashes: &mut Vec<String>, sha: &str) {
    if sha.is_empty() {
        return;
    }
    hashes.push(sha.to_string());
}

/// Exponential backoff with jitter; attempt starts at 0.
async fn backoff(attempt: u32) {
    let base = Duration::from_millis(500);
    let exp = base * 2u32.saturating_pow(attempt.min(10));
    let capped = exp.min(Duration::from_secs(10));
    let jitter = fastrand::u64(..(capped.as_millis() as u64 / 3 + 1));
    tokio::time::sleep(capped + Duration::from_millis(jitter)).await;
}
