//! Binary entrypoint for the gitopsd service.
use std::sync::Arc;

use gitopsd::chart::HelmRenderer;
use gitopsd::config::Config;
use gitopsd::gitrepo::RepoCache;
use gitopsd::notifications::{github::CommitStatusProvider, slack::SlackProvider, NotificationsManager};
use gitopsd::scm::{StaticTokenManager, TokenManager};
use gitopsd::store::Store;
use gitopsd::worker::{BranchDeleteWorker, GitopsWorker, ReleaseStateWorker};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = Config::from_env();
    let store = Store::new(&config.database_url).await?;

    let token_manager: Option<Arc<dyn TokenManager>> = if config.scm_token.is_empty() {
        warn!("no SCM token set, deleted branch detection and commit statuses are off");
        None
    } else {
        Some(Arc::new(StaticTokenManager::new(config.scm_token.clone())))
    };

    let mut notifications = NotificationsManager::new();
    if config.notifications.provider == "slack" {
        notifications.add_provider(Box::new(SlackProvider::new(
            config.notifications.token.clone(),
            config.notifications.default_channel.clone(),
            config.notifications.channel_mapping.clone(),
        )?));
    }
    if let Some(tm) = &token_manager {
        notifications.add_provider(Box::new(CommitStatusProvider::new(
            tm.clone(),
            config.scm_base_url.clone(),
        )?));
    }
    let broadcaster = notifications.broadcaster();
    tokio::spawn(notifications.run());

    let repo_cache = RepoCache::new(
        &config.repo_cache_path,
        &config.gitops_repo,
        &config.gitops_repo_deploy_key_path,
    )
    .await?;
    tokio::spawn(repo_cache.clone().run());
    info!("repo cache initialized");

    if !config.gitops_repo.is_empty() && !config.gitops_repo_deploy_key_path.is_empty() {
        let worker = GitopsWorker::new(
            store.clone(),
            config.gitops_repo.clone(),
            config.gitops_repo_deploy_key_path.clone(),
            (config.git_author_name.clone(), config.git_author_email.clone()),
            Arc::new(HelmRenderer::new(token_manager.clone())),
            broadcaster,
            repo_cache.clone(),
        );
        tokio::spawn(worker.run());
        info!("gitops worker started");
    } else {
        warn!("not starting gitops worker, GITOPS_REPO and GITOPS_REPO_DEPLOY_KEY_PATH must be set");
    }

    if config.release_stats {
        tokio::spawn(ReleaseStateWorker::new(repo_cache.clone()).run());
    }

    if let Some(tm) = token_manager {
        let observer = BranchDeleteWorker::new(
            store,
            tm,
            format!("{}-mirrors", config.repo_cache_path),
            config.manifest_dir.clone(),
        );
        tokio::spawn(observer.run());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
