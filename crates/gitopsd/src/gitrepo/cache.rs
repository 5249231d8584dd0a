use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use git2::Repository;
use tempfile::TempDir;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::ops;

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide cached clone of the GitOps repository. Readers share the
/// cache directly; writers get a private copy so the refresh loop and the
/// single-threaded worker never share a working tree.
pub struct RepoCache {
    cache_path: PathBuf,
    deploy_key_path: String,
    refresh_now: Notify,
}

/// A writable working copy bound to a temp directory. Dropping the instance
/// removes the directory, so cleanup holds on every exit path. The repo is
/// opened on demand: `git2::Repository` is not Sync, and writers hold the
/// instance across await points.
pub struct WriteInstance {
    dir: TempDir,
}

impl WriteInstance {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn open(&self) -> Result<Repository> {
        Ok(Repository::open(self.dir.path())?)
    }
}

impl RepoCache {
    /// Opens the cache, cloning the GitOps repo into `cache_path` when it is
    /// not there yet.
    pub async fn new(cache_path: &str, repo_url: &str, deploy_key_path: &str) -> Result<Arc<Self>> {
        let path = PathBuf::from(cache_path);
        if !path.join(".git").exists() {
            if repo_url.is_empty() {
                return Err(anyhow!("no gitops repo cache at {cache_path} and no repo url to clone"));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            clone(repo_url, &path, deploy_key_path).await?;
            info!(%repo_url, %cache_path, "gitops repo cloned");
        }
        Ok(Arc::new(Self {
            cache_path: path,
            deploy_key_path: deploy_key_path.to_string(),
            refresh_now: Notify::new(),
        }))
    }

    /// Background refresh loop: fetch + fast-forward every 30 s, immediately
    /// when a pusher invalidates the cache.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                _ = self.refresh_now.notified() => {}
            }
            if let Err(e) = self.refresh().await {
                warn!(error=%e, "gitops repo refresh failed");
            }
        }
    }

    /// Forces the next refresh to run immediately.
    pub fn invalidate(&self) {
        self.refresh_now.notify_one();
    }

    /// The cached repo, for read-only access.
    pub fn instance_for_read(&self) -> Result<Repository> {
        Ok(Repository::open(&self.cache_path)?)
    }

    /// Copies the cache into a fresh temp directory and returns a writable
    /// repo bound to it.
    pub fn instance_for_write(&self) -> Result<WriteInstance> {
        let dir = tempfile::tempdir()?;
        copy_dir(&self.cache_path, dir.path())?;
        Ok(WriteInstance { dir })
    }

    /// Fetches and fast-forwards the cached clone to the remote head.
    pub async fn refresh(&self) -> Result<()> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("-C").arg(&self.cache_path).args(["fetch", "--all", "--prune"]);
        if !self.deploy_key_path.is_empty() {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o StrictHostKeyChecking=no", self.deploy_key_path),
            );
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(anyhow!(
                "cannot fetch gitops repo: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let (branch, has_upstream) = {
            let repo = self.instance_for_read()?;
            let branch = ops::head_branch(&repo)?;
            let has_upstream = repo
                .resolve_reference_from_short_name(&format!("origin/{branch}"))
                .is_ok();
            (branch, has_upstream)
        };
        if has_upstream {
            ops::git(&self.cache_path, &["reset", "--hard", &format!("origin/{branch}")]).await?;
        }
        Ok(())
    }
}

async fn clone(repo_url: &str, path: &Path, deploy_key_path: &str) -> Result<()> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("clone").arg(repo_url).arg(path);
    if !deploy_key_path.is_empty() {
        cmd.env(
            "GIT_SSH_COMMAND",
            format!("ssh -i {deploy_key_path} -o StrictHostKeyChecking=no"),
        );
    }
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(anyhow!(
            "cannot clone gitops repo: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
