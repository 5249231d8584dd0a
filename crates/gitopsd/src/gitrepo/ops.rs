use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use git2::{Commit, DiffOptions, IndexAddOption, Repository, Signature};
use tokio::process::Command;
use tracing::debug;

/// Marker prefix on synthesized revert commits. The rollback walk uses it to
/// recognise prior rollbacks and skip them.
pub const ROLLBACK_MARKER: &str = "[gitopsd rollback]";

/// Machine-parseable line naming the commit a revert undoes.
pub fn reverts_line(sha: &str) -> String {
    format!("This reverts commit {sha}.")
}

/// Writes the rendered files under `<env>/<app>/` (replacing the directory
/// contents), stages everything, and commits when the tree changed.
/// Returns the new commit sha, or an empty string when the diff was empty.
pub fn commit_files_to_git(
    repo: &Repository,
    files: &HashMap<String, String>,
    env: &str,
    app: &str,
    message: &str,
    trailer: &str,
    author: (&str, &str),
) -> Result<String> {
    let workdir = workdir(repo)?;
    let target = workdir.join(env).join(app);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::create_dir_all(&target)?;
    for (name, content) in files {
        std::fs::write(target.join(name), content)?;
    }

    stage_all(repo)?;

    if nothing_to_commit(repo)? {
        return Ok(String::new());
    }

    let full_message = if trailer.is_empty() {
        message.to_string()
    } else {
        format!("{message}\n\n{trailer}")
    };
    commit(repo, &full_message, author)
}

/// Removes `path` from the working tree recursively and stages the deletion.
pub fn del_dir(repo: &Repository, path: &str) -> Result<()> {
    let target = workdir(repo)?.join(path);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    stage_all(repo)
}

pub fn nothing_to_commit(repo: &Repository) -> Result<bool> {
    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.is_empty())
}

pub fn commit(repo: &Repository, message: &str, author: (&str, &str)) -> Result<String> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let head = repo.head()?.peel_to_commit()?;
    let sig = Signature::now(author.0, author.1)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])?;
    Ok(oid.to_string())
}

fn stage_all(repo: &Repository) -> Result<()> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    Ok(())
}

fn workdir(repo: &Repository) -> Result<&Path> {
    repo.workdir().ok_or_else(|| anyhow!("bare repository has no working tree"))
}

pub fn head_branch(repo: &Repository) -> Result<String> {
    let head = repo.head()?;
    Ok(head.shorthand().unwrap_or("main").to_string())
}

/// Commit shas strictly between HEAD and `since`, newest first.
pub fn shas_since(repo: &Repository, since: &str) -> Result<Vec<String>> {
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    let mut hashes = Vec::new();
    for oid in walk {
        let oid = oid?;
        if oid.to_string() == since {
            break;
        }
        hashes.push(oid.to_string());
    }
    Ok(hashes)
}

/// Whether the commit changed anything under `prefix` relative to its first
/// parent (or the empty tree for a root commit).
pub fn commit_touches_path(repo: &Repository, commit: &Commit<'_>, prefix: &str) -> Result<bool> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None,
    };
    let mut opts = DiffOptions::new();
    opts.pathspec(prefix);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
    Ok(diff.deltas().len() > 0)
}

pub fn is_rollback_commit(commit: &Commit<'_>) -> bool {
    commit.message().unwrap_or_default().starts_with(ROLLBACK_MARKER)
}

/// Scans forward history for a revert commit naming `sha`.
pub fn has_been_reverted(repo: &Repository, sha: &str) -> Result<bool> {
    let needle = reverts_line(sha);
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    for oid in walk {
        let commit = repo.find_commit(oid?)?;
        if commit.message().unwrap_or_default().contains(&needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reverts `sha` in the working tree with the native git binary so the
/// restored tree is byte-exact, then commits with the rollback marker.
pub async fn native_revert(path: &Path, sha: &str, author: (&str, &str)) -> Result<()> {
    git(path, &["revert", "--no-commit", sha]).await?;
    let title = format!("{ROLLBACK_MARKER} revert {sha}");
    let body = reverts_line(sha);
    git(
        path,
        &[
            "-c",
            &format!("user.name={}", author.0),
            "-c",
            &format!("user.email={}", author.1),
            "commit",
            "-m",
            &title,
            "-m",
            &body,
        ],
    )
    .await
}

/// Pushes `branch` to origin with the native git binary; a deploy key is
/// wired in through GIT_SSH_COMMAND.
pub async fn native_push(path: &Path, deploy_key_path: &str, branch: &str) -> Result<()> {
    let refspec = format!("{branch}:{branch}");
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(path).arg("push").arg("origin").arg(&refspec);
    if !deploy_key_path.is_empty() {
        cmd.env(
            "GIT_SSH_COMMAND",
            format!("ssh -i {deploy_key_path} -o StrictHostKeyChecking=no"),
        );
    }
    debug!(?path, branch, "git push");
    let output = cmd.output().await?;
    if !output.status.success() {
        bail!("cannot push: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

pub async fn git(path: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git").arg("-C").arg(path).args(args).output().await?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
