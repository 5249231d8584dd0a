use std::collections::HashMap;

use tracing::debug;

/// Service configuration, read from the environment the way the daemon is
/// deployed (no flags, no config files).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database_url: String,
    pub gitops_repo: String,
    pub gitops_repo_deploy_key_path: String,
    pub repo_cache_path: String,
    pub scm_token: String,
    pub scm_base_url: String,
    pub release_stats: bool,
    pub manifest_dir: String,
    pub git_author_name: String,
    pub git_author_email: String,
    pub notifications: Notifications,
}

#[derive(Debug, Clone, Default)]
pub struct Notifications {
    pub provider: String,
    pub token: String,
    pub default_channel: String,
    pub channel_mapping: HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> Self {
        let cfg = Config {
            database_url: env_or("DATABASE_URL", "sqlite:gitopsd.sqlite?mode=rwc"),
            gitops_repo: env_or("GITOPS_REPO", ""),
            gitops_repo_deploy_key_path: env_or("GITOPS_REPO_DEPLOY_KEY_PATH", ""),
            repo_cache_path: env_or("REPO_CACHE_PATH", "/tmp/gitopsd-repo-cache"),
            scm_token: env_or("SCM_TOKEN", ""),
            scm_base_url: env_or("SCM_BASE_URL", "https://api.github.com"),
            release_stats: env_or("RELEASE_STATS", "") == "enabled",
            manifest_dir: env_or("MANIFEST_DIR", ".gitopsd"),
            git_author_name: env_or("GIT_AUTHOR_NAME", "gitopsd"),
            git_author_email: env_or("GIT_AUTHOR_EMAIL", "gitopsd@localhost"),
            notifications: Notifications {
                provider: env_or("NOTIFICATIONS_PROVIDER", ""),
                token: env_or("NOTIFICATIONS_TOKEN", ""),
                default_channel: env_or("NOTIFICATIONS_DEFAULT_CHANNEL", ""),
                channel_mapping: parse_channel_mapping(&env_or("NOTIFICATIONS_CHANNEL_MAPPING", "")),
            },
        };
        debug!(gitops_repo=%cfg.gitops_repo, cache=%cfg.repo_cache_path, "config loaded");
        cfg
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parses `repo=channel,repo2=channel2` pairs; malformed pairs are skipped.
fn parse_channel_mapping(raw: &str) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for pair in raw.split(',') {
        if let Some((repo, channel)) = pair.split_once('=') {
            if !repo.is_empty() && !channel.is_empty() {
                mapping.insert(repo.trim().to_string(), channel.trim().to_string());
            }
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mapping_pairs() {
        let mapping = parse_channel_mapping("acme/my-app=releases,acme/other=ops");
        assert_eq!(mapping.get("acme/my-app").map(String::as_str), Some("releases"));
        assert_eq!(mapping.get("acme/other").map(String::as_str), Some("ops"));
        assert!(parse_channel_mapping("").is_empty());
        assert!(parse_channel_mapping("garbage").is_empty());
    }
}
