use std::collections::HashMap;

use anyhow::{anyhow, Result};
use minijinja::Environment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::artifact::GitEvent;

/// Per-environment recipe: chart reference + values + optional deploy and
/// cleanup policies + optional patches. `values` may contain unresolved
/// template placeholders until `resolve_vars` is applied.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Manifest {
    pub app: String,
    pub env: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<Cleanup>,
    pub chart: Chart,
    pub values: HashMap<String, serde_json::Value>,
    #[serde(rename = "strategicMergePatches", skip_serializing_if = "String::is_empty")]
    pub strategic_merge_patches: String,
    #[serde(rename = "json6902Patches", skip_serializing_if = "String::is_empty")]
    pub json6902_patches: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Chart {
    pub repository: String,
    pub name: String,
    pub version: String,
}

/// Predicate over an artifact's branch/tag/event deciding whether it should
/// be released to an environment. Branch and tag are shell-style globs with
/// an optional leading `!` negation.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Deploy {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<GitEvent>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CleanupEvent {
    #[default]
    BranchDeleted,
}

/// Predicate over a deleted branch deciding whether its preview app should
/// be removed from the GitOps repo.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Cleanup {
    /// App name to delete. May contain the `{{ .BRANCH }}` placeholder,
    /// the only variable available in cleanup templates.
    pub app: String,
    pub event: CleanupEvent,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

impl Manifest {
    /// Substitutes `vars` into every templated field of the manifest by
    /// rendering its YAML form. The cleanup block is detached first: cleanup
    /// placeholders live in a different namespace (only `BRANCH`) and are
    /// resolved at branch-deletion time.
    pub fn resolve_vars(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let cleanup = self.cleanup.take();
        let manifest_string = serde_yaml::to_string(self)
            .map_err(|e| anyhow!("cannot marshal manifest {}", e))?;
        let templated = render(&manifest_string, vars)?;
        let mut resolved: Manifest =
            serde_yaml::from_str(&templated).map_err(|e| anyhow!("cannot parse manifest {}", e))?;
        resolved.cleanup = cleanup;
        *self = resolved;
        Ok(())
    }
}

impl Cleanup {
    pub fn resolve_vars(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let cleanup_string =
            serde_yaml::to_string(self).map_err(|e| anyhow!("cannot marshal cleanup policy {}", e))?;
        let templated = render(&cleanup_string, vars)?;
        *self = serde_yaml::from_str(&templated)
            .map_err(|e| anyhow!("cannot parse cleanup policy {}", e))?;
        Ok(())
    }
}

static TEMPLATE_ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.add_filter("sanitizeDNSName", |s: String| sanitize_dns_name(&s));
    env
});

// Matches a whole `{{ ... }}` expression so the leading-dot variable style
// (`{{ .BRANCH | sanitizeDNSName }}`) can be normalised before rendering.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{[^{}]*\}\}").unwrap());
static DOTTED_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());

fn render(source: &str, vars: &HashMap<String, String>) -> Result<String> {
    let normalized = PLACEHOLDER.replace_all(source, |caps: &regex::Captures<'_>| {
        DOTTED_VAR.replace_all(&caps[0], "$1").into_owned()
    });
    TEMPLATE_ENV
        .render_str(&normalized, vars)
        .map_err(|e| anyhow!("cannot resolve manifest vars {}", e))
}

/// Coerces a string into an RFC 1123 DNS label: lowercase, every run of
/// non-`[0-9a-z]` collapsed to a single `-`, truncated to 63 chars, dashes
/// trimmed from both ends.
pub fn sanitize_dns_name(s: &str) -> String {
    static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new("[^0-9a-z]+").unwrap());
    let lowered = s.to_lowercase();
    let mut sanitized = NON_ALNUM.replace_all(&lowered, "-").into_owned();
    if sanitized.len() > 63 {
        sanitized.truncate(63);
    }
    sanitized.trim_matches('-').to_string()
}
