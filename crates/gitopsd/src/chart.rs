use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_yaml::Value;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use crate::manifest::Manifest;
use crate::scm::TokenManager;

/// Renders a manifest's chart + values into a multi-document YAML stream.
/// The seam exists so the worker can be exercised without a helm binary.
#[async_trait]
pub trait ChartRenderer: Send + Sync + 'static {
    async fn template(&self, manifest: &Manifest) -> Result<String>;
}

/// Shells out to `helm template`. Charts hosted in git repositories
/// (`chart.name` containing `.git`) are cloned to a temp dir first, with an
/// SCM access token for private repos; the dir is removed after use.
pub struct HelmRenderer {
    token_manager: Option<Arc<dyn TokenManager>>,
}

impl HelmRenderer {
    pub fn new(token_manager: Option<Arc<dyn TokenManager>>) -> Self {
        Self { token_manager }
    }
}

#[async_trait]
impl ChartRenderer for HelmRenderer {
    async fn template(&self, manifest: &Manifest) -> Result<String> {
        if manifest.chart.name.starts_with("git@") {
            bail!("only HTTPS git repo urls supported");
        }

        let mut manifest = manifest.clone();
        let mut _chart_clone: Option<TempDir> = None;
        if manifest.chart.name.contains(".git") {
            let token = match &self.token_manager {
                Some(tm) => tm.token().await.map(|(t, _)| t).unwrap_or_default(),
                None => String::new(),
            };
            let (dir, chart_path) = clone_chart_from_repo(&manifest.chart.name, &token).await?;
            manifest.chart.name = chart_path.to_string_lossy().into_owned();
            manifest.chart.repository = String::new();
            manifest.chart.version = String::new();
            _chart_clone = Some(dir);
        }

        let values_dir = tempfile::tempdir()?;
        let values_path = values_dir.path().join("values.yaml");
        let values_yaml = serde_yaml::to_string(&manifest.values)
            .map_err(|e| anyhow!("cannot marshal values {}", e))?;
        tokio::fs::write(&values_path, values_yaml).await?;

        let mut cmd = Command::new("helm");
        cmd.arg("template")
            .arg(&manifest.app)
            .arg(&manifest.chart.name)
            .arg("--namespace")
            .arg(&manifest.namespace)
            .arg("--values")
            .arg(&values_path);
        if !manifest.chart.repository.is_empty() {
            cmd.arg("--repo").arg(&manifest.chart.repository);
        }
        if !manifest.chart.version.is_empty() {
            cmd.arg("--version").arg(&manifest.chart.version);
        }

        debug!(app=%manifest.app, chart=%manifest.chart.name, "helm template");
        let output = cmd.output().await.map_err(|e| anyhow!("cannot run helm template {}", e))?;
        if !output.status.success() {
            bail!(
                "cannot run helm template {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Clones a git-hosted chart. Supports a trailing `?path=/sub/dir` selector
/// for monorepo charts; the token is injected into the HTTPS clone url.
async fn clone_chart_from_repo(chart_name: &str, token: &str) -> Result<(TempDir, PathBuf)> {
    let (url, sub_path) = match chart_name.split_once("?path=") {
        Some((url, sub)) => (url.to_string(), sub.trim_start_matches('/').to_string()),
        None => (chart_name.to_string(), String::new()),
    };

    let clone_url = match (url.strip_prefix("https://"), token.is_empty()) {
        (Some(rest), false) => format!("https://oauth2:{token}@{rest}"),
        _ => url.clone(),
    };

    let dir = tempfile::tempdir()?;
    let output = Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(&clone_url)
        .arg(dir.path())
        .output()
        .await?;
    if !output.status.success() {
        bail!(
            "cannot fetch chart from git {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let chart_path = if sub_path.is_empty() { dir.path().to_path_buf() } else { dir.path().join(sub_path) };
    Ok((dir, chart_path))
}

/// Applies strategic-merge patches to a rendered manifest stream. Each patch
/// document is matched to a rendered document by kind + metadata.name and
/// deep-merged into it: maps merge recursively, nulls delete, everything
/// else replaces.
pub fn apply_patches(patches: &str, rendered: &str) -> Result<String> {
    let mut docs = parse_docs(rendered)?;
    let patch_docs = parse_docs(patches)?;

    for patch in &patch_docs {
        let target_id = doc_id(patch);
        let target = docs
            .iter_mut()
            .find(|d| doc_id(d) == target_id)
            .ok_or_else(|| anyhow!("cannot apply patches to chart: no document matches {:?}", target_id))?;
        merge(target, patch);
    }

    let mut out = String::new();
    for doc in &docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc).map_err(|e| anyhow!("cannot marshal document {}", e))?);
    }
    Ok(out)
}

/// Splits a multi-document stream into discrete files keyed
/// `<kind>-<name>.yaml`, one file per document.
pub fn split_rendered(rendered: &str) -> Result<HashMap<String, String>> {
    let docs = parse_docs(rendered)?;
    let mut files = HashMap::new();
    for doc in &docs {
        let (kind, name) = doc_id(doc);
        if kind.is_empty() || name.is_empty() {
            continue;
        }
        let content = serde_yaml::to_string(doc).map_err(|e| anyhow!("cannot marshal document {}", e))?;
        files.insert(format!("{kind}-{name}.yaml"), content);
    }
    Ok(files)
}

fn parse_docs(stream: &str) -> Result<Vec<Value>> {
    use serde::Deserialize;
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(stream) {
        let value = Value::deserialize(de).map_err(|e| anyhow!("cannot parse document {}", e))?;
        if !matches!(value, Value::Null) {
            docs.push(value);
        }
    }
    Ok(docs)
}

fn doc_id(doc: &Value) -> (String, String) {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (kind, name)
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Mapping(target_map), Value::Mapping(patch_map)) => {
            for (k, v) in patch_map {
                if v.is_null() {
                    target_map.remove(k);
                } else if let Some(existing) = target_map.get_mut(k) {
                    merge(existing, v);
                } else {
                    target_map.insert(k.clone(), v.clone());
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
