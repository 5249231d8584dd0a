use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Git event kind an artifact was built from. Absent fields on the wire
/// default to `push`, matching how CI shippers omit the field for plain
/// branch builds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum GitEvent {
    #[default]
    Push,
    Pr,
    Tag,
    BranchDeleted,
}

impl std::fmt::Display for GitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GitEvent::Push => "push",
            GitEvent::Pr => "pr",
            GitEvent::Tag => "tag",
            GitEvent::BranchDeleted => "branchDeleted",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Version {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repository_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
    pub event: GitEvent,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub committer_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub committer_email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Immutable, CI-produced bundle of metadata describing a built commit and
/// its releasable manifests.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Artifact {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    pub version: Version,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<Manifest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<HashMap<String, serde_json::Value>>,
}

impl Artifact {
    pub fn has_cleanup_policy(&self) -> bool {
        self.environments.iter().any(|m| m.cleanup.is_some())
    }

    /// Flat template variable map: CI context entries overlaid with the
    /// string-typed item values. Non-string item values are dropped.
    pub fn vars(&self) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self.context.clone();
        for item in &self.items {
            for (k, v) in item {
                if let serde_json::Value::String(s) = v {
                    vars.insert(k.clone(), s.clone());
                }
            }
        }
        vars
    }
}

/// Entry body for `release` events.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ReleaseRequest {
    pub env: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    #[serde(rename = "triggeredBy")]
    pub triggered_by: String,
}

/// Entry body for `rollback` events.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RollbackRequest {
    pub env: String,
    pub app: String,
    #[serde(rename = "targetSHA")]
    pub target_sha: String,
    #[serde(rename = "triggeredBy")]
    pub triggered_by: String,
}

/// Entry body for `branchDeleted` events. Carries the last-known manifests
/// for the branch so cleanup can resolve its targets after the branch is gone.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BranchDeletedEvent {
    pub repository: String,
    pub branch: String,
    pub manifests: Vec<Manifest>,
}

/// Release descriptor embedded as a JSON trailer in deploy commit messages
/// for downstream consumers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Release {
    pub app: String,
    pub env: String,
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    pub version: Version,
    #[serde(rename = "triggeredBy")]
    pub triggered_by: String,
}
