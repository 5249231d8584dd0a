use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;

pub const TYPE_ARTIFACT: &str = "artifact";
pub const TYPE_RELEASE: &str = "release";
pub const TYPE_ROLLBACK: &str = "rollback";
pub const TYPE_BRANCH_DELETED: &str = "branchDeleted";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Processed,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Processed => "processed",
            EventStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in the durable event queue. Artifacts are stored as events of type
/// `artifact` so all inbound work shares one table and one status lifecycle.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    pub id: String,
    pub created: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub event_type: String,
    pub blob: String,
    pub status: String,
    pub status_desc: String,
    pub repository: String,
    pub branch: String,
    pub event: String,
    pub source_branch: String,
    pub target_branch: String,
    pub tag: String,
    pub sha: String,
    pub artifact_id: String,
    #[sqlx(skip)]
    #[serde(default)]
    pub gitops_hashes: Vec<String>,
}

impl Event {
    /// A fresh queue entry; the store fills id, created, and status on
    /// enqueue.
    pub fn new(event_type: &str, blob: String) -> Self {
        Event {
            id: String::new(),
            created: 0,
            event_type: event_type.to_string(),
            blob,
            status: String::new(),
            status_desc: String::new(),
            repository: String::new(),
            branch: String::new(),
            event: String::new(),
            source_branch: String::new(),
            target_branch: String::new(),
            tag: String::new(),
            sha: String::new(),
            artifact_id: String::new(),
            gitops_hashes: vec![],
        }
    }

    pub fn to_artifact(&self) -> anyhow::Result<Artifact> {
        let artifact: Artifact = serde_json::from_str(&self.blob)
            .map_err(|e| anyhow::anyhow!("cannot parse artifact {}", e))?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_artifact_blob() {
        let blob = r#"{"id":"my-app-1","version":{"repositoryName":"acme/my-app","sha":"ea9ab7c","branch":"master"}}"#;
        let event = Event::new(TYPE_ARTIFACT, blob.to_string());
        let artifact = event.to_artifact().unwrap();
        assert_eq!(artifact.id, "my-app-1");
        assert_eq!(artifact.version.repository_name, "acme/my-app");
    }

    #[test]
    fn bad_blob_is_a_parse_error() {
        let event = Event::new(TYPE_ARTIFACT, "{not-json".to_string());
        assert!(event.to_artifact().is_err());
    }
}
