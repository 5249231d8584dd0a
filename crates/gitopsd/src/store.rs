use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::model::{Event, EventStatus, TYPE_ARTIFACT};

const REPOS_WITH_CLEANUP_POLICY: &str = "reposWithCleanupPolicy";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable store behind the event queue and the artifact log. Exclusively
/// owns the `events` table; safe for one worker plus many enqueuers, the
/// backing SQL engine provides isolation.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::migrate!().run(&pool).await.map_err(sqlx::Error::from)?;
        info!(%database_url, "store initialized");
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn new_test() -> StoreResult<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Persists an event, filling in id, created stamp, and the `new` status
    /// when absent.
    pub async fn enqueue(&self, mut event: Event) -> StoreResult<Event> {
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        if event.created == 0 {
            event.created = chrono::Utc::now().timestamp();
        }
        if event.status.is_empty() {
            event.status = EventStatus::New.as_str().to_string();
        }
        sqlx::query(
            "INSERT INTO events (id, created, type, blob, status, status_desc, repository, branch, event, source_branch, target_branch, tag, sha, artifact_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.created)
        .bind(&event.event_type)
        .bind(&event.blob)
        .bind(&event.status)
        .bind(&event.status_desc)
        .bind(&event.repository)
        .bind(&event.branch)
        .bind(&event.event)
        .bind(&event.source_branch)
        .bind(&event.target_branch)
        .bind(&event.tag)
        .bind(&event.sha)
        .bind(&event.artifact_id)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    /// Stores an artifact as an event of type `artifact`, generating its id
    /// and created stamp when the shipper omitted them.
    pub async fn create_artifact(&self, artifact: &mut Artifact) -> StoreResult<Event> {
        if artifact.id.is_empty() {
            let repo = artifact.version.repository_name.replace('/', "-");
            artifact.id = format!("{}-{}", repo, Uuid::new_v4());
        }
        if artifact.created == 0 {
            artifact.created = chrono::Utc::now().timestamp();
        }
        let blob = serde_json::to_string(artifact)?;
        let event = Event {
            id: String::new(),
            created: artifact.created,
            event_type: TYPE_ARTIFACT.to_string(),
            blob,
            status: String::new(),
            status_desc: String::new(),
            repository: artifact.version.repository_name.clone(),
            branch: artifact.version.branch.clone(),
            event: artifact.version.event.to_string(),
            source_branch: artifact.version.source_branch.clone(),
            target_branch: artifact.version.target_branch.clone(),
            tag: artifact.version.tag.clone(),
            sha: artifact.version.sha.clone(),
            artifact_id: artifact.id.clone(),
            gitops_hashes: vec![],
        };
        self.enqueue(event).await
    }

    /// Events with `status=new`, oldest first.
    pub async fn unprocessed_events(&self) -> StoreResult<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE status = ? ORDER BY created ASC, rowid ASC",
        )
        .bind(EventStatus::New.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn update_event_status(
        &self,
        id: &str,
        status: EventStatus,
        status_desc: &str,
        gitops_hashes_json: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE events SET status = ?, status_desc = ?, gitops_hashes = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(status_desc)
            .bind(gitops_hashes_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A single event by id, with the persisted gitops hashes decoded.
    pub async fn event(&self, id: &str) -> StoreResult<Event> {
        let mut event =
            sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ? LIMIT 1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        let hashes: (String,) = sqlx::query_as("SELECT gitops_hashes FROM events WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        event.gitops_hashes = serde_json::from_str(&hashes.0).unwrap_or_default();
        Ok(event)
    }

    /// The artifact event for the given artifact id.
    pub async fn artifact(&self, artifact_id: &str) -> StoreResult<Event> {
        sqlx::query_as::<_, Event>("SELECT * FROM events WHERE type = ? AND artifact_id = ? LIMIT 1")
            .bind(TYPE_ARTIFACT)
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("artifact {artifact_id}")))
    }

    /// Artifact events newest first, narrowed by the filter.
    pub async fn artifacts(&self, filter: &ArtifactsFilter) -> StoreResult<Vec<Event>> {
        let mut qb: QueryBuilder<'_, sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM events WHERE type = ");
        qb.push_bind(TYPE_ARTIFACT);
        if let Some(repo) = &filter.repository {
            qb.push(" AND repository = ").push_bind(repo);
        }
        if let Some(branch) = &filter.branch {
            qb.push(" AND branch = ").push_bind(branch);
        }
        if let Some(event) = &filter.event {
            qb.push(" AND event = ").push_bind(event);
        }
        if let Some(sha) = &filter.sha {
            qb.push(" AND sha = ").push_bind(sha);
        }
        if let Some(since) = filter.since {
            qb.push(" AND created >= ").push_bind(since);
        }
        qb.push(" ORDER BY created DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
            if let Some(offset) = filter.offset {
                qb.push(" OFFSET ").push_bind(offset);
            }
        }
        let events = qb.build_query_as::<Event>().fetch_all(&self.pool).await?;
        Ok(events)
    }

    /// Repositories whose artifacts ever declared a cleanup policy. The set
    /// feeds the branch-delete observer and only ever grows.
    pub async fn repos_with_cleanup_policy(&self) -> StoreResult<Vec<String>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM key_values WHERE key = ?")
                .bind(REPOS_WITH_CLEANUP_POLICY)
                .fetch_optional(&self.pool)
                .await?;
        match value {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(vec![]),
        }
    }

    pub async fn save_repos_with_cleanup_policy(&self, repos: &[String]) -> StoreResult<()> {
        let json = serde_json::to_string(repos)?;
        sqlx::query("INSERT INTO key_values (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(REPOS_WITH_CLEANUP_POLICY)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ArtifactsFilter {
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub event: Option<String>,
    pub sha: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{GitEvent, Version};
    use crate::model::{TYPE_RELEASE, TYPE_ROLLBACK};

    fn artifact(repo: &str, sha: &str, branch: &str, event: GitEvent) -> Artifact {
        Artifact {
            version: Version {
                repository_name: repo.into(),
                sha: sha.into(),
                branch: branch.into(),
                event,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_and_drain_in_order() {
        let store = Store::new_test().await.unwrap();
        for (i, t) in [TYPE_RELEASE, TYPE_ROLLBACK, TYPE_RELEASE].into_iter().enumerate() {
            let mut e = Event::new(t, "{}".to_string());
            e.id = format!("e{i}");
            e.created = 100 + i as i64;
            store.enqueue(e).await.unwrap();
        }

        let unprocessed = store.unprocessed_events().await.unwrap();
        assert_eq!(unprocessed.len(), 3);
        assert_eq!(unprocessed[0].id, "e0", "oldest first");
        assert_eq!(unprocessed[2].id, "e2");

        store
            .update_event_status("e0", EventStatus::Processed, "", "[\"abc\"]")
            .await
            .unwrap();
        store
            .update_event_status("e1", EventStatus::Error, "boom", "[]")
            .await
            .unwrap();

        let unprocessed = store.unprocessed_events().await.unwrap();
        assert_eq!(unprocessed.len(), 1, "terminal events leave the queue");
        assert_eq!(unprocessed[0].id, "e2");
    }

    #[tokio::test]
    async fn create_artifact_fills_id_and_created() {
        let store = Store::new_test().await.unwrap();
        let mut a = artifact("acme/my-app", "ea9ab7c", "master", GitEvent::Push);
        let event = store.create_artifact(&mut a).await.unwrap();
        assert!(a.id.starts_with("acme-my-app-"), "generated id: {}", a.id);
        assert_ne!(a.created, 0);
        assert_eq!(event.event_type, TYPE_ARTIFACT);
        assert_eq!(event.repository, "acme/my-app");

        let fetched = store.artifact(&a.id).await.unwrap();
        assert_eq!(fetched.to_artifact().unwrap().version.sha, "ea9ab7c");
    }

    #[tokio::test]
    async fn artifact_not_found() {
        let store = Store::new_test().await.unwrap();
        let err = store.artifact("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn artifacts_filters() {
        let store = Store::new_test().await.unwrap();
        let mut a1 = artifact("acme/my-app", "1", "master", GitEvent::Push);
        a1.created = 100;
        let mut a2 = artifact("acme/my-app", "2", "bugfix-123", GitEvent::Pr);
        a2.created = 200;
        let mut a3 = artifact("acme/other", "3", "master", GitEvent::Push);
        a3.created = 300;
        for a in [&mut a1, &mut a2, &mut a3] {
            store.create_artifact(a).await.unwrap();
        }

        let all = store.artifacts(&ArtifactsFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].sha, "3", "newest first");

        let by_repo = store
            .artifacts(&ArtifactsFilter { repository: Some("acme/my-app".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_repo.len(), 2);

        let by_branch = store
            .artifacts(&ArtifactsFilter { branch: Some("bugfix-123".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_branch.len(), 1);
        assert_eq!(by_branch[0].sha, "2");

        let by_event = store
            .artifacts(&ArtifactsFilter { event: Some("pr".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_event.len(), 1);

        let since = store
            .artifacts(&ArtifactsFilter { since: Some(250), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].sha, "3");

        let paged = store
            .artifacts(&ArtifactsFilter { limit: Some(1), offset: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].sha, "2");
    }

    #[tokio::test]
    async fn repos_with_cleanup_policy_round_trip() {
        let store = Store::new_test().await.unwrap();
        assert!(store.repos_with_cleanup_policy().await.unwrap().is_empty());
        store
            .save_repos_with_cleanup_policy(&["acme/my-app".to_string()])
            .await
            .unwrap();
        store
            .save_repos_with_cleanup_policy(&["acme/my-app".to_string(), "acme/other".to_string()])
            .await
            .unwrap();
        let repos = store.repos_with_cleanup_policy().await.unwrap();
        assert_eq!(repos, vec!["acme/my-app".to_string(), "acme/other".to_string()]);
    }
}
