use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gitopsd::artifact::{Artifact, BranchDeletedEvent, GitEvent, ReleaseRequest, RollbackRequest, Version};
use gitopsd::chart::ChartRenderer;
use gitopsd::gitrepo::RepoCache;
use gitopsd::manifest::{Cleanup, Deploy, Manifest};
use gitopsd::model::{Event, TYPE_BRANCH_DELETED, TYPE_RELEASE, TYPE_ROLLBACK};
use gitopsd::notifications::{Message, NotificationsManager, Provider};
use gitopsd::store::Store;
use gitopsd::worker::outcome::OutcomeStatus;
use gitopsd::worker::GitopsWorker;

/// Renders a deterministic three-document stream from the manifest's values
/// so tests can drive the full write path without a helm binary.
#[derive(Default)]
struct StubRenderer {
    fail_for_env: Option<String>,
}

#[async_trait]
impl ChartRenderer for StubRenderer {
    async fn template(&self, manifest: &Manifest) -> anyhow::Result<String> {
        if self.fail_for_env.as_deref() == Some(manifest.env.as_str()) {
            anyhow::bail!("helm exploded");
        }
        let image = manifest
            .values
            .get("image")
            .and_then(|v| v.as_str())
            .unwrap_or("debian");
        Ok(format!(
            r#"---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {app}
spec:
  template:
    spec:
      containers:
        - name: {app}
          image: {image}
---
apiVersion: v1
kind: Service
metadata:
  name: {app}
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: {app}
data:
  image: {image}
"#,
            app = manifest.app,
            image = image
        ))
    }
}

struct CollectingProvider {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Provider for CollectingProvider {
    fn name(&self) -> &'static str {
        "collecting"
    }
    async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let label = match msg {
            Message::Deploy(d) => format!("deploy/{:?}", d.status),
            Message::Rollback(r) => format!("rollback/{:?}", r.status),
            Message::Delete(d) => format!("delete/{:?}", d.status),
        };
        self.seen.lock().unwrap().push(label);
        Ok(())
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    store: Store,
    cache: Arc<RepoCache>,
    worker: GitopsWorker,
    manager: NotificationsManager,
    origin: PathBuf,
}

fn commit_all(repo: &git2::Repository, message: &str) -> String {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("tester", "tester@localhost").unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
        .to_string()
}

fn git(cwd: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .current_dir(cwd)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

async fn setup_with(
    renderer: StubRenderer,
    seed: impl FnOnce(&git2::Repository, &Path),
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();

    let seed_dir = tmp.path().join("seed");
    std::fs::create_dir_all(&seed_dir).unwrap();
    let seed_repo = git2::Repository::init(&seed_dir).unwrap();
    std::fs::write(seed_dir.join("README.md"), "gitops\n").unwrap();
    commit_all(&seed_repo, "init");
    seed(&seed_repo, &seed_dir);

    let origin = tmp.path().join("origin.git");
    git(
        tmp.path(),
        &["clone", "--bare", "--quiet", seed_dir.to_str().unwrap(), origin.to_str().unwrap()],
    );

    let cache_path = tmp.path().join("cache");
    let cache = RepoCache::new(cache_path.to_str().unwrap(), origin.to_str().unwrap(), "")
        .await
        .unwrap();

    let store = Store::new_test().await.unwrap();
    let manager = NotificationsManager::new();
    let worker = GitopsWorker::new(
        store.clone(),
        "acme/gitops".to_string(),
        String::new(),
        ("gitopsd".to_string(), "gitopsd@localhost".to_string()),
        Arc::new(renderer),
        manager.broadcaster(),
        cache.clone(),
    );

    Harness { _tmp: tmp, store, cache, worker, manager, origin }
}

async fn setup(seed: impl FnOnce(&git2::Repository, &Path)) -> Harness {
    setup_with(StubRenderer::default(), seed).await
}

fn origin_head_file(origin: &Path, path: &str) -> Option<String> {
    let repo = git2::Repository::open(origin).unwrap();
    let tree = repo.head().unwrap().peel_to_tree().unwrap();
    let entry = tree.get_path(Path::new(path)).ok()?;
    let object = entry.to_object(&repo).unwrap();
    let blob = object.as_blob()?;
    Some(String::from_utf8_lossy(blob.content()).into_owned())
}

fn origin_commit_count(origin: &Path) -> usize {
    let repo = git2::Repository::open(origin).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    walk.count()
}

fn origin_head_message(origin: &Path) -> String {
    let repo = git2::Repository::open(origin).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    head.message().unwrap_or_default().to_string()
}

fn deployable_artifact(env: &str, app: &str) -> Artifact {
    Artifact {
        version: Version {
            repository_name: "acme/my-app".into(),
            sha: "ea9ab7cc31b2599bf4afcfd639da516ca27a4780".into(),
            branch: "master".into(),
            event: GitEvent::Push,
            ..Default::default()
        },
        environments: vec![Manifest {
            app: app.into(),
            env: env.into(),
            namespace: env.into(),
            deploy: Some(Deploy {
                branch: "master".into(),
                event: Some(GitEvent::Push),
                ..Default::default()
            }),
            values: HashMap::from([("image".to_string(), serde_json::json!("debian:stable"))]),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn artifact_deploy_is_idempotent() {
    let h = setup(|_, _| {}).await;
    let before = origin_commit_count(&h.origin);

    let mut artifact = deployable_artifact("staging", "my-app");
    let event = h.store.create_artifact(&mut artifact).await.unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed");
    assert_eq!(stored.gitops_hashes.len(), 1, "one env, one commit");

    assert_eq!(origin_commit_count(&h.origin), before + 1);
    let deployment = origin_head_file(&h.origin, "staging/my-app/Deployment-my-app.yaml")
        .expect("deployment file written");
    assert!(deployment.contains("debian:stable"));
    assert!(origin_head_file(&h.origin, "staging/my-app/Service-my-app.yaml").is_some());
    assert!(origin_head_file(&h.origin, "staging/my-app/ConfigMap-my-app.yaml").is_some());

    let message = origin_head_message(&h.origin);
    assert!(message.starts_with("automated deploy"), "{message}");
    assert!(message.contains(&format!("\"artifactID\":\"{}\"", artifact.id)), "{message}");

    // same content again: empty diff, no commit, no recorded refs
    h.cache.refresh().await.unwrap();
    let mut again = deployable_artifact("staging", "my-app");
    let event = h.store.create_artifact(&mut again).await.unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed");
    assert!(stored.gitops_hashes.is_empty(), "identical release produces no commit");
    assert_eq!(origin_commit_count(&h.origin), before + 1);
}

#[tokio::test]
async fn skipped_policy_writes_nothing() {
    let h = setup(|_, _| {}).await;
    let before = origin_commit_count(&h.origin);

    let mut artifact = deployable_artifact("staging", "my-app");
    artifact.environments[0].deploy = Some(Deploy {
        branch: "!master".into(),
        event: Some(GitEvent::Push),
        ..Default::default()
    });
    let event = h.store.create_artifact(&mut artifact).await.unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed");
    assert!(stored.gitops_hashes.is_empty());
    assert_eq!(origin_commit_count(&h.origin), before);
}

#[tokio::test]
async fn release_event_targets_requested_env() {
    let h = setup(|_, _| {}).await;

    let mut artifact = deployable_artifact("staging", "my-app");
    artifact.environments.push(Manifest {
        app: "my-app".into(),
        env: "prod".into(),
        namespace: "prod".into(),
        values: HashMap::from([("image".to_string(), serde_json::json!("debian:bookworm"))]),
        ..Default::default()
    });
    h.store.create_artifact(&mut artifact).await.unwrap();

    let request = ReleaseRequest {
        env: "prod".into(),
        app: String::new(),
        artifact_id: artifact.id.clone(),
        triggered_by: "jane".into(),
    };
    let event = h
        .store
        .enqueue(Event::new(TYPE_RELEASE, serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed", "{}", stored.status_desc);
    assert_eq!(stored.gitops_hashes.len(), 1);

    assert!(origin_head_file(&h.origin, "prod/my-app/Deployment-my-app.yaml").is_some());
    assert!(
        origin_head_file(&h.origin, "staging/my-app/Deployment-my-app.yaml").is_none(),
        "untargeted env stays untouched"
    );
    assert!(origin_head_message(&h.origin).contains("\"triggeredBy\":\"jane\""));
}

#[tokio::test]
async fn release_event_with_unknown_artifact_errors() {
    let h = setup(|_, _| {}).await;
    let request = ReleaseRequest {
        env: "prod".into(),
        app: String::new(),
        artifact_id: "no-such-artifact".into(),
        triggered_by: "jane".into(),
    };
    let event = h
        .store
        .enqueue(Event::new(TYPE_RELEASE, serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "error");
    assert!(stored.status_desc.contains("cannot find artifact with id"), "{}", stored.status_desc);
}

#[tokio::test]
async fn garbage_release_blob_is_a_parse_error() {
    let h = setup(|_, _| {}).await;
    let event = h
        .store
        .enqueue(Event::new(TYPE_RELEASE, "{not-json".to_string()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "error");
    assert!(
        stored.status_desc.contains(&format!("cannot parse release request with id: {}", event.id)),
        "{}",
        stored.status_desc
    );
}

#[tokio::test]
async fn rollback_reverts_to_target_sha() {
    let mut seeded: Vec<String> = Vec::new();
    let h = setup(|repo, dir| {
        for version in ["v1", "v2", "v3"] {
            let app_dir = dir.join("prod/my-app");
            std::fs::create_dir_all(&app_dir).unwrap();
            std::fs::write(app_dir.join("app.yaml"), format!("image: {version}\n")).unwrap();
            seeded.push(commit_all(repo, &format!("automated deploy {version}")));
        }
    })
    .await;
    let target = seeded[0].clone();

    let request = RollbackRequest {
        env: "prod".into(),
        app: "my-app".into(),
        target_sha: target.clone(),
        triggered_by: "jane".into(),
    };
    let event = h
        .store
        .enqueue(Event::new(TYPE_ROLLBACK, serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed", "{}", stored.status_desc);
    assert_eq!(stored.gitops_hashes.len(), 2, "one revert per commit after the target");

    let restored = origin_head_file(&h.origin, "prod/my-app/app.yaml").unwrap();
    assert_eq!(restored, "image: v1\n", "tree under prod/my-app matches the target sha");
    assert!(origin_head_message(&h.origin).starts_with("[gitopsd rollback]"));

    // a second rollback to the same target finds everything already
    // reverted and pushes nothing new
    h.cache.refresh().await.unwrap();
    let commits_after_first = origin_commit_count(&h.origin);
    let event = h
        .store
        .enqueue(Event::new(TYPE_ROLLBACK, serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;
    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed", "{}", stored.status_desc);
    assert_eq!(origin_commit_count(&h.origin), commits_after_first);
}

#[tokio::test]
async fn branch_deleted_cleans_up_preview_app() {
    let h = setup(|repo, dir| {
        let app_dir = dir.join("staging/preview-feature-x");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("app.yaml"), "image: preview\n").unwrap();
        commit_all(repo, "automated deploy preview");
    })
    .await;

    let blob = BranchDeletedEvent {
        repository: "acme/my-app".into(),
        branch: "feature/x".into(),
        manifests: vec![Manifest {
            app: "preview".into(),
            env: "staging".into(),
            cleanup: Some(Cleanup {
                app: "preview-{{ .BRANCH | sanitizeDNSName }}".into(),
                branch: "feature/*".into(),
                ..Default::default()
            }),
            ..Default::default()
        }],
    };
    let event = h
        .store
        .enqueue(Event::new(TYPE_BRANCH_DELETED, serde_json::to_string(&blob).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed", "{}", stored.status_desc);
    assert_eq!(stored.gitops_hashes.len(), 1);

    assert!(
        origin_head_file(&h.origin, "staging/preview-feature-x/app.yaml").is_none(),
        "preview app removed"
    );
    assert_eq!(
        origin_head_message(&h.origin).trim(),
        "[gitopsd delete] staging/preview-feature-x deleted by policy"
    );

    // deleting a branch whose app dir never existed changes nothing
    h.cache.refresh().await.unwrap();
    let commits = origin_commit_count(&h.origin);
    let mut blob = blob;
    blob.branch = "feature/y".into();
    let event = h
        .store
        .enqueue(Event::new(TYPE_BRANCH_DELETED, serde_json::to_string(&blob).unwrap()))
        .await
        .unwrap();
    h.worker.process_event(&event).await;
    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "processed", "{}", stored.status_desc);
    assert!(stored.gitops_hashes.is_empty(), "nothing to delete, no ref recorded");
    assert_eq!(origin_commit_count(&h.origin), commits);
}

#[tokio::test]
async fn failing_env_keeps_earlier_outcomes_and_errors_the_event() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut h = setup_with(
        StubRenderer { fail_for_env: Some("prod".to_string()) },
        |_, _| {},
    )
    .await;
    h.manager.add_provider(Box::new(CollectingProvider { seen: seen.clone() }));

    let mut artifact = deployable_artifact("staging", "my-app");
    let mut prod = artifact.environments[0].clone();
    prod.env = "prod".into();
    prod.namespace = "prod".into();
    artifact.environments.push(prod);

    let event = h.store.create_artifact(&mut artifact).await.unwrap();
    h.worker.process_event(&event).await;

    let stored = h.store.event(&event.id).await.unwrap();
    assert_eq!(stored.status, "error");
    assert!(stored.status_desc.contains("helm exploded"), "{}", stored.status_desc);
    assert_eq!(stored.gitops_hashes.len(), 1, "first env's commit survives the later failure");
    assert!(origin_head_file(&h.origin, "staging/my-app/Deployment-my-app.yaml").is_some());

    // both outcomes were broadcast, success and failure
    let Harness { worker, manager, .. } = h;
    drop(worker);
    manager.run().await;
    let labels = seen.lock().unwrap().clone();
    assert_eq!(
        labels,
        vec![
            format!("deploy/{:?}", OutcomeStatus::Success),
            format!("deploy/{:?}", OutcomeStatus::Failure)
        ]
    );
}
