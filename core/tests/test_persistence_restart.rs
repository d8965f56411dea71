mod common;

use common::{next_matching, subscribe, TextEngine, WAIT};
use meshmerge_core::{CoreError, RepoBackend, RepoConfig, RepoEvent};
use std::path::Path;
use std::time::Duration;

/// sled holds a file lock until its last handle is gone, which can lag the
/// drop of the repo by a moment.
async fn reopen(path: &Path) -> RepoBackend<TextEngine> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match RepoBackend::open(RepoConfig::persistent(path), TextEngine) {
            Ok(repo) => return repo,
            Err(CoreError::Store(e)) if tokio::time::Instant::now() < deadline => {
                tracing::debug!("Repo still locked: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Failed to reopen repo: {}", e),
        }
    }
}

#[tokio::test]
async fn test_repo_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo");

    let payload = b"persisted file contents".to_vec();
    let (repo_id, doc, file) = {
        let repo = RepoBackend::open(RepoConfig::persistent(&path), TextEngine).unwrap();
        let doc = repo.create_doc().unwrap();
        assert_eq!(repo.change(&doc, b"abc").unwrap(), 1);
        let file = repo.write_file(&payload, "text/plain").unwrap();
        let id = repo.id();
        repo.close().await.unwrap();
        (id, doc, file)
    };

    let repo = reopen(&path).await;
    assert_eq!(repo.id(), repo_id);
    assert_eq!(repo.doc_ids(), vec![doc]);

    let mut events = subscribe(&repo.events());
    repo.open_doc(doc).unwrap();
    let patch = next_matching(&mut events, |event| match event {
        RepoEvent::Ready { doc_id, patch, .. } if doc_id == doc => Some(patch),
        _ => None,
    })
    .await;
    assert_eq!(patch, "abc");

    // The root actor is still ours and continues its sequence
    assert_eq!(repo.change(&doc, b"def").unwrap(), 2);
    assert_eq!(repo.clock(&doc).unwrap().get(&doc.root_actor()), 2);

    let (bytes, mime) = repo.read_file(&file).unwrap();
    assert_eq!(bytes, payload);
    assert_eq!(mime, "text/plain");
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_deleted_doc_stays_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo");

    let doc = {
        let repo = RepoBackend::open(RepoConfig::persistent(&path), TextEngine).unwrap();
        let doc = repo.create_doc().unwrap();
        repo.destroy_doc(&doc).await.unwrap();
        repo.close().await.unwrap();
        doc
    };

    let repo = reopen(&path).await;
    assert!(repo.doc_ids().is_empty());
    assert!(matches!(repo.open_doc(doc), Err(CoreError::DocDeleted(_))));
    repo.close().await.unwrap();
}
