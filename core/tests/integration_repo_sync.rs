mod common;

use common::{eventually, next_matching, repo_on, subscribe, WAIT};
use meshmerge_core::{MemoryHub, RepoEvent};
use serde_json::json;

#[tokio::test]
async fn test_document_syncs_both_ways() {
    let hub = MemoryHub::new();
    let a = repo_on(&hub).await;
    let b = repo_on(&hub).await;
    let mut events_a = subscribe(&a.events());
    let mut events_b = subscribe(&b.events());

    let doc = a.create_doc().unwrap();
    a.change(&doc, b"hello").unwrap();

    b.open_doc(doc).unwrap();
    assert!(!b.is_ready(&doc));

    let ready = next_matching(&mut events_b, |event| match event {
        RepoEvent::Ready { doc_id, patch, .. } if doc_id == doc => Some(patch),
        _ => None,
    })
    .await;
    assert_eq!(ready, "hello");
    assert!(b.is_ready(&doc));

    // Later changes arrive as remote patches
    a.change(&doc, b" world").unwrap();
    let patch = next_matching(&mut events_b, |event| match event {
        RepoEvent::Patch { doc_id, patch, local: false, .. } if doc_id == doc => Some(patch),
        _ => None,
    })
    .await;
    assert_eq!(patch, " world");

    // B writes through an actor of its own, which A picks up
    b.change(&doc, b"!").unwrap();
    let patch = next_matching(&mut events_a, |event| match event {
        RepoEvent::Patch { doc_id, patch, local: false, .. } if doc_id == doc => Some(patch),
        _ => None,
    })
    .await;
    assert_eq!(patch, "!");

    let state_a = a.with_doc_state(&doc, |s| s.clone()).unwrap();
    let state_b = b.with_doc_state(&doc, |s| s.clone()).unwrap();
    assert_eq!(state_a, "hello world!");
    assert_eq!(state_b, "hello world!");
    assert_eq!(a.clock(&doc), b.clock(&doc));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_document_messages_reach_peers() {
    let hub = MemoryHub::new();
    let a = repo_on(&hub).await;
    let b = repo_on(&hub).await;
    let mut events_b = subscribe(&b.events());

    let doc = a.create_doc().unwrap();
    a.change(&doc, b"x").unwrap();
    b.open_doc(doc).unwrap();
    next_matching(&mut events_b, |event| match event {
        RepoEvent::Ready { doc_id, .. } if doc_id == doc => Some(()),
        _ => None,
    })
    .await;

    let a_sender = a.clone();
    assert!(eventually(|| a_sender.send_doc_message(&doc, json!({"cursor": 4})).unwrap() > 0).await);

    let (peer, contents) = next_matching(&mut events_b, |event| match event {
        RepoEvent::DocumentMessage {
            doc_id,
            peer,
            contents,
        } if doc_id == doc => Some((peer, contents)),
        _ => None,
    })
    .await;
    assert_eq!(peer, a.id());
    assert_eq!(contents, json!({"cursor": 4}));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_peer_clock_is_reported() {
    let hub = MemoryHub::new();
    let a = repo_on(&hub).await;
    let b = repo_on(&hub).await;
    let mut events_b = subscribe(&b.events());

    let doc = a.create_doc().unwrap();
    a.change(&doc, b"one").unwrap();
    a.change(&doc, b"two").unwrap();
    b.open_doc(doc).unwrap();

    let clock = next_matching(&mut events_b, |event| match event {
        RepoEvent::ClockUpdated { doc_id, repo, clock } if doc_id == doc && repo == a.id() => {
            Some(clock)
        }
        _ => None,
    })
    .await;
    assert_eq!(clock.get(&doc.root_actor()), 2);

    let b_ready = b.clone();
    assert!(
        tokio::time::timeout(WAIT, async {
            while !b_ready.is_ready(&doc) {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    );
    assert_eq!(b.with_doc_state(&doc, |s| s.clone()).unwrap(), "onetwo");

    a.close().await.unwrap();
    b.close().await.unwrap();
}
