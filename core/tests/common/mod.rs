// Shared helpers for the integration tests
#![allow(dead_code)]

use meshmerge_core::{
    Change, MemoryHub, MergeEngine, NetworkConfig, Queue, RepoBackend, RepoConfig, RepoEvent,
    Subscription,
};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

/// Concatenates change payloads as UTF-8 text
pub struct TextEngine;

impl MergeEngine for TextEngine {
    type State = String;
    type Patch = String;

    fn init(&self) -> String {
        String::new()
    }

    fn apply_changes(&self, state: &mut String, changes: &[Change]) -> anyhow::Result<String> {
        let mut added = String::new();
        for change in changes {
            added.push_str(std::str::from_utf8(&change.data)?);
        }
        state.push_str(&added);
        Ok(added)
    }

    fn apply_local_change(&self, state: &mut String, change: &Change) -> anyhow::Result<String> {
        self.apply_changes(state, std::slice::from_ref(change))
    }

    fn get_patch(&self, state: &String) -> String {
        state.clone()
    }
}

/// Timing that keeps tests fast
pub fn fast_network() -> NetworkConfig {
    NetworkConfig {
        heartbeat_interval_ms: 200,
        peer_timeout_ms: 5_000,
        handshake_timeout_ms: 2_000,
        close_grace_ms: 200,
    }
}

pub fn memory_config() -> RepoConfig {
    RepoConfig {
        storage_path: None,
        network: fast_network(),
    }
}

/// An in-memory repo attached to `hub`
pub async fn repo_on(hub: &MemoryHub) -> RepoBackend<TextEngine> {
    let repo = RepoBackend::open(memory_config(), TextEngine).unwrap();
    let (swarm, incoming) = hub.swarm();
    repo.attach_swarm(swarm, incoming).await.unwrap();
    repo
}

/// Poll `check` until it holds or the wait runs out
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Wait for the first event matching `pick`
pub async fn next_matching<P, T>(
    events: &mut Subscription<RepoEvent<P>>,
    mut pick: impl FnMut(RepoEvent<P>) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            let event = events.recv().await.expect("event queue closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("timed out waiting for event")
}

pub fn subscribe<T: Send + 'static>(queue: &Queue<T>) -> Subscription<T> {
    queue.subscribe().unwrap()
}
