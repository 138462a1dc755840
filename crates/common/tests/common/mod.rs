//! Shared test utilities for coordinator integration tests
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use ::common::coordinator::ShareEvent;
use tempfile::TempDir;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber honouring RUST_LOG. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a root directory containing the named subdirectories
pub fn setup_root(dirs: &[&str]) -> TempDir {
    init_tracing();
    let root = TempDir::new().unwrap();
    for dir in dirs {
        std::fs::create_dir_all(root.path().join(dir)).unwrap();
    }
    root
}

pub fn write_file(root: &Path, path: &str, contents: &[u8]) {
    let path = root.join(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Wait for the next event matching `predicate`, skipping others.
pub async fn next_event<F>(events: &mut broadcast::Receiver<ShareEvent>, predicate: F) -> ShareEvent
where
    F: Fn(&ShareEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain whatever events are already queued.
pub fn drain(events: &mut broadcast::Receiver<ShareEvent>) -> Vec<ShareEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Start listening and wait until the coordinator reports it.
///
/// Returns a subscription positioned after the `Listening` event.
pub async fn listen<S, T>(
    coordinator: &::common::coordinator::ShareCoordinator<S, T>,
) -> broadcast::Receiver<ShareEvent>
where
    S: ::common::archive::ArchiveStore,
    T: ::common::swarm::SwarmTransport,
{
    let mut events = coordinator.subscribe();
    coordinator.start_listening().await.unwrap();
    next_event(&mut events, |e| matches!(e, ShareEvent::Listening { .. })).await;
    events
}
