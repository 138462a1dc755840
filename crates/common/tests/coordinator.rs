//! Integration tests for the share coordinator lifecycle

mod common;

use std::time::Duration;

use ::common::coordinator::{ConfigError, CoordinatorError, ShareCoordinator, ShareEvent};
use ::common::keys::ArchiveSecret;
use ::common::swarm::SwarmError;
use ::common::testkit::{
    memory_coordinator, with_store, MemoryArchiveStore, MemoryCoordinator, MemorySwarm,
};
use tokio::io::AsyncReadExt;

#[test]
fn test_builder_requires_root_and_port() {
    let err = MemoryCoordinator::builder().build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingRootAndPort));

    let err = MemoryCoordinator::builder().port(3282).build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingRoot));

    let err = MemoryCoordinator::builder().root_dir("/srv").build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingPort));
}

#[test]
fn test_builder_requires_collaborators() {
    let err = MemoryCoordinator::builder()
        .root_dir("/srv")
        .port(3282)
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::MissingArchiveStore));

    let err = ShareCoordinator::<MemoryArchiveStore, MemorySwarm>::builder()
        .root_dir("/srv")
        .port(3282)
        .archive_store(MemoryArchiveStore::new())
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::MissingTransport));

    let err = MemoryCoordinator::builder()
        .root_dir("")
        .port(3282)
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidRoot(_)));
}

#[tokio::test]
async fn test_start_listening_emits_listening() {
    let root = common::setup_root(&[]);
    let (coordinator, _, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = coordinator.subscribe();

    coordinator.start_listening().await.unwrap();

    let event = common::next_event(&mut events, |e| matches!(e, ShareEvent::Listening { .. })).await;
    assert_eq!(event, ShareEvent::Listening { port: 3282 });
    assert!(coordinator.is_listening());
    assert_eq!(swarm.port(), Some(3282));
}

#[tokio::test]
async fn test_start_listening_twice_fails() {
    let root = common::setup_root(&[]);
    let (coordinator, _, _) = memory_coordinator(root.path(), 3282).unwrap();

    coordinator.start_listening().await.unwrap();
    let err = coordinator.start_listening().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Swarm(SwarmError::AlreadyListening)
    ));
}

#[tokio::test]
async fn test_init_directory_tracks_once() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, _) = memory_coordinator(root.path(), 3282).unwrap();

    let first = coordinator.init_directory("site").await.unwrap();
    let second = coordinator.init_directory("site").await.unwrap();
    // absolute paths under the root name the same directory
    let third = coordinator
        .init_directory(root.path().join("site"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(store.created(), 1);
    assert_eq!(coordinator.num_directories(), 1);
    assert_eq!(coordinator.num_sharing(), 0);
    assert_eq!(coordinator.discovery_key_for("site"), Some(first.discovery_key));
    assert!(coordinator.is_key_tracked(&first.discovery_key));
}

#[tokio::test]
async fn test_concurrent_init_creates_one_archive() {
    let root = common::setup_root(&["site"]);
    let store = MemoryArchiveStore::with_creation_delay(Duration::from_millis(100));
    let (coordinator, store, _) = with_store(root.path(), 3282, store).unwrap();

    let (a, b) = tokio::join!(
        coordinator.init_directory("site"),
        coordinator.init_directory("/site"),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(store.created(), 1);
    assert_eq!(coordinator.num_directories(), 1);
}

#[tokio::test]
async fn test_init_missing_directory() {
    let root = common::setup_root(&[]);
    let (coordinator, store, _) = memory_coordinator(root.path(), 3282).unwrap();

    let err = coordinator.init_directory("missing").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(_)));
    assert_eq!(err.to_string(), "missing does not exist");
    assert_eq!(store.created(), 0);
    assert!(!coordinator.is_tracked("missing"));
}

#[tokio::test]
async fn test_share_requires_init() {
    let root = common::setup_root(&["site"]);
    let (coordinator, _, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    let err = coordinator.share_directory("site", false).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotInitialized(_)));
    assert_eq!(err.to_string(), "Cannot share site. It is not initialized");
    assert_eq!(swarm.joins(), 0);
}

#[tokio::test]
async fn test_share_joins_swarm_once() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = common::listen(&coordinator).await;

    coordinator.init_directory("site").await.unwrap();
    let ids = coordinator.share_directory("site", false).await.unwrap();

    let event = common::next_event(&mut events, |e| matches!(e, ShareEvent::Shared(_))).await;
    assert_eq!(event, ShareEvent::Shared(ids.discovery_key));
    assert!(swarm.is_joined(&ids.discovery_key));
    assert_eq!(coordinator.num_sharing(), 1);

    // sharing again re-imports but does not join again
    coordinator.share_directory("site", false).await.unwrap();
    let archive = store.archive_at(root.path().join("site")).unwrap();
    assert_eq!(archive.imports(), 2);
    assert_eq!(swarm.joins(), 1);
    assert!(common::drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_share_skip_import() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    coordinator.init_directory("site").await.unwrap();
    let ids = coordinator.share_directory("site", true).await.unwrap();

    let archive = store.archive_at(root.path().join("site")).unwrap();
    assert_eq!(archive.imports(), 0);
    assert!(swarm.is_joined(&ids.discovery_key));
}

#[tokio::test]
async fn test_unshare_directory() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    assert!(!coordinator.unshare_directory("site").await.unwrap());

    coordinator.init_directory("site").await.unwrap();
    let ids = coordinator.share_directory("site", false).await.unwrap();
    assert!(coordinator.unshare_directory("site").await.unwrap());

    let archive = store.archive_at(root.path().join("site")).unwrap();
    assert!(archive.is_closed());
    assert!(!swarm.is_joined(&ids.discovery_key));
    assert_eq!(swarm.leaves(), 1);
    assert!(!coordinator.is_tracked("site"));
    assert!(coordinator.archive_for_key(&ids.discovery_key).is_none());

    // a second unshare finds nothing to do
    assert!(!coordinator.unshare_directory("site").await.unwrap());
}

#[tokio::test]
async fn test_unshare_initialized_only_keeps_tracking() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    coordinator.init_directory("site").await.unwrap();
    assert!(coordinator.unshare_directory("site").await.unwrap());

    assert!(coordinator.is_tracked("site"));
    assert_eq!(swarm.leaves(), 0);
    assert!(!store.archives()[0].is_closed());
}

#[tokio::test]
async fn test_update_directory() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    assert!(!coordinator.update_directory("site").await.unwrap());

    coordinator.init_directory("site").await.unwrap();
    coordinator.share_directory("site", false).await.unwrap();
    assert!(coordinator.update_directory("site").await.unwrap());

    let archive = store.archive_at(root.path().join("site")).unwrap();
    assert_eq!(archive.imports(), 2);
    assert_eq!(swarm.joins(), 1);
}

#[tokio::test]
async fn test_list_directories() {
    let root = common::setup_root(&["b", "a"]);
    let (coordinator, _, _) = memory_coordinator(root.path(), 3282).unwrap();

    coordinator.init_directory("b").await.unwrap();
    let a = coordinator.init_directory("a").await.unwrap();
    coordinator.share_directory("a", false).await.unwrap();

    let listed = coordinator.list_directories();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].dir, coordinator.root_dir().join("a"));
    assert_eq!(listed[0].discovery_key, a.discovery_key);
    assert!(listed[0].sharing);
    assert_eq!(listed[1].dir, coordinator.root_dir().join("b"));
    assert!(!listed[1].sharing);
}

#[tokio::test]
async fn test_dotted_path_is_same_directory() {
    let root = common::setup_root(&["a", "x"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    let plain = coordinator.init_directory("a").await.unwrap();
    let dotted = coordinator.init_directory("x/../a").await.unwrap();
    assert_eq!(plain, dotted);
    assert_eq!(store.created(), 1);

    coordinator.share_directory("a", false).await.unwrap();
    coordinator.share_directory("x/../a", false).await.unwrap();
    assert_eq!(coordinator.num_directories(), 1);
    assert_eq!(coordinator.num_sharing(), 1);
    assert_eq!(swarm.joins(), 1);
    assert!(coordinator.is_tracked(coordinator.root_dir().join("x/../a")));

    assert!(coordinator.unshare_directory("a").await.unwrap());
    assert!(!coordinator.is_tracked("x/../a"));
    assert_eq!(coordinator.num_directories(), 0);
    assert!(!swarm.is_joined(&plain.discovery_key));
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_directory_is_same_directory() {
    let root = common::setup_root(&["site"]);
    std::os::unix::fs::symlink(root.path().join("site"), root.path().join("alias")).unwrap();
    let (coordinator, store, _) = memory_coordinator(root.path(), 3282).unwrap();

    let site = coordinator.init_directory("site").await.unwrap();
    let alias = coordinator.init_directory("alias").await.unwrap();
    assert_eq!(site, alias);
    assert_eq!(store.created(), 1);
    assert_eq!(coordinator.num_directories(), 1);
    assert_eq!(coordinator.list_directories()[0].dir, coordinator.root_dir().join("site"));
}

#[tokio::test]
async fn test_sync_with_aliases_keeps_one_entry() {
    let root = common::setup_root(&["a", "x"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();

    let outcome = coordinator.sync(&["a", "x/../a"]).await;
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.results[0].discovery_key, outcome.results[1].discovery_key);
    assert_eq!(store.created(), 1);
    assert_eq!(coordinator.num_directories(), 1);
    assert_eq!(swarm.joins(), 1);

    // the alias names the tracked directory, so nothing is unshared
    coordinator.sync(&["x/../a"]).await;
    assert_eq!(coordinator.num_sharing(), 1);
    assert_eq!(swarm.leaves(), 0);
}

#[tokio::test]
async fn test_dial_known_key_replicates() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = common::listen(&coordinator).await;
    coordinator.init_directory("site").await.unwrap();
    let ids = coordinator.share_directory("site", false).await.unwrap();
    common::drain(&mut events);

    let (mut peer, session) = swarm.dial(&ids.discovery_key).await.unwrap();
    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    session.await.unwrap();

    assert_eq!(received, ids.archive_key.as_bytes().to_vec());
    let event = common::next_event(&mut events, |e| matches!(e, ShareEvent::Replicating(_))).await;
    assert_eq!(event, ShareEvent::Replicating(ids.discovery_key));
    assert!(common::drain(&mut events).is_empty());

    let archive = store.archive_at(root.path().join("site")).unwrap();
    assert_eq!(archive.replications(), 1);
}

#[tokio::test]
async fn test_dial_unknown_key_is_ignored() {
    let root = common::setup_root(&["site"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = common::listen(&coordinator).await;
    coordinator.init_directory("site").await.unwrap();
    coordinator.share_directory("site", false).await.unwrap();
    common::drain(&mut events);

    let stranger = ArchiveSecret::generate().archive_key().discovery_key();
    let (mut peer, session) = swarm.dial(&stranger).await.unwrap();
    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    session.await.unwrap();

    assert!(received.is_empty());
    assert!(common::drain(&mut events).is_empty());
    assert_eq!(store.archives()[0].replications(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let root = common::setup_root(&["a", "b"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = common::listen(&coordinator).await;

    coordinator.init_directory("a").await.unwrap();
    coordinator.share_directory("a", false).await.unwrap();
    coordinator.init_directory("b").await.unwrap();

    coordinator.shutdown().await.unwrap();

    assert_eq!(coordinator.num_directories(), 0);
    assert_eq!(coordinator.num_sharing(), 0);
    assert!(store.archives().iter().all(|a| a.is_closed()));
    assert!(swarm.is_closed());

    let event = common::next_event(&mut events, |e| matches!(e, ShareEvent::Closed { .. })).await;
    assert_eq!(
        event,
        ShareEvent::Closed {
            operator_initiated: true
        }
    );
    assert!(!coordinator.is_listening());

    let err = coordinator.init_directory("a").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ShuttingDown));
}

#[tokio::test]
async fn test_shutdown_swallows_close_errors() {
    let root = common::setup_root(&["a", "b"]);
    let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    common::listen(&coordinator).await;

    coordinator.init_directory("a").await.unwrap();
    coordinator.share_directory("a", false).await.unwrap();
    coordinator.init_directory("b").await.unwrap();
    let stuck = store.archive_at(root.path().join("a")).unwrap();
    stuck.set_fail_close(true);

    coordinator.shutdown().await.unwrap();

    assert!(!stuck.is_closed());
    assert!(store.archive_at(root.path().join("b")).unwrap().is_closed());
    assert_eq!(coordinator.num_directories(), 0);
    assert!(swarm.is_closed());
}

#[tokio::test]
async fn test_unexpected_transport_close() {
    let root = common::setup_root(&[]);
    let (coordinator, _, swarm) = memory_coordinator(root.path(), 3282).unwrap();
    let mut events = common::listen(&coordinator).await;

    // errors are logged, not republished
    swarm.fail("boom");
    ::common::swarm::SwarmTransport::close(&*swarm).await.unwrap();

    let event = common::next_event(&mut events, |e| matches!(e, ShareEvent::Closed { .. })).await;
    assert_eq!(
        event,
        ShareEvent::Closed {
            operator_initiated: false
        }
    );
}

#[tokio::test]
async fn test_init_racing_shutdown() {
    let root = common::setup_root(&["site"]);
    let store = MemoryArchiveStore::with_creation_delay(Duration::from_millis(200));
    let (coordinator, store, _) = with_store(root.path(), 3282, store).unwrap();

    let pending = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.init_directory("site").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.shutdown().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinatorError::ShuttingDown));
    assert_eq!(coordinator.num_directories(), 0);
    assert_eq!(store.created(), 1);
    assert!(store.archives()[0].is_closed());
}
