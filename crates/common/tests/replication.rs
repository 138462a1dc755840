//! End-to-end replication of filesystem archives over the in-memory swarm

mod common;

use std::path::Path;
use std::sync::Arc;

use ::common::archive::{read_replica, FsArchiveStore};
use ::common::coordinator::{CoordinatorError, ShareCoordinator};
use ::common::keys::ArchiveSecret;
use ::common::testkit::MemorySwarm;

type FsCoordinator = ShareCoordinator<FsArchiveStore, MemorySwarm>;

fn fs_coordinator(root: &Path) -> (FsCoordinator, Arc<MemorySwarm>) {
    let swarm = Arc::new(MemorySwarm::new());
    let coordinator = FsCoordinator::builder()
        .root_dir(root)
        .port(3282)
        .archive_store(FsArchiveStore::new())
        .transport(swarm.clone())
        .build()
        .unwrap();
    (coordinator, swarm)
}

#[tokio::test]
async fn test_peer_receives_shared_files() {
    let root = common::setup_root(&["site"]);
    common::write_file(root.path(), "site/index.html", b"<h1>hello</h1>");
    common::write_file(root.path(), "site/assets/app.js", b"console.log(1)");

    let (coordinator, swarm) = fs_coordinator(root.path());
    let _events = common::listen(&coordinator).await;
    let outcome = coordinator.sync(&["site"]).await;
    let ids = &outcome.results[0];

    let (mut peer, session) = swarm.dial(&ids.discovery_key).await.unwrap();
    let replica = read_replica(&mut peer, &ids.archive_key).await.unwrap();
    session.await.unwrap();

    assert_eq!(replica.manifest.version, 1);
    assert_eq!(replica.files.len(), 2);
    assert_eq!(replica.file("index.html"), Some(&b"<h1>hello</h1>"[..]));
    assert_eq!(replica.file("assets/app.js"), Some(&b"console.log(1)"[..]));
    // archive metadata is never part of the replica
    assert!(replica.files.iter().all(|(path, _)| !path.starts_with(".dat")));
}

#[tokio::test]
async fn test_replica_rejects_wrong_archive_key() {
    let root = common::setup_root(&["site"]);
    common::write_file(root.path(), "site/index.html", b"hi");

    let (coordinator, swarm) = fs_coordinator(root.path());
    let _events = common::listen(&coordinator).await;
    let outcome = coordinator.sync(&["site"]).await;

    let imposter = ArchiveSecret::generate().archive_key();
    let (mut peer, _session) = swarm.dial(&outcome.results[0].discovery_key).await.unwrap();
    assert!(read_replica(&mut peer, &imposter).await.is_err());
}

#[tokio::test]
async fn test_update_is_seen_by_next_peer() {
    let root = common::setup_root(&["site"]);
    common::write_file(root.path(), "site/index.html", b"v1");

    let (coordinator, swarm) = fs_coordinator(root.path());
    let _events = common::listen(&coordinator).await;
    let ids = coordinator.sync(&["site"]).await.results[0].clone();

    common::write_file(root.path(), "site/index.html", b"version two");
    assert!(coordinator.update_directory("site").await.unwrap());

    let (mut peer, session) = swarm.dial(&ids.discovery_key).await.unwrap();
    let replica = read_replica(&mut peer, &ids.archive_key).await.unwrap();
    session.await.unwrap();

    assert_eq!(replica.manifest.version, 2);
    assert_eq!(replica.file("index.html"), Some(&b"version two"[..]));
}

#[tokio::test]
async fn test_archive_identity_survives_restart() {
    let root = common::setup_root(&["site"]);
    common::write_file(root.path(), "site/index.html", b"hi");

    let (coordinator, _) = fs_coordinator(root.path());
    let first = coordinator.sync(&["site"]).await.results[0].clone();
    coordinator.shutdown().await.unwrap();

    let (coordinator, _) = fs_coordinator(root.path());
    let second = coordinator.sync(&["site"]).await.results[0].clone();

    assert_eq!(first.archive_key, second.archive_key);
    assert_eq!(first.discovery_key, second.discovery_key);
    let archive = coordinator.archive_for_dir("site").unwrap();
    assert!(archive.resumed());
    // nothing changed on disk, so the version is kept
    assert_eq!(archive.version().await, 1);
}

#[tokio::test]
async fn test_copied_archive_metadata_is_refused() {
    let root = common::setup_root(&["a", "b"]);
    common::write_file(root.path(), "a/index.html", b"a");
    let (coordinator, swarm) = fs_coordinator(root.path());
    let _events = common::listen(&coordinator).await;

    coordinator.init_directory("a").await.unwrap();
    let a = coordinator.share_directory("a", false).await.unwrap();

    let secret = std::fs::read(root.path().join("a/.dat/key")).unwrap();
    common::write_file(root.path(), "b/.dat/key", &secret);

    let err = coordinator.init_directory("b").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::DuplicateArchive { .. }));
    assert!(!coordinator.is_tracked("b"));

    // the first directory keeps its archive and swarm membership
    assert_eq!(coordinator.discovery_key_for("a"), Some(a.discovery_key));
    assert!(coordinator.archive_for_key(&a.discovery_key).is_some());
    assert_eq!(coordinator.num_sharing(), 1);
    assert!(swarm.is_joined(&a.discovery_key));
    let (mut peer, session) = swarm.dial(&a.discovery_key).await.unwrap();
    let replica = read_replica(&mut peer, &a.archive_key).await.unwrap();
    session.await.unwrap();
    assert_eq!(replica.file("index.html"), Some(&b"a"[..]));
}
