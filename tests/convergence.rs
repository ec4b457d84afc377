// SPDX-License-Identifier: Apache-2.0

//! End-to-end convergence of the registry cache over the in-memory
//! coordination tree: one dispatcher per registry, external actors
//! mutating the tree through their own sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canopy::{CoordinationSession, MemoryTree, NodeLifetime, ServiceRegistry};

/// Poll until `condition` holds; panics if it never does.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn start_registry(tree: &MemoryTree) -> Arc<ServiceRegistry> {
    let (session, notifications) = tree.connect();
    let registry = ServiceRegistry::new(Arc::new(session), "/services");
    registry.clone().spawn_dispatcher(notifications);
    registry
}

#[tokio::test]
async fn converges_on_addition() {
    let tree = MemoryTree::new();
    let registry = start_registry(&tree);
    registry.initialise().await.unwrap();
    assert!(registry.services().is_empty());

    let (actor, _actor_rx) = tree.connect();
    actor
        .create("/services/service1", b"host1:1234", NodeLifetime::Ephemeral)
        .await
        .unwrap();

    wait_until("service1 to appear", || {
        registry.services()
            == HashMap::from([("service1".to_string(), "host1:1234".to_string())])
    })
    .await;
}

#[tokio::test]
async fn converges_on_removal() {
    let tree = MemoryTree::new();
    let registry = start_registry(&tree);
    registry.initialise().await.unwrap();

    let (actor, _actor_rx) = tree.connect();
    actor
        .create("/services/service1", b"host1:1234", NodeLifetime::Ephemeral)
        .await
        .unwrap();
    wait_until("service1 to appear", || {
        registry.services().contains_key("service1")
    })
    .await;

    // Ending the owning session releases the ephemeral entry.
    actor.close().await.unwrap();
    wait_until("service1 to disappear", || {
        !registry.services().contains_key("service1")
    })
    .await;
}

#[tokio::test]
async fn converges_on_update() {
    let tree = MemoryTree::new();
    let registry = start_registry(&tree);
    registry.initialise().await.unwrap();

    let (actor, _actor_rx) = tree.connect();
    actor
        .create("/services/service1", b"host1:1234", NodeLifetime::Ephemeral)
        .await
        .unwrap();
    wait_until("service1 to appear", || {
        registry.services().contains_key("service1")
    })
    .await;

    actor
        .write("/services/service1", b"host2:6789", 0)
        .await
        .unwrap();
    wait_until("service1 to change address", || {
        registry.services().get("service1") == Some(&"host2:6789".to_string())
    })
    .await;
}

#[tokio::test]
async fn data_watches_survive_topology_changes() {
    let tree = MemoryTree::new();
    let registry = start_registry(&tree);
    registry.initialise().await.unwrap();

    let (actor, _actor_rx) = tree.connect();
    actor
        .create("/services/service1", b"host1:1234", NodeLifetime::Ephemeral)
        .await
        .unwrap();
    wait_until("service1 to appear", || {
        registry.services().contains_key("service1")
    })
    .await;

    // A second topology change reconciles the cache from scratch.
    actor
        .create("/services/service2", b"host2:2345", NodeLifetime::Ephemeral)
        .await
        .unwrap();
    wait_until("service2 to appear", || {
        registry.services().contains_key("service2")
    })
    .await;

    // service1's data watch must still be armed after the reconcile.
    actor
        .write("/services/service1", b"host9:9999", 0)
        .await
        .unwrap();
    wait_until("service1 to change address", || {
        registry.services().get("service1") == Some(&"host9:9999".to_string())
    })
    .await;
}

#[tokio::test]
async fn multiple_registrants_see_each_other() {
    let tree = MemoryTree::new();
    let first = start_registry(&tree);
    let second = start_registry(&tree);

    first.initialise().await.unwrap();
    second.initialise().await.unwrap();

    first.register("service1", "host1:1111").await.unwrap();
    second.register("service2", "host2:2222").await.unwrap();

    let expected = HashMap::from([
        ("service1".to_string(), "host1:1111".to_string()),
        ("service2".to_string(), "host2:2222".to_string()),
    ]);
    wait_until("first registry to hold both entries", || {
        first.services() == expected
    })
    .await;
    wait_until("second registry to hold both entries", || {
        second.services() == expected
    })
    .await;
}

#[tokio::test]
async fn concurrent_initialise_creates_one_root() {
    let tree = MemoryTree::new();
    let first = start_registry(&tree);
    let second = start_registry(&tree);

    let (a, b) = tokio::join!(first.initialise(), second.initialise());
    a.unwrap();
    b.unwrap();

    let (probe, _probe_rx) = tree.connect();
    assert_eq!(
        probe.list_children("/").await.unwrap(),
        vec!["services".to_string()]
    );
}

#[tokio::test]
async fn expired_registrant_self_heals() {
    let tree = MemoryTree::new();
    let observer = start_registry(&tree);
    observer.initialise().await.unwrap();

    let (owner_session, _owner_rx) = tree.connect();
    let owner_session = Arc::new(owner_session);
    let owner = ServiceRegistry::new(owner_session.clone(), "/services");
    owner.initialise().await.unwrap();
    owner.register("flaky", "host:1").await.unwrap();

    wait_until("flaky to appear", || {
        observer.services().contains_key("flaky")
    })
    .await;

    // Cleanup needs no cooperation from the dead process.
    tree.expire(&owner_session);

    wait_until("flaky to disappear", || {
        !observer.services().contains_key("flaky")
    })
    .await;
}
