// SPDX-License-Identifier: Apache-2.0

//! Coordination tree client surface.
//!
//! The coordination service exposes a hierarchical namespace of nodes,
//! each holding an opaque payload and a write-incremented version.
//! Watches are one-shot: a firing consumes the subscription, and the
//! consumer must re-arm before it can observe the next change of that
//! class. Everything asynchronous a session produces (watch firings
//! and connection-state transitions) is funneled into a single
//! ordered channel so the consumer never races with itself.
//!
//! Two backends implement [`CoordinationSession`]: a ZooKeeper-backed
//! one ([`zookeeper::ZooKeeperSession`]) and an in-memory one
//! ([`memory::MemoryTree`]) used by tests and local development.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod memory;
pub mod zookeeper;

/// Receiver half of a session's notification sink.
pub type NotificationReceiver = mpsc::UnboundedReceiver<TreeNotification>;

/// Node lifetime classes supported by the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLifetime {
    /// Survives the creating session.
    Persistent,
    /// Removed by the service when the creating session ends.
    Ephemeral,
}

/// Subset of per-node metadata the client relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, incremented by the service on every write.
    pub version: i32,
}

/// Asynchronous notifications delivered through a session's sink.
///
/// Delivery order matches the order changes were applied at the
/// coordination service. Watch-firing variants carry the path the
/// watch was armed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNotification {
    /// Session reached the connected state (also emitted on reconnect).
    SessionConnected,
    /// Transport dropped; the session may still recover.
    SessionDisconnected,
    /// Session formally expired; ephemerals owned by it are gone.
    SessionExpired,
    /// Child set of the node at `path` changed.
    ChildrenChanged { path: String },
    /// Payload of the node at `path` changed.
    DataChanged { path: String },
    /// The node at `path` was deleted.
    NodeDeleted { path: String },
}

/// Errors surfaced by coordination tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// Session could not be established, was lost, or was closed locally.
    #[error("connection error: {0}")]
    Connection(String),

    /// Create targeted a path that already holds a node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Operation targeted a path with no node.
    #[error("no node at {0}")]
    NoNode(String),

    /// Conditional write targeted a stale version.
    #[error("version conflict at {path} (expected version {expected})")]
    VersionConflict { path: String, expected: i32 },

    /// Anything else the backend reports.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl TreeError {
    /// True for the benign duplicate-create outcome.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, TreeError::NodeExists(_))
    }
}

/// One session with the coordination tree service.
///
/// The `*_watching` variants arm a one-shot watch of the matching class
/// as part of the read; its eventual firing arrives on the session's
/// notification channel. Implementations must keep notification
/// delivery ordered with respect to the changes that caused it.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Node metadata if a node exists at `path`.
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, TreeError>;

    /// Read a node's payload and metadata.
    async fn read(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError>;

    /// Read and arm a one-shot data-changed/node-deleted watch on `path`.
    async fn read_watching(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError>;

    /// Names (not full paths) of the children of `path`.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, TreeError>;

    /// List children and arm a one-shot children-changed watch on `path`.
    async fn list_children_watching(&self, path: &str) -> Result<Vec<String>, TreeError>;

    /// Create a node. The parent must exist.
    async fn create(
        &self,
        path: &str,
        payload: &[u8],
        lifetime: NodeLifetime,
    ) -> Result<(), TreeError>;

    /// Overwrite a node's payload, conditional on `expected_version`.
    async fn write(
        &self,
        path: &str,
        payload: &[u8],
        expected_version: i32,
    ) -> Result<NodeStat, TreeError>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> Result<(), TreeError>;

    /// Gracefully end the session, releasing its ephemeral nodes.
    /// Idempotent.
    async fn close(&self) -> Result<(), TreeError>;
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Final path component, e.g. `/services/web` -> `web`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_joins() {
        assert_eq!(child_path("/services", "web"), "/services/web");
        assert_eq!(child_path("/", "services"), "/services");
    }

    #[test]
    fn node_name_is_last_component() {
        assert_eq!(node_name("/services/web"), "web");
        assert_eq!(node_name("/services"), "services");
    }
}
