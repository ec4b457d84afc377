// SPDX-License-Identifier: Apache-2.0

//! In-memory coordination tree.
//!
//! A single-process stand-in for the real coordination service, with
//! the same observable contract: versioned nodes, persistent and
//! ephemeral lifetimes, one-shot watches, and per-session ordered
//! notification delivery. Backs the integration tests and local
//! development; it deliberately has no consensus, replication or
//! durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    CoordinationSession, NodeLifetime, NodeStat, NotificationReceiver, TreeError, TreeNotification,
};

type SessionId = u64;

#[derive(Default)]
struct Node {
    payload: Vec<u8>,
    version: i32,
    /// Owning session for ephemeral nodes; `None` for persistent ones.
    owner: Option<SessionId>,
    /// One-shot data-changed/node-deleted subscriptions.
    data_watchers: Vec<SessionId>,
    /// One-shot children-changed subscriptions.
    child_watchers: Vec<SessionId>,
}

struct TreeState {
    nodes: BTreeMap<String, Node>,
    sinks: HashMap<SessionId, mpsc::UnboundedSender<TreeNotification>>,
    next_session: SessionId,
}

impl TreeState {
    fn notify(&self, session: SessionId, notification: TreeNotification) {
        if let Some(sink) = self.sinks.get(&session) {
            // A closed receiver just means the consumer is gone.
            let _ = sink.send(notification);
        }
    }

    fn fire_data_watchers(&mut self, path: &str, deleted: bool) {
        let Some(node) = self.nodes.get_mut(path) else {
            return;
        };
        let watchers = std::mem::take(&mut node.data_watchers);
        for session in watchers {
            let notification = if deleted {
                TreeNotification::NodeDeleted {
                    path: path.to_string(),
                }
            } else {
                TreeNotification::DataChanged {
                    path: path.to_string(),
                }
            };
            self.notify(session, notification);
        }
    }

    fn fire_child_watchers(&mut self, path: &str) {
        let Some(node) = self.nodes.get_mut(path) else {
            return;
        };
        let watchers = std::mem::take(&mut node.child_watchers);
        for session in watchers {
            self.notify(
                session,
                TreeNotification::ChildrenChanged {
                    path: path.to_string(),
                },
            );
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    /// Remove a node, firing its deletion and its parent's child watches.
    fn remove_node(&mut self, path: &str) {
        self.fire_data_watchers(path, true);
        self.nodes.remove(path);
        let parent = parent_path(path);
        self.fire_child_watchers(&parent);
    }

    /// End a session: drop its sink and release every ephemeral it owns.
    fn end_session(&mut self, session: SessionId, expired: bool) {
        if expired {
            self.notify(session, TreeNotification::SessionExpired);
        }
        if self.sinks.remove(&session).is_none() {
            return;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }
    }
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn validate_path(path: &str) -> Result<(), TreeError> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
        return Err(TreeError::Backend(anyhow::anyhow!("invalid path: {path}")));
    }
    Ok(())
}

/// Shared in-memory tree; clone handles to connect multiple sessions.
#[derive(Clone)]
pub struct MemoryTree {
    state: Arc<Mutex<TreeState>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            state: Arc::new(Mutex::new(TreeState {
                nodes,
                sinks: HashMap::new(),
                next_session: 1,
            })),
        }
    }

    /// Open a session. The connected notification is queued before the
    /// receiver is handed back.
    pub fn connect(&self) -> (MemorySession, NotificationReceiver) {
        let (sink, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_session;
            state.next_session += 1;
            state.sinks.insert(id, sink);
            state.notify(id, TreeNotification::SessionConnected);
            id
        };
        (
            MemorySession {
                tree: self.clone(),
                id,
            },
            receiver,
        )
    }

    /// Force-expire a session, as the service would after missed
    /// heartbeats. Its ephemerals are released and watchers notified.
    pub fn expire(&self, session: &MemorySession) {
        self.state.lock().end_session(session.id, true);
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

/// One session against a [`MemoryTree`].
pub struct MemorySession {
    tree: MemoryTree,
    id: SessionId,
}

impl MemorySession {
    fn guard<'a>(
        &self,
        state: &'a mut TreeState,
    ) -> Result<&'a mut TreeState, TreeError> {
        if !state.sinks.contains_key(&self.id) {
            return Err(TreeError::Connection("session closed".to_string()));
        }
        Ok(state)
    }
}

impl Drop for MemorySession {
    /// A dropped handle ends the session, as abandoning a real client
    /// connection eventually would.
    fn drop(&mut self) {
        self.tree.state.lock().end_session(self.id, false);
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        Ok(state.nodes.get(path).map(|node| NodeStat {
            version: node.version,
        }))
    }

    async fn read(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        Ok((
            node.payload.clone(),
            NodeStat {
                version: node.version,
            },
        ))
    }

    async fn read_watching(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        let id = self.id;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        // Re-arming an identical watch is idempotent, as in the real
        // service: one firing per session per class.
        if !node.data_watchers.contains(&id) {
            node.data_watchers.push(id);
        }
        Ok((
            node.payload.clone(),
            NodeStat {
                version: node.version,
            },
        ))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        if !state.nodes.contains_key(path) {
            return Err(TreeError::NoNode(path.to_string()));
        }
        Ok(state.children_of(path))
    }

    async fn list_children_watching(&self, path: &str) -> Result<Vec<String>, TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        let id = self.id;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        if !node.child_watchers.contains(&id) {
            node.child_watchers.push(id);
        }
        Ok(state.children_of(path))
    }

    async fn create(
        &self,
        path: &str,
        payload: &[u8],
        lifetime: NodeLifetime,
    ) -> Result<(), TreeError> {
        validate_path(path)?;
        if path == "/" {
            return Err(TreeError::NodeExists(path.to_string()));
        }
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        let parent = parent_path(path);
        if !state.nodes.contains_key(&parent) {
            return Err(TreeError::NoNode(parent));
        }
        if state.nodes.contains_key(path) {
            return Err(TreeError::NodeExists(path.to_string()));
        }
        let owner = match lifetime {
            NodeLifetime::Persistent => None,
            NodeLifetime::Ephemeral => Some(self.id),
        };
        state.nodes.insert(
            path.to_string(),
            Node {
                payload: payload.to_vec(),
                version: 0,
                owner,
                data_watchers: Vec::new(),
                child_watchers: Vec::new(),
            },
        );
        state.fire_child_watchers(&parent);
        Ok(())
    }

    async fn write(
        &self,
        path: &str,
        payload: &[u8],
        expected_version: i32,
    ) -> Result<NodeStat, TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        if node.version != expected_version {
            return Err(TreeError::VersionConflict {
                path: path.to_string(),
                expected: expected_version,
            });
        }
        node.payload = payload.to_vec();
        node.version += 1;
        let stat = NodeStat {
            version: node.version,
        };
        state.fire_data_watchers(path, false);
        Ok(stat)
    }

    async fn delete(&self, path: &str) -> Result<(), TreeError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        let state = self.guard(&mut state)?;
        if !state.nodes.contains_key(path) {
            return Err(TreeError::NoNode(path.to_string()));
        }
        if !state.children_of(path).is_empty() {
            return Err(TreeError::Backend(anyhow::anyhow!(
                "node {path} has children"
            )));
        }
        state.remove_node(path);
        Ok(())
    }

    async fn close(&self) -> Result<(), TreeError> {
        self.tree.state.lock().end_session(self.id, false);
        Ok(())
    }
}
