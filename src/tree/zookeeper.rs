// SPDX-License-Identifier: Apache-2.0

//! ZooKeeper-backed coordination session.
//!
//! Thin adapter over the `zookeeper-client` crate. Every one-shot
//! watch armed here is drained by a small spawned task that forwards
//! the firing into the session's notification channel; session-state
//! transitions are forwarded the same way. Firings of a single watch
//! arrive in server order; no ordering is promised across independent
//! watches.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use zookeeper_client as zk;

use super::{
    CoordinationSession, NodeLifetime, NodeStat, NotificationReceiver, TreeError, TreeNotification,
};

pub struct ZooKeeperSession {
    /// `None` once the session has been closed locally.
    client: Mutex<Option<zk::Client>>,
    sink: mpsc::UnboundedSender<TreeNotification>,
}

impl ZooKeeperSession {
    /// Open a session and block until it is connected. The
    /// `SessionConnected` notification is queued before this returns.
    pub async fn connect(
        endpoint: &str,
        session_timeout: Duration,
    ) -> Result<(Self, NotificationReceiver), TreeError> {
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(endpoint)
            .await
            .map_err(|err| TreeError::Connection(err.to_string()))?;

        let (sink, receiver) = mpsc::unbounded_channel();
        let _ = sink.send(TreeNotification::SessionConnected);

        let mut state_watcher = client.state_watcher();
        let state_sink = sink.clone();
        tokio::spawn(async move {
            loop {
                let state = state_watcher.changed().await;
                let terminated = state.is_terminated();
                if let Some(notification) = state_notification(state) {
                    if state_sink.send(notification).is_err() {
                        break;
                    }
                }
                if terminated {
                    break;
                }
            }
        });

        Ok((
            Self {
                client: Mutex::new(Some(client)),
                sink,
            },
            receiver,
        ))
    }

    fn client(&self) -> Result<zk::Client, TreeError> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| TreeError::Connection("session closed".to_string()))
    }

    /// Forward a one-shot watch firing into the notification channel.
    fn forward(&self, path: &str, watcher: zk::OneshotWatcher) {
        let armed = path.to_string();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            let notification = match event.event_type {
                zk::EventType::NodeChildrenChanged => {
                    TreeNotification::ChildrenChanged { path: armed }
                }
                zk::EventType::NodeDataChanged | zk::EventType::NodeCreated => {
                    TreeNotification::DataChanged { path: armed }
                }
                zk::EventType::NodeDeleted => TreeNotification::NodeDeleted { path: armed },
                // Session transitions are covered by the state watcher.
                _ => return,
            };
            let _ = sink.send(notification);
        });
    }
}

/// Session-state transitions worth surfacing to the consumer.
fn state_notification(state: zk::SessionState) -> Option<TreeNotification> {
    match state {
        zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
            Some(TreeNotification::SessionConnected)
        }
        zk::SessionState::Disconnected => Some(TreeNotification::SessionDisconnected),
        zk::SessionState::Expired => Some(TreeNotification::SessionExpired),
        _ => None,
    }
}

fn map_err(path: &str, expected_version: Option<i32>, err: zk::Error) -> TreeError {
    match err {
        zk::Error::NodeExists => TreeError::NodeExists(path.to_string()),
        zk::Error::NoNode => TreeError::NoNode(path.to_string()),
        zk::Error::BadVersion => TreeError::VersionConflict {
            path: path.to_string(),
            expected: expected_version.unwrap_or(-1),
        },
        other => TreeError::Backend(anyhow::anyhow!("{other}")),
    }
}

#[async_trait]
impl CoordinationSession for ZooKeeperSession {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, TreeError> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|err| map_err(path, None, err))?;
        Ok(stat.map(|stat| NodeStat {
            version: stat.version,
        }))
    }

    async fn read(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError> {
        let (payload, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|err| map_err(path, None, err))?;
        Ok((
            payload,
            NodeStat {
                version: stat.version,
            },
        ))
    }

    async fn read_watching(&self, path: &str) -> Result<(Vec<u8>, NodeStat), TreeError> {
        let (payload, stat, watcher) = self
            .client()?
            .get_and_watch_data(path)
            .await
            .map_err(|err| map_err(path, None, err))?;
        self.forward(path, watcher);
        Ok((
            payload,
            NodeStat {
                version: stat.version,
            },
        ))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, TreeError> {
        self.client()?
            .list_children(path)
            .await
            .map_err(|err| map_err(path, None, err))
    }

    async fn list_children_watching(&self, path: &str) -> Result<Vec<String>, TreeError> {
        let (children, _stat, watcher) = self
            .client()?
            .get_and_watch_children(path)
            .await
            .map_err(|err| map_err(path, None, err))?;
        self.forward(path, watcher);
        Ok(children)
    }

    async fn create(
        &self,
        path: &str,
        payload: &[u8],
        lifetime: NodeLifetime,
    ) -> Result<(), TreeError> {
        let mode = match lifetime {
            NodeLifetime::Persistent => zk::CreateMode::Persistent,
            NodeLifetime::Ephemeral => zk::CreateMode::Ephemeral,
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        self.client()?
            .create(path, payload, &options)
            .await
            .map_err(|err| map_err(path, None, err))?;
        Ok(())
    }

    async fn write(
        &self,
        path: &str,
        payload: &[u8],
        expected_version: i32,
    ) -> Result<NodeStat, TreeError> {
        let stat = self
            .client()?
            .set_data(path, payload, Some(expected_version))
            .await
            .map_err(|err| map_err(path, Some(expected_version), err))?;
        Ok(NodeStat {
            version: stat.version,
        })
    }

    async fn delete(&self, path: &str) -> Result<(), TreeError> {
        self.client()?
            .delete(path, None)
            .await
            .map_err(|err| map_err(path, None, err))
    }

    async fn close(&self) -> Result<(), TreeError> {
        // Dropping the last handle ends the session; the server then
        // reclaims every ephemeral it owned.
        let _ = self.client.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_states_map_to_notifications() {
        assert_eq!(
            state_notification(zk::SessionState::SyncConnected),
            Some(TreeNotification::SessionConnected)
        );
        assert_eq!(
            state_notification(zk::SessionState::ConnectedReadOnly),
            Some(TreeNotification::SessionConnected)
        );
        assert_eq!(
            state_notification(zk::SessionState::Disconnected),
            Some(TreeNotification::SessionDisconnected)
        );
        assert_eq!(
            state_notification(zk::SessionState::Expired),
            Some(TreeNotification::SessionExpired)
        );
        assert_eq!(state_notification(zk::SessionState::Closed), None);
        assert_eq!(state_notification(zk::SessionState::AuthFailed), None);
    }
}
