// SPDX-License-Identifier: Apache-2.0

//! Registry synchronizer.
//!
//! Owns the local `name -> address` mirror of the registry root's
//! children and keeps it eventually consistent by reacting to the
//! coordination tree's notifications. All cache mutation driven by
//! notifications happens on one dispatcher task consuming the
//! session's ordered channel, so the handler never races with itself;
//! `register` and `services` may be called from anywhere concurrently,
//! which is why the cache lives behind its own mutex.
//!
//! A topology change triggers a reconcile-from-scratch: re-arm the
//! children watch, relist, rebuild the cache. The reconcile also
//! re-arms the per-entry data watch of every child it reads, so a
//! topology event can never leave a live entry without data-change
//! coverage. A data change on a single entry takes the cheaper path:
//! re-arm, re-read, patch that entry alone.
//!
//! Errors met while reconciling are logged and swallowed: a missed
//! update is repaired by the next firing, and the design prefers a
//! stale-for-one-round cache over a crashed consumer. The one call
//! that must not stay failed is re-arming the children watch itself,
//! since without it no further topology event arrives; that call gets
//! a short bounded retry before the failure is given up on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tree::{
    CoordinationSession, NodeLifetime, NotificationReceiver, TreeError, TreeNotification,
    child_path, node_name,
};

/// Errors surfaced by the registry's startup-path operations.
/// Notification-path errors are never surfaced; they are logged by the
/// dispatcher and healed by the next reconcile.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registry root creation or initial enumeration failed.
    #[error("failed to initialise registry: {0}")]
    Initialisation(#[source] TreeError),

    /// Publishing this process's own entry failed.
    #[error("failed to register service {name}: {source}")]
    Registration {
        name: String,
        #[source]
        source: TreeError,
    },
}

const CHILDREN_WATCH_RETRIES: u32 = 3;
const CHILDREN_WATCH_BACKOFF: Duration = Duration::from_millis(100);

pub struct ServiceRegistry {
    session: Arc<dyn CoordinationSession>,
    root: String,
    services: Mutex<HashMap<String, String>>,
    cancel: CancellationToken,
}

impl ServiceRegistry {
    pub fn new(session: Arc<dyn CoordinationSession>, root: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session,
            root: root.into(),
            services: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Seed the cache and arm the first round of watches.
    ///
    /// Creates the registry root if this process is the first to find
    /// it missing; a concurrent create by another process is treated
    /// as success. Safe to call more than once.
    pub async fn initialise(&self) -> Result<(), RegistryError> {
        let root_stat = self
            .session
            .exists(&self.root)
            .await
            .map_err(RegistryError::Initialisation)?;
        if root_stat.is_none() {
            match self
                .session
                .create(&self.root, b"", NodeLifetime::Persistent)
                .await
            {
                Ok(()) => tracing::info!(root = %self.root, "created registry root"),
                Err(err) if err.is_node_exists() => {
                    tracing::debug!(root = %self.root, "registry root created concurrently")
                }
                Err(err) => return Err(RegistryError::Initialisation(err)),
            }
        }

        let children = self
            .session
            .list_children_watching(&self.root)
            .await
            .map_err(RegistryError::Initialisation)?;
        for name in children {
            let path = child_path(&self.root, &name);
            match self.session.read_watching(&path).await {
                Ok((payload, _)) => {
                    if let Some(address) = decode_address(&name, payload) {
                        self.services.lock().insert(name, address);
                    }
                }
                // Vanished between list and read; the armed children
                // watch already covers the removal.
                Err(TreeError::NoNode(_)) => {}
                Err(err) => return Err(RegistryError::Initialisation(err)),
            }
        }
        Ok(())
    }

    /// Publish or update this process's own entry.
    ///
    /// A leftover node (crash-and-fast-restart before the old session
    /// expired, or an address update) is overwritten at its freshly
    /// observed version. The local cache entry is written directly:
    /// the writer already knows the value, so its own entry is
    /// authoritative without waiting for the self-fired watch.
    pub async fn register(&self, name: &str, address: &str) -> Result<(), RegistryError> {
        let path = child_path(&self.root, name);
        let result = match self.session.exists(&path).await {
            Ok(None) => self
                .session
                .create(&path, address.as_bytes(), NodeLifetime::Ephemeral)
                .await
                .map(|()| "registered"),
            Ok(Some(stat)) => self
                .session
                .write(&path, address.as_bytes(), stat.version)
                .await
                .map(|_| "updated"),
            Err(err) => Err(err),
        };
        match result {
            Ok(action) => tracing::info!(service = name, %address, "{action} service"),
            Err(source) => {
                return Err(RegistryError::Registration {
                    name: name.to_string(),
                    source,
                });
            }
        }

        self.services
            .lock()
            .insert(name.to_string(), address.to_string());
        Ok(())
    }

    /// Point-in-time copy of the cache.
    pub fn services(&self) -> HashMap<String, String> {
        self.services.lock().clone()
    }

    /// Consume the session's notification channel until shutdown or
    /// channel close. The single consumer is what serializes all
    /// notification-driven cache mutation.
    pub fn spawn_dispatcher(self: Arc<Self>, mut receiver: NotificationReceiver) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = receiver.recv() => match notification {
                        Some(notification) => self.handle_notification(notification).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("registry dispatcher stopped");
        })
    }

    /// Stop the dispatcher and close the session. Sequence this after
    /// any in-flight `initialise`/`register` has returned.
    pub async fn shutdown(&self) -> Result<(), TreeError> {
        self.cancel.cancel();
        self.session.close().await
    }

    async fn handle_notification(&self, notification: TreeNotification) {
        match notification {
            TreeNotification::SessionConnected => {
                tracing::info!("connected to coordination service");
            }
            TreeNotification::SessionDisconnected => {
                // Watches and ephemerals survive a transient disconnect
                // under the session model; keep the cache as-is.
                tracing::warn!("disconnected from coordination service; cache retained");
            }
            TreeNotification::SessionExpired => {
                tracing::warn!("coordination session expired; own registration is gone");
            }
            TreeNotification::ChildrenChanged { path } if path == self.root => {
                if let Err(err) = self.reconcile_all().await {
                    tracing::warn!(%err, "reconcile after topology change failed; awaiting next change");
                }
            }
            TreeNotification::ChildrenChanged { path } => {
                tracing::debug!(%path, "ignoring children change outside registry root");
            }
            TreeNotification::DataChanged { path } => {
                let name = node_name(&path).to_string();
                if let Err(err) = self.reconcile_entry(&name).await {
                    tracing::warn!(service = %name, %err, "entry refresh failed; awaiting next change");
                }
            }
            TreeNotification::NodeDeleted { path } => {
                let name = node_name(&path);
                if self.services.lock().remove(name).is_some() {
                    tracing::info!(service = %name, "service removed");
                }
            }
        }
    }

    /// Full reconcile after a topology change.
    async fn reconcile_all(&self) -> Result<(), TreeError> {
        // Re-arm the children watch before reading anything, so a
        // change landing mid-reconcile still triggers the next round.
        let children = self.arm_children_watch().await?;
        let mut fresh = HashMap::with_capacity(children.len());
        for name in children {
            let path = child_path(&self.root, &name);
            match self.session.read_watching(&path).await {
                Ok((payload, _)) => {
                    if let Some(address) = decode_address(&name, payload) {
                        fresh.insert(name, address);
                    }
                }
                // Raced a delete; the next children firing reconciles.
                Err(TreeError::NoNode(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let mut services = self.services.lock();
        services.clear();
        services.extend(fresh);
        tracing::info!(count = services.len(), "registry reconciled");
        Ok(())
    }

    /// List the root's children with the children watch re-armed.
    ///
    /// Losing this watch is the only way the registry stops hearing
    /// about topology changes, so a failure here is retried a few
    /// times before it is surfaced to the dispatcher's log.
    async fn arm_children_watch(&self) -> Result<Vec<String>, TreeError> {
        let mut attempt = 0;
        loop {
            match self.session.list_children_watching(&self.root).await {
                Ok(children) => return Ok(children),
                Err(err) if attempt < CHILDREN_WATCH_RETRIES => {
                    attempt += 1;
                    tracing::warn!(%err, attempt, "re-arming children watch failed; retrying");
                    tokio::time::sleep(CHILDREN_WATCH_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Refresh one entry after its data watch fired.
    async fn reconcile_entry(&self, name: &str) -> Result<(), TreeError> {
        let path = child_path(&self.root, name);
        match self.session.read_watching(&path).await {
            Ok((payload, _)) => {
                if let Some(address) = decode_address(name, payload) {
                    self.services.lock().insert(name.to_string(), address);
                }
                Ok(())
            }
            Err(TreeError::NoNode(_)) => {
                self.services.lock().remove(name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Entry payloads are UTF-8 addresses; anything else is skipped, not
/// fatal.
fn decode_address(name: &str, payload: Vec<u8>) -> Option<String> {
    match String::from_utf8(payload) {
        Ok(address) => Some(address),
        Err(_) => {
            tracing::warn!(service = %name, "skipping entry with non-UTF-8 payload");
            None
        }
    }
}
