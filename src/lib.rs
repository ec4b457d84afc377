// SPDX-License-Identifier: Apache-2.0

//! Canopy
//!
//! A service-discovery client for a hierarchical coordination tree
//! (ZooKeeper-style). Each process publishes its own `name -> address`
//! entry as an ephemeral node under a shared registry root and mirrors
//! every other live entry into a local in-memory cache, kept
//! eventually consistent by re-arming the tree's one-shot watches.

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod config;
pub mod logging;
pub mod registry;
pub mod tree;

pub use config::RegistrySettings;
pub use registry::{RegistryError, ServiceRegistry};
pub use tokio_util::sync::CancellationToken;
pub use tree::{
    CoordinationSession, NodeLifetime, NodeStat, TreeError, TreeNotification,
    memory::MemoryTree, zookeeper::ZooKeeperSession,
};
