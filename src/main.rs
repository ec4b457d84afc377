// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use clap::Parser;

use canopy::{
    RegistrySettings, Result, ServiceRegistry, ZooKeeperSession, logging,
};

#[derive(Parser)]
#[command(author, version, about = "Register a service and mirror the registry", long_about = None)]
struct Args {
    /// Name to register this service under
    service_name: String,

    /// Address other services should use to reach it, e.g. host:port
    service_address: String,

    /// Coordination service endpoint (overrides CANOPY_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Registry root node (overrides CANOPY_ROOT)
    #[arg(long)]
    root: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut settings = RegistrySettings::from_env()?;
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(root) = args.root {
        settings.root = root;
    }

    tracing::info!(endpoint = %settings.endpoint, "connecting to coordination service");
    let (session, notifications) =
        ZooKeeperSession::connect(&settings.endpoint, settings.session_timeout()).await?;

    let registry = ServiceRegistry::new(Arc::new(session), settings.root);
    let dispatcher = registry.clone().spawn_dispatcher(notifications);

    registry.initialise().await?;
    registry
        .register(&args.service_name, &args.service_address)
        .await?;
    tracing::info!(services = ?registry.services(), "registry initialised");

    // Runs until externally terminated.
    tokio::signal::ctrl_c().await?;

    registry.shutdown().await?;
    dispatcher.await?;
    Ok(())
}
