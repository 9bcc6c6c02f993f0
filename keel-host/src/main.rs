//! Entry point for the `keel-host` HTTP server.

use std::sync::Arc;

use keel_core::HostEnv;
use keel_host::{routes::service_routes, DatabaseHost, HostConfig};
use keel_store::{LocalBlobStore, PostgresConnector};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let env = match HostEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            tracing::error!(error = %e, "invalid environment");
            std::process::exit(1);
        }
    };

    let blobs = Arc::new(LocalBlobStore::from_env(&env));
    let config = HostConfig::new(env.clone()).with_identity(env.identity.clone());
    let server = DatabaseHost::new(config, PostgresConnector, move |sessions| {
        service_routes(sessions, blobs)
    });

    match server.host().start(None).await {
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    }

    if let Some(addr) = server.host().local_addr().await {
        info!(addr = %addr, deploy_env = %env.deploy_env, "keel-host listening");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    if let Err(e) = server.host().stop().await {
        tracing::error!(error = %e, "server error during shutdown");
        std::process::exit(1);
    }
}
