use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ssh_relay::http::{self, AppState, StaticTokenAuthenticator};
use ssh_relay::inventory::{Inventory, InventoryError};
use ssh_relay::rate_limit::RateLimiter;
use ssh_relay::session::{ManagerConfig, RelayServices, SshConnectionManager, TracingAuditLog};
use ssh_relay::ssh::{HostKeyPolicy, RusshConnector};
use ssh_relay::{init_logging, open_store, ConfigError, RelayConfig, RelayError, StoreError};

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        error!("SSH relay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = RelayConfig::resolve(std::env::args_os().nth(1).map(PathBuf::from))?;
    info!(
        "Starting SSH relay on {} (store {:?}, max sessions {})",
        config.listen_addr, config.store, config.max_sessions
    );

    let store = open_store(&config.store).await?;

    let inventory = match &config.inventory_path {
        Some(path) => Arc::new(Inventory::load(path)?),
        None => {
            warn!("No inventory configured; every connect request will be denied");
            Arc::new(Inventory::default())
        }
    };
    let authenticator = StaticTokenAuthenticator::new(inventory.tokens());
    if authenticator.is_empty() {
        warn!("No API tokens configured; every request will be rejected as unauthenticated");
    }

    let policy = Arc::new(HostKeyPolicy::new(config.known_hosts_path.clone()));
    info!("Host keys pinned in {:?}", policy.path());

    let services = RelayServices {
        hosts: inventory.clone(),
        mappings: inventory.clone(),
        secrets: inventory,
        audit: Arc::new(TracingAuditLog),
        connector: Arc::new(RusshConnector::new(policy, config.ssh_timeout())),
    };
    if config.trust_forwarded_headers {
        info!("Client addresses taken from forwarding headers");
    }
    let manager = SshConnectionManager::new(store, services, ManagerConfig::from(&config));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    let shutdown = CancellationToken::new();
    let sweeper = manager.start_expiry_sweeper();
    let eviction = limiter.start_eviction(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let state = AppState {
        manager: manager.clone(),
        authenticator: Arc::new(authenticator),
        limiter,
        public_websocket_base: config.public_websocket_base.clone(),
        trust_forwarded_headers: config.trust_forwarded_headers,
    };
    let served = http::serve(config.listen_addr, state, shutdown.clone()).await;

    shutdown.cancel();
    manager.shutdown().await;
    let _ = sweeper.await;
    let _ = eviction.await;
    info!("SSH relay stopped");

    served?;
    Ok(())
}
