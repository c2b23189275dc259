//! plfm-vt Node Agent ("Manager")
//!
//! Runs on a single bare-metal host and owns the full lifecycle of the
//! Firecracker microVMs scheduled onto it: provisioning storage and
//! networking, driving the jailer and Firecracker API, and exposing the
//! `/v1` REST surface that callers use to create, start, stop, exec into,
//! and snapshot VMs.

use std::sync::Arc;

use anyhow::{Context, Result};
use plfm_node_agent::firecracker::{FirecrackerDriver, FirecrackerDriverConfig};
use plfm_node_agent::network::NetworkManager;
use plfm_node_agent::state::StateStore;
use plfm_node_agent::storage::StorageProvider;
use plfm_node_agent::{api, config, VmService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt node agent");
    info!(listen_addr = %config.listen_addr, storage_root = %config.storage_root.display(), "Configuration loaded");

    tokio::fs::create_dir_all(&config.storage_root)
        .await
        .context("failed to create storage root")?;

    let store = Arc::new(
        StateStore::open(config.storage_root.join("state.db")).context("failed to open state store")?,
    );

    let storage = Arc::new(StorageProvider::new(
        config.storage_root.clone(),
        config.images_dir.clone(),
        config.rootfs_clone_mode,
    ));

    let network = Arc::new(
        NetworkManager::new(&config.network_pool_cidr, &config.egress_iface)
            .context("failed to initialize host networking")?,
    );

    let driver = Arc::new(FirecrackerDriver::new(FirecrackerDriverConfig {
        firecracker_bin: config.firecracker_bin.clone(),
        jailer_bin: config.jailer_bin.clone(),
        chroot_base: config.storage_root.join("jail"),
        jail_uid: config.jail_uid,
        jail_gid: config.jail_gid,
        boot_timeout: config.limits.agent_boot_timeout,
    }));

    let vm_service = Arc::new(VmService::new(
        config.limits.clone(),
        config.kernel_path.clone(),
        store,
        storage,
        network,
        driver,
    ));

    let state = api::AppState {
        vm_service,
        api_key: Arc::from(config.api_key.as_str()),
        enable_snapshots: config.enable_snapshots,
    };

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .context("server error")?;

    Ok(())
}
