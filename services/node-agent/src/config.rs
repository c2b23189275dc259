//! Configuration for the node agent ("Manager").

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::storage::CloneMode;
use crate::vm_service::VmServiceLimits;

/// Node agent configuration, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for the HTTP API.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`.
    pub log_level: String,

    /// API key expected on `X-Api-Key` for every `/v1` request.
    pub api_key: String,

    /// Root directory for per-VM rootfs copies, logs, and snapshots.
    pub storage_root: PathBuf,

    /// Directory holding base kernel/rootfs images, keyed by image id.
    pub images_dir: PathBuf,

    /// Fixed VSOCK port the guest agent listens on inside every VM.
    pub agent_vsock_port: u32,

    pub limits: VmServiceLimits,

    /// Whether `/v1/snapshots` and `POST /v1/vms/:id/snapshots` are enabled.
    pub enable_snapshots: bool,
    pub snapshot_template_cpu: u32,
    pub snapshot_template_mem_mb: u32,

    /// How a per-VM rootfs is derived from its base image.
    pub rootfs_clone_mode: CloneMode,

    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub kernel_path: PathBuf,
    pub jail_uid: u32,
    pub jail_gid: u32,

    /// Host `/30` pool CIDR that per-VM guest/host address pairs are carved from.
    pub network_pool_cidr: String,
    /// Host interface used for SNAT of guest egress traffic.
    pub egress_iface: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("LISTEN_ADDR", "127.0.0.1:8080")
            .parse()
            .context("invalid LISTEN_ADDR")?;

        let log_level = env_or("LOG_LEVEL", "info");

        let api_key = std::env::var("API_KEY").context("API_KEY must be set")?;

        let storage_root = PathBuf::from(env_or("STORAGE_ROOT", "/var/lib/plfm-node-agent"));
        let images_dir = PathBuf::from(env_or("IMAGES_DIR", "/var/lib/plfm-node-agent/images"));

        let agent_vsock_port = env_parse("AGENT_VSOCK_PORT", crate::agent_protocol::AGENT_VSOCK_PORT)?;

        let limits = VmServiceLimits {
            max_vms: env_parse("MAX_VMS", 64)?,
            max_cpu: env_parse("MAX_CPU", 8)?,
            max_mem_mb: env_parse("MAX_MEM_MB", 16384)?,
            max_allow_ips: env_parse("MAX_ALLOW_IPS", 64)?,
            max_exec_timeout_ms: env_parse("MAX_EXEC_TIMEOUT_MS", 120_000)?,
            max_run_timeout_ms: env_parse("MAX_RUN_TS_TIMEOUT_MS", 120_000)?,
            agent_boot_timeout: Duration::from_secs(env_parse("AGENT_BOOT_TIMEOUT_SECS", 15)?),
        };

        let enable_snapshots = env_bool("ENABLE_SNAPSHOTS", false);
        let snapshot_template_cpu = env_parse("SNAPSHOT_TEMPLATE_CPU", 2)?;
        let snapshot_template_mem_mb = env_parse("SNAPSHOT_TEMPLATE_MEM_MB", 1024)?;

        let rootfs_clone_mode = CloneMode::from_env_str(&env_or("ROOTFS_CLONE_MODE", "auto"));

        let firecracker_bin = PathBuf::from(env_or("FIRECRACKER_BIN", "/usr/bin/firecracker"));
        let jailer_bin = PathBuf::from(env_or("JAILER_BIN", "/usr/bin/jailer"));
        let kernel_path = PathBuf::from(env_or(
            "KERNEL_PATH",
            "/var/lib/plfm-node-agent/images/default/vmlinux",
        ));
        let jail_uid = env_parse("JAIL_UID", 1000)?;
        let jail_gid = env_parse("JAIL_GID", 1000)?;

        let network_pool_cidr = env_or("NETWORK_POOL_CIDR", "172.16.0.0/16");
        let egress_iface = env_or("EGRESS_IFACE", "eth0");

        Ok(Self {
            listen_addr,
            log_level,
            api_key,
            storage_root,
            images_dir,
            agent_vsock_port,
            limits,
            enable_snapshots,
            snapshot_template_cpu,
            snapshot_template_mem_mb,
            rootfs_clone_mode,
            firecracker_bin,
            jailer_bin,
            kernel_path,
            jail_uid,
            jail_gid,
            network_pool_cidr,
            egress_iface,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
