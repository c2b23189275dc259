//! Firecracker microVM driver: jailer spawn, HTTP-over-UNIX-socket API
//! client, and the boot/restore/snapshot/destroy sequences that drive a
//! single VM's underlying Firecracker process.
//!
//! ## Components
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: VM configuration structures (machine, boot, drives, network)
//! - `jailer`: Sandbox configuration and cgroup setup
//! - `driver`: `FirecrackerDriver`, the boot/restore/snapshot/destroy sequences

mod api;
mod config;
mod driver;
mod jailer;

pub use api::{ApiError, CreateSnapshotRequest, FirecrackerClient, InstanceInfo, LoadSnapshotRequest};
pub use config::{
    generate_mac_address, network_boot_args, BootSource, DriveConfig, MachineConfig,
    NetworkInterface, VsockConfig,
};
pub use driver::{
    BootOutcome, BootParams, FirecrackerDriver, FirecrackerDriverConfig, FirecrackerError,
    RestoreParams, RunningVm,
};
pub use jailer::{JailerConfig, SandboxManager};
