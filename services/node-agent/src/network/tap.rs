//! TAP device creation and management.
//!
//! Creates and configures TAP devices for Firecracker microVMs. Each VM
//! gets a dedicated TAP device for its virtio-net interface (eth0 inside
//! the guest), addressed as a point-to-point `/30`: the host side holds
//! `.1`, the guest side `.2`.

use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

/// TAP device configuration.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// VM ID (used for naming).
    pub vm_id: String,
    /// Host-side address of the `/30`.
    pub host_ip: Ipv4Addr,
    /// Guest-side address of the `/30`.
    pub guest_ip: Ipv4Addr,
    /// MTU (default 1500).
    pub mtu: u32,
}

impl TapConfig {
    /// Create a new TAP configuration.
    pub fn new(vm_id: &str, host_ip: Ipv4Addr, guest_ip: Ipv4Addr) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            host_ip,
            guest_ip,
            mtu: 1500,
        }
    }

    /// Set custom MTU.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Get the TAP device name.
    pub fn tap_name(&self) -> String {
        tap_name_for(&self.vm_id)
    }
}

/// Derive the TAP device name for a VM id. TAP names are limited to 15
/// characters (`IFNAMSIZ - 1`), so only the last 11 characters of the id
/// survive after the `fc-` prefix.
pub fn tap_name_for(vm_id: &str) -> String {
    let suffix = if vm_id.len() > 11 {
        &vm_id[vm_id.len() - 11..]
    } else {
        vm_id
    };
    format!("fc-{}", suffix)
}

/// Errors from TAP device operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device: {0}")]
    CreateFailed(String),

    #[error("failed to configure TAP device: {0}")]
    ConfigFailed(String),

    #[error("failed to delete TAP device: {0}")]
    DeleteFailed(String),

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Handle to a created TAP device.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    vm_id: String,
}

impl TapDevice {
    /// Get the TAP device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the owning VM's id.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Bring the device up (used after snapshot restore completes network
    /// reconciliation on the guest side).
    pub fn set_up(&self) -> Result<(), TapError> {
        run_ip(&["link", "set", "dev", &self.name, "up"])
            .map_err(|e| TapError::ConfigFailed(e.to_string()))
    }

    /// Bring the device down (used while restoring from a snapshot, before
    /// the guest's own interface has been reconciled).
    pub fn set_down(&self) -> Result<(), TapError> {
        run_ip(&["link", "set", "dev", &self.name, "down"])
            .map_err(|e| TapError::ConfigFailed(e.to_string()))
    }

    /// Clean up the TAP device (delete it). Idempotent.
    pub fn cleanup(&self) -> Result<(), TapError> {
        delete_tap(&self.name)
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(tap = %self.name, error = %e, "failed to clean up TAP device on drop");
        }
    }
}

/// Create and configure a TAP device for a VM:
/// 1. create the device
/// 2. set MTU
/// 3. assign the host-side `/30` address
/// 4. bring the link up (unless `start_down` is set, for snapshot restore)
pub fn create_tap(config: &TapConfig, start_down: bool) -> Result<TapDevice, TapError> {
    let tap_name = config.tap_name();

    info!(
        tap = %tap_name,
        vm_id = %config.vm_id,
        host_ip = %config.host_ip,
        guest_ip = %config.guest_ip,
        mtu = config.mtu,
        "creating tap device"
    );

    run_ip(&["tuntap", "add", "dev", &tap_name, "mode", "tap"])
        .map_err(|e| TapError::CreateFailed(e.to_string()))?;

    run_ip(&["link", "set", "dev", &tap_name, "mtu", &config.mtu.to_string()]).map_err(|e| {
        let _ = run_ip(&["link", "delete", &tap_name]);
        TapError::ConfigFailed(format!("mtu: {e}"))
    })?;

    run_ip(&[
        "addr",
        "add",
        &format!("{}/30", config.host_ip),
        "dev",
        &tap_name,
    ])
    .map_err(|e| {
        let _ = run_ip(&["link", "delete", &tap_name]);
        TapError::ConfigFailed(format!("address: {e}"))
    })?;

    if !start_down {
        run_ip(&["link", "set", "dev", &tap_name, "up"]).map_err(|e| {
            let _ = run_ip(&["link", "delete", &tap_name]);
            TapError::ConfigFailed(format!("bring up: {e}"))
        })?;
    }

    if let Err(e) = enable_ipv4_forwarding(&tap_name) {
        warn!(tap = %tap_name, error = %e, "failed to enable ipv4 forwarding");
    }

    debug!(tap = %tap_name, "tap device created and configured");

    Ok(TapDevice {
        name: tap_name,
        vm_id: config.vm_id.clone(),
    })
}

fn delete_tap(tap_name: &str) -> Result<(), TapError> {
    info!(tap = %tap_name, "deleting tap device");

    let output = Command::new("ip")
        .args(["link", "delete", tap_name])
        .output()
        .map_err(TapError::CommandFailed)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Cannot find device") {
            return Ok(());
        }
        return Err(TapError::DeleteFailed(stderr.trim().to_string()));
    }

    debug!(tap = %tap_name, "tap device deleted");
    Ok(())
}

/// Run an `ip` command, returning an error with stderr attached on failure.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

fn enable_ipv4_forwarding(iface: &str) -> Result<()> {
    let path = format!("/proc/sys/net/ipv4/conf/{}/forwarding", iface);
    std::fs::write(&path, "1").context("failed to enable ipv4 forwarding")?;
    Ok(())
}

/// Check if a TAP device exists.
pub fn tap_exists(tap_name: &str) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{}", tap_name)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_generation_truncates_to_ifnamsiz() {
        let name = tap_name_for("01JEXAMPLE123456");
        assert!(name.starts_with("fc-"));
        assert!(name.len() <= 15);
        assert_eq!(name, "fc-AMPLE123456");
    }

    #[test]
    fn tap_name_short_id_unchanged() {
        assert_eq!(tap_name_for("vm1"), "fc-vm1");
    }

    #[test]
    fn tap_config_builder() {
        let config = TapConfig::new(
            "vm-test",
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
        )
        .with_mtu(9000);

        assert_eq!(config.mtu, 9000);
        assert_eq!(config.host_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(config.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
    }
}
