//! Host networking for Firecracker microVMs.
//!
//! Owns the IPv4 `/30`-per-VM allocator, TAP device lifecycle, and the
//! nftables SNAT/allowlist rules that fence each guest's egress traffic.

mod allocator;
mod firewall;
mod tap;

pub use allocator::{AllocatedSlot, Allocator, NetworkError};
pub use tap::{tap_name_for, TapConfig, TapDevice, TapError};

use std::net::Ipv4Addr;

use tracing::info;

/// A VM's allocated networking resources, returned by `NetworkManager::allocate`.
#[derive(Debug, Clone)]
pub struct VmNetwork {
    pub slot: u32,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub vsock_cid: u32,
    pub tap_name: String,
}

/// Owns the allocator and drives TAP/firewall setup and teardown for each VM.
pub struct NetworkManager {
    allocator: Allocator,
    egress_iface: String,
}

impl NetworkManager {
    pub fn new(pool_cidr: &str, egress_iface: &str) -> Result<Self, NetworkError> {
        let allocator = Allocator::new(pool_cidr)?;
        let manager = Self {
            allocator,
            egress_iface: egress_iface.to_string(),
        };
        firewall::install_pool_nat(pool_cidr, egress_iface)?;
        Ok(manager)
    }

    /// Re-seed the allocator with resources already recorded for a running
    /// VM, so a restarted Manager doesn't re-hand them out.
    pub fn reserve(&self, slot: u32, vsock_cid: u32) {
        self.allocator.reserve(slot, vsock_cid);
    }

    /// Allocate a `/30` slot, vsock CID, and derive the TAP name for a new VM.
    pub fn allocate(&self, vm_id: &str) -> Result<VmNetwork, NetworkError> {
        let slot = self.allocator.allocate_slot()?;
        let vsock_cid = match self.allocator.allocate_cid() {
            Ok(cid) => cid,
            Err(e) => {
                self.allocator.release_slot(slot.slot);
                return Err(e);
            }
        };

        Ok(VmNetwork {
            slot: slot.slot,
            host_ip: slot.host_ip,
            guest_ip: slot.guest_ip,
            vsock_cid,
            tap_name: tap_name_for(vm_id),
        })
    }

    /// Create the TAP device for a VM. `start_down` keeps the link down
    /// until snapshot restore has reconciled the guest's own interface.
    pub fn create_tap(
        &self,
        vm_id: &str,
        net: &VmNetwork,
        start_down: bool,
    ) -> Result<TapDevice, NetworkError> {
        let config = TapConfig::new(vm_id, net.host_ip, net.guest_ip);
        Ok(tap::create_tap(&config, start_down)?)
    }

    /// Install the per-VM egress allowlist.
    pub fn apply_allowlist(
        &self,
        vm_id: &str,
        tap_name: &str,
        gateway: Ipv4Addr,
        allow_ips: &[String],
        outbound_internet: bool,
    ) -> Result<(), NetworkError> {
        firewall::install_vm_allowlist(vm_id, tap_name, gateway, allow_ips, outbound_internet)
    }

    /// Tear down a VM's network resources: firewall chain, TAP device (via
    /// `Drop` on the caller's `TapDevice`), and pool slot/CID release.
    /// Idempotent.
    pub fn release(&self, vm_id: &str, slot: u32, vsock_cid: u32) {
        if let Err(e) = firewall::teardown_vm_allowlist(vm_id) {
            tracing::warn!(vm_id, error = %e, "failed to tear down vm allowlist");
        }
        self.allocator.release_slot(slot);
        self.allocator.release_cid(vsock_cid);
        info!(vm_id, slot, vsock_cid, "released network resources");
    }

    pub fn egress_iface(&self) -> &str {
        &self.egress_iface
    }

    /// Recover a VM's slot index from its persisted guest IP, for release
    /// paths that only have a `VmRecord` (not the original `VmNetwork`) on
    /// hand, e.g. `stop`/`destroy` after a Manager restart.
    pub fn slot_for_guest_ip(&self, guest_ip: Ipv4Addr) -> Option<u32> {
        self.allocator.slot_for_guest_ip(guest_ip)
    }
}
