//! Host-wide allocation of per-VM network resources.
//!
//! Mirrors the allocate-with-uniqueness-retry shape the Firecracker runtime
//! already used for guest CIDs, generalized to also hand out a `/30` slot
//! from a configured pool. Both kinds of allocation are serialized under
//! their own mutex/atomic so a create never races another create for the
//! same address or CID.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Errors from network resource allocation.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("no free vsock CID available")]
    CidExhausted,

    #[error("invalid pool CIDR '{0}': {1}")]
    InvalidPool(String, String),

    #[error("tap device error: {0}")]
    Tap(#[from] super::tap::TapError),

    #[error("firewall configuration failed: {0}")]
    Firewall(String),
}

/// A `/30` slot handed out to one VM: host-side gateway address and
/// guest-side address, plus the slot index needed to release it.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedSlot {
    pub slot: u32,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
}

/// First vsock CID usable by a guest; 0-2 are reserved (see vsock(7)).
const FIRST_GUEST_CID: u32 = 3;

/// Owns the host's IPv4 `/30` pool and vsock CID space. One instance lives
/// for the lifetime of the Manager process, constructed once in `main`.
pub struct Allocator {
    pool_base: u32,
    total_slots: u32,
    slots: Mutex<HashSet<u32>>,
    next_cid: AtomicU32,
    cids: Mutex<HashSet<u32>>,
}

impl Allocator {
    /// Build an allocator over `pool_cidr` (e.g. `172.16.0.0/16`).
    pub fn new(pool_cidr: &str) -> Result<Self, NetworkError> {
        let (base, prefix) = parse_cidr(pool_cidr)?;
        if prefix > 30 {
            return Err(NetworkError::InvalidPool(
                pool_cidr.to_string(),
                "prefix must be /30 or wider".to_string(),
            ));
        }
        let total_slots = 1u32 << (30 - prefix);

        Ok(Self {
            pool_base: base,
            total_slots,
            slots: Mutex::new(HashSet::new()),
            next_cid: AtomicU32::new(FIRST_GUEST_CID),
            cids: Mutex::new(HashSet::new()),
        })
    }

    /// Seed already-allocated slots/CIDs on startup (from `VmStore::list_vms`)
    /// so a restarted Manager doesn't hand out resources still in use by a
    /// VM it already knows about.
    pub fn reserve(&self, slot: u32, cid: u32) {
        self.slots.lock().expect("slots mutex poisoned").insert(slot);
        self.cids.lock().expect("cids mutex poisoned").insert(cid);
    }

    /// Allocate the next unused `/30` slot.
    pub fn allocate_slot(&self) -> Result<AllocatedSlot, NetworkError> {
        let mut slots = self.slots.lock().expect("slots mutex poisoned");
        for slot in 0..self.total_slots {
            if slots.insert(slot) {
                let network = self.pool_base + slot * 4;
                return Ok(AllocatedSlot {
                    slot,
                    host_ip: Ipv4Addr::from(network + 1),
                    guest_ip: Ipv4Addr::from(network + 2),
                });
            }
        }
        Err(NetworkError::PoolExhausted)
    }

    /// Return a `/30` slot to the pool. Idempotent.
    pub fn release_slot(&self, slot: u32) {
        self.slots.lock().expect("slots mutex poisoned").remove(&slot);
    }

    /// Recover the slot index that produced `guest_ip`, so a VM's
    /// persisted `guestIp` is enough to release its slot without also
    /// persisting the slot index itself.
    pub fn slot_for_guest_ip(&self, guest_ip: Ipv4Addr) -> Option<u32> {
        let addr = u32::from(guest_ip);
        let offset = addr.checked_sub(self.pool_base + 2)?;
        if offset % 4 != 0 {
            return None;
        }
        Some(offset / 4)
    }

    /// Allocate a vsock CID unique among currently-in-use CIDs.
    pub fn allocate_cid(&self) -> Result<u32, NetworkError> {
        let mut cids = self.cids.lock().expect("cids mutex poisoned");
        for _ in 0..cids.len() as u32 + self.total_slots + 1 {
            let candidate = self.next_cid.fetch_add(1, Ordering::SeqCst);
            let candidate = if candidate == 0 { FIRST_GUEST_CID } else { candidate };
            if cids.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(NetworkError::CidExhausted)
    }

    /// Return a vsock CID to the pool. Idempotent.
    pub fn release_cid(&self, cid: u32) {
        self.cids.lock().expect("cids mutex poisoned").remove(&cid);
    }
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8), NetworkError> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| NetworkError::InvalidPool(cidr.to_string(), "missing prefix".to_string()))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| NetworkError::InvalidPool(cidr.to_string(), format!("{e}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| NetworkError::InvalidPool(cidr.to_string(), format!("{e}")))?;
    Ok((u32::from(addr), prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_slot_gives_distinct_addresses() {
        let allocator = Allocator::new("172.16.0.0/24").unwrap();
        let a = allocator.allocate_slot().unwrap();
        let b = allocator.allocate_slot().unwrap();
        assert_ne!(a.slot, b.slot);
        assert_ne!(a.guest_ip, b.guest_ip);
        assert_eq!(a.host_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(a.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(b.host_ip, Ipv4Addr::new(172, 16, 0, 5));
    }

    #[test]
    fn release_slot_allows_reuse() {
        let allocator = Allocator::new("172.16.0.0/30").unwrap();
        let a = allocator.allocate_slot().unwrap();
        assert!(allocator.allocate_slot().is_err());
        allocator.release_slot(a.slot);
        assert!(allocator.allocate_slot().is_ok());
    }

    #[test]
    fn allocate_cid_is_unique() {
        let allocator = Allocator::new("172.16.0.0/24").unwrap();
        let a = allocator.allocate_cid().unwrap();
        let b = allocator.allocate_cid().unwrap();
        assert_ne!(a, b);
        assert!(a >= 3);
    }

    #[test]
    fn slot_for_guest_ip_round_trips() {
        let allocator = Allocator::new("172.16.0.0/24").unwrap();
        let a = allocator.allocate_slot().unwrap();
        let b = allocator.allocate_slot().unwrap();
        assert_eq!(allocator.slot_for_guest_ip(a.guest_ip), Some(a.slot));
        assert_eq!(allocator.slot_for_guest_ip(b.guest_ip), Some(b.slot));
        assert_eq!(allocator.slot_for_guest_ip(Ipv4Addr::new(10, 0, 0, 2)), None);
    }

    #[test]
    fn reserve_prevents_reallocation() {
        let allocator = Allocator::new("172.16.0.0/24").unwrap();
        allocator.reserve(0, 3);
        let slot = allocator.allocate_slot().unwrap();
        assert_ne!(slot.slot, 0);
        let cid = allocator.allocate_cid().unwrap();
        assert_ne!(cid, 3);
    }
}
