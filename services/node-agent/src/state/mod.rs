//! Local state persistence for the Manager.
//!
//! SQLite-based storage for `VmRecord`s and `SnapshotRecord`s, so the
//! Manager can recover its view of running VMs and available snapshots
//! after a restart.

mod store;

pub use store::{ProvisionMode, SnapshotRecord, StateStore, StateStoreError, VmRecord, VmState};
