//! SQLite-based persistence for VM and snapshot records.
//!
//! Durable storage for the Manager's view of the world, so a restart can
//! rediscover what VMs and snapshots exist on disk without re-deriving it
//! from the filesystem layout alone.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    Invalid(String),
}

/// VM lifecycle state, persisted as the authoritative phase of a `VmRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Deleted,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// How a VM came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    Boot,
    Snapshot,
}

impl ProvisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Snapshot => "snapshot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "boot" => Some(Self::Boot),
            "snapshot" => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// The authoritative per-VM record.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: String,
    pub state: VmState,
    pub cpu: u32,
    pub mem_mb: u32,
    pub disk_size_mb: Option<u32>,
    pub guest_ip: String,
    pub tap_name: String,
    pub vsock_cid: u32,
    pub outbound_internet: bool,
    /// Stored as a JSON array of CIDR strings.
    pub allow_ips: Vec<String>,
    pub rootfs_path: String,
    pub kernel_path: String,
    pub logs_dir: String,
    pub image_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub created_at: i64,
    pub provision_mode: ProvisionMode,
}

/// Metadata for a persisted snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: String,
    pub kind: String,
    pub created_at: i64,
    pub cpu: u32,
    pub mem_mb: u32,
    pub source_vm_id: Option<String>,
    pub has_disk: bool,
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                cpu INTEGER NOT NULL,
                mem_mb INTEGER NOT NULL,
                disk_size_mb INTEGER,
                guest_ip TEXT NOT NULL,
                tap_name TEXT NOT NULL,
                vsock_cid INTEGER NOT NULL,
                outbound_internet INTEGER NOT NULL,
                allow_ips TEXT NOT NULL,
                rootfs_path TEXT NOT NULL,
                kernel_path TEXT NOT NULL,
                logs_dir TEXT NOT NULL,
                image_id TEXT,
                snapshot_id TEXT,
                created_at INTEGER NOT NULL,
                provision_mode TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vms_state ON vms(state);

            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                cpu INTEGER NOT NULL,
                mem_mb INTEGER NOT NULL,
                source_vm_id TEXT,
                has_disk INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("state store schema initialized");
        Ok(())
    }

    pub fn get_vm(&self, id: &str) -> Result<Option<VmRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, state, cpu, mem_mb, disk_size_mb, guest_ip, tap_name, vsock_cid,
                    outbound_internet, allow_ips, rootfs_path, kernel_path, logs_dir,
                    image_id, snapshot_id, created_at, provision_mode
             FROM vms WHERE id = ?1",
        )?;

        stmt.query_row(params![id], Self::row_to_vm)
            .optional()
            .map_err(Into::into)
    }

    pub fn upsert_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        let allow_ips = serde_json::to_string(&record.allow_ips)
            .map_err(|e| StateStoreError::Invalid(e.to_string()))?;

        self.conn.execute(
            r#"
            INSERT INTO vms (id, state, cpu, mem_mb, disk_size_mb, guest_ip, tap_name,
                              vsock_cid, outbound_internet, allow_ips, rootfs_path,
                              kernel_path, logs_dir, image_id, snapshot_id, created_at,
                              provision_mode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                cpu = excluded.cpu,
                mem_mb = excluded.mem_mb,
                disk_size_mb = excluded.disk_size_mb,
                guest_ip = excluded.guest_ip,
                tap_name = excluded.tap_name,
                vsock_cid = excluded.vsock_cid,
                outbound_internet = excluded.outbound_internet,
                allow_ips = excluded.allow_ips,
                rootfs_path = excluded.rootfs_path,
                kernel_path = excluded.kernel_path,
                logs_dir = excluded.logs_dir,
                image_id = excluded.image_id,
                snapshot_id = excluded.snapshot_id,
                provision_mode = excluded.provision_mode
            "#,
            params![
                record.id,
                record.state.as_str(),
                record.cpu,
                record.mem_mb,
                record.disk_size_mb,
                record.guest_ip,
                record.tap_name,
                record.vsock_cid,
                record.outbound_internet,
                allow_ips,
                record.rootfs_path,
                record.kernel_path,
                record.logs_dir,
                record.image_id,
                record.snapshot_id,
                record.created_at,
                record.provision_mode.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn set_vm_state(&self, id: &str, state: VmState) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "UPDATE vms SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id],
        )?;
        if changed == 0 {
            return Err(StateStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete_vm(&self, id: &str) -> Result<(), StateStoreError> {
        self.conn
            .execute("DELETE FROM vms WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn list_vms(&self) -> Result<Vec<VmRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, state, cpu, mem_mb, disk_size_mb, guest_ip, tap_name, vsock_cid,
                    outbound_internet, allow_ips, rootfs_path, kernel_path, logs_dir,
                    image_id, snapshot_id, created_at, provision_mode
             FROM vms ORDER BY created_at",
        )?;

        let records = stmt
            .query_map([], Self::row_to_vm)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn list_vms_by_state(&self, state: VmState) -> Result<Vec<VmRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, state, cpu, mem_mb, disk_size_mb, guest_ip, tap_name, vsock_cid,
                    outbound_internet, allow_ips, rootfs_path, kernel_path, logs_dir,
                    image_id, snapshot_id, created_at, provision_mode
             FROM vms WHERE state = ?1 ORDER BY created_at",
        )?;

        let records = stmt
            .query_map(params![state.as_str()], Self::row_to_vm)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_active_vms(&self) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vms WHERE state != ?1",
            params![VmState::Deleted.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_vm(row: &rusqlite::Row) -> rusqlite::Result<VmRecord> {
        let state_str: String = row.get(1)?;
        let state = VmState::from_str(&state_str).unwrap_or(VmState::Error);
        let allow_ips_json: String = row.get(9)?;
        let allow_ips: Vec<String> = serde_json::from_str(&allow_ips_json).unwrap_or_default();
        let mode_str: String = row.get(16)?;
        let provision_mode = ProvisionMode::from_str(&mode_str).unwrap_or(ProvisionMode::Boot);

        Ok(VmRecord {
            id: row.get(0)?,
            state,
            cpu: row.get(2)?,
            mem_mb: row.get(3)?,
            disk_size_mb: row.get(4)?,
            guest_ip: row.get(5)?,
            tap_name: row.get(6)?,
            vsock_cid: row.get(7)?,
            outbound_internet: row.get(8)?,
            allow_ips,
            rootfs_path: row.get(10)?,
            kernel_path: row.get(11)?,
            logs_dir: row.get(12)?,
            image_id: row.get(13)?,
            snapshot_id: row.get(14)?,
            created_at: row.get(15)?,
            provision_mode,
        })
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, created_at, cpu, mem_mb, source_vm_id, has_disk
             FROM snapshots WHERE id = ?1",
        )?;
        stmt.query_row(params![id], Self::row_to_snapshot)
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO snapshots (id, kind, created_at, cpu, mem_mb, source_vm_id, has_disk)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                cpu = excluded.cpu,
                mem_mb = excluded.mem_mb,
                source_vm_id = excluded.source_vm_id,
                has_disk = excluded.has_disk
            "#,
            params![
                record.id,
                record.kind,
                record.created_at,
                record.cpu,
                record.mem_mb,
                record.source_vm_id,
                record.has_disk,
            ],
        )?;
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, created_at, cpu, mem_mb, source_vm_id, has_disk
             FROM snapshots ORDER BY created_at",
        )?;
        let records = stmt
            .query_map([], Self::row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<(), StateStoreError> {
        self.conn
            .execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<SnapshotRecord> {
        Ok(SnapshotRecord {
            id: row.get(0)?,
            kind: row.get(1)?,
            created_at: row.get(2)?,
            cpu: row.get(3)?,
            mem_mb: row.get(4)?,
            source_vm_id: row.get(5)?,
            has_disk: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vm(id: &str) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            state: VmState::Created,
            cpu: 2,
            mem_mb: 512,
            disk_size_mb: None,
            guest_ip: "172.16.0.2".to_string(),
            tap_name: format!("fc-{id}"),
            vsock_cid: 3,
            outbound_internet: true,
            allow_ips: vec!["0.0.0.0/0".to_string()],
            rootfs_path: "/data/vms/x/rootfs.ext4".to_string(),
            kernel_path: "/data/images/base/vmlinux".to_string(),
            logs_dir: "/data/vms/x/logs".to_string(),
            image_id: Some("img-1".to_string()),
            snapshot_id: None,
            created_at: 1000,
            provision_mode: ProvisionMode::Boot,
        }
    }

    #[test]
    fn vm_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let record = sample_vm("vm-1");
        store.upsert_vm(&record).unwrap();

        let fetched = store.get_vm("vm-1").unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Created);
        assert_eq!(fetched.allow_ips, vec!["0.0.0.0/0".to_string()]);

        store.set_vm_state("vm-1", VmState::Running).unwrap();
        let fetched = store.get_vm("vm-1").unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Running);

        assert_eq!(store.list_vms().unwrap().len(), 1);
        assert_eq!(store.count_active_vms().unwrap(), 1);

        store.delete_vm("vm-1").unwrap();
        assert!(store.get_vm("vm-1").unwrap().is_none());
    }

    #[test]
    fn set_vm_state_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.set_vm_state("missing", VmState::Running).unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    #[test]
    fn vm_state_roundtrip() {
        for state in [
            VmState::Created,
            VmState::Starting,
            VmState::Running,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Error,
            VmState::Deleted,
        ] {
            let s = state.as_str();
            assert_eq!(VmState::from_str(s).unwrap(), state);
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let record = SnapshotRecord {
            id: "snap-1".to_string(),
            kind: "vm".to_string(),
            created_at: 2000,
            cpu: 2,
            mem_mb: 512,
            source_vm_id: Some("vm-1".to_string()),
            has_disk: true,
        };
        store.insert_snapshot(&record).unwrap();

        let fetched = store.get_snapshot("snap-1").unwrap().unwrap();
        assert_eq!(fetched.cpu, 2);
        assert!(fetched.has_disk);

        assert_eq!(store.list_snapshots().unwrap().len(), 1);
        store.delete_snapshot("snap-1").unwrap();
        assert!(store.get_snapshot("snap-1").unwrap().is_none());
    }

    #[test]
    fn list_vms_by_state_filters() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_vm(&sample_vm("vm-1")).unwrap();
        let mut vm2 = sample_vm("vm-2");
        vm2.state = VmState::Running;
        store.upsert_vm(&vm2).unwrap();

        let running = store.list_vms_by_state(VmState::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "vm-2");
    }
}
