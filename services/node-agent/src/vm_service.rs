//! Drives a single VM's lifecycle: create, start, stop, destroy, snapshot,
//! and the exec/run/file-transfer surface the Guest Agent exposes.
//!
//! Grounded on `instance.rs`'s `InstanceManager` converge-to-desired-state
//! shape, narrowed to one VM's own lifecycle driven by direct API calls
//! instead of a remote plan, with per-VM serialization via a mutex-per-id
//! guard table rather than one global `RwLock<HashMap>` write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::agent_client::{AgentClient, AgentClientError};
use crate::agent_protocol::{AllowlistRequest, ExecRequest, ExecResult, NetworkConfigRequest, RunRequest};
use crate::firecracker::{
    generate_mac_address, BootOutcome, BootParams, FirecrackerDriver, FirecrackerError, RestoreParams,
    RunningVm,
};
use crate::network::{NetworkManager, TapDevice};
use crate::state::{ProvisionMode, SnapshotRecord, StateStore, StateStoreError, VmRecord, VmState};
use crate::storage::{GuestImage, SnapshotMetaFile, StorageError, StorageProvider};

#[derive(Debug, Error)]
pub enum VmServiceError {
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("quota exceeded: {reason}")]
    Quota { reason: String },

    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("precondition failed: expected {expected}, got {actual}")]
    PreconditionFailed { expected: String, actual: String },

    #[error("guest agent unreachable for vm {vm_id}")]
    GuestAgentUnreachable { vm_id: String },

    #[error("firecracker API failed during {phase}: status {status}, stderr: {stderr_tail}")]
    FirecrackerApi {
        phase: String,
        status: u16,
        stderr_tail: String,
    },

    #[error("host resource failure during {phase}: {source}")]
    HostResource {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VmServiceError {
    /// A stable machine-readable tag, following `guest-init`'s
    /// `InitError::reason_code()` convention.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Quota { .. } => "quota",
            Self::NotFound { .. } => "not_found",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::GuestAgentUnreachable { .. } => "guest_agent_unreachable",
            Self::FirecrackerApi { .. } => "firecracker_api",
            Self::HostResource { .. } => "host_resource",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StateStoreError> for VmServiceError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(id) => Self::NotFound { id },
            other => Self::HostResource {
                phase: "state".to_string(),
                source: other.into(),
            },
        }
    }
}

/// Body of `POST /v1/vms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    pub cpu: u32,
    pub mem_mb: u32,
    #[serde(default)]
    pub allow_ips: Vec<String>,
    #[serde(default)]
    pub outbound_internet: bool,
    pub snapshot_id: Option<String>,
    pub image_id: Option<String>,
    pub disk_size_mb: Option<u32>,
}

/// `VmPublic` — the caller-facing projection of a `VmRecord`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPublic {
    pub id: String,
    pub state: VmState,
    pub cpu: u32,
    pub mem_mb: u32,
    pub guest_ip: String,
    pub outbound_internet: bool,
    pub created_at: i64,
    pub provision_mode: ProvisionMode,
}

impl From<&VmRecord> for VmPublic {
    fn from(r: &VmRecord) -> Self {
        Self {
            id: r.id.clone(),
            state: r.state,
            cpu: r.cpu,
            mem_mb: r.mem_mb,
            guest_ip: r.guest_ip.clone(),
            outbound_internet: r.outbound_internet,
            created_at: r.created_at,
            provision_mode: r.provision_mode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmServiceLimits {
    pub max_vms: u32,
    pub max_cpu: u32,
    pub max_mem_mb: u32,
    pub max_allow_ips: usize,
    pub max_exec_timeout_ms: u64,
    pub max_run_timeout_ms: u64,
    pub agent_boot_timeout: Duration,
}

impl Default for VmServiceLimits {
    fn default() -> Self {
        Self {
            max_vms: 64,
            max_cpu: 8,
            max_mem_mb: 16384,
            max_allow_ips: 64,
            max_exec_timeout_ms: 120_000,
            max_run_timeout_ms: 120_000,
            agent_boot_timeout: Duration::from_secs(15),
        }
    }
}

/// A VM's live, in-process handles: the jailed Firecracker process and the
/// TAP device feeding it. Both carry real resources (`TapDevice` deletes
/// the device on `Drop`; `RunningVm` owns the jailer child process), so
/// this entry must live exactly as long as the VM is RUNNING.
struct RunningEntry {
    vm: RunningVm,
    tap: TapDevice,
}

pub struct VmService {
    limits: VmServiceLimits,
    default_kernel_path: PathBuf,
    store: Arc<StateStore>,
    storage: Arc<StorageProvider>,
    network: Arc<NetworkManager>,
    driver: Arc<FirecrackerDriver>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    running: RwLock<HashMap<String, RunningEntry>>,
}

impl VmService {
    pub fn new(
        limits: VmServiceLimits,
        default_kernel_path: PathBuf,
        store: Arc<StateStore>,
        storage: Arc<StorageProvider>,
        network: Arc<NetworkManager>,
        driver: Arc<FirecrackerDriver>,
    ) -> Self {
        Self {
            limits,
            default_kernel_path,
            store,
            storage,
            network,
            driver,
            locks: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a `VmRecord`, turning a missing row into `NotFound` so callers
    /// can use `?` directly instead of matching on `Option`.
    fn require_vm(&self, vm_id: &str) -> Result<VmRecord, VmServiceError> {
        self.store
            .get_vm(vm_id)?
            .ok_or_else(|| VmServiceError::NotFound { id: vm_id.to_string() })
    }

    async fn lock_for(&self, vm_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(vm_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(vm_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn list(&self) -> Result<Vec<VmPublic>, VmServiceError> {
        let records = self.store.list_vms()?;
        Ok(records.iter().map(VmPublic::from).collect())
    }

    pub async fn get(&self, vm_id: &str) -> Result<VmPublic, VmServiceError> {
        let record = self.require_vm(vm_id)?;
        Ok(VmPublic::from(&record))
    }

    fn validate_create(&self, req: &CreateVmRequest) -> Result<(), VmServiceError> {
        if req.cpu == 0 || req.cpu > self.limits.max_cpu {
            return Err(VmServiceError::Validation {
                field: "cpu".to_string(),
                reason: format!("must be in 1..={}", self.limits.max_cpu),
            });
        }
        if req.mem_mb == 0 || req.mem_mb > self.limits.max_mem_mb {
            return Err(VmServiceError::Validation {
                field: "memMb".to_string(),
                reason: format!("must be in 1..={}", self.limits.max_mem_mb),
            });
        }
        if req.allow_ips.len() > self.limits.max_allow_ips {
            return Err(VmServiceError::Validation {
                field: "allowIps".to_string(),
                reason: format!("at most {} entries", self.limits.max_allow_ips),
            });
        }
        for ip in &req.allow_ips {
            if ip.is_empty() || ip.len() > 128 {
                return Err(VmServiceError::Validation {
                    field: "allowIps".to_string(),
                    reason: "each entry must be non-empty and <= 128 chars".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Create and boot a VM, either cold from an image or restored from a
    /// snapshot.
    pub async fn create(&self, req: CreateVmRequest) -> Result<VmPublic, VmServiceError> {
        self.validate_create(&req)?;

        let active = self.store.count_active_vms()?;
        if active >= self.limits.max_vms as i64 {
            return Err(VmServiceError::Quota {
                reason: format!("max_vms ({}) reached", self.limits.max_vms),
            });
        }

        let vm_id = plfm_id::VmId::new().to_string();
        let lock = self.lock_for(&vm_id).await;
        let _guard = lock.lock().await;

        let snapshot = match &req.snapshot_id {
            Some(sid) => {
                let meta = self
                    .storage
                    .read_snapshot_meta(sid)
                    .await
                    .map_err(|e| storage_error(sid, e))?;
                if meta.cpu != req.cpu || meta.mem_mb != req.mem_mb {
                    return Err(VmServiceError::Validation {
                        field: "snapshotId".to_string(),
                        reason: "cpu/memMb must match the snapshot's".to_string(),
                    });
                }
                Some(meta)
            }
            None => None,
        };

        let result = self.create_inner(&vm_id, &req, snapshot).await;
        if result.is_err() {
            warn!(vm_id = %vm_id, "vm create failed, marking ERROR");
            let _ = self.store.set_vm_state(&vm_id, VmState::Error);
        }
        result
    }

    async fn resolve_kernel(&self, image_id: Option<&str>) -> PathBuf {
        if let Some(iid) = image_id {
            if let Ok(image) = self.storage.resolve_image(iid).await {
                return image.vmlinux_path;
            }
        }
        self.default_kernel_path.clone()
    }

    async fn create_inner(
        &self,
        vm_id: &str,
        req: &CreateVmRequest,
        snapshot: Option<SnapshotMetaFile>,
    ) -> Result<VmPublic, VmServiceError> {
        let net = self.network.allocate(vm_id).map_err(|e| host_error("network", e))?;

        let rootfs_path: PathBuf = if let Some(meta) = &snapshot {
            let paths = self.storage.snapshot_artifact_paths(&meta.id);
            self.storage
                .prepare_vm_storage_from_disk(vm_id, &paths.disk)
                .await
                .map_err(|e| host_error("storage", e))?
        } else {
            let image_id = req.image_id.as_deref().ok_or_else(|| VmServiceError::Validation {
                field: "imageId".to_string(),
                reason: "required unless snapshotId is set".to_string(),
            })?;
            let image: GuestImage = self
                .storage
                .resolve_image(image_id)
                .await
                .map_err(|e| storage_error(image_id, e))?;
            self.storage
                .prepare_vm_storage(vm_id, &image, req.disk_size_mb)
                .await
                .map_err(|e| host_error("storage", e))?
        };

        let kernel_path = self.resolve_kernel(req.image_id.as_deref()).await;
        let logs_dir = self.storage.vm_logs_dir(vm_id);
        let is_restore = snapshot.is_some();
        let provision_mode = if is_restore { ProvisionMode::Snapshot } else { ProvisionMode::Boot };

        let record = VmRecord {
            id: vm_id.to_string(),
            state: VmState::Created,
            cpu: req.cpu,
            mem_mb: req.mem_mb,
            disk_size_mb: req.disk_size_mb,
            guest_ip: net.guest_ip.to_string(),
            tap_name: net.tap_name.clone(),
            vsock_cid: net.vsock_cid,
            outbound_internet: req.outbound_internet,
            allow_ips: req.allow_ips.clone(),
            rootfs_path: rootfs_path.to_string_lossy().into_owned(),
            kernel_path: kernel_path.to_string_lossy().into_owned(),
            logs_dir: logs_dir.to_string_lossy().into_owned(),
            image_id: req.image_id.clone(),
            snapshot_id: req.snapshot_id.clone(),
            created_at: Utc::now().timestamp(),
            provision_mode,
        };
        self.store.upsert_vm(&record)?;

        let tap = self
            .network
            .create_tap(vm_id, &net, is_restore)
            .map_err(|e| host_error("network", e))?;

        self.store.set_vm_state(vm_id, VmState::Starting)?;

        let restore_paths = snapshot.as_ref().map(|meta| {
            let paths = self.storage.snapshot_artifact_paths(&meta.id);
            (paths.mem, paths.vmstate)
        });

        let boot_params = BootParams {
            vm_id,
            cpu: req.cpu,
            mem_mb: req.mem_mb,
            kernel_path: &kernel_path,
            rootfs_path: &rootfs_path,
            tap_name: &net.tap_name,
            guest_ip: net.guest_ip,
            gateway_ip: net.host_ip,
            vsock_cid: net.vsock_cid,
            logs_dir: &logs_dir,
            restore_from: restore_paths.as_ref().map(|(mem, vmstate)| RestoreParams {
                mem_path: mem,
                vmstate_path: vmstate,
            }),
        };

        let (running_vm, outcome) = self.driver.boot(boot_params).await.map_err(|e| firecracker_error("boot", e))?;

        let agent = AgentClient::new(&running_vm.sandbox.chroot.join("run/agent.vsock"));
        if agent.wait_healthy(self.limits.agent_boot_timeout).await.is_err() {
            self.driver.destroy(vm_id, running_vm).await;
            return Err(VmServiceError::GuestAgentUnreachable { vm_id: vm_id.to_string() });
        }

        if matches!(outcome, BootOutcome::Restored) {
            let _ = agent
                .configure_network(&NetworkConfigRequest {
                    iface: "eth0".to_string(),
                    ip: net.guest_ip.to_string(),
                    cidr: 30,
                    gateway: net.host_ip.to_string(),
                    mac: generate_mac_address(vm_id),
                })
                .await;
            if let Err(e) = tap.set_up() {
                warn!(vm_id, error = %e, "failed to bring up tap after restore reconciliation");
            }
        }

        self.network
            .apply_allowlist(vm_id, &net.tap_name, net.host_ip, &req.allow_ips, req.outbound_internet)
            .map_err(|e| host_error("network", e))?;

        agent
            .apply_allowlist(&AllowlistRequest {
                cidrs: req.allow_ips.clone(),
                allow_outbound: req.outbound_internet,
                gateway: net.host_ip.to_string(),
            })
            .await
            .map_err(|e| agent_error(vm_id, e))?;

        self.running
            .write()
            .await
            .insert(vm_id.to_string(), RunningEntry { vm: running_vm, tap });
        self.store.set_vm_state(vm_id, VmState::Running)?;

        let final_record = self.require_vm(vm_id)?;
        Ok(VmPublic::from(&final_record))
    }

    pub async fn create_snapshot(&self, vm_id: &str) -> Result<SnapshotMetaFile, VmServiceError> {
        let lock = self.lock_for(vm_id).await;
        let _guard = lock.lock().await;

        let record = self.require_vm(vm_id)?;
        if record.state != VmState::Running {
            return Err(VmServiceError::PreconditionFailed {
                expected: "RUNNING".to_string(),
                actual: format!("{:?}", record.state),
            });
        }

        let snapshot_id = plfm_id::SnapshotId::new().to_string();
        let paths = self.storage.snapshot_artifact_paths(&snapshot_id);
        tokio::fs::create_dir_all(paths.mem.parent().unwrap())
            .await
            .map_err(|e| host_error("storage", StorageError::Io(e)))?;

        {
            let running = self.running.read().await;
            let entry = running
                .get(vm_id)
                .ok_or_else(|| VmServiceError::GuestAgentUnreachable { vm_id: vm_id.to_string() })?;
            self.driver
                .snapshot(&entry.vm, &paths.mem, &paths.vmstate)
                .await
                .map_err(|e| firecracker_error("snapshot", e))?;
        }

        self.storage
            .clone_disk(Path::new(&record.rootfs_path), &paths.disk)
            .await
            .map_err(|e| host_error("storage", e))?;

        let meta = SnapshotMetaFile {
            id: snapshot_id.clone(),
            kind: "vm".to_string(),
            created_at: Utc::now().timestamp(),
            cpu: record.cpu,
            mem_mb: record.mem_mb,
            source_vm_id: Some(vm_id.to_string()),
            has_disk: true,
        };
        self.storage
            .write_snapshot_meta(&meta)
            .await
            .map_err(|e| host_error("storage", e))?;
        self.store.insert_snapshot(&SnapshotRecord {
            id: snapshot_id,
            kind: meta.kind.clone(),
            created_at: meta.created_at,
            cpu: meta.cpu,
            mem_mb: meta.mem_mb,
            source_vm_id: meta.source_vm_id.clone(),
            has_disk: meta.has_disk,
        })?;

        Ok(meta)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotMetaFile>, VmServiceError> {
        self.storage.list_snapshots().await.map_err(|e| host_error("storage", e))
    }

    /// Cold boot from the VM's existing per-VM rootfs; no storage prep.
    pub async fn start(&self, vm_id: &str) -> Result<VmPublic, VmServiceError> {
        let lock = self.lock_for(vm_id).await;
        let _guard = lock.lock().await;

        let record = self.require_vm(vm_id)?;
        if record.state != VmState::Stopped {
            return Err(VmServiceError::PreconditionFailed {
                expected: "STOPPED".to_string(),
                actual: format!("{:?}", record.state),
            });
        }

        let net = self.network.allocate(vm_id).map_err(|e| host_error("network", e))?;
        let tap = self
            .network
            .create_tap(vm_id, &net, false)
            .map_err(|e| host_error("network", e))?;

        self.store.set_vm_state(vm_id, VmState::Starting)?;

        let kernel_path = PathBuf::from(&record.kernel_path);
        let rootfs_path = PathBuf::from(&record.rootfs_path);
        let logs_dir = PathBuf::from(&record.logs_dir);

        let boot_params = BootParams {
            vm_id,
            cpu: record.cpu,
            mem_mb: record.mem_mb,
            kernel_path: &kernel_path,
            rootfs_path: &rootfs_path,
            tap_name: &net.tap_name,
            guest_ip: net.guest_ip,
            gateway_ip: net.host_ip,
            vsock_cid: net.vsock_cid,
            logs_dir: &logs_dir,
            restore_from: None,
        };

        let (running_vm, _outcome) =
            self.driver.boot(boot_params).await.map_err(|e| firecracker_error("boot", e))?;

        let agent = AgentClient::new(&running_vm.sandbox.chroot.join("run/agent.vsock"));
        if agent.wait_healthy(self.limits.agent_boot_timeout).await.is_err() {
            self.driver.destroy(vm_id, running_vm).await;
            return Err(VmServiceError::GuestAgentUnreachable { vm_id: vm_id.to_string() });
        }

        self.network
            .apply_allowlist(vm_id, &net.tap_name, net.host_ip, &record.allow_ips, record.outbound_internet)
            .map_err(|e| host_error("network", e))?;
        agent
            .apply_allowlist(&AllowlistRequest {
                cidrs: record.allow_ips.clone(),
                allow_outbound: record.outbound_internet,
                gateway: net.host_ip.to_string(),
            })
            .await
            .map_err(|e| agent_error(vm_id, e))?;

        self.running
            .write()
            .await
            .insert(vm_id.to_string(), RunningEntry { vm: running_vm, tap });

        let mut updated = record;
        updated.guest_ip = net.guest_ip.to_string();
        updated.tap_name = net.tap_name.clone();
        updated.vsock_cid = net.vsock_cid;
        updated.state = VmState::Running;
        self.store.upsert_vm(&updated)?;

        Ok(VmPublic::from(&updated))
    }

    pub async fn stop(&self, vm_id: &str) -> Result<(), VmServiceError> {
        let lock = self.lock_for(vm_id).await;
        let _guard = lock.lock().await;

        let record = self.require_vm(vm_id)?;
        if record.state == VmState::Stopped {
            return Ok(());
        }
        if record.state != VmState::Running {
            return Err(VmServiceError::PreconditionFailed {
                expected: "RUNNING".to_string(),
                actual: format!("{:?}", record.state),
            });
        }

        if let Some(entry) = self.running.write().await.remove(vm_id) {
            if let Err(e) = self.driver.stop(&entry.vm).await {
                warn!(vm_id, error = %e, "graceful stop failed, forcing shutdown");
            }
            self.driver.destroy(vm_id, entry.vm).await;
            drop(entry.tap);
        }

        self.release_network(vm_id, &record);
        self.store.set_vm_state(vm_id, VmState::Stopped)?;
        Ok(())
    }

    pub async fn destroy(&self, vm_id: &str) -> Result<(), VmServiceError> {
        let lock = self.lock_for(vm_id).await;
        let _guard = lock.lock().await;

        let record = match self.require_vm(vm_id) {
            Ok(r) => r,
            Err(VmServiceError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if record.state == VmState::Deleted {
            return Ok(());
        }

        if let Some(entry) = self.running.write().await.remove(vm_id) {
            self.driver.destroy(vm_id, entry.vm).await;
            drop(entry.tap);
        }

        self.release_network(vm_id, &record);

        if let Err(e) = self.storage.cleanup_vm_storage(vm_id).await {
            warn!(vm_id, error = %e, "storage cleanup failed during destroy, continuing");
        }
        self.store.set_vm_state(vm_id, VmState::Deleted)?;
        self.locks.write().await.remove(vm_id);
        Ok(())
    }

    fn release_network(&self, vm_id: &str, record: &VmRecord) {
        let guest_ip = match record.guest_ip.parse() {
            Ok(ip) => ip,
            Err(_) => return,
        };
        let slot = self.network.slot_for_guest_ip(guest_ip).unwrap_or(0);
        self.network.release(vm_id, slot, record.vsock_cid);
    }

    fn agent_for(&self, running: &HashMap<String, RunningEntry>, vm_id: &str) -> Option<AgentClient> {
        running
            .get(vm_id)
            .map(|e| AgentClient::new(&e.vm.sandbox.chroot.join("run/agent.vsock")))
    }

    async fn require_running(&self, vm_id: &str) -> Result<(VmRecord, AgentClient), VmServiceError> {
        let record = self.require_vm(vm_id)?;
        if record.state != VmState::Running {
            return Err(VmServiceError::PreconditionFailed {
                expected: "RUNNING".to_string(),
                actual: format!("{:?}", record.state),
            });
        }
        let running = self.running.read().await;
        let agent = self
            .agent_for(&running, vm_id)
            .ok_or_else(|| VmServiceError::GuestAgentUnreachable { vm_id: vm_id.to_string() })?;
        Ok((record, agent))
    }

    pub async fn exec(&self, vm_id: &str, mut req: ExecRequest) -> Result<ExecResult, VmServiceError> {
        let (_record, agent) = self.require_running(vm_id).await?;
        req.timeout_ms = Some(req.timeout_ms.unwrap_or(30_000).min(self.limits.max_exec_timeout_ms));
        agent.exec(&req).await.map_err(|e| agent_error(vm_id, e))
    }

    pub async fn run_ts(&self, vm_id: &str, mut req: RunRequest) -> Result<ExecResult, VmServiceError> {
        let (record, agent) = self.require_running(vm_id).await?;
        req.allow_net = record.outbound_internet;
        req.timeout_ms = Some(req.timeout_ms.unwrap_or(30_000).min(self.limits.max_run_timeout_ms));
        agent.run_ts(&req).await.map_err(|e| agent_error(vm_id, e))
    }

    pub async fn run_js(&self, vm_id: &str, mut req: RunRequest) -> Result<ExecResult, VmServiceError> {
        let (record, agent) = self.require_running(vm_id).await?;
        req.allow_net = record.outbound_internet;
        req.timeout_ms = Some(req.timeout_ms.unwrap_or(30_000).min(self.limits.max_run_timeout_ms));
        agent.run_js(&req).await.map_err(|e| agent_error(vm_id, e))
    }

    pub async fn upload_files(&self, vm_id: &str, dest: &str, archive: Vec<u8>) -> Result<(), VmServiceError> {
        const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
        if archive.len() > MAX_UPLOAD_BYTES {
            return Err(VmServiceError::Validation {
                field: "body".to_string(),
                reason: "exceeds 10 MiB upload cap".to_string(),
            });
        }
        let (_record, agent) = self.require_running(vm_id).await?;
        agent.upload(dest, archive).await.map_err(|e| agent_error(vm_id, e))
    }

    pub async fn download_files(&self, vm_id: &str, path: &str) -> Result<Vec<u8>, VmServiceError> {
        let (_record, agent) = self.require_running(vm_id).await?;
        agent.download(path).await.map_err(|e| agent_error(vm_id, e))
    }
}

fn storage_error(id: &str, err: StorageError) -> VmServiceError {
    match err {
        StorageError::SnapshotNotFound(id) => VmServiceError::NotFound { id },
        StorageError::ImageNotFound(id) => VmServiceError::NotFound { id },
        other => VmServiceError::HostResource {
            phase: "storage".to_string(),
            source: anyhow::anyhow!("{id}: {other}"),
        },
    }
}

fn host_error(phase: &str, err: impl Into<anyhow::Error>) -> VmServiceError {
    VmServiceError::HostResource {
        phase: phase.to_string(),
        source: err.into(),
    }
}

fn firecracker_error(phase: &str, err: FirecrackerError) -> VmServiceError {
    match err {
        FirecrackerError::Api(e) => VmServiceError::FirecrackerApi {
            phase: phase.to_string(),
            status: 0,
            stderr_tail: e.to_string(),
        },
        FirecrackerError::SocketTimeout { stderr_tail, .. } => VmServiceError::FirecrackerApi {
            phase: phase.to_string(),
            status: 0,
            stderr_tail,
        },
        other => VmServiceError::HostResource {
            phase: phase.to_string(),
            source: other.into(),
        },
    }
}

fn agent_error(vm_id: &str, err: AgentClientError) -> VmServiceError {
    match err {
        AgentClientError::Unreachable(_) => VmServiceError::GuestAgentUnreachable { vm_id: vm_id.to_string() },
        other => VmServiceError::HostResource {
            phase: "agent".to_string(),
            source: other.into(),
        },
    }
}
