//! Drives one Firecracker microVM through the jailer: spawn, API
//! sequencing, cold start or snapshot restore, snapshot creation, and
//! destroy.
//!
//! Grounded on the teacher's former `runtime.rs`: the jailer-spawn and
//! API-sequencing shape is kept, but generalized from OCI-image-backed
//! boot plus remote log shipping to this core's boot-args/network model
//! and local log files.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use super::api::{ApiError, CreateSnapshotRequest, FirecrackerClient, LoadSnapshotRequest};
use super::config::{
    generate_mac_address, network_boot_args, BootSource, DriveConfig, MachineConfig,
    NetworkInterface, VsockConfig,
};
use super::jailer::{JailerConfig, JailerError, SandboxManager, SandboxPaths};

/// How a VM came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Cold,
    Restored,
}

/// Errors from driving a Firecracker instance.
#[derive(Debug, Error)]
pub enum FirecrackerError {
    #[error("firecracker api error: {0}")]
    Api(#[from] ApiError),

    #[error("jailer error: {0}")]
    Jailer(#[from] JailerError),

    #[error("failed to spawn jailer: {0}")]
    SpawnFailed(std::io::Error),

    #[error("api socket did not become ready within {timeout_secs}s (stdout: {stdout_tail}, stderr: {stderr_tail})")]
    SocketTimeout {
        timeout_secs: u64,
        stdout_tail: String,
        stderr_tail: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static configuration for the driver, shared across VMs.
#[derive(Debug, Clone)]
pub struct FirecrackerDriverConfig {
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub chroot_base: PathBuf,
    pub jail_uid: u32,
    pub jail_gid: u32,
    pub boot_timeout: Duration,
}

/// Everything needed to boot or restore one VM.
pub struct BootParams<'a> {
    pub vm_id: &'a str,
    pub cpu: u32,
    pub mem_mb: u32,
    pub kernel_path: &'a Path,
    pub rootfs_path: &'a Path,
    pub tap_name: &'a str,
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub vsock_cid: u32,
    pub logs_dir: &'a Path,
    /// When set, restore from a snapshot's `mem.snap`/`vmstate.snap` instead
    /// of a cold `InstanceStart`.
    pub restore_from: Option<RestoreParams<'a>>,
}

/// Host paths to a snapshot's memory and VM-state artifacts.
pub struct RestoreParams<'a> {
    pub mem_path: &'a Path,
    pub vmstate_path: &'a Path,
}

const AGENT_SOCKET_RELATIVE: &str = "run/agent.vsock";
const KERNEL_RELATIVE: &str = "vmlinux";
const ROOTFS_RELATIVE: &str = "rootfs.ext4";
const SNAPSHOT_IN_MEM: &str = "snapshot-in/mem.snap";
const SNAPSHOT_IN_VMSTATE: &str = "snapshot-in/vmstate.snap";
const SNAPSHOT_OUT_MEM: &str = "snapshot-out/mem.snap";
const SNAPSHOT_OUT_VMSTATE: &str = "snapshot-out/vmstate.snap";

/// A live, jailed Firecracker process plus the client to talk to it.
pub struct RunningVm {
    pub vm_id: String,
    pub sandbox: SandboxPaths,
    pub client: FirecrackerClient,
    child: Child,
    stdout_tail: Arc<StdMutex<VecDeque<u8>>>,
    stderr_tail: Arc<StdMutex<VecDeque<u8>>>,
}

impl RunningVm {
    fn tail_string(buf: &Arc<StdMutex<VecDeque<u8>>>) -> String {
        let guard = buf.lock().expect("tail mutex poisoned");
        String::from_utf8_lossy(&guard.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    pub fn stdout_tail(&self) -> String {
        Self::tail_string(&self.stdout_tail)
    }

    pub fn stderr_tail(&self) -> String {
        Self::tail_string(&self.stderr_tail)
    }
}

pub struct FirecrackerDriver {
    config: FirecrackerDriverConfig,
}

impl FirecrackerDriver {
    pub fn new(config: FirecrackerDriverConfig) -> Self {
        Self { config }
    }

    /// Spawn the jailer, configure the VM over its API, and either cold
    /// boot or restore from a snapshot.
    pub async fn boot(&self, params: BootParams<'_>) -> Result<(RunningVm, BootOutcome), FirecrackerError> {
        let jailer_config = JailerConfig::new(params.vm_id, self.config.chroot_base.clone())
            .with_memory_limit(params.mem_mb as u64 * 1024 * 1024);
        let jailer_config = JailerConfig {
            jailer_path: self.config.jailer_bin.clone(),
            firecracker_path: self.config.firecracker_bin.clone(),
            uid: self.config.jail_uid,
            gid: self.config.jail_gid,
            ..jailer_config
        };

        let sandbox_manager = SandboxManager::new(jailer_config.clone());
        let sandbox = sandbox_manager.prepare_sandbox()?;
        sandbox_manager.setup_cgroups()?;

        self.stage_inputs(&sandbox, &params)?;

        let (child, stdout_tail, stderr_tail) =
            self.spawn_jailer(&sandbox_manager, params.logs_dir).await?;

        let client = FirecrackerClient::new(&sandbox.socket);
        self.wait_for_socket(&client, &stdout_tail, &stderr_tail)
            .await?;

        self.configure(&client, &params).await?;

        let outcome = if let Some(restore) = &params.restore_from {
            self.restore(&client, &sandbox, restore).await?;
            BootOutcome::Restored
        } else {
            client.start_instance().await?;
            BootOutcome::Cold
        };

        info!(vm_id = params.vm_id, ?outcome, "vm boot sequence complete");

        Ok((
            RunningVm {
                vm_id: params.vm_id.to_string(),
                sandbox,
                client,
                child,
                stdout_tail,
                stderr_tail,
            },
            outcome,
        ))
    }

    /// Copy/link the kernel and rootfs into the jail so Firecracker (which
    /// runs chrooted) can see them under its own root.
    fn stage_inputs(&self, sandbox: &SandboxPaths, params: &BootParams<'_>) -> Result<(), FirecrackerError> {
        let kernel_dest = sandbox.chroot.join(KERNEL_RELATIVE);
        let rootfs_dest = sandbox.chroot.join(ROOTFS_RELATIVE);

        stage_file(params.kernel_path, &kernel_dest)?;
        stage_file(params.rootfs_path, &rootfs_dest)?;

        if let Some(restore) = &params.restore_from {
            let mem_dest = sandbox.chroot.join(SNAPSHOT_IN_MEM);
            let vmstate_dest = sandbox.chroot.join(SNAPSHOT_IN_VMSTATE);
            stage_file(restore.mem_path, &mem_dest)?;
            stage_file(restore.vmstate_path, &vmstate_dest)?;
        }

        Ok(())
    }

    async fn spawn_jailer(
        &self,
        manager: &SandboxManager,
        logs_dir: &Path,
    ) -> Result<(Child, Arc<StdMutex<VecDeque<u8>>>, Arc<StdMutex<VecDeque<u8>>>), FirecrackerError> {
        tokio::fs::create_dir_all(logs_dir).await?;

        let mut command = Command::new(&self.config.jailer_bin);
        command
            .args(manager.jailer_args())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(FirecrackerError::SpawnFailed)?;

        let stdout_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(8192)));
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(8192)));

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pipeline(stdout, logs_dir.join("firecracker.stdout.log"), stdout_tail.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pipeline(stderr, logs_dir.join("firecracker.stderr.log"), stderr_tail.clone());
        }

        Ok((child, stdout_tail, stderr_tail))
    }

    async fn wait_for_socket(
        &self,
        client: &FirecrackerClient,
        stdout_tail: &Arc<StdMutex<VecDeque<u8>>>,
        stderr_tail: &Arc<StdMutex<VecDeque<u8>>>,
    ) -> Result<(), FirecrackerError> {
        let deadline = tokio::time::Instant::now() + self.config.boot_timeout;
        while tokio::time::Instant::now() < deadline {
            if client.socket_exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Err(FirecrackerError::SocketTimeout {
            timeout_secs: self.config.boot_timeout.as_secs(),
            stdout_tail: RunningVm::tail_string(stdout_tail),
            stderr_tail: RunningVm::tail_string(stderr_tail),
        })
    }

    async fn configure(
        &self,
        client: &FirecrackerClient,
        params: &BootParams<'_>,
    ) -> Result<(), FirecrackerError> {
        client
            .put_machine_config(&MachineConfig::new(params.cpu as u8, params.mem_mb))
            .await?;

        let boot_args = network_boot_args(params.guest_ip, params.gateway_ip);
        client
            .put_boot_source(
                &BootSource::new(PathBuf::from("/").join(KERNEL_RELATIVE))
                    .with_boot_args(&boot_args),
            )
            .await?;

        let drive = DriveConfig::new(
            "rootfs",
            PathBuf::from("/").join(ROOTFS_RELATIVE),
            true,
        );
        client.put_drive(&drive).await?;

        let mac = generate_mac_address(params.vm_id);
        client
            .put_network_interface(
                &NetworkInterface::new("eth0", params.tap_name).with_mac(&mac),
            )
            .await?;

        client
            .put_vsock(&VsockConfig::new(
                params.vsock_cid,
                PathBuf::from("/").join(AGENT_SOCKET_RELATIVE),
            ))
            .await?;

        Ok(())
    }

    async fn restore(
        &self,
        client: &FirecrackerClient,
        _sandbox: &SandboxPaths,
        _restore: &RestoreParams<'_>,
    ) -> Result<(), FirecrackerError> {
        client
            .load_snapshot(&LoadSnapshotRequest {
                snapshot_path: PathBuf::from("/").join(SNAPSHOT_IN_VMSTATE).to_string_lossy().into_owned(),
                mem_file_path: PathBuf::from("/").join(SNAPSHOT_IN_MEM).to_string_lossy().into_owned(),
                enable_diff_snapshots: false,
                resume_vm: false,
            })
            .await?;
        client.resume().await?;
        Ok(())
    }

    /// Pause, snapshot, and resume a running VM, then copy the artifacts to
    /// their final destinations.
    pub async fn snapshot(
        &self,
        vm: &RunningVm,
        dest_mem: &Path,
        dest_vmstate: &Path,
    ) -> Result<(), FirecrackerError> {
        vm.client.pause().await?;

        let result = vm
            .client
            .create_snapshot(&CreateSnapshotRequest {
                snapshot_path: PathBuf::from("/").join(SNAPSHOT_OUT_VMSTATE).to_string_lossy().into_owned(),
                mem_file_path: PathBuf::from("/").join(SNAPSHOT_OUT_MEM).to_string_lossy().into_owned(),
                snapshot_type: "Full",
            })
            .await;

        vm.client.resume().await?;
        result?;

        tokio::fs::create_dir_all(vm.sandbox.chroot.join("snapshot-out")).await?;
        tokio::fs::copy(vm.sandbox.chroot.join(SNAPSHOT_OUT_MEM), dest_mem).await?;
        tokio::fs::copy(vm.sandbox.chroot.join(SNAPSHOT_OUT_VMSTATE), dest_vmstate).await?;

        Ok(())
    }

    /// Request a graceful shutdown via `SendCtrlAltDel`.
    pub async fn stop(&self, vm: &RunningVm) -> Result<(), FirecrackerError> {
        vm.client.send_ctrl_alt_del().await?;
        Ok(())
    }

    /// Kill the process and remove the jail subtree. Best-effort: errors
    /// are logged, never propagated, since destroy must always make
    /// progress.
    pub async fn destroy(&self, vm_id: &str, mut vm: RunningVm) {
        if let Err(e) = vm.child.start_kill() {
            warn!(vm_id, error = %e, "failed to signal jailer process");
        }
        let _ = vm.child.wait().await;

        let jailer_config = JailerConfig::new(vm_id, self.config.chroot_base.clone());
        let manager = SandboxManager::new(jailer_config);
        if let Err(e) = manager.cleanup() {
            error!(vm_id, error = %e, "failed to clean up jail sandbox");
        }
    }
}

fn stage_file(src: &Path, dest: &Path) -> Result<(), FirecrackerError> {
    if super::jailer::link_to_sandbox(src, dest).is_err() {
        super::jailer::copy_to_sandbox(src, dest)?;
    }
    Ok(())
}

fn spawn_log_pipeline<R>(reader: R, log_path: PathBuf, tail: Arc<StdMutex<VecDeque<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %log_path.display(), error = %e, "failed to open firecracker log file");
                return;
            }
        };

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(error = %e, "failed to write firecracker log line");
                break;
            }
            let _ = file.write_all(b"\n").await;

            let mut guard = tail.lock().expect("tail mutex poisoned");
            for byte in line.as_bytes().iter().chain(std::iter::once(&b'\n')) {
                if guard.len() == guard.capacity() {
                    guard.pop_front();
                }
                guard.push_back(*byte);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_jail_local() {
        assert!(!KERNEL_RELATIVE.starts_with('/'));
        assert!(!ROOTFS_RELATIVE.starts_with('/'));
    }
}
