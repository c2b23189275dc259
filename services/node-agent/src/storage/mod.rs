//! Per-VM rootfs provisioning and snapshot artifact layout.
//!
//! Layout under a configured root:
//! ```text
//! <root>/vms/<id>/rootfs.ext4
//! <root>/vms/<id>/logs/...
//! <root>/snapshots/<sid>/{mem.snap, vmstate.snap, disk.img, meta.json}
//! <root>/images/<iid>/{vmlinux, rootfs.ext4}
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

/// How a per-VM rootfs is derived from its base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    Auto,
    Reflink,
    Overlay,
    Copy,
}

impl CloneMode {
    pub fn from_env_str(s: &str) -> Self {
        match s {
            "reflink" => Self::Reflink,
            "overlay" => Self::Overlay,
            "copy" => Self::Copy,
            _ => Self::Auto,
        }
    }
}

/// Resolved paths to a `<iid>`'s kernel and base rootfs.
#[derive(Debug, Clone)]
pub struct GuestImage {
    pub id: String,
    pub vmlinux_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub base_rootfs_bytes: u64,
}

/// On-disk snapshot metadata sidecar (`meta.json`), also returned verbatim
/// as the `SnapshotMeta` API response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetaFile {
    pub id: String,
    pub kind: String,
    pub created_at: i64,
    pub cpu: u32,
    pub mem_mb: u32,
    pub source_vm_id: Option<String>,
    pub has_disk: bool,
}

/// Paths to a snapshot's three artifacts.
#[derive(Debug, Clone)]
pub struct SnapshotArtifactPaths {
    pub mem: PathBuf,
    pub vmstate: PathBuf,
    pub disk: PathBuf,
    pub meta: PathBuf,
}

pub struct StorageProvider {
    root: PathBuf,
    images_dir: PathBuf,
    clone_mode: CloneMode,
}

impl StorageProvider {
    pub fn new(root: impl Into<PathBuf>, images_dir: impl Into<PathBuf>, clone_mode: CloneMode) -> Self {
        Self {
            root: root.into(),
            images_dir: images_dir.into(),
            clone_mode,
        }
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.root.join("vms").join(vm_id)
    }

    pub fn vm_rootfs_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("rootfs.ext4")
    }

    pub fn vm_logs_dir(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("logs")
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join("snapshots").join(snapshot_id)
    }

    /// Read `images/<iid>/manifest.json` plus check for `vmlinux`/`rootfs.ext4`.
    pub async fn resolve_image(&self, image_id: &str) -> Result<GuestImage, StorageError> {
        let dir = self.images_dir.join(image_id);
        let vmlinux_path = dir.join("vmlinux");
        let rootfs_path = dir.join("rootfs.ext4");

        if !vmlinux_path.exists() || !rootfs_path.exists() {
            return Err(StorageError::ImageNotFound(image_id.to_string()));
        }

        let base_rootfs_bytes = tokio::fs::metadata(&rootfs_path).await?.len();

        Ok(GuestImage {
            id: image_id.to_string(),
            vmlinux_path,
            rootfs_path,
            base_rootfs_bytes,
        })
    }

    /// Materialize a per-VM rootfs from an image's base rootfs.
    pub async fn prepare_vm_storage(
        &self,
        vm_id: &str,
        image: &GuestImage,
        disk_size_mb: Option<u32>,
    ) -> Result<PathBuf, StorageError> {
        let dest = self.vm_rootfs_path(vm_id);
        tokio::fs::create_dir_all(self.vm_dir(vm_id)).await?;
        tokio::fs::create_dir_all(self.vm_logs_dir(vm_id)).await?;

        self.clone_disk(&image.rootfs_path, &dest).await?;

        if let Some(size_mb) = disk_size_mb {
            self.extend_disk(&dest, size_mb as u64 * 1024 * 1024).await?;
        }

        fsync_file_and_parent(&dest).await?;

        Ok(dest)
    }

    /// Clone a snapshot's `disk.img` into the per-VM rootfs.
    pub async fn prepare_vm_storage_from_disk(
        &self,
        vm_id: &str,
        disk_path: &Path,
    ) -> Result<PathBuf, StorageError> {
        let dest = self.vm_rootfs_path(vm_id);
        tokio::fs::create_dir_all(self.vm_dir(vm_id)).await?;
        tokio::fs::create_dir_all(self.vm_logs_dir(vm_id)).await?;

        self.clone_disk(disk_path, &dest).await?;
        fsync_file_and_parent(&dest).await?;

        Ok(dest)
    }

    /// Clone `src` into `dst` per the configured policy: reflink when
    /// supported, falling back to a full copy; `overlay` instead hardlinks
    /// the base (the writable layer is mounted by the driver at boot time,
    /// not here); `copy` always does a full copy.
    pub async fn clone_disk(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let mode = self.clone_mode;

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            match mode {
                CloneMode::Auto | CloneMode::Reflink => {
                    reflink_copy::reflink_or_copy(&src, &dst)?;
                }
                CloneMode::Overlay => {
                    std::fs::hard_link(&src, &dst).or_else(|_| std::fs::copy(&src, &dst).map(|_| ()))?;
                }
                CloneMode::Copy => {
                    std::fs::copy(&src, &dst)?;
                }
            }
            Ok(())
        })
        .await
        .expect("clone_disk blocking task panicked")?;

        debug!(src = %src.display(), dst = %dst.display(), "disk cloned");
        Ok(())
    }

    /// Extend a disk file to `size_bytes` (sparse; ext4 is sparse by
    /// default). No-op if the file is already at least that large.
    async fn extend_disk(&self, path: &Path, size_bytes: u64) -> Result<(), StorageError> {
        let current = tokio::fs::metadata(path).await?.len();
        if current >= size_bytes {
            return Ok(());
        }
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = File::options().write(true).open(&path)?;
            file.set_len(size_bytes)
        })
        .await
        .expect("extend_disk blocking task panicked")?;
        Ok(())
    }

    pub fn snapshot_artifact_paths(&self, snapshot_id: &str) -> SnapshotArtifactPaths {
        let dir = self.snapshot_dir(snapshot_id);
        SnapshotArtifactPaths {
            mem: dir.join("mem.snap"),
            vmstate: dir.join("vmstate.snap"),
            disk: dir.join("disk.img"),
            meta: dir.join("meta.json"),
        }
    }

    /// Write a snapshot's artifacts directory and `meta.json` sidecar.
    pub async fn write_snapshot_meta(&self, meta: &SnapshotMetaFile) -> Result<(), StorageError> {
        let paths = self.snapshot_artifact_paths(&meta.id);
        tokio::fs::create_dir_all(self.snapshot_dir(&meta.id)).await?;
        let json = serde_json::to_vec_pretty(meta)?;
        tokio::fs::write(&paths.meta, json).await?;
        Ok(())
    }

    pub async fn read_snapshot_meta(&self, snapshot_id: &str) -> Result<SnapshotMetaFile, StorageError> {
        let paths = self.snapshot_artifact_paths(snapshot_id);
        if !paths.meta.exists() {
            return Err(StorageError::SnapshotNotFound(snapshot_id.to_string()));
        }
        let bytes = tokio::fs::read(&paths.meta).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List snapshots whose three artifacts are all present; partial
    /// snapshot directories (interrupted writes) are silently skipped.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotMetaFile>, StorageError> {
        let snapshots_root = self.root.join("snapshots");
        if !snapshots_root.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&snapshots_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let paths = self.snapshot_artifact_paths(&id);
            if paths.mem.exists() && paths.vmstate.exists() && paths.meta.exists() {
                if let Ok(meta) = self.read_snapshot_meta(&id).await {
                    if !meta.has_disk || paths.disk.exists() {
                        out.push(meta);
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), StorageError> {
        let dir = self.snapshot_dir(snapshot_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Recursively delete a VM's storage directory. Idempotent.
    pub async fn cleanup_vm_storage(&self, vm_id: &str) -> Result<(), StorageError> {
        let dir = self.vm_dir(vm_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            info!(vm_id, "cleaned up vm storage");
        }
        Ok(())
    }
}

/// fsync the file and its containing directory entry, so a reflink clone's
/// directory entry cannot be lost on a host crash between clone and boot.
async fn fsync_file_and_parent(path: &Path) -> Result<(), StorageError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = File::open(&path)?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    })
    .await
    .expect("fsync blocking task panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[tokio::test]
    async fn prepare_vm_storage_clones_and_extends() {
        let tmp = tempfile::tempdir().unwrap();
        let images_dir = tmp.path().join("images");
        let base_rootfs = images_dir.join("base").join("rootfs.ext4");
        write_file(&base_rootfs, b"0123456789");
        write_file(&images_dir.join("base").join("vmlinux"), b"kernel");

        let provider = StorageProvider::new(tmp.path().join("data"), images_dir, CloneMode::Copy);
        let image = provider.resolve_image("base").await.unwrap();
        assert_eq!(image.base_rootfs_bytes, 10);

        let dest = provider.prepare_vm_storage("vm-1", &image, Some(1)).await.unwrap();
        let meta = tokio::fs::metadata(&dest).await.unwrap();
        assert_eq!(meta.len(), 1024 * 1024);
    }

    #[tokio::test]
    async fn resolve_image_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StorageProvider::new(tmp.path().join("data"), tmp.path().join("images"), CloneMode::Copy);
        let err = provider.resolve_image("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn snapshot_meta_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StorageProvider::new(tmp.path(), tmp.path().join("images"), CloneMode::Copy);
        let meta = SnapshotMetaFile {
            id: "snap-1".to_string(),
            kind: "vm".to_string(),
            created_at: 1000,
            cpu: 2,
            mem_mb: 512,
            source_vm_id: Some("vm-1".to_string()),
            has_disk: true,
        };
        provider.write_snapshot_meta(&meta).await.unwrap();
        let fetched = provider.read_snapshot_meta("snap-1").await.unwrap();
        assert_eq!(fetched.cpu, 2);

        // list_snapshots skips it since mem.snap/vmstate.snap/disk.img are absent
        assert!(provider.list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_vm_storage_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StorageProvider::new(tmp.path(), tmp.path().join("images"), CloneMode::Copy);
        provider.cleanup_vm_storage("never-existed").await.unwrap();
    }
}
