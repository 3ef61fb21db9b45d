//! Capabilities the flash pipeline consumes from the host. Each trait is a
//! narrow seam so a backend can shell out to tools or use native calls
//! without the orchestrator noticing.

use crate::{DiskGeometry, FileSystemChoice, PartitionPlan, PartitionSpec};
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{} is not recognised as a Windows image in UDF format", path.display())]
    NotARecognizedImage { path: PathBuf },

    #[error("failed to write partition table to {}: {output}", device.display())]
    PartitionWriteFailed { device: PathBuf, output: String },

    #[error("failed to create {filesystem} filesystem on {}: {output}", partition.display())]
    FormatFailed {
        filesystem: FileSystemChoice,
        partition: PathBuf,
        output: String,
    },

    #[error("failed to mount {} at {}: {output}", partition.display(), target.display())]
    MountFailed {
        partition: PathBuf,
        target: PathBuf,
        output: String,
    },

    #[error("failed to unmount {}: {output}", target.display())]
    UnmountFailed { target: PathBuf, output: String },

    #[error("failed to attach loop device for {}: {output}", file.display())]
    LoopAttachFailed { file: PathBuf, output: String },

    #[error("failed to detach loop device {}: {output}", device.display())]
    LoopDetachFailed { device: PathBuf, output: String },

    #[error("failed to write payload to partition {index} of {}: {reason}", device.display())]
    PayloadWriteFailed {
        device: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("failed to write boot code to {}: {output}", target.display())]
    BootSectorFailed { target: PathBuf, output: String },

    #[error("required tool not found: {0}")]
    ToolMissing(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HostError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HostError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Creates an empty directory under `parent` (the system temp dir when
/// unset) that outlives the guard `tempfile` would attach. Callers remove it
/// with [`remove_mount_point`].
pub fn create_mount_point(prefix: &str, parent: Option<&Path>) -> HostResult<PathBuf> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match parent {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
    .map_err(|err| HostError::io("create mount point", err))?;
    Ok(dir.keep())
}

/// Non-recursive: a directory that is still a mount point is left alone.
pub fn remove_mount_point(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        warn!("Failed to remove mount point {}: {}", path.display(), err);
    }
}

/// Facts about the destination and the mounts that hold it.
pub trait DeviceInspector {
    fn is_block_device(&self, path: &Path) -> HostResult<bool>;
    fn is_system_disk(&self, path: &Path) -> bool;
    fn geometry(&self, path: &Path) -> HostResult<DiskGeometry>;
    /// Unmounts every mounted partition of `device`. Succeeds without doing
    /// anything when `device` is not a mounted block device.
    fn unmount_partitions(&self, device: &Path) -> HostResult<()>;
}

pub trait PartitionTableWriter {
    fn write_table(
        &self,
        device: &Path,
        geometry: &DiskGeometry,
        plan: &PartitionPlan,
    ) -> HostResult<()>;
}

/// Writes a raw byte payload into one partition's block range.
pub trait PayloadWriter {
    fn write_partition_payload(
        &self,
        device: &Path,
        geometry: &DiskGeometry,
        index: usize,
        partition: &PartitionSpec,
        payload: &[u8],
    ) -> HostResult<()>;
}

pub trait FilesystemFormatter {
    fn format(&self, filesystem: FileSystemChoice, partition: &Path) -> HostResult<()>;
}

pub trait Mounter {
    fn mount(&self, partition: &Path, target: &Path) -> HostResult<()>;
    fn unmount(&self, target: &Path) -> HostResult<()>;
}

pub trait LoopDevices {
    /// Attaches `file` with partition scanning and returns the loop device path.
    fn attach(&self, file: &Path) -> HostResult<PathBuf>;
    fn detach(&self, device: &Path) -> HostResult<()>;
}

/// Writes MBR-compatible boot code to a partition or whole device.
pub trait BootSectorWriter {
    fn write_boot_sector(&self, target: &Path) -> HostResult<()>;
}

pub trait ToolLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf>;

    fn is_available(&self, tool: &str) -> bool {
        self.locate(tool).is_some()
    }
}
