use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use winstick_core::{FileSystemChoice, FlashRequest, ToolLocator};

pub const SFDISK: &str = "sfdisk";
pub const LOSETUP: &str = "losetup";
pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";
pub const MS_SYS: &str = "ms-sys";

/// Everything the probe reports on besides the mkfs tools.
pub const SUPPORT_TOOLS: [&str; 5] = [SFDISK, LOSETUP, MOUNT, UMOUNT, MS_SYS];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no supported filesystem tools (mkfs.exfat, mkfs.ntfs, mkfs.vfat) found")]
    NoFilesystemAvailable,
    #[error("{requested} was requested but {} is not installed", requested.mkfs_tool())]
    FilesystemUnavailable { requested: FileSystemChoice },
    #[error("required tool {tool} not found ({reason})")]
    ToolMissing { tool: String, reason: String },
    #[error("{filesystem} needs the UEFI:NTFS bootstrap image, none was loaded")]
    MissingBootstrap { filesystem: FileSystemChoice },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Usable filesystems in preference order.
    pub filesystems: Vec<FileSystemChoice>,
    pub default_filesystem: Option<FileSystemChoice>,
    pub tools: Vec<ToolStatus>,
}

pub fn probe_available_filesystems(tools: &dyn ToolLocator) -> Vec<FileSystemChoice> {
    FileSystemChoice::PREFERENCE
        .into_iter()
        .filter(|filesystem| tools.is_available(filesystem.mkfs_tool()))
        .collect()
}

pub fn probe_host(tools: &dyn ToolLocator) -> ProbeReport {
    let filesystems = probe_available_filesystems(tools);
    let names = FileSystemChoice::PREFERENCE
        .iter()
        .map(|filesystem| filesystem.mkfs_tool())
        .chain(SUPPORT_TOOLS);
    ProbeReport {
        default_filesystem: filesystems.first().copied(),
        filesystems,
        tools: names
            .map(|name| ToolStatus {
                name: name.to_string(),
                path: tools.locate(name),
            })
            .collect(),
    }
}

/// Resolves the filesystem for a run: the requested one if it is usable,
/// otherwise the first available in preference order.
pub fn select_filesystem(
    requested: Option<FileSystemChoice>,
    available: &[FileSystemChoice],
) -> Result<FileSystemChoice, ConfigError> {
    match requested {
        Some(filesystem) if available.contains(&filesystem) => Ok(filesystem),
        Some(filesystem) => Err(ConfigError::FilesystemUnavailable {
            requested: filesystem,
        }),
        None => FileSystemChoice::PREFERENCE
            .into_iter()
            .find(|filesystem| available.contains(filesystem))
            .ok_or(ConfigError::NoFilesystemAvailable),
    }
}

/// Tools a request needs, with the reason each one is needed.
pub fn required_tools(
    request: &FlashRequest,
    destination_is_file: bool,
) -> Vec<(&'static str, &'static str)> {
    let mut tools = vec![
        (request.filesystem.mkfs_tool(), "creates the filesystem"),
        (SFDISK, "writes the partition table"),
        (MOUNT, "mounts the data partition"),
        (UMOUNT, "unmounts the data partition"),
    ];
    if destination_is_file {
        tools.push((LOSETUP, "attaches the destination file"));
    }
    if !request.scheme.is_gpt() {
        tools.push((MS_SYS, "writes MBR boot code"));
    }
    tools
}

pub fn check_required_tools(
    tools: &dyn ToolLocator,
    request: &FlashRequest,
    destination_is_file: bool,
) -> Result<(), ConfigError> {
    if !tools.is_available(request.filesystem.mkfs_tool()) {
        return Err(ConfigError::FilesystemUnavailable {
            requested: request.filesystem,
        });
    }
    for (tool, reason) in required_tools(request, destination_is_file) {
        if !tools.is_available(tool) {
            return Err(ConfigError::ToolMissing {
                tool: tool.to_string(),
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}
