use crate::command::{describe, run_tool};
use crate::LinuxHost;
use std::ffi::OsString;
use std::path::Path;
use winstick_core::host::HostResult;
use winstick_core::{BootSectorWriter, FileSystemChoice, FilesystemFormatter, HostError};

pub const MS_SYS: &str = "ms-sys";

/// Arguments for the filesystem's mkfs tool.
pub fn mkfs_args(filesystem: FileSystemChoice, partition: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = match filesystem {
        FileSystemChoice::Exfat => Vec::new(),
        FileSystemChoice::Ntfs => vec!["-Q".into()],
        FileSystemChoice::Fat32 => vec!["-F".into(), "32".into()],
    };
    args.push(partition.as_os_str().to_os_string());
    args
}

impl FilesystemFormatter for LinuxHost {
    fn format(&self, filesystem: FileSystemChoice, partition: &Path) -> HostResult<()> {
        let tool = self.tool(filesystem.mkfs_tool())?;
        run_tool(&tool, mkfs_args(filesystem, partition))
            .map(|_| ())
            .map_err(|err| HostError::FormatFailed {
                filesystem,
                partition: partition.to_path_buf(),
                output: describe(&err),
            })
    }
}

impl BootSectorWriter for LinuxHost {
    fn write_boot_sector(&self, target: &Path) -> HostResult<()> {
        let ms_sys = self.tool(MS_SYS)?;
        run_tool(&ms_sys, [OsString::from("-w"), target.as_os_str().to_os_string()])
            .map(|_| ())
            .map_err(|err| HostError::BootSectorFailed {
                target: target.to_path_buf(),
                output: describe(&err),
            })
    }
}
