use crate::command::{describe, run_tool};
use crate::mounts::{belongs_to_device, read_mounts, MountEntry};
use crate::LinuxHost;
use log::{debug, info};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use winstick_core::host::HostResult;
use winstick_core::{DeviceInspector, DiskGeometry, HostError, Mounter};

/// Regular-file destinations are addressed in these units.
pub const REGULAR_FILE_BLOCK_SIZE: u64 = 512;
/// A disk holding any of these mounts is the running system.
pub const SYSTEM_MOUNT_POINTS: [&str; 3] = ["/", "/boot", "/boot/efi"];
pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";

impl DeviceInspector for LinuxHost {
    fn is_block_device(&self, path: &Path) -> HostResult<bool> {
        Ok(stat(path)?.file_type().is_block_device())
    }

    fn is_system_disk(&self, path: &Path) -> bool {
        holds_system_mount(&canonical_device(path), &read_mounts())
    }

    fn geometry(&self, path: &Path) -> HostResult<DiskGeometry> {
        let metadata = stat(path)?;
        if metadata.file_type().is_block_device() {
            let file = File::open(path)
                .map_err(|err| HostError::io(format!("open {}", path.display()), err))?;
            block_geometry(&file)
                .map_err(|err| HostError::io(format!("query geometry of {}", path.display()), err))
        } else if metadata.is_file() {
            Ok(DiskGeometry::from_size_bytes(
                metadata.len(),
                REGULAR_FILE_BLOCK_SIZE,
            ))
        } else {
            Err(HostError::io(
                format!("query geometry of {}", path.display()),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not a block device or regular file",
                ),
            ))
        }
    }

    fn unmount_partitions(&self, device: &Path) -> HostResult<()> {
        if !matches!(self.is_block_device(device), Ok(true)) {
            debug!("{} is not a block device, nothing to unmount", device.display());
            return Ok(());
        }
        let device = canonical_device(device);
        for target in mounted_targets(&device, &read_mounts()) {
            info!("unmounting {}", target.display());
            self.unmount(&target)?;
        }
        Ok(())
    }
}

impl Mounter for LinuxHost {
    fn mount(&self, partition: &Path, target: &Path) -> HostResult<()> {
        let mount = self.tool(MOUNT)?;
        run_tool(&mount, [partition.as_os_str(), target.as_os_str()])
            .map(|_| ())
            .map_err(|err| HostError::MountFailed {
                partition: partition.to_path_buf(),
                target: target.to_path_buf(),
                output: describe(&err),
            })
    }

    fn unmount(&self, target: &Path) -> HostResult<()> {
        let umount = self.tool(UMOUNT)?;
        run_tool(&umount, [OsStr::new(target)])
            .map(|_| ())
            .map_err(|err| HostError::UnmountFailed {
                target: target.to_path_buf(),
                output: describe(&err),
            })
    }
}

fn stat(path: &Path) -> HostResult<fs::Metadata> {
    fs::metadata(path).map_err(|err| HostError::io(format!("stat {}", path.display()), err))
}

/// Resolves udev symlinks such as /dev/disk/by-id/* to the kernel node.
pub fn canonical_device(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

pub fn holds_system_mount(device: &str, mounts: &[MountEntry]) -> bool {
    mounts
        .iter()
        .filter(|entry| {
            SYSTEM_MOUNT_POINTS
                .iter()
                .any(|point| entry.mount_point == Path::new(point))
        })
        .any(|entry| belongs_to_device(&canonical_device(Path::new(&entry.device)), device))
}

/// Mount points backed by `device` or its partitions, deepest first.
pub fn mounted_targets(device: &str, mounts: &[MountEntry]) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = mounts
        .iter()
        .filter(|entry| belongs_to_device(&entry.device, device))
        .map(|entry| entry.mount_point.clone())
        .collect();
    targets.sort_by_key(|target| std::cmp::Reverse(target.components().count()));
    targets.dedup();
    targets
}

#[cfg(target_os = "linux")]
fn block_geometry(file: &File) -> io::Result<DiskGeometry> {
    use std::os::unix::io::AsRawFd;

    // _IO(0x12, 104) and _IOR(0x12, 114, size_t)
    const BLKSSZGET: u64 = 0x1268;
    const BLKGETSIZE64: u64 = 0x8000_1272 | ((std::mem::size_of::<usize>() as u64) << 16);

    let fd = file.as_raw_fd();
    let mut block_size: libc::c_int = 0;
    // SAFETY: fd is open for the lifetime of `file`; the kernel writes one c_int.
    if unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut block_size) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut size_bytes: u64 = 0;
    // SAFETY: as above; the kernel writes one u64.
    if unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size_bytes) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if block_size <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("device reported block size {}", block_size),
        ));
    }
    Ok(DiskGeometry::from_size_bytes(size_bytes, block_size as u64))
}

#[cfg(not(target_os = "linux"))]
fn block_geometry(_file: &File) -> io::Result<DiskGeometry> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "block device geometry requires linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::parse_mounts;
    use crate::PathToolLocator;

    const MOUNTS: &str = "\
/dev/nvme0n1p2 / ext4 rw 0 0
/dev/nvme0n1p1 /boot/efi vfat rw 0 0
/dev/sdb1 /media/stick exfat rw 0 0
/dev/sdb2 /media/stick/esp vfat rw 0 0
/dev/sdc1 /media/other vfat rw 0 0
";

    #[test]
    fn system_disk_is_detected_from_root_mount() {
        let mounts = parse_mounts(MOUNTS);
        assert!(holds_system_mount("/dev/nvme0n1", &mounts));
        assert!(!holds_system_mount("/dev/sdb", &mounts));
    }

    #[test]
    fn targets_are_unmounted_deepest_first() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(
            mounted_targets("/dev/sdb", &mounts),
            vec![
                PathBuf::from("/media/stick/esp"),
                PathBuf::from("/media/stick")
            ]
        );
        assert!(mounted_targets("/dev/sdd", &mounts).is_empty());
    }

    #[test]
    fn regular_file_geometry_uses_512_byte_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        File::create(&path).unwrap().set_len(64 * 1024 * 1024).unwrap();

        let host = LinuxHost::new();
        assert!(!host.is_block_device(&path).unwrap());
        let geometry = host.geometry(&path).unwrap();
        assert_eq!(geometry.logical_block_size, 512);
        assert_eq!(geometry.total_blocks, 131_072);
    }

    #[test]
    fn unmounting_a_regular_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        File::create(&path).unwrap();
        assert!(LinuxHost::new().unmount_partitions(&path).is_ok());
        assert!(LinuxHost::new()
            .unmount_partitions(&dir.path().join("absent"))
            .is_ok());
    }

    #[test]
    fn mount_tools_come_from_the_locator() {
        let dir = tempfile::tempdir().unwrap();
        let host = LinuxHost::with_tools(PathToolLocator::with_dirs(vec![dir.path().to_path_buf()]));
        assert!(matches!(
            host.mount(Path::new("/dev/sdz1"), dir.path()),
            Err(HostError::ToolMissing(ref tool)) if tool == MOUNT
        ));
        assert!(matches!(
            host.unmount(dir.path()),
            Err(HostError::ToolMissing(ref tool)) if tool == UMOUNT
        ));
    }

    #[test]
    fn directories_have_no_geometry() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LinuxHost::new().geometry(dir.path()),
            Err(HostError::Io { .. })
        ));
    }
}
