use crate::command::{describe, run_tool};
use crate::device::MOUNT;
use crate::LinuxHost;
use log::{debug, warn};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use winstick_content::{ensure_windows_image, tree_from_directory, ImageReader, SourceImage};
use winstick_core::{create_mount_point, remove_mount_point, HostError, Mounter};

pub const IMAGE_MOUNT_PREFIX: &str = "winstick-iso-";

/// Exposes a UDF image through a read-only loop mount that lives as long as
/// the returned [`SourceImage`].
#[derive(Debug, Clone, Default)]
pub struct LoopIsoReader {
    host: LinuxHost,
}

impl LoopIsoReader {
    pub fn new(host: LinuxHost) -> Self {
        Self { host }
    }
}

impl ImageReader for LoopIsoReader {
    fn open_image(&self, path: &Path) -> Result<SourceImage, HostError> {
        ensure_windows_image(path)?;
        let mount = self.host.tool(MOUNT)?;
        let mount_point = create_mount_point(IMAGE_MOUNT_PREFIX, None)?;
        let mounted = run_tool(
            &mount,
            [
                OsStr::new("-t"),
                OsStr::new("udf"),
                OsStr::new("-o"),
                OsStr::new("loop,ro"),
                path.as_os_str(),
                mount_point.as_os_str(),
            ],
        );
        if let Err(err) = mounted {
            remove_mount_point(&mount_point);
            return Err(HostError::MountFailed {
                partition: path.to_path_buf(),
                target: mount_point,
                output: describe(&err),
            });
        }

        let mount = ImageMount {
            host: self.host.clone(),
            mount_point,
        };
        let root = tree_from_directory(&mount.mount_point).map_err(|err| {
            HostError::io(format!("read {}", mount.mount_point.display()), err)
        })?;
        Ok(SourceImage::with_mount(root, Box::new(mount)))
    }
}

#[derive(Debug)]
struct ImageMount {
    host: LinuxHost,
    mount_point: PathBuf,
}

impl Drop for ImageMount {
    fn drop(&mut self) {
        match self.host.unmount(&self.mount_point) {
            Ok(()) => {
                debug!("Unmounted image at {}", self.mount_point.display());
                remove_mount_point(&self.mount_point);
            }
            Err(err) => warn!("Failed to unmount image: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathToolLocator;
    use std::fs;

    #[test]
    fn rejects_unrecognised_images_before_mounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.iso");
        fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        assert!(matches!(
            LoopIsoReader::default().open_image(&path),
            Err(HostError::NotARecognizedImage { .. })
        ));
    }

    #[test]
    fn mount_is_resolved_through_the_tool_locator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("win.iso");
        let mut bytes = vec![0u8; 20 * 2048];
        bytes[16 * 2048 + 1..16 * 2048 + 6].copy_from_slice(b"BEA01");
        bytes[17 * 2048 + 1..17 * 2048 + 6].copy_from_slice(b"NSR03");
        bytes[18 * 2048 + 1..18 * 2048 + 6].copy_from_slice(b"TEA01");
        fs::write(&path, bytes).unwrap();

        let empty = tempfile::tempdir().unwrap();
        let reader = LoopIsoReader::new(LinuxHost::with_tools(PathToolLocator::with_dirs(vec![
            empty.path().to_path_buf(),
        ])));
        match reader.open_image(&path) {
            Err(HostError::ToolMissing(tool)) => assert_eq!(tool, MOUNT),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("mounted without a mount tool"),
        }
    }
}
