use crate::command::{describe, run_tool};
use crate::LinuxHost;
use log::warn;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use winstick_core::host::HostResult;
use winstick_core::{partition_path, HostError, LoopDevices};

/// How long to wait for udev to create partition nodes after attaching.
pub const PARTITION_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

impl LoopDevices for LinuxHost {
    fn attach(&self, file: &Path) -> HostResult<PathBuf> {
        let losetup = self.tool("losetup")?;
        let failed = |output: String| HostError::LoopAttachFailed {
            file: file.to_path_buf(),
            output,
        };
        let output = run_tool(
            &losetup,
            [
                OsStr::new("--find"),
                OsStr::new("--show"),
                OsStr::new("--partscan"),
                file.as_os_str(),
            ],
        )
        .map_err(|err| failed(describe(&err)))?;

        let device = output.stdout.trim();
        if device.is_empty() {
            return Err(failed("losetup did not report a device".to_string()));
        }
        let device = PathBuf::from(device);
        let first = partition_path(&device, 1);
        if !wait_for_node(&first, PARTITION_SETTLE_TIMEOUT) {
            warn!("{} did not appear after attaching {}", first.display(), device.display());
        }
        Ok(device)
    }

    fn detach(&self, device: &Path) -> HostResult<()> {
        let losetup = self.tool("losetup")?;
        run_tool(&losetup, [OsStr::new("--detach"), device.as_os_str()])
            .map(|_| ())
            .map_err(|err| HostError::LoopDetachFailed {
                device: device.to_path_buf(),
                output: describe(&err),
            })
    }
}

pub fn wait_for_node(path: &Path, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if path.exists() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
