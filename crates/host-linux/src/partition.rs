use crate::command::{describe, run_tool, run_tool_with_input};
use crate::loopdev::{wait_for_node, PARTITION_SETTLE_TIMEOUT};
use crate::LinuxHost;
use log::debug;
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use winstick_core::host::HostResult;
use winstick_core::{
    partition_path, DeviceInspector, DiskGeometry, HostError, PartitionPlan, PartitionRole,
    PartitionTableWriter,
};

pub const SFDISK: &str = "sfdisk";
pub const UDEVADM: &str = "udevadm";

pub const MBR_ESP_TYPE: &str = "ef";
pub const MBR_DATA_TYPE: &str = "7";
pub const GPT_ESP_TYPE: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const GPT_DATA_TYPE: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

/// sfdisk input describing `plan` in absolute sectors.
pub fn render_sfdisk_script(geometry: &DiskGeometry, plan: &PartitionPlan) -> String {
    let gpt = plan.scheme.is_gpt();
    let mut script = String::new();
    let _ = writeln!(script, "label: {}", if gpt { "gpt" } else { "dos" });
    let _ = writeln!(script, "unit: sectors");
    let _ = writeln!(script, "sector-size: {}", geometry.logical_block_size);
    script.push('\n');

    for partition in &plan.partitions {
        let (kind, name) = match (partition.role, gpt) {
            (PartitionRole::EspBootstrap, false) => (MBR_ESP_TYPE, "EFI System"),
            (PartitionRole::WindowsData, false) => (MBR_DATA_TYPE, "Windows ISO"),
            (PartitionRole::EspBootstrap, true) => (GPT_ESP_TYPE, "EFI System"),
            (PartitionRole::WindowsData, true) => (GPT_DATA_TYPE, "Windows ISO"),
        };
        let _ = write!(
            script,
            "start={}, size={}, type={}",
            partition.start_block,
            partition.block_count(),
            kind
        );
        if gpt {
            let _ = write!(script, ", name=\"{}\"", name);
            if partition.bootable {
                script.push_str(", attrs=\"LegacyBIOSBootable\"");
            }
        } else if partition.bootable {
            script.push_str(", bootable");
        }
        script.push('\n');
    }
    script
}

impl PartitionTableWriter for LinuxHost {
    fn write_table(
        &self,
        device: &Path,
        geometry: &DiskGeometry,
        plan: &PartitionPlan,
    ) -> HostResult<()> {
        let sfdisk = self.tool(SFDISK)?;
        let script = render_sfdisk_script(geometry, plan);
        run_tool_with_input(
            &sfdisk,
            [OsStr::new("--wipe"), OsStr::new("always"), device.as_os_str()],
            Some(&script),
        )
        .map_err(|err| HostError::PartitionWriteFailed {
            device: device.to_path_buf(),
            output: describe(&err),
        })?;

        // Image files get their nodes later, when they are attached.
        if matches!(self.is_block_device(device), Ok(true)) {
            self.udev_settle();
            wait_for_partitions(device, plan.partitions.len(), PARTITION_SETTLE_TIMEOUT)?;
        }
        Ok(())
    }
}

impl LinuxHost {
    /// Best effort: without udevadm the node wait below still applies.
    fn udev_settle(&self) {
        let result = self
            .tool(UDEVADM)
            .map_err(|err| err.to_string())
            .and_then(|udevadm| {
                run_tool(&udevadm, [OsStr::new("settle")]).map_err(|err| describe(&err))
            });
        if let Err(reason) = result {
            debug!("Skipping udev settle: {}", reason);
        }
    }
}

/// Waits for the kernel to publish partitions 1..=`count` of `device`.
pub fn wait_for_partitions(device: &Path, count: usize, timeout: Duration) -> HostResult<()> {
    for number in 1..=count {
        let node = partition_path(device, number);
        if !wait_for_node(&node, timeout) {
            return Err(HostError::PartitionWriteFailed {
                device: device.to_path_buf(),
                output: format!(
                    "{} did not appear within {}s of writing the table",
                    node.display(),
                    timeout.as_secs()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use winstick_core::{PartitionScheme, PartitionSpec};

    fn plan(scheme: PartitionScheme) -> PartitionPlan {
        PartitionPlan {
            scheme,
            partitions: vec![
                PartitionSpec {
                    start_block: 2048,
                    end_block: 129_023,
                    role: PartitionRole::WindowsData,
                    bootable: true,
                },
                PartitionSpec {
                    start_block: 129_024,
                    end_block: 131_071,
                    role: PartitionRole::EspBootstrap,
                    bootable: false,
                },
            ],
        }
    }

    #[test]
    fn waits_until_every_partition_node_exists() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("mmcblk0");
        std::fs::write(dir.path().join("mmcblk0p1"), b"").unwrap();
        std::fs::write(dir.path().join("mmcblk0p2"), b"").unwrap();

        assert!(wait_for_partitions(&device, 2, Duration::from_millis(1)).is_ok());
        match wait_for_partitions(&device, 3, Duration::from_millis(150)) {
            Err(HostError::PartitionWriteFailed { device: failed, output }) => {
                assert_eq!(failed, device);
                assert!(output.contains("mmcblk0p3"), "{}", output);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn renders_dos_script() {
        let geometry = DiskGeometry::from_size_bytes(64 * 1024 * 1024, 512);
        assert_eq!(
            render_sfdisk_script(&geometry, &plan(PartitionScheme::Mbr)),
            "label: dos\n\
             unit: sectors\n\
             sector-size: 512\n\
             \n\
             start=2048, size=126976, type=7, bootable\n\
             start=129024, size=2048, type=ef\n"
        );
    }

    #[test]
    fn renders_gpt_script() {
        let geometry = DiskGeometry::from_size_bytes(64 * 1024 * 1024, 4096);
        let script = render_sfdisk_script(&geometry, &plan(PartitionScheme::Gpt));
        assert!(script.starts_with("label: gpt\nunit: sectors\nsector-size: 4096\n"));
        assert!(script.contains(&format!(
            "start=2048, size=126976, type={}, name=\"Windows ISO\", attrs=\"LegacyBIOSBootable\"\n",
            GPT_DATA_TYPE
        )));
        assert!(script.contains(&format!(
            "start=129024, size=2048, type={}, name=\"EFI System\"\n",
            GPT_ESP_TYPE
        )));
    }
}
