use crate::device::SYSTEM_MOUNT_POINTS;
use crate::mounts::{mounts_by_device_name, read_mounts, MountEntry};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use winstick_core::{Disk, Partition};

pub const SYS_BLOCK: &str = "/sys/block";
pub const BY_LABEL: &str = "/dev/disk/by-label";
/// Kernel name prefixes of disks that can never be a USB drive.
const VIRTUAL_PREFIXES: [&str; 5] = ["loop", "ram", "zram", "dm-", "md"];

pub fn enumerate_disks() -> Result<Vec<Disk>> {
    enumerate_disks_in(
        Path::new(SYS_BLOCK),
        Path::new("/dev"),
        &read_mounts(),
        &labels_in(Path::new(BY_LABEL)),
    )
}

/// Candidate destinations: removable, not virtual, not the running system.
pub fn removable_disks() -> Result<Vec<Disk>> {
    Ok(enumerate_disks()?
        .into_iter()
        .filter(|disk| disk.removable && !disk.is_system_disk)
        .collect())
}

pub fn enumerate_disks_in(
    sys_block: &Path,
    dev_root: &Path,
    mounts: &[MountEntry],
    labels: &HashMap<String, String>,
) -> Result<Vec<Disk>> {
    let mounts = mounts_by_device_name(mounts);
    let mut disks = Vec::new();
    let entries =
        fs::read_dir(sys_block).with_context(|| format!("read {}", sys_block.display()))?;
    for entry in entries {
        let entry = entry?;
        let disk_name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_disk(&entry.path(), &disk_name) {
            continue;
        }
        let size_bytes = read_u64(entry.path().join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let removable = read_u64(entry.path().join("removable")).unwrap_or(0) == 1;
        let friendly_name = friendly_name(&entry.path()).unwrap_or_else(|| disk_name.clone());
        let partitions = enumerate_partitions(&entry.path(), &mounts, labels)?;
        let whole_disk_mounts = mounts.get(&disk_name).map(Vec::as_slice).unwrap_or(&[]);
        let is_system_disk = partitions
            .iter()
            .flat_map(|partition| partition.mount_points.iter())
            .map(String::as_str)
            .chain(whole_disk_mounts.iter().filter_map(|info| info.mount_point.to_str()))
            .any(|mount| SYSTEM_MOUNT_POINTS.iter().any(|point| *point == mount));
        disks.push(Disk {
            path: dev_root.join(&disk_name),
            id: disk_name,
            friendly_name,
            size_bytes,
            removable,
            is_system_disk,
            partitions,
        });
    }
    disks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(disks)
}

fn enumerate_partitions(
    disk_path: &Path,
    mounts: &HashMap<String, Vec<MountEntry>>,
    labels: &HashMap<String, String>,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let entries =
        fs::read_dir(disk_path).with_context(|| format!("read {}", disk_path.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.join("partition").exists() {
            continue;
        }
        let part_name = entry.file_name().to_string_lossy().to_string();
        let size_bytes = read_u64(path.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let mount_infos = mounts.get(&part_name).cloned().unwrap_or_default();
        partitions.push(Partition {
            label: labels.get(&part_name).cloned(),
            fs: mount_infos.first().map(|info| info.fs_type.clone()),
            mount_points: mount_infos
                .iter()
                .map(|info| info.mount_point.display().to_string())
                .collect(),
            id: part_name,
            size_bytes,
        });
    }
    partitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(partitions)
}

/// Filesystem labels keyed by kernel name, read from udev's by-label links
/// (`USB\x20STICK -> ../../sdb1` gives "sdb1" -> "USB STICK").
fn labels_in(dir: &Path) -> HashMap<String, String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return HashMap::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let target = fs::read_link(entry.path()).ok()?;
            let kernel_name = target.file_name()?.to_str()?.to_string();
            let label = decode_udev_name(&entry.file_name().to_string_lossy());
            Some((kernel_name, label))
        })
        .collect()
}

/// udev writes unsafe bytes in link names as `\xHH`.
fn decode_udev_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escaped = bytes
            .get(idx..idx + 4)
            .filter(|chunk| chunk.starts_with(b"\\x"))
            .and_then(|chunk| std::str::from_utf8(&chunk[2..]).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                decoded.push(byte);
                idx += 4;
            }
            None => {
                decoded.push(bytes[idx]);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn friendly_name(disk_path: &Path) -> Option<String> {
    let vendor = read_string(disk_path.join("device/vendor")).filter(|value| !value.is_empty());
    let model = read_string(disk_path.join("device/model")).filter(|value| !value.is_empty());
    match (vendor, model) {
        (Some(vendor), Some(model)) => Some(format!("{} {}", vendor, model)),
        (vendor, model) => model.or(vendor),
    }
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

/// `sys_entry` is the /sys/block link, which points under
/// /sys/devices/virtual for disks with no backing hardware.
fn is_virtual_disk(sys_entry: &Path, name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        || fs::canonicalize(sys_entry)
            .map(|target| {
                target
                    .components()
                    .any(|component| component.as_os_str() == "virtual")
            })
            .unwrap_or(false)
}
