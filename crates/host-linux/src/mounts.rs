use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

pub fn read_mounts() -> Vec<MountEntry> {
    parse_mounts(&fs::read_to_string(PROC_MOUNTS).unwrap_or_default())
}

pub fn parse_mounts(data: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        entries.push(MountEntry {
            device: unescape_mount(device),
            mount_point: PathBuf::from(unescape_mount(mount_point)),
            fs_type: fs_type.to_string(),
        });
    }
    entries
}

/// Mounts of `/dev/*` nodes keyed by kernel name ("sdb1").
pub fn mounts_by_device_name(entries: &[MountEntry]) -> HashMap<String, Vec<MountEntry>> {
    let mut mounts: HashMap<String, Vec<MountEntry>> = HashMap::new();
    for entry in entries {
        if !entry.device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(&entry.device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(entry.clone());
    }
    mounts
}

/// True when `node` is `device` itself or one of its partitions
/// ("/dev/sdb2" or "/dev/loop0p1"), but not a sibling such as "/dev/sdbb".
pub fn belongs_to_device(node: &str, device: &str) -> bool {
    let Some(rest) = node.strip_prefix(device) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if device.chars().last().is_some_and(|ch| ch.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
}

/// Undoes the `\ooo` escapes the kernel writes for space, tab, newline and
/// backslash in /proc mount fields.
pub fn unescape_mount(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escaped = match bytes[idx] {
            b'\\' => bytes.get(idx + 1..idx + 4).and_then(octal_byte),
            _ => None,
        };
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

fn octal_byte(digits: &[u8]) -> Option<u8> {
    let value = digits.iter().try_fold(0u32, |acc, digit| match digit {
        b'0'..=b'7' => Some(acc * 8 + u32::from(digit - b'0')),
        _ => None,
    })?;
    u8::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /run/media/user/My\\040Stick exfat rw 0 0
/dev/sdb2 /run/media/user/ESP vfat rw 0 0
broken-line
";

    #[test]
    fn parses_proc_mounts() {
        let entries = parse_mounts(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[2].mount_point,
            PathBuf::from("/run/media/user/My Stick")
        );
        assert_eq!(entries[2].fs_type, "exfat");
    }

    #[test]
    fn groups_device_mounts_by_name() {
        let grouped = mounts_by_device_name(&parse_mounts(SAMPLE));
        assert!(!grouped.contains_key("sysfs"));
        assert_eq!(grouped["sdb2"][0].mount_point, PathBuf::from("/run/media/user/ESP"));
        assert_eq!(grouped["nvme0n1p2"][0].mount_point, PathBuf::from("/"));
    }

    #[test]
    fn matches_partitions_of_a_device() {
        assert!(belongs_to_device("/dev/sdb", "/dev/sdb"));
        assert!(belongs_to_device("/dev/sdb12", "/dev/sdb"));
        assert!(!belongs_to_device("/dev/sdbb1", "/dev/sdb"));
        assert!(belongs_to_device("/dev/loop0p2", "/dev/loop0"));
        assert!(!belongs_to_device("/dev/loop01", "/dev/loop0"));
        assert!(belongs_to_device("/dev/nvme0n1p2", "/dev/nvme0n1"));
        assert!(!belongs_to_device("/dev/nvme0n12", "/dev/nvme0n1"));
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_mount("a\\040b\\011c"), "a b\tc");
        assert_eq!(unescape_mount("trailing\\"), "trailing\\");
        assert_eq!(unescape_mount("bad\\09x"), "bad\\09x");
        assert_eq!(unescape_mount("back\\134slash"), "back\\slash");
        assert_eq!(unescape_mount("/media/caf\\303\\251"), "/media/caf\u{e9}");
    }
}
