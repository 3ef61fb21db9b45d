use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod host;

pub use host::{
    create_mount_point, remove_mount_point, BootSectorWriter, DeviceInspector,
    FilesystemFormatter, HostError, LoopDevices, Mounter, PartitionTableWriter, PayloadWriter,
    ToolLocator,
};

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemChoice {
    Exfat,
    Ntfs,
    Fat32,
}

impl FileSystemChoice {
    /// Default selection order when the user does not pick a filesystem.
    pub const PREFERENCE: [FileSystemChoice; 3] = [
        FileSystemChoice::Exfat,
        FileSystemChoice::Ntfs,
        FileSystemChoice::Fat32,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystemChoice::Exfat => "exfat",
            FileSystemChoice::Ntfs => "ntfs",
            FileSystemChoice::Fat32 => "fat32",
        }
    }

    /// Host tool that creates this filesystem.
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            FileSystemChoice::Exfat => "mkfs.exfat",
            FileSystemChoice::Ntfs => "mkfs.ntfs",
            FileSystemChoice::Fat32 => "mkfs.vfat",
        }
    }

    /// FAT32 firmware boots directly, everything else needs the bootstrap partition.
    pub fn needs_bootstrap(&self) -> bool {
        !matches!(self, FileSystemChoice::Fat32)
    }

    pub fn bootstrap_first(&self) -> bool {
        false
    }
}

impl fmt::Display for FileSystemChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileSystemChoice {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exfat" => Ok(FileSystemChoice::Exfat),
            "ntfs" => Ok(FileSystemChoice::Ntfs),
            "fat32" | "vfat" => Ok(FileSystemChoice::Fat32),
            other => Err(format!("unsupported filesystem: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionScheme {
    #[default]
    Mbr,
    Gpt,
}

impl PartitionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionScheme::Mbr => "mbr",
            PartitionScheme::Gpt => "gpt",
        }
    }

    pub fn is_gpt(&self) -> bool {
        matches!(self, PartitionScheme::Gpt)
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated user input for one flash run. Never mutated once the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub source_image: PathBuf,
    pub destination_device: PathBuf,
    pub filesystem: FileSystemChoice,
    pub scheme: PartitionScheme,
    pub skip_validation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskGeometry {
    pub logical_block_size: u64,
    pub total_blocks: u64,
}

impl DiskGeometry {
    pub fn from_size_bytes(size_bytes: u64, logical_block_size: u64) -> Self {
        let total_blocks = if logical_block_size == 0 {
            0
        } else {
            size_bytes / logical_block_size
        };
        Self {
            logical_block_size,
            total_blocks,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_blocks.saturating_mul(self.logical_block_size)
    }

    /// Number of whole blocks needed to hold `bytes`.
    pub fn blocks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.logical_block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRole {
    EspBootstrap,
    WindowsData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub start_block: u64,
    /// Inclusive.
    pub end_block: u64,
    pub role: PartitionRole,
    pub bootable: bool,
}

impl PartitionSpec {
    pub fn block_count(&self) -> u64 {
        self.end_block - self.start_block + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub scheme: PartitionScheme,
    pub partitions: Vec<PartitionSpec>,
}

impl PartitionPlan {
    /// 1-based index of the partition receiving the image files. A single
    /// partition plan stores files on its only partition.
    pub fn data_index(&self) -> usize {
        if self.partitions.len() == 1 {
            return 1;
        }
        self.index_of(PartitionRole::WindowsData).unwrap_or(1)
    }

    /// 1-based index of the bootstrap partition, if the plan has a separate one.
    pub fn bootstrap_index(&self) -> Option<usize> {
        if self.partitions.len() < 2 {
            return None;
        }
        self.index_of(PartitionRole::EspBootstrap)
    }

    pub fn partition(&self, index: usize) -> Option<&PartitionSpec> {
        index.checked_sub(1).and_then(|idx| self.partitions.get(idx))
    }

    fn index_of(&self, role: PartitionRole) -> Option<usize> {
        self.partitions
            .iter()
            .position(|partition| partition.role == role)
            .map(|idx| idx + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    UnmountDevice,
    PartitionDevice,
    WriteBootstrap,
    CreateFilesystem,
    ExtractImage,
    ValidateImage,
    WriteBootSector,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::UnmountDevice,
        Phase::PartitionDevice,
        Phase::WriteBootstrap,
        Phase::CreateFilesystem,
        Phase::ExtractImage,
        Phase::ValidateImage,
        Phase::WriteBootSector,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Phase::UnmountDevice => "Unmounting destination partitions",
            Phase::PartitionDevice => "Creating partition table",
            Phase::WriteBootstrap => "Writing UEFI:NTFS bootstrap partition",
            Phase::CreateFilesystem => "Creating filesystem",
            Phase::ExtractImage => "Extracting image files",
            Phase::ValidateImage => "Validating extracted files",
            Phase::WriteBootSector => "Writing MBR boot code",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered phases for one request, fixed before execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    phases: Vec<Phase>,
}

impl PhasePlan {
    pub fn for_request(request: &FlashRequest) -> Self {
        Self::new(request.filesystem, request.scheme, request.skip_validation)
    }

    pub fn new(filesystem: FileSystemChoice, scheme: PartitionScheme, skip_validation: bool) -> Self {
        let phases = Phase::ALL
            .into_iter()
            .filter(|phase| match phase {
                Phase::WriteBootstrap => filesystem.needs_bootstrap(),
                Phase::ValidateImage => !skip_validation,
                Phase::WriteBootSector => !scheme.is_gpt(),
                _ => true,
            })
            .collect();
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// "Phase i/N: label" for the phase at zero-based `idx`.
    pub fn header(&self, idx: usize) -> String {
        match self.phases.get(idx) {
            Some(phase) => format!("Phase {}/{}: {}", idx + 1, self.phases.len(), phase),
            None => format!("Phase {}/{}", idx + 1, self.phases.len()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Disk {
    pub id: String,
    pub path: PathBuf,
    pub friendly_name: String,
    pub size_bytes: u64,
    pub is_system_disk: bool,
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Partition {
    pub id: String,
    pub label: Option<String>,
    pub fs: Option<String>,
    pub size_bytes: u64,
    pub mount_points: Vec<String>,
}

/// Kernel name of partition `number` on `device` ("/dev/sdb" -> "/dev/sdb2",
/// "/dev/loop0" -> "/dev/loop0p2").
pub fn partition_path(device: &Path, number: usize) -> PathBuf {
    let mut value = device.as_os_str().to_string_lossy().to_string();
    if value.chars().last().is_some_and(|ch| ch.is_ascii_digit()) {
        value.push('p');
    }
    value.push_str(&number.to_string());
    PathBuf::from(value)
}
