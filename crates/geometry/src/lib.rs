use thiserror::Error;
use winstick_core::{
    DiskGeometry, FileSystemChoice, PartitionPlan, PartitionRole, PartitionScheme, PartitionSpec,
    MIB,
};

/// Leading gap before the first partition.
pub const ALIGNMENT_BYTES: u64 = MIB;
/// Size of the UEFI:NTFS bootstrap partition.
pub const BOOTSTRAP_BYTES: u64 = MIB;
/// Blocks left free at the end of GPT disks for the backup header and table,
/// the same reservation fdisk makes.
pub const GPT_TRAILER_BLOCKS: u64 = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("logical block size must be non-zero")]
    InvalidBlockSize,
    #[error("disk of {total_blocks} blocks is too small for the requested layout")]
    DiskTooSmall { total_blocks: u64 },
}

/// Picks the layout the filesystem needs: FAT32 boots straight from a single
/// partition, exFAT and NTFS need the bootstrap partition alongside the data.
pub fn plan_for_filesystem(
    geometry: &DiskGeometry,
    scheme: PartitionScheme,
    filesystem: FileSystemChoice,
) -> Result<PartitionPlan, GeometryError> {
    if filesystem.needs_bootstrap() {
        plan_two_partition_layout(geometry, scheme, filesystem.bootstrap_first())
    } else {
        plan_single_partition(geometry, scheme)
    }
}

pub fn plan_single_partition(
    geometry: &DiskGeometry,
    scheme: PartitionScheme,
) -> Result<PartitionPlan, GeometryError> {
    let bounds = Bounds::new(geometry, scheme)?;
    let size = bounds
        .last_usable
        .checked_sub(bounds.first_usable)
        .map(|span| span + 1)
        .filter(|size| *size > 0)
        .ok_or(GeometryError::DiskTooSmall {
            total_blocks: geometry.total_blocks,
        })?;

    Ok(PartitionPlan {
        scheme,
        partitions: vec![PartitionSpec {
            start_block: bounds.first_usable,
            end_block: bounds.first_usable + size - 1,
            role: PartitionRole::EspBootstrap,
            bootable: true,
        }],
    })
}

pub fn plan_two_partition_layout(
    geometry: &DiskGeometry,
    scheme: PartitionScheme,
    bootstrap_first: bool,
) -> Result<PartitionPlan, GeometryError> {
    let bounds = Bounds::new(geometry, scheme)?;
    let too_small = GeometryError::DiskTooSmall {
        total_blocks: geometry.total_blocks,
    };
    let bootstrap_blocks = geometry.blocks_for(BOOTSTRAP_BYTES);
    let usable = bounds.last_usable + 1;
    let data_blocks = usable
        .checked_sub(bounds.first_usable)
        .and_then(|span| span.checked_sub(bootstrap_blocks))
        .filter(|blocks| *blocks > 0)
        .ok_or(too_small)?;

    let (first_role, first_blocks, second_role) = if bootstrap_first {
        (PartitionRole::EspBootstrap, bootstrap_blocks, PartitionRole::WindowsData)
    } else {
        (PartitionRole::WindowsData, data_blocks, PartitionRole::EspBootstrap)
    };

    let first = PartitionSpec {
        start_block: bounds.first_usable,
        end_block: bounds.first_usable + first_blocks - 1,
        role: first_role,
        bootable: true,
    };
    let second = PartitionSpec {
        start_block: first.end_block + 1,
        end_block: bounds.last_usable,
        role: second_role,
        bootable: false,
    };

    Ok(PartitionPlan {
        scheme,
        partitions: vec![first, second],
    })
}

/// First and last (inclusive) block a plan may use.
struct Bounds {
    first_usable: u64,
    last_usable: u64,
}

impl Bounds {
    fn new(geometry: &DiskGeometry, scheme: PartitionScheme) -> Result<Self, GeometryError> {
        if geometry.logical_block_size == 0 {
            return Err(GeometryError::InvalidBlockSize);
        }
        let trailer = if scheme.is_gpt() { GPT_TRAILER_BLOCKS } else { 0 };
        let first_usable = geometry.blocks_for(ALIGNMENT_BYTES);
        let last_usable = geometry
            .total_blocks
            .checked_sub(trailer + 1)
            .filter(|last| *last >= first_usable)
            .ok_or(GeometryError::DiskTooSmall {
                total_blocks: geometry.total_blocks,
            })?;
        Ok(Self {
            first_usable,
            last_usable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZES: [u64; 3] = [512, 2048, 4096];
    const DISK_SIZES: [u64; 4] = [16 * MIB, 64 * MIB, 7_800 * MIB, 32_000 * MIB + 512 * 3];

    fn geometries() -> Vec<DiskGeometry> {
        let mut out = Vec::new();
        for block in BLOCK_SIZES {
            for size in DISK_SIZES {
                out.push(DiskGeometry::from_size_bytes(size, block));
            }
        }
        out
    }

    fn trailer(scheme: PartitionScheme) -> u64 {
        if scheme.is_gpt() {
            GPT_TRAILER_BLOCKS
        } else {
            0
        }
    }

    #[test]
    fn single_partition_on_512_byte_mbr_disk() {
        let geometry = DiskGeometry {
            logical_block_size: 512,
            total_blocks: 1_048_576,
        };
        let plan = plan_single_partition(&geometry, PartitionScheme::Mbr).unwrap();
        assert_eq!(plan.partitions.len(), 1);
        let only = plan.partitions[0];
        assert_eq!(only.start_block, 2048);
        assert_eq!(only.end_block, 1_048_575);
        assert!(only.bootable);
        assert_eq!(plan.data_index(), 1);
        assert_eq!(plan.bootstrap_index(), None);
    }

    #[test]
    fn single_partition_gpt_leaves_trailer() {
        let geometry = DiskGeometry {
            logical_block_size: 512,
            total_blocks: 1_048_576,
        };
        let plan = plan_single_partition(&geometry, PartitionScheme::Gpt).unwrap();
        assert_eq!(plan.partitions[0].end_block, 1_048_575 - 2048);
    }

    #[test]
    fn two_partition_layouts_are_contiguous_and_span_disk() {
        for geometry in geometries() {
            for scheme in [PartitionScheme::Mbr, PartitionScheme::Gpt] {
                for bootstrap_first in [true, false] {
                    let plan =
                        plan_two_partition_layout(&geometry, scheme, bootstrap_first).unwrap();
                    let parts = &plan.partitions;
                    assert_eq!(parts.len(), 2);
                    assert_eq!(parts[0].start_block, geometry.blocks_for(ALIGNMENT_BYTES));
                    assert!(parts[0].start_block <= parts[0].end_block);
                    assert_eq!(parts[1].start_block, parts[0].end_block + 1);
                    assert!(parts[1].start_block <= parts[1].end_block);
                    assert_eq!(
                        parts[1].end_block + 1,
                        geometry.total_blocks - trailer(scheme),
                        "{:?} {:?}",
                        geometry,
                        scheme
                    );
                }
            }
        }
    }

    #[test]
    fn bootstrap_partition_is_one_mebibyte() {
        for geometry in geometries() {
            for scheme in [PartitionScheme::Mbr, PartitionScheme::Gpt] {
                for bootstrap_first in [true, false] {
                    let plan =
                        plan_two_partition_layout(&geometry, scheme, bootstrap_first).unwrap();
                    let index = plan.bootstrap_index().unwrap();
                    let bootstrap = plan.partition(index).unwrap();
                    assert_eq!(
                        bootstrap.block_count(),
                        MIB.div_ceil(geometry.logical_block_size)
                    );
                    assert_eq!(bootstrap.role, PartitionRole::EspBootstrap);
                }
            }
        }
    }

    #[test]
    fn bootstrap_order_is_a_parameter() {
        let geometry = DiskGeometry::from_size_bytes(64 * MIB, 512);
        let first = plan_two_partition_layout(&geometry, PartitionScheme::Mbr, true).unwrap();
        assert_eq!(first.bootstrap_index(), Some(1));
        assert_eq!(first.data_index(), 2);
        let second = plan_two_partition_layout(&geometry, PartitionScheme::Mbr, false).unwrap();
        assert_eq!(second.bootstrap_index(), Some(2));
        assert_eq!(second.data_index(), 1);
        assert!(second.partitions[0].bootable);
        assert!(!second.partitions[1].bootable);
    }

    #[test]
    fn gpt_shifts_bootstrap_before_trailer() {
        let geometry = DiskGeometry::from_size_bytes(64 * MIB, 512);
        let plan = plan_two_partition_layout(&geometry, PartitionScheme::Gpt, false).unwrap();
        let bootstrap = plan.partitions[1];
        assert_eq!(bootstrap.end_block, geometry.total_blocks - 2048 - 1);
        assert_eq!(bootstrap.start_block, geometry.total_blocks - 2048 - 2048);
    }

    #[test]
    fn rejects_disks_without_room_for_data() {
        // Exactly alignment + bootstrap: the data partition would be empty.
        let geometry = DiskGeometry::from_size_bytes(2 * MIB, 512);
        assert_eq!(
            plan_two_partition_layout(&geometry, PartitionScheme::Mbr, false),
            Err(GeometryError::DiskTooSmall { total_blocks: 4096 })
        );
        let tiny = DiskGeometry::from_size_bytes(MIB, 512);
        assert!(plan_single_partition(&tiny, PartitionScheme::Mbr).is_err());
        let gpt = DiskGeometry::from_size_bytes(2 * MIB, 512);
        assert!(plan_single_partition(&gpt, PartitionScheme::Gpt).is_err());
    }

    #[test]
    fn rejects_zero_block_size() {
        let geometry = DiskGeometry {
            logical_block_size: 0,
            total_blocks: 10,
        };
        assert_eq!(
            plan_single_partition(&geometry, PartitionScheme::Mbr),
            Err(GeometryError::InvalidBlockSize)
        );
    }

    #[test]
    fn filesystem_selects_layout() {
        let geometry = DiskGeometry::from_size_bytes(64 * MIB, 512);
        let fat = plan_for_filesystem(&geometry, PartitionScheme::Mbr, FileSystemChoice::Fat32)
            .unwrap();
        assert_eq!(fat.partitions.len(), 1);
        let ntfs = plan_for_filesystem(&geometry, PartitionScheme::Gpt, FileSystemChoice::Ntfs)
            .unwrap();
        assert_eq!(ntfs.partitions.len(), 2);
        assert_eq!(ntfs.scheme, PartitionScheme::Gpt);
    }
}
