use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use winstick_core::host::HostResult;
use winstick_core::{DiskGeometry, HostError, PartitionSpec, PayloadWriter};

/// Bytes written per `write_all` call.
pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Writes raw partition payloads straight into the destination's block range.
/// Works on block devices and on regular image files alike.
#[derive(Debug, Clone, Copy)]
pub struct RawPayloadWriter {
    /// Read the payload back after writing and compare.
    pub verify: bool,
}

impl RawPayloadWriter {
    pub fn new() -> Self {
        Self { verify: true }
    }
}

impl Default for RawPayloadWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadWriter for RawPayloadWriter {
    fn write_partition_payload(
        &self,
        device: &Path,
        geometry: &DiskGeometry,
        index: usize,
        partition: &PartitionSpec,
        payload: &[u8],
    ) -> HostResult<()> {
        let failed = |reason: String| HostError::PayloadWriteFailed {
            device: device.to_path_buf(),
            index,
            reason,
        };

        let (offset, capacity) = partition_extent(geometry, partition)
            .ok_or_else(|| failed("partition extent overflows".to_string()))?;
        if payload.len() as u64 > capacity {
            return Err(failed(format!(
                "payload of {} bytes exceeds partition size of {} bytes",
                payload.len(),
                capacity
            )));
        }

        debug!(
            "writing {} byte payload to {} at offset {}",
            payload.len(),
            device.display(),
            offset
        );
        let mut file = OpenOptions::new()
            .write(true)
            .read(self.verify)
            .open(device)
            .map_err(|err| failed(err.to_string()))?;
        write_at(&mut file, offset, payload).map_err(|err| failed(err.to_string()))?;
        file.sync_all().map_err(|err| failed(err.to_string()))?;

        if self.verify {
            let same = matches_at(&mut file, offset, payload).map_err(|err| failed(err.to_string()))?;
            if !same {
                return Err(failed("read back differs from payload".to_string()));
            }
        }
        Ok(())
    }
}

/// Byte offset and length of a partition, `None` on overflow.
pub fn partition_extent(geometry: &DiskGeometry, partition: &PartitionSpec) -> Option<(u64, u64)> {
    let offset = partition.start_block.checked_mul(geometry.logical_block_size)?;
    let length = partition
        .end_block
        .checked_sub(partition.start_block)?
        .checked_add(1)?
        .checked_mul(geometry.logical_block_size)?;
    Some((offset, length))
}

fn write_at(file: &mut File, offset: u64, payload: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
        file.write_all(chunk)?;
    }
    file.flush()
}

fn matches_at(file: &mut File, offset: u64, payload: &[u8]) -> io::Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0u8; WRITE_CHUNK_SIZE];
    for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
        let read_back = &mut buffer[..chunk.len()];
        file.read_exact(read_back)?;
        if read_back != chunk {
            return Ok(false);
        }
    }
    Ok(true)
}
