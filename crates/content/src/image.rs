use crate::tree::TreeNode;
use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use winstick_core::HostError;

const ISO_SECTOR: u64 = 2048;
const VRS_FIRST_SECTOR: u64 = 16;
/// Descriptors inspected before giving up on finding an NSR descriptor.
const VRS_MAX_DESCRIPTORS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// UDF volume (NSR02/NSR03 descriptor present), what Windows ISOs use.
    Udf,
    /// A disk image carrying its own partition table.
    PartitionedDisk,
    /// ISO 9660 without UDF.
    PlainIso9660,
    Unknown,
}

/// Classifies an image from its first sectors.
pub fn probe_image(reader: &mut (impl Read + Seek)) -> io::Result<ImageKind> {
    if has_partition_table(reader)? {
        return Ok(ImageKind::PartitionedDisk);
    }
    let mut saw_iso = false;
    let mut descriptor = [0u8; 7];
    for idx in 0..VRS_MAX_DESCRIPTORS {
        reader.seek(SeekFrom::Start((VRS_FIRST_SECTOR + idx) * ISO_SECTOR))?;
        if !read_full(reader, &mut descriptor)? {
            break;
        }
        match &descriptor[1..6] {
            b"NSR02" | b"NSR03" => return Ok(ImageKind::Udf),
            b"CD001" => saw_iso = true,
            b"BEA01" | b"BOOT2" | b"CDW02" => {}
            // TEA01 or anything unexpected ends the sequence.
            _ => break,
        }
    }
    Ok(if saw_iso {
        ImageKind::PlainIso9660
    } else {
        ImageKind::Unknown
    })
}

/// Opens `path` and fails with `NotARecognizedImage` unless it holds a UDF volume.
pub fn ensure_windows_image(path: &Path) -> Result<(), HostError> {
    let mut file =
        File::open(path).map_err(|err| HostError::io(format!("open {}", path.display()), err))?;
    let kind = probe_image(&mut file)
        .map_err(|err| HostError::io(format!("read {}", path.display()), err))?;
    if kind == ImageKind::Udf {
        Ok(())
    } else {
        Err(HostError::NotARecognizedImage {
            path: path.to_path_buf(),
        })
    }
}

fn has_partition_table(reader: &mut (impl Read + Seek)) -> io::Result<bool> {
    let mut head = [0u8; 1024];
    reader.seek(SeekFrom::Start(0))?;
    let mut filled = 0;
    while filled < head.len() {
        let read = reader.read(&mut head[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    if filled >= 520 && &head[512..520] == b"EFI PART" {
        return Ok(true);
    }
    if filled >= 512 && head[510] == 0x55 && head[511] == 0xAA {
        // Any non-empty primary entry (type byte at +4) means an MBR disk image.
        return Ok((0..4).any(|slot| head[446 + slot * 16 + 4] != 0));
    }
    Ok(false)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            return Ok(false);
        }
        filled += read;
    }
    Ok(true)
}

/// The opened source: its root node plus whatever keeps the backing storage
/// alive (a loop mount, for instance) until dropped.
pub struct SourceImage {
    pub root: TreeNode,
    _mount: Option<Box<dyn Any + Send>>,
}

impl SourceImage {
    pub fn new(root: TreeNode) -> Self {
        Self { root, _mount: None }
    }

    pub fn with_mount(root: TreeNode, mount: Box<dyn Any + Send>) -> Self {
        Self {
            root,
            _mount: Some(mount),
        }
    }
}

impl std::fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceImage")
            .field("root", &self.root.name())
            .field("mounted", &self._mount.is_some())
            .finish()
    }
}

/// Turns an image file into a tree. Fails with `NotARecognizedImage` when
/// the file is not a Windows installation image.
pub trait ImageReader {
    fn open_image(&self, path: &Path) -> Result<SourceImage, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn descriptor(id: &[u8; 5]) -> Vec<u8> {
        let mut sector = vec![0u8; ISO_SECTOR as usize];
        sector[1..6].copy_from_slice(id);
        sector[6] = 1;
        sector
    }

    fn image_with(descriptors: &[&[u8; 5]]) -> Vec<u8> {
        let mut bytes = vec![0u8; (VRS_FIRST_SECTOR * ISO_SECTOR) as usize];
        for id in descriptors {
            bytes.extend(descriptor(id));
        }
        bytes
    }

    #[test]
    fn recognises_udf_volume() {
        let image = image_with(&[b"CD001", b"BEA01", b"NSR02", b"TEA01"]);
        assert_eq!(probe_image(&mut Cursor::new(image)).unwrap(), ImageKind::Udf);
    }

    #[test]
    fn plain_iso_is_not_udf() {
        let image = image_with(&[b"CD001", b"CD001"]);
        assert_eq!(
            probe_image(&mut Cursor::new(image)).unwrap(),
            ImageKind::PlainIso9660
        );
    }

    #[test]
    fn gpt_disk_image_is_rejected() {
        let mut image = image_with(&[b"BEA01", b"NSR03"]);
        image[512..520].copy_from_slice(b"EFI PART");
        assert_eq!(
            probe_image(&mut Cursor::new(image)).unwrap(),
            ImageKind::PartitionedDisk
        );
    }

    #[test]
    fn mbr_with_entries_is_rejected() {
        let mut image = image_with(&[b"BEA01", b"NSR03"]);
        image[510] = 0x55;
        image[511] = 0xAA;
        image[446 + 4] = 0x07;
        assert_eq!(
            probe_image(&mut Cursor::new(image)).unwrap(),
            ImageKind::PartitionedDisk
        );
    }

    #[test]
    fn short_file_is_unknown() {
        assert_eq!(
            probe_image(&mut Cursor::new(vec![0u8; 100])).unwrap(),
            ImageKind::Unknown
        );
    }

    #[test]
    fn ensure_windows_image_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.iso");
        std::fs::write(&path, b"definitely not an image").unwrap();
        match ensure_windows_image(&path) {
            Err(HostError::NotARecognizedImage { path: reported }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }

        let good = dir.path().join("win.iso");
        std::fs::write(&good, image_with(&[b"BEA01", b"NSR02"])).unwrap();
        assert!(ensure_windows_image(&good).is_ok());
    }
}
