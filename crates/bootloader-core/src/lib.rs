use anyhow::{anyhow, Context, Result};
use log::debug;
use std::path::{Path, PathBuf};

pub const PAYLOAD_ENV: &str = "WINSTICK_UEFI_NTFS_IMAGE";
pub const DEFAULT_PAYLOAD_PATH: &str = "/usr/share/winstick/uefi-ntfs.img";
/// The bootstrap partition is 1 MiB; the payload must fit inside it.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
const SECTOR: usize = 512;

/// The UEFI:NTFS image written raw into the bootstrap partition. It is a
/// small FAT volume whose EFI loader chains into the NTFS/exFAT data
/// partition.
#[derive(Debug, Clone)]
pub struct BootstrapPayload {
    pub source: PathBuf,
    pub bytes: Vec<u8>,
}

impl BootstrapPayload {
    pub fn from_bytes(source: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<Self> {
        validate_payload(&bytes)?;
        Ok(Self {
            source: source.into(),
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Explicit path, then `WINSTICK_UEFI_NTFS_IMAGE`, then the packaged default.
pub fn resolve_payload_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(PAYLOAD_ENV) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_PAYLOAD_PATH),
    }
}

pub fn load_bootstrap_payload(path: impl AsRef<Path>) -> Result<BootstrapPayload> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read UEFI:NTFS image {}", path.display()))?;
    debug!("loaded {} byte bootstrap payload from {}", bytes.len(), path.display());
    BootstrapPayload::from_bytes(path, bytes)
        .with_context(|| format!("invalid UEFI:NTFS image {}", path.display()))
}

pub fn validate_payload(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(anyhow!("payload is empty"));
    }
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(anyhow!(
            "payload is {} bytes, larger than the {} byte bootstrap partition",
            bytes.len(),
            MAX_PAYLOAD_BYTES
        ));
    }
    if bytes.len() % SECTOR != 0 {
        return Err(anyhow!(
            "payload length {} is not a multiple of {} bytes",
            bytes.len(),
            SECTOR
        ));
    }
    if bytes[510] != 0x55 || bytes[511] != 0xAA {
        return Err(anyhow!("payload is missing the 0x55AA boot signature"));
    }
    Ok(())
}
