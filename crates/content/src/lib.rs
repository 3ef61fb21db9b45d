//! Read-only views of Windows installation media and the engine that copies
//! them onto a mounted filesystem.

pub mod engine;
pub mod image;
pub mod progress;
pub mod tree;

use std::path::Path;
use winstick_core::HostError;

pub use engine::{
    extract_image, extract_tree, validate_image, validate_tree, ContentError, Side,
    COPY_BUFFER_SIZE,
};
pub use image::{ensure_windows_image, probe_image, ImageKind, ImageReader, SourceImage};
pub use progress::{
    format_bytes, format_progress, CopyProgress, LogSink, ProgressAction, ProgressReporter,
    ProgressSink, ProgressSnapshot,
};
pub use tree::{
    copyable_size, total_size, tree_from_directory, FileContent, HostFile, InMemoryFile,
    NodeInfo, TreeNode, SKIPPED_FILE_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    Image,
}

/// Opens `path` as a source tree. Directories (an already extracted or
/// mounted image) are read in place, anything else goes through `reader`.
pub fn open_source(
    path: &Path,
    reader: &dyn ImageReader,
) -> Result<(SourceImage, SourceKind), HostError> {
    if path.is_dir() {
        let root = tree_from_directory(path)
            .map_err(|err| HostError::io(format!("read {}", path.display()), err))?;
        return Ok((SourceImage::new(root), SourceKind::Directory));
    }
    Ok((reader.open_image(path)?, SourceKind::Image))
}
