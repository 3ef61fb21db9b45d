use crate::progress::{CopyProgress, ProgressAction, ProgressReporter, ProgressSink};
use crate::tree::{copyable_size, FileContent, NodeInfo, TreeNode};
use log::{debug, info};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Image,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Image => f.write_str("image"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Failures of an extract or validate walk. Paths are relative to the image root.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("failed to create directory {}: {source}", path.display())]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create file {}: {source}", path.display())]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open file {} on {side}: {source}", path.display())]
    FileOpenFailed {
        path: PathBuf,
        side: Side,
        #[source]
        source: io::Error,
    },
    #[error("failed to read file {} from {side}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        side: Side,
        #[source]
        source: io::Error,
    },
    #[error("failed to write file {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to sync file {}: {source}", path.display())]
    SyncFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("contents of file {} do not match the image", path.display())]
    ContentMismatch { path: PathBuf },
    #[error("file {} on disk is larger than expected", path.display())]
    UnexpectedExtraData { path: PathBuf },
    #[error("file {} copied {actual} bytes, image lists {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl ContentError {
    pub fn path(&self) -> &Path {
        match self {
            ContentError::DirectoryCreateFailed { path, .. }
            | ContentError::FileCreateFailed { path, .. }
            | ContentError::FileOpenFailed { path, .. }
            | ContentError::ReadFailed { path, .. }
            | ContentError::WriteFailed { path, .. }
            | ContentError::SyncFailed { path, .. }
            | ContentError::ContentMismatch { path }
            | ContentError::UnexpectedExtraData { path }
            | ContentError::SizeMismatch { path, .. } => path,
        }
    }
}

/// Copies the children of `root` into `destination`, syncing every file.
pub fn extract_tree(
    root: &TreeNode,
    destination: &Path,
    progress: &CopyProgress,
) -> Result<(), ContentError> {
    let mut walker = Walker::new(destination, progress);
    walker.walk_root(root, |walker, node, rel| walker.extract_node(node, rel))
}

/// Compares the children of `root` byte for byte against `destination`.
/// Extra entries that only exist on the destination are not reported.
pub fn validate_tree(
    root: &TreeNode,
    destination: &Path,
    progress: &CopyProgress,
) -> Result<(), ContentError> {
    let mut walker = Walker::new(destination, progress);
    walker.walk_root(root, |walker, node, rel| walker.validate_node(node, rel))
}

/// [`extract_tree`] with a reporter thread feeding `sink`. Returns bytes written.
pub fn extract_image(
    root: &TreeNode,
    destination: &Path,
    sink: Box<dyn ProgressSink>,
) -> Result<u64, ContentError> {
    run_reported(ProgressAction::Extracted, root, sink, |progress| {
        extract_tree(root, destination, progress)
    })
}

/// [`validate_tree`] with a reporter thread feeding `sink`. Returns bytes compared.
pub fn validate_image(
    root: &TreeNode,
    destination: &Path,
    sink: Box<dyn ProgressSink>,
) -> Result<u64, ContentError> {
    run_reported(ProgressAction::Validated, root, sink, |progress| {
        validate_tree(root, destination, progress)
    })
}

fn run_reported(
    action: ProgressAction,
    root: &TreeNode,
    sink: Box<dyn ProgressSink>,
    walk: impl FnOnce(&CopyProgress) -> Result<(), ContentError>,
) -> Result<u64, ContentError> {
    let progress = Arc::new(CopyProgress::new());
    let reporter = ProgressReporter::spawn(action, copyable_size(root), progress.clone(), sink);
    let result = walk(&progress);
    reporter.finish();
    result.map(|_| progress.bytes_processed())
}

struct Walker<'a> {
    destination: &'a Path,
    progress: &'a CopyProgress,
    buf: Vec<u8>,
    check: Vec<u8>,
}

impl<'a> Walker<'a> {
    fn new(destination: &'a Path, progress: &'a CopyProgress) -> Self {
        Self {
            destination,
            progress,
            buf: vec![0u8; COPY_BUFFER_SIZE],
            check: Vec::new(),
        }
    }

    fn walk_root(
        &mut self,
        root: &TreeNode,
        mut visit: impl FnMut(&mut Self, &TreeNode, &Path) -> Result<(), ContentError>,
    ) -> Result<(), ContentError> {
        match root {
            TreeNode::Directory { children, .. } => {
                for child in children {
                    visit(self, child, Path::new(child.name()))?;
                }
                Ok(())
            }
            TreeNode::File { .. } => visit(self, root, Path::new(root.name())),
        }
    }

    fn extract_node(&mut self, node: &TreeNode, rel: &Path) -> Result<(), ContentError> {
        if node.is_skipped() {
            info!("skipping {}", rel.display());
            return Ok(());
        }
        match node {
            TreeNode::Directory { info, children } => {
                let path = self.destination.join(rel);
                create_dir(&path, info).map_err(|source| ContentError::DirectoryCreateFailed {
                    path: rel.to_path_buf(),
                    source,
                })?;
                for child in children {
                    self.extract_node(child, &rel.join(child.name()))?;
                }
                Ok(())
            }
            TreeNode::File { info, content } => self.extract_file(info, content.as_ref(), rel),
        }
    }

    fn extract_file(
        &mut self,
        info: &NodeInfo,
        content: &dyn FileContent,
        rel: &Path,
    ) -> Result<(), ContentError> {
        debug!("extract {} ({} bytes)", rel.display(), info.size);
        let mut reader = content.open().map_err(|source| ContentError::FileOpenFailed {
            path: rel.to_path_buf(),
            side: Side::Image,
            source,
        })?;
        let mut out =
            File::create(self.destination.join(rel)).map_err(|source| {
                ContentError::FileCreateFailed {
                    path: rel.to_path_buf(),
                    source,
                }
            })?;

        let mut copied = 0u64;
        loop {
            let read = read_some(&mut reader, &mut self.buf).map_err(|source| {
                ContentError::ReadFailed {
                    path: rel.to_path_buf(),
                    side: Side::Image,
                    source,
                }
            })?;
            if read == 0 {
                break;
            }
            out.write_all(&self.buf[..read])
                .map_err(|source| ContentError::WriteFailed {
                    path: rel.to_path_buf(),
                    source,
                })?;
            copied += read as u64;
            self.progress.add(read as u64);
        }
        out.sync_all().map_err(|source| ContentError::SyncFailed {
            path: rel.to_path_buf(),
            source,
        })?;

        if copied != info.size {
            return Err(ContentError::SizeMismatch {
                path: rel.to_path_buf(),
                expected: info.size,
                actual: copied,
            });
        }
        Ok(())
    }

    fn validate_node(&mut self, node: &TreeNode, rel: &Path) -> Result<(), ContentError> {
        if node.is_skipped() {
            return Ok(());
        }
        match node {
            TreeNode::Directory { children, .. } => {
                for child in children {
                    self.validate_node(child, &rel.join(child.name()))?;
                }
                Ok(())
            }
            TreeNode::File { content, .. } => self.validate_file(content.as_ref(), rel),
        }
    }

    fn validate_file(&mut self, content: &dyn FileContent, rel: &Path) -> Result<(), ContentError> {
        debug!("validate {}", rel.display());
        if self.check.len() != COPY_BUFFER_SIZE {
            self.check = vec![0u8; COPY_BUFFER_SIZE];
        }
        let read_failed = |side: Side| {
            let path = rel.to_path_buf();
            move |source: io::Error| ContentError::ReadFailed { path, side, source }
        };

        let mut source = content.open().map_err(|source| ContentError::FileOpenFailed {
            path: rel.to_path_buf(),
            side: Side::Image,
            source,
        })?;
        let mut on_disk =
            File::open(self.destination.join(rel)).map_err(|source| {
                ContentError::FileOpenFailed {
                    path: rel.to_path_buf(),
                    side: Side::Destination,
                    source,
                }
            })?;

        loop {
            let read = fill(&mut source, &mut self.buf).map_err(read_failed(Side::Image))?;
            if read == 0 {
                break;
            }
            // The destination must not run out before the image does.
            on_disk
                .read_exact(&mut self.check[..read])
                .map_err(read_failed(Side::Destination))?;
            if self.buf[..read] != self.check[..read] {
                return Err(ContentError::ContentMismatch {
                    path: rel.to_path_buf(),
                });
            }
            self.progress.add(read as u64);
        }

        let trailing = read_some(&mut on_disk, &mut self.check[..1])
            .map_err(read_failed(Side::Destination))?;
        if trailing > 0 {
            return Err(ContentError::UnexpectedExtraData {
                path: rel.to_path_buf(),
            });
        }
        Ok(())
    }
}

fn create_dir(path: &Path, info: &NodeInfo) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        // Owner keeps write access so children can be created.
        builder.mode(info.mode | 0o700);
    }
    #[cfg(not(unix))]
    let _ = info;
    builder.create(path)
}

fn read_some(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = read_some(reader, &mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
