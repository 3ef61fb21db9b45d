use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Files with this name are never extracted or validated.
// TODO: copy install.wim once FAT32 layouts can put it on a secondary exFAT/NTFS partition.
pub const SKIPPED_FILE_NAME: &str = "install.wim";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub size: u64,
    /// Permission bits only.
    pub mode: u32,
    pub modified: SystemTime,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o755,
            modified: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Readable bytes behind a file node.
pub trait FileContent: fmt::Debug + Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;
}

/// A read-only node of a source image. Directories own their children in
/// name order.
#[derive(Debug)]
pub enum TreeNode {
    Directory {
        info: NodeInfo,
        children: Vec<TreeNode>,
    },
    File {
        info: NodeInfo,
        content: Box<dyn FileContent>,
    },
}

impl TreeNode {
    pub fn directory(name: impl Into<String>, mut children: Vec<TreeNode>) -> Self {
        children.sort_by(|a, b| a.name().cmp(b.name()));
        TreeNode::Directory {
            info: NodeInfo::new(name, 0),
            children,
        }
    }

    pub fn file(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let mut info = NodeInfo::new(name, bytes.len() as u64);
        info.mode = 0o644;
        TreeNode::File {
            info,
            content: Box::new(InMemoryFile(bytes)),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        match self {
            TreeNode::Directory { info, .. } | TreeNode::File { info, .. } => info,
        }
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn size(&self) -> u64 {
        self.info().size
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeNode::Directory { .. })
    }

    pub fn children(&self) -> &[TreeNode] {
        match self {
            TreeNode::Directory { children, .. } => children,
            TreeNode::File { .. } => &[],
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.name() == SKIPPED_FILE_NAME
    }
}

/// Sum of every file size below `node`.
pub fn total_size(node: &TreeNode) -> u64 {
    match node {
        TreeNode::File { info, .. } => info.size,
        TreeNode::Directory { children, .. } => children
            .iter()
            .fold(0u64, |acc, child| acc.saturating_add(total_size(child))),
    }
}

/// Like [`total_size`], minus the nodes the content engine skips.
pub fn copyable_size(node: &TreeNode) -> u64 {
    if node.is_skipped() {
        return 0;
    }
    match node {
        TreeNode::File { info, .. } => info.size,
        TreeNode::Directory { children, .. } => children
            .iter()
            .fold(0u64, |acc, child| acc.saturating_add(copyable_size(child))),
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryFile(pub Vec<u8>);

impl FileContent for InMemoryFile {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.0.as_slice())))
    }
}

#[derive(Debug, Clone)]
pub struct HostFile {
    path: PathBuf,
}

impl HostFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FileContent for HostFile {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }
}

/// Builds a tree from a host directory, such as a mounted image. The root
/// node takes the directory's own name.
pub fn tree_from_directory(root: &Path) -> io::Result<TreeNode> {
    let metadata = fs::metadata(root)?;
    let name = root
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut children = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            children.push(tree_from_directory(&path)?);
        } else if metadata.is_file() {
            children.push(TreeNode::File {
                info: node_info(entry.file_name().to_string_lossy().to_string(), &metadata),
                content: Box::new(HostFile::new(path)),
            });
        }
    }
    children.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(TreeNode::Directory {
        info: node_info(name, &metadata),
        children,
    })
}

fn node_info(name: String, metadata: &fs::Metadata) -> NodeInfo {
    NodeInfo {
        name,
        size: if metadata.is_file() { metadata.len() } else { 0 },
        mode: permission_bits(metadata),
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TreeNode {
        TreeNode::directory(
            "",
            vec![
                TreeNode::file("setup.exe", vec![1u8; 10]),
                TreeNode::directory(
                    "sources",
                    vec![
                        TreeNode::file("boot.wim", vec![2u8; 100]),
                        TreeNode::file("install.wim", vec![3u8; 1000]),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn total_size_counts_every_file() {
        assert_eq!(total_size(&sample()), 1110);
    }

    #[test]
    fn copyable_size_leaves_out_install_wim() {
        assert_eq!(copyable_size(&sample()), 110);
    }

    #[test]
    fn directory_children_are_sorted() {
        let tree = TreeNode::directory(
            "root",
            vec![TreeNode::file("b", "b"), TreeNode::file("a", "a")],
        );
        let names: Vec<_> = tree.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn reads_host_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("efi")).unwrap();
        fs::write(dir.path().join("efi").join("boot.efi"), b"efi").unwrap();
        fs::write(dir.path().join("bootmgr"), b"bootmgr!").unwrap();

        let tree = tree_from_directory(dir.path()).unwrap();
        assert!(tree.is_dir());
        assert_eq!(total_size(&tree), 11);
        let names: Vec<_> = tree.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["bootmgr", "efi"]);

        let TreeNode::File { content, .. } = &tree.children()[0] else {
            panic!("bootmgr should be a file");
        };
        let mut bytes = Vec::new();
        content.open().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"bootmgr!");
    }
}
