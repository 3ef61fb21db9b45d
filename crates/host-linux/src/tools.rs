use std::ffi::OsString;
use std::path::{Path, PathBuf};
use winstick_core::ToolLocator;

/// Admin tools often live outside an unprivileged user's PATH.
pub const SYSTEM_TOOL_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Finds executables the way a shell would, plus the sbin directories.
#[derive(Debug, Clone, Default)]
pub struct PathToolLocator {
    search_path: Option<OsString>,
    extra_dirs: Vec<PathBuf>,
}

impl PathToolLocator {
    pub fn from_env() -> Self {
        Self {
            search_path: std::env::var_os("PATH"),
            extra_dirs: SYSTEM_TOOL_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            search_path: None,
            extra_dirs: dirs,
        }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .search_path
            .as_ref()
            .map(|value| std::env::split_paths(value).collect())
            .unwrap_or_default();
        for dir in &self.extra_dirs {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        dirs
    }
}

impl ToolLocator for PathToolLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        if tool.contains('/') {
            let path = PathBuf::from(tool);
            return is_executable(&path).then_some(path);
        }
        self.search_dirs()
            .into_iter()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(tool))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_tool(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn finds_executables_in_search_dirs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = write_tool(second.path(), "mkfs.exfat", 0o755);
        write_tool(first.path(), "mkfs.ntfs", 0o644);

        let locator =
            PathToolLocator::with_dirs(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(locator.locate("mkfs.exfat"), Some(expected));
        assert!(!locator.is_available("mkfs.ntfs"));
        assert!(!locator.is_available("mkfs.vfat"));
    }

    #[test]
    fn accepts_explicit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "ms-sys", 0o700);
        let locator = PathToolLocator::with_dirs(Vec::new());
        assert_eq!(locator.locate(tool.to_str().unwrap()), Some(tool));
    }

    #[test]
    fn search_path_comes_before_system_dirs() {
        let locator = PathToolLocator {
            search_path: Some(OsString::from("/opt/tools:/usr/sbin")),
            extra_dirs: vec![PathBuf::from("/usr/sbin"), PathBuf::from("/sbin")],
        };
        assert_eq!(
            locator.search_dirs(),
            vec![
                PathBuf::from("/opt/tools"),
                PathBuf::from("/usr/sbin"),
                PathBuf::from("/sbin")
            ]
        );
    }
}
