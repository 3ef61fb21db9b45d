//! Linux implementations of the host capabilities the flash pipeline uses.
//! Everything shells out to the standard tools except geometry, which is
//! read with block-device ioctls.

pub mod command;
pub mod device;
pub mod disks;
pub mod format;
pub mod iso;
pub mod loopdev;
pub mod mounts;
pub mod partition;
pub mod tools;

use std::path::PathBuf;
use winstick_core::host::HostResult;
use winstick_core::{HostError, ToolLocator};

pub use disks::{enumerate_disks, removable_disks};
pub use iso::LoopIsoReader;
pub use tools::PathToolLocator;

#[derive(Debug, Clone)]
pub struct LinuxHost {
    tools: PathToolLocator,
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::with_tools(PathToolLocator::from_env())
    }

    pub fn with_tools(tools: PathToolLocator) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &PathToolLocator {
        &self.tools
    }

    fn tool(&self, name: &str) -> HostResult<PathBuf> {
        self.tools
            .locate(name)
            .ok_or_else(|| HostError::ToolMissing(name.to_string()))
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}
