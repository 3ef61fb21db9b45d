//! Capability probe and the phase-by-phase flash orchestrator.

pub mod flash;
pub mod probe;

use anyhow::Result;
use log::info;

pub use flash::{
    FlashBackend, FlashError, FlashOptions, FlashSummary, FlashWorkflow, PhaseError,
    PreconditionError, MOUNT_POINT_PREFIX,
};
pub use probe::{
    check_required_tools, probe_available_filesystems, probe_host, required_tools,
    select_filesystem, ConfigError, ProbeReport, ToolStatus,
};

pub trait Workflow {
    fn name(&self) -> &'static str;
    fn run(&self) -> Result<()>;
}

pub fn run_workflow<W: Workflow>(workflow: W) -> Result<()> {
    info!("Running {} workflow", workflow.name());
    workflow.run()
}
