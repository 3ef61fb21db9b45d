use crate::probe::{check_required_tools, probe_available_filesystems, ConfigError};
use crate::Workflow;
use anyhow::Context;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use winstick_bootloader_core::BootstrapPayload;
use winstick_content::{
    copyable_size, extract_image, format_bytes, open_source, validate_image, ContentError,
    ImageReader, LogSink, ProgressAction, ProgressSink, SourceImage,
};
use winstick_core::{
    create_mount_point, partition_path, remove_mount_point, BootSectorWriter, DeviceInspector,
    DiskGeometry, FilesystemFormatter, FlashRequest, HostError, LoopDevices, Mounter,
    PartitionPlan, PartitionTableWriter, PayloadWriter, Phase, PhasePlan, ToolLocator,
};
use winstick_geometry::{plan_for_filesystem, GeometryError};
use winstick_safety::{
    can_target_destination, check_capacity, DestinationFacts, SafetyContext, SafetyDecision,
};

pub const MOUNT_POINT_PREFIX: &str = "winstick-mnt-";

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("{0}")]
    Denied(String),
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("no bootstrap payload loaded")]
    MissingBootstrap,
    #[error("partition plan has no bootstrap partition")]
    NoBootstrapPartition,
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("invalid configuration")]
    Configuration(#[from] ConfigError),
    #[error("preflight check failed")]
    Precondition(#[from] PreconditionError),
    #[error("Phase {index}/{total} ({phase}) failed")]
    Phase {
        phase: Phase,
        index: usize,
        total: usize,
        #[source]
        source: PhaseError,
    },
}

/// The host capabilities one run goes through.
#[derive(Clone, Copy)]
pub struct FlashBackend<'a> {
    pub images: &'a dyn ImageReader,
    pub inspector: &'a dyn DeviceInspector,
    pub partitioner: &'a dyn PartitionTableWriter,
    pub payload_writer: &'a dyn PayloadWriter,
    pub formatter: &'a dyn FilesystemFormatter,
    pub mounter: &'a dyn Mounter,
    pub loops: &'a dyn LoopDevices,
    pub boot_sector: &'a dyn BootSectorWriter,
    pub tools: &'a dyn ToolLocator,
}

impl<'a> FlashBackend<'a> {
    /// Takes every device-facing capability from one host implementation.
    pub fn from_host<H>(
        host: &'a H,
        images: &'a dyn ImageReader,
        payload_writer: &'a dyn PayloadWriter,
        tools: &'a dyn ToolLocator,
    ) -> Self
    where
        H: DeviceInspector
            + PartitionTableWriter
            + FilesystemFormatter
            + Mounter
            + LoopDevices
            + BootSectorWriter,
    {
        Self {
            images,
            inspector: host,
            partitioner: host,
            payload_writer,
            formatter: host,
            mounter: host,
            loops: host,
            boot_sector: host,
            tools,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub safety: SafetyContext,
    /// Required for exFAT and NTFS.
    pub bootstrap: Option<BootstrapPayload>,
    /// Parent of the temporary mount points, the system temp dir when unset.
    pub mount_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlashSummary {
    pub request: FlashRequest,
    /// The destination with symlinks resolved, the path every phase used.
    pub device: PathBuf,
    pub geometry: DiskGeometry,
    pub plan: PartitionPlan,
    pub completed: Vec<Phase>,
    pub bytes_extracted: u64,
    pub bytes_validated: Option<u64>,
    pub loop_device: Option<PathBuf>,
}

type SinkFactory<'a> = Box<dyn Fn(ProgressAction) -> Box<dyn ProgressSink> + 'a>;

pub struct FlashWorkflow<'a> {
    request: FlashRequest,
    options: FlashOptions,
    backend: FlashBackend<'a>,
    sinks: SinkFactory<'a>,
}

struct Prepared {
    device: PathBuf,
    source: SourceImage,
    geometry: DiskGeometry,
    plan: PartitionPlan,
    destination_is_file: bool,
}

impl<'a> FlashWorkflow<'a> {
    pub fn new(request: FlashRequest, options: FlashOptions, backend: FlashBackend<'a>) -> Self {
        Self {
            request,
            options,
            backend,
            sinks: Box::new(|_| -> Box<dyn ProgressSink> { Box::new(LogSink) }),
        }
    }

    /// Replaces the default log-line progress output.
    pub fn with_progress(
        mut self,
        sinks: impl Fn(ProgressAction) -> Box<dyn ProgressSink> + 'a,
    ) -> Self {
        self.sinks = Box::new(sinks);
        self
    }

    pub fn request(&self) -> &FlashRequest {
        &self.request
    }

    pub fn phase_plan(&self) -> PhasePlan {
        PhasePlan::for_request(&self.request)
    }

    pub fn execute(&self) -> Result<FlashSummary, FlashError> {
        let phases = self.phase_plan();
        let prepared = self.preflight()?;
        info!(
            "Flashing {} to {}: {} on {}, {} of files, {} phases",
            self.request.source_image.display(),
            prepared.device.display(),
            self.request.filesystem,
            self.request.scheme,
            format_bytes(copyable_size(&prepared.source.root)),
            phases.len()
        );

        let mut target = Target {
            destination: &prepared.device,
            is_file: prepared.destination_is_file,
            loops: self.backend.loops,
            attached: None,
        };
        let mut summary = FlashSummary {
            request: self.request.clone(),
            device: prepared.device.clone(),
            geometry: prepared.geometry,
            plan: prepared.plan.clone(),
            completed: Vec::with_capacity(phases.len()),
            bytes_extracted: 0,
            bytes_validated: None,
            loop_device: None,
        };

        let total = phases.len();
        for (idx, phase) in phases.phases().iter().copied().enumerate() {
            info!("{}", phases.header(idx));
            self.run_phase(phase, &prepared, &mut target, &mut summary)
                .map_err(|source| FlashError::Phase {
                    phase,
                    index: idx + 1,
                    total,
                    source,
                })?;
            summary.completed.push(phase);
        }
        summary.loop_device = target.attached.as_ref().map(|guard| guard.device.clone());
        drop(target);

        info!(
            "Finished writing {} to {}",
            self.request.source_image.display(),
            self.request.destination_device.display()
        );
        Ok(summary)
    }

    /// Reads everything the run needs without touching the destination.
    fn preflight(&self) -> Result<Prepared, FlashError> {
        let request = &self.request;
        let backend = &self.backend;

        let available = probe_available_filesystems(backend.tools);
        if !available.contains(&request.filesystem) {
            return Err(ConfigError::FilesystemUnavailable {
                requested: request.filesystem,
            }
            .into());
        }
        if request.filesystem.needs_bootstrap() && self.options.bootstrap.is_none() {
            return Err(ConfigError::MissingBootstrap {
                filesystem: request.filesystem,
            }
            .into());
        }

        // Partition nodes are named after the kernel device, not a udev alias.
        let destination = fs::canonicalize(&request.destination_device).map_err(|err| {
            PreconditionError::from(HostError::io(
                format!("resolve {}", request.destination_device.display()),
                err,
            ))
        })?;
        if destination != request.destination_device {
            debug!(
                "Resolved {} to {}",
                request.destination_device.display(),
                destination.display()
            );
        }

        let is_block_device = backend
            .inspector
            .is_block_device(&destination)
            .map_err(PreconditionError::from)?;
        let is_regular_file = !is_block_device
            && fs::metadata(&destination)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false);
        check_required_tools(backend.tools, request, is_regular_file)?;

        let facts = DestinationFacts {
            path: destination.clone(),
            is_block_device,
            is_regular_file,
            is_system_disk: backend.inspector.is_system_disk(&destination),
        };
        allow(can_target_destination(&self.options.safety, &facts))?;

        let (source, kind) =
            open_source(&request.source_image, backend.images).map_err(PreconditionError::from)?;
        debug!("Opened {} as {:?}", request.source_image.display(), kind);

        let geometry = backend
            .inspector
            .geometry(&destination)
            .map_err(PreconditionError::from)?;
        allow(check_capacity(
            &self.options.safety,
            copyable_size(&source.root),
            geometry.size_bytes(),
        ))?;
        let plan = plan_for_filesystem(&geometry, request.scheme, request.filesystem)
            .map_err(PreconditionError::from)?;
        debug!("Partition plan: {:?}", plan);

        Ok(Prepared {
            device: destination,
            source,
            geometry,
            plan,
            destination_is_file: is_regular_file,
        })
    }

    fn run_phase(
        &self,
        phase: Phase,
        prepared: &Prepared,
        target: &mut Target<'_>,
        summary: &mut FlashSummary,
    ) -> Result<(), PhaseError> {
        let backend = &self.backend;
        let destination = &prepared.device;
        match phase {
            Phase::UnmountDevice => backend.inspector.unmount_partitions(destination)?,
            Phase::PartitionDevice => {
                backend
                    .partitioner
                    .write_table(destination, &prepared.geometry, &prepared.plan)?
            }
            Phase::WriteBootstrap => {
                let payload = self
                    .options
                    .bootstrap
                    .as_ref()
                    .ok_or(PhaseError::MissingBootstrap)?;
                let index = prepared
                    .plan
                    .bootstrap_index()
                    .ok_or(PhaseError::NoBootstrapPartition)?;
                let partition = prepared
                    .plan
                    .partition(index)
                    .ok_or(PhaseError::NoBootstrapPartition)?;
                backend.payload_writer.write_partition_payload(
                    destination,
                    &prepared.geometry,
                    index,
                    partition,
                    &payload.bytes,
                )?;
            }
            Phase::CreateFilesystem => {
                let partition = partition_path(&target.device()?, prepared.plan.data_index());
                backend.formatter.format(self.request.filesystem, &partition)?;
            }
            Phase::ExtractImage => {
                let partition = partition_path(&target.device()?, prepared.plan.data_index());
                let mount = MountGuard::mount(
                    backend.mounter,
                    &partition,
                    self.options.mount_root.as_deref(),
                )?;
                summary.bytes_extracted = extract_image(
                    &prepared.source.root,
                    mount.path(),
                    (self.sinks)(ProgressAction::Extracted),
                )?;
            }
            Phase::ValidateImage => {
                let partition = partition_path(&target.device()?, prepared.plan.data_index());
                let mount = MountGuard::mount(
                    backend.mounter,
                    &partition,
                    self.options.mount_root.as_deref(),
                )?;
                summary.bytes_validated = Some(validate_image(
                    &prepared.source.root,
                    mount.path(),
                    (self.sinks)(ProgressAction::Validated),
                )?);
            }
            Phase::WriteBootSector => {
                let device = target.device()?;
                backend
                    .boot_sector
                    .write_boot_sector(&partition_path(&device, prepared.plan.data_index()))?;
                backend.boot_sector.write_boot_sector(&device)?;
            }
        }
        Ok(())
    }
}

impl Workflow for FlashWorkflow<'_> {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn run(&self) -> anyhow::Result<()> {
        let summary = self.execute().with_context(|| {
            format!(
                "failed to write {} to {}",
                self.request.source_image.display(),
                self.request.destination_device.display()
            )
        })?;
        info!(
            "{} phases completed, {} extracted",
            summary.completed.len(),
            format_bytes(summary.bytes_extracted)
        );
        Ok(())
    }
}

fn allow(decision: SafetyDecision) -> Result<(), PreconditionError> {
    match decision {
        SafetyDecision::Allow => Ok(()),
        SafetyDecision::Deny(reason) => Err(PreconditionError::Denied(reason)),
    }
}

/// The device whose partitions the run works on. A regular-file destination
/// is attached to a loop device the first time a partition node is needed
/// and detached when the run ends.
struct Target<'a> {
    destination: &'a Path,
    is_file: bool,
    loops: &'a dyn LoopDevices,
    attached: Option<LoopGuard<'a>>,
}

impl Target<'_> {
    fn device(&mut self) -> Result<PathBuf, HostError> {
        if !self.is_file {
            return Ok(self.destination.to_path_buf());
        }
        if let Some(guard) = &self.attached {
            return Ok(guard.device.clone());
        }
        let device = self.loops.attach(self.destination)?;
        info!(
            "Attached {} as {}",
            self.destination.display(),
            device.display()
        );
        self.attached = Some(LoopGuard {
            loops: self.loops,
            device: device.clone(),
        });
        Ok(device)
    }
}

struct LoopGuard<'a> {
    loops: &'a dyn LoopDevices,
    device: PathBuf,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.loops.detach(&self.device) {
            warn!("Failed to detach {}: {}", self.device.display(), err);
        }
    }
}

/// A partition mounted at a fresh temporary directory. Dropping it unmounts
/// and removes the directory.
struct MountGuard<'a> {
    mounter: &'a dyn Mounter,
    target: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    fn mount(
        mounter: &'a dyn Mounter,
        partition: &Path,
        parent: Option<&Path>,
    ) -> Result<Self, HostError> {
        let mut guard = Self {
            mounter,
            target: create_mount_point(MOUNT_POINT_PREFIX, parent)?,
            mounted: false,
        };
        mounter.mount(partition, &guard.target)?;
        guard.mounted = true;
        debug!("Mounted {} at {}", partition.display(), guard.target.display());
        Ok(guard)
    }

    fn path(&self) -> &Path {
        &self.target
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = self.mounter.unmount(&self.target) {
                // The partition is still mounted there; keep the directory.
                warn!("Failed to unmount {}: {}", self.target.display(), err);
                return;
            }
        }
        remove_mount_point(&self.target);
    }
}
