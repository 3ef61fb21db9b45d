mod progress;
mod wizard;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use progress::BarSink;
use serde::Serialize;
use std::path::{Path, PathBuf};
use winstick_bootloader_core::{load_bootstrap_payload, resolve_payload_path};
use winstick_content::{ProgressAction, ProgressSink};
use winstick_core::{
    DeviceInspector, DiskGeometry, FileSystemChoice, FlashRequest, PartitionScheme, PartitionSpec,
    PhasePlan,
};
use winstick_geometry::plan_for_filesystem;
use winstick_host_linux::{LinuxHost, LoopIsoReader};
use winstick_imaging::RawPayloadWriter;
use winstick_safety::SafetyContext;
use winstick_workflow_engine::{
    probe_available_filesystems, probe_host, run_workflow, select_filesystem, FlashBackend,
    FlashOptions, FlashWorkflow,
};

#[derive(Debug, Parser)]
#[command(name = "winstick", version, about = "Write a Windows installation ISO to a USB drive")]
struct Cli {
    /// Log at debug level, including every external command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Partition, format and fill DEVICE from SOURCE
    Flash(FlashArgs),
    /// Print the filesystems and tools this host supports as JSON
    Probe {
        #[arg(long)]
        pretty: bool,
    },
    /// Print the phases and partition layout a flash would use, without writing
    Plan(PlanArgs),
    /// Choose the drive, image and options interactively
    Wizard,
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Windows ISO, or a directory holding its extracted contents
    source: PathBuf,
    /// Destination block device
    device: PathBuf,
    /// Filesystem for the data partition [default: first available of exfat, ntfs, fat32]
    #[arg(long = "fs", value_name = "FS")]
    filesystem: Option<FileSystemChoice>,
    /// Use a GPT partition table instead of MBR
    #[arg(long)]
    gpt: bool,
    #[arg(long)]
    skip_validation: bool,
    /// UEFI:NTFS bootstrap image [env: WINSTICK_UEFI_NTFS_IMAGE]
    #[arg(long = "uefi-ntfs", value_name = "PATH")]
    uefi_ntfs: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Read the geometry from this device or image file
    #[arg(required_unless_present = "size_bytes")]
    device: Option<PathBuf>,
    /// Plan for a synthetic disk of this size instead
    #[arg(long, conflicts_with = "device")]
    size_bytes: Option<u64>,
    #[arg(long, default_value_t = 512)]
    block_size: u64,
    #[arg(long = "fs", value_name = "FS")]
    filesystem: Option<FileSystemChoice>,
    #[arg(long)]
    gpt: bool,
    #[arg(long)]
    skip_validation: bool,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct PlanOutput {
    filesystem: FileSystemChoice,
    scheme: PartitionScheme,
    geometry: DiskGeometry,
    phases: Vec<String>,
    partitions: Vec<PartitionSpec>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Flash(args) => flash(args),
        Command::Probe { pretty } => {
            let host = LinuxHost::new();
            print_json(&probe_host(host.tools()), pretty)
        }
        Command::Plan(args) => {
            let geometry = match (&args.device, args.size_bytes) {
                (_, Some(size_bytes)) => DiskGeometry::from_size_bytes(size_bytes, args.block_size),
                (Some(device), None) => LinuxHost::new().geometry(device)?,
                (None, None) => bail!("pass a device or --size-bytes"),
            };
            let filesystem = match args.filesystem {
                Some(filesystem) => filesystem,
                None => {
                    let host = LinuxHost::new();
                    select_filesystem(None, &probe_available_filesystems(host.tools()))
                        .unwrap_or(FileSystemChoice::PREFERENCE[0])
                }
            };
            let output = build_plan(&args, geometry, filesystem)?;
            print_json(&output, args.pretty)
        }
        Command::Wizard => wizard::run(),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn flash(args: FlashArgs) -> Result<()> {
    let host = LinuxHost::new();
    let filesystem = select_filesystem(
        args.filesystem,
        &probe_available_filesystems(host.tools()),
    )?;
    let request = FlashRequest {
        source_image: args.source,
        destination_device: args.device,
        filesystem,
        scheme: scheme(args.gpt),
        skip_validation: args.skip_validation,
    };
    run_flash(&host, request, args.uefi_ntfs.as_deref())
}

/// Runs one flash against the local Linux host with bar progress output.
fn run_flash(host: &LinuxHost, request: FlashRequest, uefi_ntfs: Option<&Path>) -> Result<()> {
    let options = flash_options(&request, uefi_ntfs)?;
    let reader = LoopIsoReader::new(host.clone());
    let payload_writer = RawPayloadWriter::new();
    let backend = FlashBackend::from_host(host, &reader, &payload_writer, host.tools());
    let workflow = FlashWorkflow::new(request, options, backend)
        .with_progress(|action: ProgressAction| -> Box<dyn ProgressSink> {
            Box::new(BarSink::new(action))
        });
    run_workflow(workflow)
}

fn flash_options(request: &FlashRequest, uefi_ntfs: Option<&Path>) -> Result<FlashOptions> {
    let bootstrap = if request.filesystem.needs_bootstrap() {
        Some(load_bootstrap_payload(resolve_payload_path(uefi_ntfs))?)
    } else {
        None
    };
    Ok(FlashOptions {
        safety: SafetyContext::from_env(),
        bootstrap,
        mount_root: None,
    })
}

fn build_plan(
    args: &PlanArgs,
    geometry: DiskGeometry,
    filesystem: FileSystemChoice,
) -> Result<PlanOutput> {
    let scheme = scheme(args.gpt);
    let phases = PhasePlan::new(filesystem, scheme, args.skip_validation);
    let plan = plan_for_filesystem(&geometry, scheme, filesystem)?;
    Ok(PlanOutput {
        filesystem,
        scheme,
        geometry,
        phases: (0..phases.len()).map(|idx| phases.header(idx)).collect(),
        partitions: plan.partitions,
    })
}

fn scheme(gpt: bool) -> PartitionScheme {
    if gpt {
        PartitionScheme::Gpt
    } else {
        PartitionScheme::Mbr
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flash_flags() {
        let cli = Cli::try_parse_from([
            "winstick",
            "flash",
            "win.iso",
            "/dev/sdb",
            "--fs",
            "NTFS",
            "--gpt",
            "--skip-validation",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Flash(args) = cli.command else {
            panic!("expected flash");
        };
        assert_eq!(args.source, PathBuf::from("win.iso"));
        assert_eq!(args.device, PathBuf::from("/dev/sdb"));
        assert_eq!(args.filesystem, Some(FileSystemChoice::Ntfs));
        assert!(args.gpt);
        assert!(args.skip_validation);
        assert_eq!(args.uefi_ntfs, None);
    }

    #[test]
    fn rejects_unknown_filesystem() {
        assert!(Cli::try_parse_from(["winstick", "flash", "a.iso", "/dev/sdb", "--fs", "zfs"]).is_err());
    }

    #[test]
    fn plan_needs_a_device_or_size() {
        assert!(Cli::try_parse_from(["winstick", "plan"]).is_err());
        assert!(Cli::try_parse_from(["winstick", "plan", "--size-bytes", "1073741824"]).is_ok());
    }

    #[test]
    fn plans_a_synthetic_disk() {
        let cli = Cli::try_parse_from([
            "winstick",
            "plan",
            "--size-bytes",
            "536870912",
            "--fs",
            "fat32",
        ])
        .unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let geometry = DiskGeometry::from_size_bytes(args.size_bytes.unwrap(), args.block_size);
        let output = build_plan(&args, geometry, FileSystemChoice::Fat32).unwrap();

        assert_eq!(output.scheme, PartitionScheme::Mbr);
        assert_eq!(output.phases.len(), 6);
        assert_eq!(output.phases[5], "Phase 6/6: Writing MBR boot code");
        assert_eq!(output.partitions.len(), 1);
        assert_eq!(output.partitions[0].start_block, 2048);
        assert_eq!(output.partitions[0].end_block, 1_048_575);
    }

    #[test]
    fn fat32_does_not_load_a_bootstrap_image() {
        let request = FlashRequest {
            source_image: PathBuf::from("win.iso"),
            destination_device: PathBuf::from("/dev/sdb"),
            filesystem: FileSystemChoice::Fat32,
            scheme: PartitionScheme::Mbr,
            skip_validation: false,
        };
        let options = flash_options(&request, Some(Path::new("/nonexistent/uefi-ntfs.img"))).unwrap();
        assert!(options.bootstrap.is_none());
    }

    #[test]
    fn ntfs_reports_a_missing_bootstrap_image() {
        let request = FlashRequest {
            source_image: PathBuf::from("win.iso"),
            destination_device: PathBuf::from("/dev/sdb"),
            filesystem: FileSystemChoice::Ntfs,
            scheme: PartitionScheme::Mbr,
            skip_validation: false,
        };
        let err = flash_options(&request, Some(Path::new("/nonexistent/uefi-ntfs.img"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/uefi-ntfs.img"));
    }
}
