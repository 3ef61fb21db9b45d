use anyhow::{bail, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use log::info;
use std::path::{Path, PathBuf};
use winstick_content::format_bytes;
use winstick_core::{Disk, FileSystemChoice, FlashRequest, PartitionScheme};
use winstick_host_linux::{removable_disks, LinuxHost};
use winstick_workflow_engine::{probe_available_filesystems, ConfigError};

const SCHEMES: [(PartitionScheme, &str); 2] = [
    (PartitionScheme::Mbr, "MBR (BIOS and UEFI)"),
    (PartitionScheme::Gpt, "GPT (UEFI only)"),
];

pub fn run() -> Result<()> {
    let theme = ColorfulTheme::default();
    let host = LinuxHost::new();

    let disks = removable_disks()?;
    if disks.is_empty() {
        bail!("no removable drives found, plug in a USB drive and try again");
    }
    let labels: Vec<String> = disks.iter().map(disk_label).collect();
    let disk = Select::with_theme(&theme)
        .with_prompt("Destination drive")
        .items(&labels)
        .default(0)
        .interact()?;

    let source: String = Input::with_theme(&theme)
        .with_prompt("Path to the Windows ISO")
        .validate_with(|input: &String| -> Result<(), String> {
            if Path::new(input.trim()).exists() {
                Ok(())
            } else {
                Err(format!("{} does not exist", input.trim()))
            }
        })
        .interact_text()?;

    let available = probe_available_filesystems(host.tools());
    if available.is_empty() {
        return Err(ConfigError::NoFilesystemAvailable.into());
    }
    let filesystem = Select::with_theme(&theme)
        .with_prompt("Filesystem")
        .items(&available)
        .default(0)
        .interact()?;

    let scheme_labels: Vec<&str> = SCHEMES.iter().map(|(_, label)| *label).collect();
    let scheme = Select::with_theme(&theme)
        .with_prompt("Partition table")
        .items(&scheme_labels)
        .default(0)
        .interact()?;

    let validate = Confirm::with_theme(&theme)
        .with_prompt("Compare the copied files against the image afterwards?")
        .default(true)
        .interact()?;

    let request = build_request(
        &disks[disk],
        PathBuf::from(source.trim()),
        available[filesystem],
        SCHEMES[scheme].0,
        !validate,
    );
    let confirmed = Confirm::with_theme(&theme)
        .with_prompt(format!(
            "Erase everything on {} ({}) and write {}?",
            request.destination_device.display(),
            disks[disk].friendly_name,
            request.source_image.display()
        ))
        .default(false)
        .interact()?;
    if !confirmed {
        info!("Cancelled, nothing was written");
        return Ok(());
    }

    crate::run_flash(&host, request, None)
}

fn build_request(
    disk: &Disk,
    source: PathBuf,
    filesystem: FileSystemChoice,
    scheme: PartitionScheme,
    skip_validation: bool,
) -> FlashRequest {
    FlashRequest {
        source_image: source,
        destination_device: disk.path.clone(),
        filesystem,
        scheme,
        skip_validation,
    }
}

fn disk_label(disk: &Disk) -> String {
    format!(
        "{}  {}  {}",
        disk.path.display(),
        format_bytes(disk.size_bytes),
        disk.friendly_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk() -> Disk {
        Disk {
            id: "sdc".to_string(),
            path: PathBuf::from("/dev/sdc"),
            friendly_name: "SanDisk Ultra".to_string(),
            size_bytes: 16 * 1024 * 1024 * 1024,
            is_system_disk: false,
            removable: true,
            partitions: Vec::new(),
        }
    }

    #[test]
    fn labels_show_path_size_and_name() {
        assert_eq!(disk_label(&disk()), "/dev/sdc  16.0 GiB  SanDisk Ultra");
    }

    #[test]
    fn request_targets_the_chosen_disk() {
        let request = build_request(
            &disk(),
            PathBuf::from("/tmp/win11.iso"),
            FileSystemChoice::Exfat,
            PartitionScheme::Gpt,
            true,
        );
        assert_eq!(request.destination_device, PathBuf::from("/dev/sdc"));
        assert_eq!(request.source_image, PathBuf::from("/tmp/win11.iso"));
        assert_eq!(request.filesystem, FileSystemChoice::Exfat);
        assert!(request.skip_validation);
    }
}
