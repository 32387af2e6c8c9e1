//! The `romswitch` command line frontend.

use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use romswitch_lib::lsm::MediaOwnedTree;
use romswitch_lib::roms::InstalledRoms;
use romswitch_lib::switcher::{
    SwitchError, Switcher, DEFAULT_CHECKSUMS_PATH, DEFAULT_MULTIBOOT_ROOT,
};

/// Integrity-verified switching between installed multi-boot ROMs.
#[derive(Debug, Parser)]
#[clap(name = "romswitch", version)]
struct App {
    /// Root directory of the per-ROM image tree.
    #[clap(long, default_value = DEFAULT_MULTIBOOT_ROOT, global = true)]
    multiboot_dir: Utf8PathBuf,

    /// Path of the persisted checksum store.
    #[clap(long, default_value = DEFAULT_CHECKSUMS_PATH, global = true)]
    checksums: Utf8PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Flash the images of a ROM to their physical partitions, after
    /// verifying every image against the checksum store.
    Switch {
        /// ROM id to switch to.
        rom_id: String,
        /// Block device of the boot partition.
        #[clap(long)]
        boot_blockdev: Utf8PathBuf,
        /// Directory to search (non-recursively) for the block devices of
        /// extra images. May be given multiple times; probed in order.
        #[clap(long = "blockdev-dir")]
        blockdev_dirs: Vec<Utf8PathBuf>,
        /// Record the current image digests as the expected ones instead
        /// of requiring them to match.
        #[clap(long)]
        force_update_checksums: bool,
    },
    /// Record the kernel currently on the boot partition as the known-good
    /// boot image of a ROM.
    SetKernel {
        /// ROM id to set the kernel for.
        rom_id: String,
        /// Block device of the boot partition.
        #[clap(long)]
        boot_blockdev: Utf8PathBuf,
    },
}

fn install_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), SwitchError> {
    let app = App::parse();

    let registry = InstalledRoms::system();
    let fixup = MediaOwnedTree;
    let switcher = Switcher::with_paths(&registry, &fixup, app.multiboot_dir, app.checksums);

    match app.cmd {
        Command::Switch {
            rom_id,
            boot_blockdev,
            blockdev_dirs,
            force_update_checksums,
        } => {
            switcher.switch_rom(
                &rom_id,
                &boot_blockdev,
                &blockdev_dirs,
                force_update_checksums,
            )?;
            println!("Successfully switched to {rom_id}");
        }
        Command::SetKernel { rom_id, boot_blockdev } => {
            switcher.set_kernel(&rom_id, &boot_blockdev)?;
            println!("Successfully set the kernel for {rom_id}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    install_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Give the checksum failure classes their own wording; scripted
            // callers key off these messages.
            match &e {
                SwitchError::ChecksumNotFound(path) => {
                    tracing::error!("The checksum for {path} is missing; re-run with --force-update-checksums if this change is intended");
                }
                SwitchError::ChecksumInvalid(path) => {
                    tracing::error!("The checksum for {path} does not match; refusing to flash");
                }
                _ => tracing::error!("{e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
