//! Switching which ROM's images are flashed to the physical partitions.
//!
//! The pipeline is deliberately two-phased: every image is first read
//! fully into memory and verified against the checksum store, and only
//! when the whole set has passed does any device get written. The bytes
//! that were verified are the bytes that are written; sources are never
//! re-read between the check and the write.

use std::io::Write;
use std::os::unix::fs::DirBuilderExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use crate::checksums::{ChecksumLookup, ChecksumStore};
use crate::lsm::PermissionsFixup;
use crate::roms::RomRegistry;

/// Default root of the shared image tree, one subdirectory per ROM.
pub const DEFAULT_MULTIBOOT_ROOT: &str = "/data/media/0/MultiBoot";
/// Default location of the persisted checksum store.
pub const DEFAULT_CHECKSUMS_PATH: &str = "/data/multiboot/checksums.prop";
/// The mandatory boot image present in every ROM's image directory.
pub const BOOT_IMAGE: &str = "boot.img";

const IMAGE_EXT: &str = ".img";
/// The only partitions eligible for automatic flashing besides boot.
/// Everything else found in an image directory is skipped; directory
/// contents must not be able to trigger arbitrary partition writes.
const PARTITION_WHITELIST: &[&str] = &["mdm", "modem"];

/// Failure classes for a switch operation. I/O errors and registry
/// rejections abort immediately; the two checksum variants follow a strict
/// priority: an invalid (mismatched or malformed) entry anywhere is
/// reported over a missing entry anywhere.
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    /// The ROM id does not name an installed ROM.
    #[error("unknown ROM id: {0}")]
    UnknownRom(String),
    /// No digest is recorded for this image and none was forced.
    #[error("{0}: checksum does not exist")]
    ChecksumNotFound(Utf8PathBuf),
    /// The recorded digest is malformed or does not match the image.
    #[error("{0}: checksum is invalid")]
    ChecksumInvalid(Utf8PathBuf),
    /// Everything else: I/O, registry access, permissions fixup.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// One (source image, target block device) unit to verify and write.
#[derive(Debug, Default)]
struct Flashable {
    source: Utf8PathBuf,
    block_dev: Utf8PathBuf,
    expected_digest: Option<String>,
    digest: String,
    data: Vec<u8>,
}

impl Flashable {
    fn new(source: Utf8PathBuf, block_dev: Utf8PathBuf) -> Self {
        Self {
            source,
            block_dev,
            ..Default::default()
        }
    }
}

/// The switch operation, bound to its collaborators and on-disk layout.
/// Exclusively owns the checksum store for the duration of one operation;
/// callers must not run two operations concurrently against the same
/// device state.
pub struct Switcher<'a> {
    multiboot_root: Utf8PathBuf,
    checksums_path: Utf8PathBuf,
    registry: &'a dyn RomRegistry,
    fixup: &'a dyn PermissionsFixup,
}

impl<'a> Switcher<'a> {
    /// A switcher over the system's default paths.
    pub fn new(registry: &'a dyn RomRegistry, fixup: &'a dyn PermissionsFixup) -> Self {
        Self::with_paths(
            registry,
            fixup,
            DEFAULT_MULTIBOOT_ROOT.into(),
            DEFAULT_CHECKSUMS_PATH.into(),
        )
    }

    /// A switcher over explicit paths.
    pub fn with_paths(
        registry: &'a dyn RomRegistry,
        fixup: &'a dyn PermissionsFixup,
        multiboot_root: Utf8PathBuf,
        checksums_path: Utf8PathBuf,
    ) -> Self {
        Self {
            multiboot_root,
            checksums_path,
            registry,
            fixup,
        }
    }

    fn rom_dir(&self, id: &str) -> Utf8PathBuf {
        self.multiboot_root.join(id)
    }

    fn validate_rom(&self, id: &str) -> Result<(), SwitchError> {
        let known = self
            .registry
            .contains(id)
            .context("Querying ROM registry")?;
        if !known {
            tracing::error!("invalid ROM id: {id}");
            return Err(SwitchError::UnknownRom(id.to_string()));
        }
        Ok(())
    }

    /// Switch to the ROM named `id`, flashing its boot image to
    /// `boot_blockdev` and any whitelisted extra images to the block
    /// devices resolved through `blockdev_dirs`.
    ///
    /// With `force_update_checksums` the freshly computed digests are
    /// recorded (and persisted on success) instead of being required to
    /// pre-exist.
    ///
    /// On an error during the write phase, targets written earlier in the
    /// same invocation remain overwritten; there is no rollback.
    pub fn switch_rom(
        &self,
        id: &str,
        boot_blockdev: &Utf8Path,
        blockdev_dirs: &[Utf8PathBuf],
        force_update_checksums: bool,
    ) -> Result<(), SwitchError> {
        tracing::debug!("attempting to switch to {id}");
        tracing::debug!("force update checksums: {force_update_checksums}");

        self.validate_rom(id)?;
        let rom_dir = self.rom_dir(id);
        ensure_image_dir(&rom_dir)?;

        let mut flashables = vec![Flashable::new(
            rom_dir.join(BOOT_IMAGE),
            boot_blockdev.to_owned(),
        )];
        // Extra images are optional; a failed enumeration degrades to
        // flashing the boot image alone.
        match find_extra_images(&rom_dir, blockdev_dirs) {
            Ok(extra) => flashables.extend(extra),
            Err(e) => tracing::warn!("failed to find extra images: {e:#}"),
        }

        let mut store = ChecksumStore::load(&self.checksums_path);

        // Read every image fully into memory before verifying anything, so
        // an untrusted process can't swap a source file between the hash
        // verification step and the flashing step.
        for f in &mut flashables {
            f.data = std::fs::read(&f.source)
                .with_context(|| format!("{}: Failed to read image", f.source))?;
            f.digest = sha512_hex(&f.data)?;

            let image = f
                .source
                .file_name()
                .with_context(|| format!("{}: image path has no file name", f.source))?;
            if force_update_checksums {
                store.update(id, image, &f.digest);
            }

            match store.get(id, image) {
                ChecksumLookup::Found(expected) => {
                    if expected != f.digest {
                        tracing::error!(
                            "{}: checksum ({}) does not match expected ({expected})",
                            f.source,
                            f.digest
                        );
                        return Err(SwitchError::ChecksumInvalid(f.source.clone()));
                    }
                    f.expected_digest = Some(expected);
                }
                ChecksumLookup::NotFound => {}
                ChecksumLookup::Malformed => {
                    return Err(SwitchError::ChecksumInvalid(f.source.clone()))
                }
            }
        }

        // Missing digests are only reported after the loop above has seen
        // every image, so a genuine mismatch anywhere takes priority over a
        // missing entry elsewhere.
        for f in &flashables {
            if f.expected_digest.is_none() {
                tracing::error!("{}: checksum does not exist", f.source);
                return Err(SwitchError::ChecksumNotFound(f.source.clone()));
            }
        }

        // Every image passed; now flash the verified buffers.
        for f in &flashables {
            write_image(&f.block_dev, &f.data)?;
        }

        if force_update_checksums {
            tracing::debug!("updating checksums file");
            // The flash already happened; a failed persist is not allowed
            // to turn it into a failure.
            if let Err(e) = store.persist() {
                tracing::warn!("failed to persist checksums: {e:#}");
            }
        }

        self.fixup.fix_permissions(&self.multiboot_root)?;
        Ok(())
    }

    /// Record whatever is currently on `boot_blockdev` as the known-good
    /// boot image of `id`: digest the live device content, overwrite the
    /// stored `boot.img` digest with it, and copy the bytes into the ROM's
    /// image directory.
    ///
    /// This never updates digests of non-boot images; doing so here would
    /// silently bless unrelated (possibly malicious) changes.
    pub fn set_kernel(&self, id: &str, boot_blockdev: &Utf8Path) -> Result<(), SwitchError> {
        tracing::debug!("attempting to set the kernel for {id}");

        self.validate_rom(id)?;
        let rom_dir = self.rom_dir(id);
        ensure_image_dir(&rom_dir)?;
        let bootimg_path = rom_dir.join(BOOT_IMAGE);

        let data = std::fs::read(boot_blockdev.as_std_path())
            .with_context(|| format!("{boot_blockdev}: Failed to read block device"))?;
        let digest = sha512_hex(&data)?;

        let mut store = ChecksumStore::load(&self.checksums_path);
        store.update(id, BOOT_IMAGE, &digest);

        write_image(&bootimg_path, &data)?;

        tracing::debug!("updating checksums file");
        if let Err(e) = store.persist() {
            tracing::warn!("failed to persist checksums: {e:#}");
        }

        self.fixup.fix_permissions(&self.multiboot_root)?;
        Ok(())
    }
}

/// Enumerate the flashable extra images of one ROM's image directory and
/// resolve their target block devices. Non-whitelisted partitions and
/// partitions without a resolvable device are skipped, not fatal.
#[context("Finding extra images in {rom_dir}")]
fn find_extra_images(
    rom_dir: &Utf8Path,
    blockdev_dirs: &[Utf8PathBuf],
) -> Result<Vec<Flashable>> {
    let mut flashables = Vec::new();
    for entry in rom_dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(partition) = name.strip_suffix(IMAGE_EXT) else {
            continue;
        };
        if partition.is_empty() {
            // The bare literal ".img" names no partition
            continue;
        }
        if name.starts_with(BOOT_IMAGE) {
            // Boot images are handled separately
            continue;
        }
        if !PARTITION_WHITELIST.contains(&partition) {
            tracing::warn!("partition {partition} is not whitelisted for flashing");
            continue;
        }
        let Some(block_dev) = blockdev::find_block_dev(blockdev_dirs, partition) else {
            tracing::warn!("couldn't find block device for partition {partition}");
            continue;
        };

        tracing::debug!("found extra image: {} -> {block_dev}", entry.path());
        flashables.push(Flashable::new(entry.path().to_owned(), block_dev));
    }
    Ok(flashables)
}

/// The digest primitive: SHA-512 over the full buffer, lowercase hex.
fn sha512_hex(data: &[u8]) -> Result<String> {
    let digest: &[u8] =
        &openssl::hash::hash(openssl::hash::MessageDigest::sha512(), data).context("Hashing image")?;
    Ok(hex::encode(digest))
}

#[context("Creating {dir}")]
fn ensure_image_dir(dir: &Utf8Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(dir)?;
    Ok(())
}

/// Write `data` verbatim to `dev`. The target is normally a block device
/// node, but plain files (the stored boot image, tests) work the same way.
#[context("{dev}: Failed to write image")]
fn write_image(dev: &Utf8Path, data: &[u8]) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dev)?;
    f.write_all(data)?;
    f.sync_all()?;
    Ok(())
}
