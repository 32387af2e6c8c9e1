//! Ownership, mode, and SELinux label fixup for the shared image tree.
//!
//! After a successful flash the shared multi-boot image root must be
//! handed back to the media identity so unprivileged ROMs can manage
//! their own images, and its SELinux labels must match the surrounding
//! media tree.

use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::fs::{AtFlags, Mode, XattrFlags, CWD};
use rustix::process::{Gid, Uid};

/// Marker file excluding the image tree from media scanning.
const NOMEDIA: &str = ".nomedia";
/// Identity owning the shared image tree.
const MEDIA_RW_USER: &str = "media_rw";
/// Fixed Android AID for `media_rw`; the name is not always resolvable.
const MEDIA_RW_AID: u32 = 1023;
/// Mode applied recursively to the image tree.
const TREE_MODE: u32 = 0o775;
/// Path whose SELinux label the image tree should share.
const LABEL_REFERENCE: &str = "/data/media/0";

const SELINUX_XATTR: &str = "security.selinux";

/// Restores ownership, mode, and security label on the shared image
/// directory after a successful flash.
pub trait PermissionsFixup {
    /// Fix up `root` and everything below it.
    fn fix_permissions(&self, root: &Utf8Path) -> Result<()>;
}

/// Production fixup: chown to `media_rw`, chmod 0775, and copy the label
/// of the reference media directory, all recursively.
#[derive(Debug, Default)]
pub struct MediaOwnedTree;

impl PermissionsFixup for MediaOwnedTree {
    #[context("Fixing permissions on {root}")]
    fn fix_permissions(&self, root: &Utf8Path) -> Result<()> {
        // Keep the media scanner away from raw images. Creation is
        // best-effort; the chown below is what actually matters.
        if let Err(e) = std::fs::File::create(root.join(NOMEDIA)) {
            tracing::warn!("{root}: failed to create {NOMEDIA}: {e}");
        }

        let (uid, gid) = media_rw_ids();
        chown_recursive(root.as_std_path(), uid, gid)
            .with_context(|| format!("Failed to chown {root}"))?;
        chmod_recursive(root.as_std_path(), TREE_MODE)
            .with_context(|| format!("Failed to chmod {root}"))?;

        match read_label(Path::new(LABEL_REFERENCE)) {
            Some(label) => {
                set_label_recursive(root.as_std_path(), &label).with_context(|| {
                    format!(
                        "{root}: failed to set context to {}",
                        String::from_utf8_lossy(&label)
                    )
                })?;
            }
            // Unreadable reference label (no SELinux, no label) skips the
            // copy rather than failing the fixup.
            None => tracing::debug!("no label on {LABEL_REFERENCE}, skipping relabel"),
        }
        Ok(())
    }
}

fn media_rw_ids() -> (Uid, Gid) {
    let uid = uzers::get_user_by_name(MEDIA_RW_USER)
        .map(|u| u.uid())
        .unwrap_or(MEDIA_RW_AID);
    let gid = uzers::get_group_by_name(MEDIA_RW_USER)
        .map(|g| g.gid())
        .unwrap_or(MEDIA_RW_AID);
    (Uid::from_raw(uid), Gid::from_raw(gid))
}

/// Apply `f` to `path` and, if it is a directory, everything below it.
/// Symlinks are visited but never followed.
fn walk(path: &Path, f: &mut dyn FnMut(&Path, &std::fs::Metadata) -> Result<()>) -> Result<()> {
    let meta = path
        .symlink_metadata()
        .with_context(|| format!("Querying {path:?}"))?;
    f(path, &meta)?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path).with_context(|| format!("Reading {path:?}"))? {
            let entry = entry?;
            walk(&entry.path(), f)?;
        }
    }
    Ok(())
}

fn chown_recursive(root: &Path, uid: Uid, gid: Gid) -> Result<()> {
    walk(root, &mut |path, _meta| {
        rustix::fs::chownat(CWD, path, Some(uid), Some(gid), AtFlags::SYMLINK_NOFOLLOW)
            .with_context(|| format!("Changing ownership of {path:?}"))
    })
}

fn chmod_recursive(root: &Path, mode: u32) -> Result<()> {
    let mode = Mode::from_raw_mode(mode);
    walk(root, &mut |path, meta| {
        // Modes are meaningless on the link itself
        if meta.is_symlink() {
            return Ok(());
        }
        rustix::fs::chmod(path, mode).with_context(|| format!("Changing mode of {path:?}"))
    })
}

/// Read the SELinux label on `path`, without following a final symlink.
/// Any failure (missing xattr, unlabeled filesystem) yields `None`.
fn read_label(path: &Path) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 1024];
    match rustix::fs::lgetxattr(path, SELINUX_XATTR, &mut buf[..]) {
        Ok(len) => {
            buf.truncate(len);
            // The label is stored NUL-terminated
            if buf.last() == Some(&0) {
                buf.pop();
            }
            Some(buf)
        }
        Err(e) => {
            tracing::debug!("failed to read label of {path:?}: {e}");
            None
        }
    }
}

fn set_label_recursive(root: &Path, label: &[u8]) -> Result<()> {
    walk(root, &mut |path, _meta| {
        rustix::fs::lsetxattr(path, SELINUX_XATTR, label, XattrFlags::empty())
            .with_context(|| format!("Labeling {path:?}"))
    })
}
