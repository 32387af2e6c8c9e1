//! Locating the physical block device backing a named partition.

use camino::{Utf8Path, Utf8PathBuf};

/// Well-known directory containing block device nodes on Android-style
/// systems. Devices following the MMC naming convention usually have an
/// alias directly under here.
const DEV_BLOCK: &str = "/dev/block";

/// Perform a non-recursive search for the block device backing `partition`.
///
/// Names following the MMC convention (`mmcblk*`) are first probed directly
/// under `/dev/block`; otherwise (and as a fallback) each entry of
/// `search_dirs` is probed in order for `<dir>/<partition>`. The first path
/// that stats wins. Returns `None` if the partition cannot be resolved
/// anywhere; callers are expected to treat that as "not flashable" rather
/// than as an error.
pub fn find_block_dev(search_dirs: &[Utf8PathBuf], partition: &str) -> Option<Utf8PathBuf> {
    find_block_dev_in(Utf8Path::new(DEV_BLOCK), search_dirs, partition)
}

/// Search implementation parameterized on the system block device root.
fn find_block_dev_in(
    system_root: &Utf8Path,
    search_dirs: &[Utf8PathBuf],
    partition: &str,
) -> Option<Utf8PathBuf> {
    if partition.starts_with("mmcblk") {
        let path = system_root.join(partition);
        if path_exists(&path) {
            return Some(path);
        }
    }

    for base_dir in search_dirs {
        let block_dev = base_dir.join(partition);
        if path_exists(&block_dev) {
            return Some(block_dev);
        }
    }

    tracing::debug!("no block device found for partition {partition}");
    None
}

/// Existence is decided by a path-stat only; a failing stat (e.g. EACCES on
/// an intermediate directory) is treated the same as an absent device.
fn path_exists(path: &Utf8Path) -> bool {
    match path.try_exists() {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("stat of {path} failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    fn utf8_path(p: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p.to_owned()).unwrap()
    }

    #[test]
    fn test_search_order() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = utf8_path(td.path());
        let first = root.join("by-name");
        let second = root.join("platform");
        std::fs::create_dir_all(&first)?;
        std::fs::create_dir_all(&second)?;
        std::fs::write(first.join("modem"), b"")?;
        std::fs::write(second.join("modem"), b"")?;
        std::fs::write(second.join("mdm"), b"")?;

        let dirs = vec![first.clone(), second.clone()];
        // First match wins
        assert_eq!(
            find_block_dev(&dirs, "modem").as_deref(),
            Some(first.join("modem").as_path())
        );
        // Fallback to later dirs
        assert_eq!(
            find_block_dev(&dirs, "mdm").as_deref(),
            Some(second.join("mdm").as_path())
        );
        // No match anywhere
        assert_eq!(find_block_dev(&dirs, "radio"), None);
        Ok(())
    }

    #[test]
    fn test_mmc_alias_probed_first() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = utf8_path(td.path());
        let sysroot = root.join("dev-block");
        let extra = root.join("by-name");
        std::fs::create_dir_all(&sysroot)?;
        std::fs::create_dir_all(&extra)?;
        std::fs::write(sysroot.join("mmcblk0p1"), b"")?;
        std::fs::write(extra.join("mmcblk0p1"), b"")?;

        let dirs = vec![extra.clone()];
        assert_eq!(
            find_block_dev_in(&sysroot, &dirs, "mmcblk0p1").as_deref(),
            Some(sysroot.join("mmcblk0p1").as_path())
        );
        // Non-MMC names never probe the system root
        std::fs::write(sysroot.join("boot"), b"")?;
        assert_eq!(find_block_dev_in(&sysroot, &dirs, "boot"), None);
        // But MMC names still fall back to the search dirs
        std::fs::write(extra.join("mmcblk1"), b"")?;
        assert_eq!(
            find_block_dev_in(&sysroot, &dirs, "mmcblk1").as_deref(),
            Some(extra.join("mmcblk1").as_path())
        );
        Ok(())
    }

    #[test]
    fn test_empty_search_dirs() {
        assert_eq!(find_block_dev(&[], "nonexistent-partition"), None);
    }
}
