//! The installed-ROM registry seam.
//!
//! The switcher only needs a yes/no answer to "does this ROM id name an
//! installed system?"; how installations are tracked is someone else's
//! problem. The production lookup answers from the per-ROM state
//! directories.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

/// Default location of per-ROM state directories.
pub const DEFAULT_ROMS_ROOT: &str = "/data/multiboot";

/// Opaque boolean-valued lookup for installed ROM ids.
pub trait RomRegistry {
    /// Whether `id` names an installed ROM.
    fn contains(&self, id: &str) -> Result<bool>;
}

/// Registry backed by the per-ROM state directory tree: a ROM is installed
/// iff its state directory exists under the root.
#[derive(Debug)]
pub struct InstalledRoms {
    root: Utf8PathBuf,
}

impl InstalledRoms {
    /// Registry over the system state root.
    pub fn system() -> Self {
        Self::new(DEFAULT_ROMS_ROOT.into())
    }

    /// Registry over an explicit state root.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }
}

impl RomRegistry for InstalledRoms {
    fn contains(&self, id: &str) -> Result<bool> {
        // Reject anything that could escape the state root.
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return Ok(false);
        }
        let path = self.root.join(id);
        let exists = path
            .try_exists()
            .with_context(|| format!("Querying {path}"))?;
        Ok(exists && path.is_dir())
    }
}

/// Registry answering from a fixed set of ids; for tests and callers that
/// have already validated the installation set out of band.
#[derive(Debug, Default)]
pub struct StaticRoms(Vec<String>);

impl StaticRoms {
    /// Registry containing exactly `ids`.
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(ids.into_iter().map(Into::into).collect())
    }
}

impl RomRegistry for StaticRoms {
    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.0.iter().any(|r| r == id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8Path;

    fn tempdir_registry() -> Result<(tempfile::TempDir, InstalledRoms)> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        std::fs::create_dir(root.join("primary"))?;
        std::fs::create_dir(root.join("dual"))?;
        // A stray regular file is not an installation
        std::fs::write(root.join("notes.txt"), b"")?;
        Ok((td, InstalledRoms::new(root)))
    }

    #[test]
    fn test_installed_roms() -> Result<()> {
        let (_td, registry) = tempdir_registry()?;
        assert!(registry.contains("primary")?);
        assert!(registry.contains("dual")?);
        assert!(!registry.contains("triple")?);
        assert!(!registry.contains("notes.txt")?);
        Ok(())
    }

    #[test]
    fn test_rejects_path_escapes() -> Result<()> {
        let (_td, registry) = tempdir_registry()?;
        assert!(!registry.contains("")?);
        assert!(!registry.contains("..")?);
        assert!(!registry.contains("../primary")?);
        Ok(())
    }

    #[test]
    fn test_static_roms() -> Result<()> {
        let registry = StaticRoms::new(["primary", "dual"]);
        assert!(registry.contains("primary")?);
        assert!(!registry.contains("triple")?);
        Ok(())
    }
}
