//! The persistent checksum store.
//!
//! Expected image digests live in a single property-style file, one
//! entry per line of the form `<rom id>/<image>=sha512:<hex digest>`.
//! The store is an explicit transaction object: it is loaded once into
//! memory at the start of an operation, mutated in memory, and written
//! back only if the operation decides to persist its changes.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::fs::Mode;
use rustix::process::{Gid, Uid};

/// The only digest algorithm entries are allowed to carry.
pub const DIGEST_ALGORITHM: &str = "sha512";

/// Result of looking up the expected digest for one image.
#[derive(Debug, PartialEq, Eq)]
pub enum ChecksumLookup {
    /// An entry exists; the payload is the stored hex digest.
    Found(String),
    /// No entry exists for this key.
    NotFound,
    /// An entry exists but its value is unparseable or names an
    /// unsupported algorithm. Deliberately distinct from [`Self::NotFound`]
    /// so a corrupted store is never treated as merely incomplete.
    Malformed,
}

/// In-memory view of the checksum store.
#[derive(Debug, Default)]
pub struct ChecksumStore {
    entries: BTreeMap<String, String>,
    path: Utf8PathBuf,
}

fn store_key(rom_id: &str, image: &str) -> String {
    format!("{rom_id}/{image}")
}

impl ChecksumStore {
    /// Load the store from `path`. A missing or unreadable file is not an
    /// error: callers treat "no store" as "no expected digests", so this
    /// logs and yields an empty mapping.
    pub fn load(path: &Utf8Path) -> Self {
        let mut entries = BTreeMap::new();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let Some((k, v)) = line.split_once('=') else {
                        tracing::warn!("{path}: ignoring unparseable line: {line}");
                        continue;
                    };
                    entries.insert(k.to_string(), v.to_string());
                }
            }
            Err(e) => {
                tracing::warn!("{path}: failed to load checksums: {e}");
            }
        }
        Self {
            entries,
            path: path.to_owned(),
        }
    }

    /// Look up the expected digest for `image` of `rom_id`.
    pub fn get(&self, rom_id: &str, image: &str) -> ChecksumLookup {
        let key = store_key(rom_id, image);
        let Some(value) = self.entries.get(&key) else {
            return ChecksumLookup::NotFound;
        };

        match value.split_once(':') {
            Some((algo, digest)) => {
                if algo != DIGEST_ALGORITHM {
                    tracing::error!("{}: invalid digest algorithm: {algo}", self.path);
                    return ChecksumLookup::Malformed;
                }
                ChecksumLookup::Found(digest.to_string())
            }
            None => {
                tracing::error!("{}: invalid checksum property: {key}={value}", self.path);
                ChecksumLookup::Malformed
            }
        }
    }

    /// Unconditionally record `digest` as the expected digest for `image`
    /// of `rom_id`, overwriting any prior value.
    pub fn update(&mut self, rom_id: &str, image: &str, digest: &str) {
        self.entries
            .insert(store_key(rom_id, image), format!("{DIGEST_ALGORITHM}:{digest}"));
    }

    /// Number of entries currently held in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the in-memory mapping back to disk, replacing the previous
    /// file. The store file is recreated readable by its owning privileged
    /// identity only. Failures to remove the old file, recreate its parent
    /// directory, or restrict ownership are logged; only a failed final
    /// serialization is fatal.
    #[context("Persisting checksums to {}", self.path)]
    pub fn persist(&self) -> Result<()> {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("{}: failed to remove file: {e}", self.path);
            }
        }

        // Recreating the parent directory is best-effort like the removal
        // above; if it didn't work, creating the store file below is what
        // surfaces the error.
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
            {
                tracing::warn!("{parent}: failed to create directory: {e}");
            }
        }

        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .context("Creating store file")?;

        // Restricting the file to root is best-effort; when running in a
        // test environment we are usually not privileged.
        if let Err(e) = rustix::fs::chown(self.path.as_std_path(), Some(Uid::ROOT), Some(Gid::ROOT))
        {
            tracing::warn!("{}: failed to chown file: {e}", self.path);
        }
        if let Err(e) = rustix::fs::chmod(self.path.as_std_path(), Mode::from_raw_mode(0o600)) {
            tracing::warn!("{}: failed to chmod file: {e}", self.path);
        }

        for (k, v) in &self.entries {
            writeln!(f, "{k}={v}").context("Serializing entry")?;
        }
        f.flush().context("Flushing store file")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    const DIGEST_A: &str =
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\
         aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_update_get_roundtrip() {
        let mut store = ChecksumStore::default();
        assert_eq!(store.get("primary", "boot.img"), ChecksumLookup::NotFound);
        store.update("primary", "boot.img", DIGEST_A);
        assert_eq!(
            store.get("primary", "boot.img"),
            ChecksumLookup::Found(DIGEST_A.to_string())
        );
        // Other keys are unaffected
        assert_eq!(store.get("primary", "mdm.img"), ChecksumLookup::NotFound);
        assert_eq!(store.get("dual", "boot.img"), ChecksumLookup::NotFound);
    }

    #[test]
    fn test_malformed_is_not_absent() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(td.path().join("checksums.prop")).unwrap();
        let fixture = indoc! {"
            primary/boot.img=md5:abcd
            dual/boot.img=deadbeef
        "};
        std::fs::write(&path, fixture)?;

        let store = ChecksumStore::load(&path);
        // Wrong algorithm
        assert_eq!(store.get("primary", "boot.img"), ChecksumLookup::Malformed);
        // No separator at all
        assert_eq!(store.get("dual", "boot.img"), ChecksumLookup::Malformed);
        // Genuinely missing keys still report NotFound
        assert_eq!(store.get("triple", "boot.img"), ChecksumLookup::NotFound);
        Ok(())
    }

    #[test]
    fn test_persist_load_roundtrip() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        // Parent directory does not exist yet; persist must create it
        let path = Utf8PathBuf::from_path_buf(td.path().join("state/checksums.prop")).unwrap();

        let mut store = ChecksumStore::load(&path);
        assert!(store.is_empty());
        store.update("primary", "boot.img", DIGEST_A);
        store.update("dual", "modem.img", DIGEST_A);
        store.persist()?;

        let reloaded = ChecksumStore::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get("primary", "boot.img"),
            ChecksumLookup::Found(DIGEST_A.to_string())
        );
        assert_eq!(
            reloaded.get("dual", "modem.img"),
            ChecksumLookup::Found(DIGEST_A.to_string())
        );

        // The on-disk form is sorted key=value lines
        let expected = format!(
            "dual/modem.img=sha512:{DIGEST_A}\nprimary/boot.img=sha512:{DIGEST_A}\n"
        );
        similar_asserts::assert_eq!(std::fs::read_to_string(&path)?, expected);
        Ok(())
    }

    #[test]
    fn test_persist_fails_only_at_serialization() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        // The parent "directory" is a regular file, so it can be neither
        // recreated (logged) nor a store file created under it (fatal).
        let blocked = Utf8PathBuf::from_path_buf(td.path().join("blocked")).unwrap();
        std::fs::write(&blocked, b"")?;

        let mut store = ChecksumStore::load(&blocked.join("checksums.prop"));
        store.update("primary", "boot.img", DIGEST_A);
        assert!(store.persist().is_err());
        Ok(())
    }

    #[test]
    fn test_persist_replaces_previous_contents() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(td.path().join("checksums.prop")).unwrap();
        std::fs::write(&path, "stale/boot.img=sha512:0000\n")?;

        let mut store = ChecksumStore::default();
        store.path = path.clone();
        store.update("primary", "boot.img", DIGEST_A);
        store.persist()?;

        let reloaded = ChecksumStore::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("stale", "boot.img"), ChecksumLookup::NotFound);
        Ok(())
    }
}
