use crate::prelude::*;
use std::fs;

pub const PAYLOAD_SUFFIX: &str = ".payload";
pub const METADATA_SUFFIX: &str = ".metadata";
/// Older cache layouts kept the value kind in a third file per key. We never
/// write these, but listing a pre-existing cache must not trip over them.
pub const LEGACY_TYPE_SUFFIX: &str = ".type";

/// Resolved on-disk layout of one cache root:
///
/// ```text
/// <base_dir>/
///   dogpile.lock   # content irrelevant; locked by byte offset
///   rw.lock        # content irrelevant; locked by byte offset
///   values/
///     <key>.payload
///     <key>.metadata
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    values_dir: PathBuf,
    rw_lock_path: PathBuf,
    dogpile_lock_path: PathBuf,
}

impl Layout {
    pub fn new(base_dir: &Path) -> Result<Layout> {
        let base_dir = std::env::current_dir()?.join(base_dir);
        let values_dir = base_dir.join("values");
        // create_dir_all succeeds when another process wins the race
        fs::create_dir_all(&values_dir)
            .wrap_err_with(|| format!("Failed to create directory {}", values_dir.display()))?;
        Ok(Layout {
            rw_lock_path: base_dir.join("rw.lock"),
            dogpile_lock_path: base_dir.join("dogpile.lock"),
            values_dir,
        })
    }

    pub fn values_dir(&self) -> &Path {
        &self.values_dir
    }

    pub fn rw_lock_path(&self) -> &Path {
        &self.rw_lock_path
    }

    pub fn dogpile_lock_path(&self) -> &Path {
        &self.dogpile_lock_path
    }

    pub fn payload_path(&self, key: &str) -> PathBuf {
        self.values_dir.join(format!("{key}{PAYLOAD_SUFFIX}"))
    }

    pub fn metadata_path(&self, key: &str) -> PathBuf {
        self.values_dir.join(format!("{key}{METADATA_SUFFIX}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();

        assert_eq!(layout.values_dir(), tmp.path().join("values"));
        assert_eq!(layout.rw_lock_path(), tmp.path().join("rw.lock"));
        assert_eq!(layout.dogpile_lock_path(), tmp.path().join("dogpile.lock"));
        assert_eq!(
            layout.payload_path("abc"),
            tmp.path().join("values").join("abc.payload")
        );
        assert_eq!(
            layout.metadata_path("abc"),
            tmp.path().join("values").join("abc.metadata")
        );
        assert!(layout.values_dir().is_dir());
    }

    #[test]
    fn test_layout_tolerates_existing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        Layout::new(tmp.path()).unwrap();
        // second construction over the same root is fine
        Layout::new(tmp.path()).unwrap();
    }
}
