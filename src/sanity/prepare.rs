//! Directory preparation callbacks handed to the sanity suite

use anyhow::Context;
use log::{debug, info, warn};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// The mode of created target and staging directories, write and search only
pub const TARGET_DIR_MODE: u32 = 0o300;
/// The mode to relax a directory to before recursive removal
const REMOVABLE_DIR_MODE: u32 = 0o700;

/// Create `target` and its missing ancestors with mode `0300`
///
/// The parent directory is listed first for diagnostics, a listing failure
/// is only logged. Only a `NotFound` creation failure is returned, every
/// other outcome counts as success.
pub fn create_dir(target: &Path) -> anyhow::Result<PathBuf> {
    log_parent_entries(target);
    info!("building {:?}", target);
    // `DirBuilder` treats an empty path as an existing directory
    let res = if target.as_os_str().is_empty() {
        Err(io::Error::new(io::ErrorKind::NotFound, "empty directory path"))
    } else {
        DirBuilder::new()
            .recursive(true)
            .mode(TARGET_DIR_MODE)
            .create(target)
    };
    settle_create_result(target, res)?;
    Ok(target.to_owned())
}

/// List the entries of the parent of `target` into the log
fn log_parent_entries(target: &Path) {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    info!("---- content of {:?} ----", parent);
    match fs::read_dir(parent) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(e) => {
                        let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                        info!("{:?} is dir: {}", e.file_name(), is_dir);
                    }
                    Err(e) => warn!("failed to read an entry of {:?}, the error is: {}", parent, e),
                }
            }
        }
        Err(e) => warn!("failed to list {:?}, the error is: {}", parent, e),
    }
    info!("**** content of {:?} ****", parent);
}

/// Decide whether a directory creation failure is surfaced
fn settle_create_result(target: &Path, res: io::Result<()>) -> anyhow::Result<()> {
    match res {
        Ok(()) => {
            debug!("directory {:?} ready", target);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(e).context(format!("failed to create directory {:?}", target))
        }
        Err(e) => {
            warn!("ignored failure of creating {:?}, the error is: {}", target, e);
            Ok(())
        }
    }
}

/// Remove a directory created by `create_dir`, a missing directory is fine
pub fn remove_dir(target: &Path) -> anyhow::Result<()> {
    match fs::remove_dir(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if !target.is_dir() => {
            Err(e).context(format!("failed to remove {:?}, it is not a directory", target))
        }
        Err(e) => {
            debug!(
                "{:?} not removable as an empty directory, the error is: {}",
                target, e
            );
            relax_dir_mode(target)?;
            fs::remove_dir_all(target).context(format!("failed to remove {:?}", target))
        }
    }
}

/// Make every directory under `dir` readable so it can be walked and removed
pub fn relax_dir_mode(dir: &Path) -> anyhow::Result<()> {
    fs::set_permissions(dir, fs::Permissions::from_mode(REMOVABLE_DIR_MODE))
        .context(format!("failed to relax mode of {:?}", dir))?;
    for entry in fs::read_dir(dir).context(format!("failed to read directory {:?}", dir))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            relax_dir_mode(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_create_dir() -> anyhow::Result<()> {
        init_logger();
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("targetPath");

        let created = create_dir(&target)?;
        assert_eq!(created, target);
        assert!(target.is_dir());
        assert_eq!(fs::metadata(&target)?.mode() & 0o777, TARGET_DIR_MODE);

        // Existing directory is not an error
        let created = create_dir(&target)?;
        assert_eq!(created, target);

        remove_dir(&target)?;
        assert!(!target.exists());
        remove_dir(&target)?;
        Ok(())
    }

    #[test]
    fn test_create_dir_with_missing_ancestors() -> anyhow::Result<()> {
        init_logger();
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a").join("b").join("c");

        // The parent does not exist, so listing fails and creation still succeeds
        let created = create_dir(&target)?;
        assert!(created.is_dir());
        assert_eq!(
            fs::metadata(dir.path().join("a"))?.mode() & 0o777,
            TARGET_DIR_MODE
        );
        relax_dir_mode(dir.path())?;
        Ok(())
    }

    #[test]
    fn test_create_dir_under_write_only_parent() -> anyhow::Result<()> {
        init_logger();
        let dir = tempfile::tempdir()?;
        let parent = create_dir(&dir.path().join("targetPath"))?;
        // The parent is not readable, only the listing fails
        let target = create_dir(&parent.join("target"))?;
        assert!(target.is_dir());
        remove_dir(&target)?;
        assert!(!target.exists());
        remove_dir(&parent)?;
        Ok(())
    }

    #[test]
    fn test_settle_create_result() {
        let target = Path::new("/no/such/dir");
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert!(settle_create_result(target, Err(not_found)).is_err());
        let exists = io::Error::from(io::ErrorKind::AlreadyExists);
        assert!(settle_create_result(target, Err(exists)).is_ok());
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(settle_create_result(target, Err(denied)).is_ok());
        assert!(settle_create_result(target, Ok(())).is_ok());
    }

    #[test]
    fn test_create_dir_empty_path() {
        init_logger();
        let err = match create_dir(Path::new("")) {
            Ok(p) => panic!("created empty path {:?}", p),
            Err(e) => e,
        };
        assert_eq!(
            err.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_remove_regular_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("targetPath");
        fs::write(&file, b"")?;
        let err = match remove_dir(&file) {
            Ok(()) => panic!("removed regular file {:?}", file),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("not a directory"));
        assert!(file.is_file());
        assert_eq!(fs::metadata(&file)?.mode() & 0o100, 0);
        Ok(())
    }

    #[test]
    fn test_remove_non_empty_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = create_dir(&dir.path().join("stagingPath"))?;
        let _ = create_dir(&target.join("staging"))?;
        remove_dir(&target)?;
        assert!(!target.exists());
        Ok(())
    }
}
