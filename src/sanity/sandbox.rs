//! Temporary directory holding the socket, target and staging paths of one sanity run

use anyhow::Context;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use super::super::meta_data::util;
use super::prepare::relax_dir_mode;

/// The prefix of the sandbox directory name
pub const SANDBOX_PREFIX: &str = "csi_sanity_test";
/// The socket file name inside the sandbox
const SOCKET_FILE_NAME: &str = "csi.sock";
/// The target path name inside the sandbox
const TARGET_PATH_NAME: &str = "targetPath";
/// The staging path name inside the sandbox
const STAGING_PATH_NAME: &str = "stagingPath";

/// An isolated directory tree for one sanity run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sandbox {
    /// The sandbox root directory
    root: PathBuf,
    /// The unix socket end point, `unix://<root>/csi.sock`
    end_point: String,
    /// The path to publish volumes to
    target_path: PathBuf,
    /// The path to stage volumes at
    staging_path: PathBuf,
}

impl Sandbox {
    /// Create a uniquely named sandbox under the system temporary directory
    pub fn create() -> anyhow::Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    /// Create a uniquely named sandbox under `parent`
    pub fn create_in(parent: impl AsRef<Path>) -> anyhow::Result<Self> {
        let parent = parent.as_ref();
        let dir = tempfile::Builder::new()
            .prefix(SANDBOX_PREFIX)
            .tempdir_in(parent)
            .context(format!("failed to create sandbox directory in {:?}", parent))?;
        // The sandbox outlives the `TempDir` guard, `remove` cleans it up explicitly
        let root = dir.into_path();
        let sock = root.join(SOCKET_FILE_NAME);
        let sandbox = Self {
            end_point: format!("{}{}", util::UNIX_SOCKET_PREFIX, sock.display()),
            target_path: root.join(TARGET_PATH_NAME),
            staging_path: root.join(STAGING_PATH_NAME),
            root,
        };
        info!("sandbox created at {:?}", sandbox.root);
        Ok(sandbox)
    }

    /// The sandbox root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The unix socket end point
    pub fn end_point(&self) -> &str {
        &self.end_point
    }

    /// The socket file path
    pub fn socket_path(&self) -> PathBuf {
        self.root.join(SOCKET_FILE_NAME)
    }

    /// The path to publish volumes to
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// The path to stage volumes at
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Remove the sandbox, relaxing directory modes so write-only directories can be removed
    pub fn remove(self) -> anyhow::Result<()> {
        relax_dir_mode(&self.root)?;
        fs::remove_dir_all(&self.root)
            .context(format!("failed to remove sandbox {:?}", self.root))?;
        debug!("sandbox {:?} removed", self.root);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::DirBuilderExt;

    #[test]
    fn test_sandbox_paths() -> anyhow::Result<()> {
        let sandbox = Sandbox::create()?;
        let root = sandbox.root().to_owned();
        assert!(root.is_dir());
        let dir_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(dir_name.starts_with(SANDBOX_PREFIX));
        assert_eq!(
            sandbox.end_point(),
            format!("unix://{}", root.join("csi.sock").display())
        );
        assert_eq!(sandbox.target_path(), root.join("targetPath"));
        assert_eq!(sandbox.staging_path(), root.join("stagingPath"));
        assert!(!sandbox.target_path().exists());
        sandbox.remove()?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn test_sandboxes_are_distinct() -> anyhow::Result<()> {
        let first = Sandbox::create()?;
        let second = Sandbox::create()?;
        assert_ne!(first.end_point(), second.end_point());
        assert_ne!(first.target_path(), second.target_path());
        assert_ne!(first.staging_path(), second.staging_path());
        first.remove()?;
        second.remove()?;
        Ok(())
    }

    #[test]
    fn test_remove_write_only_dirs() -> anyhow::Result<()> {
        let sandbox = Sandbox::create()?;
        let nested = sandbox.target_path().join("target");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o300)
            .create(&nested)?;
        let root = sandbox.root().to_owned();
        sandbox.remove()?;
        assert!(!root.exists());
        Ok(())
    }
}
