//! Mount helpers for lustre and bind mounts

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use nix::mount::{self, MntFlags, MsFlags};
use nix::unistd;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

/// The mount table of the current process
const MOUNT_INFO_PATH: &str = "/proc/self/mountinfo";
/// The mount command used for lustre, the kernel needs `mount.lustre` to parse the NID
const MOUNT_COMMAND: &str = "mount";

/// Mount operations needed by the node service
pub trait Mounter: Send + Sync + std::fmt::Debug {
    /// Mount `source` of `fs_type` at `target` with mount options
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> anyhow::Result<()>;

    /// Bind mount `source` at `target`
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> anyhow::Result<()>;

    /// Un-mount `target`, if fail try force un-mount again
    fn unmount(&self, target: &Path) -> anyhow::Result<()>;

    /// Check whether `target` is a mount point
    fn is_mount_point(&self, target: &Path) -> anyhow::Result<bool>;
}

/// Mounter backed by the kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct LustreMounter;

impl LustreMounter {
    /// Create `LustreMounter`
    pub const fn new() -> Self {
        Self
    }

    /// Check the caller is privileged to mount
    fn check_root(op: &str) -> anyhow::Result<()> {
        if unistd::geteuid().is_root() {
            Ok(())
        } else {
            Err(anyhow!("{} requires root privilege", op))
        }
    }
}

impl Mounter for LustreMounter {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> anyhow::Result<()> {
        Self::check_root("mount")?;
        let mut mount_cmd = Command::new(MOUNT_COMMAND);
        let _ = mount_cmd.arg("-t").arg(fs_type);
        if !options.is_empty() {
            let _ = mount_cmd.arg("-o").arg(options.join(","));
        }
        let _ = mount_cmd.arg(source).arg(target);
        debug!("mount command: {:?}", mount_cmd);
        let output = mount_cmd
            .output()
            .context(format!("{} command failed to start", MOUNT_COMMAND))?;
        if !output.status.success() {
            return Err(anyhow!(
                "failed to mount {} to {:?}, the error is: {}",
                source,
                target,
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        info!("mounted {} to {:?}", source, target);
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> anyhow::Result<()> {
        Self::check_root("bind mount")?;
        mount::mount::<Path, Path, str, str>(Some(source), target, None, MsFlags::MS_BIND, None)
            .context(format!("failed to bind mount {:?} to {:?}", source, target))?;
        if read_only {
            // MS_RDONLY is ignored on the initial bind, it only takes effect on remount
            mount::mount::<Path, Path, str, str>(
                None,
                target,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None,
            )
            .context(format!("failed to remount {:?} read-only", target))?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        Self::check_root("un-mount")?;
        if let Err(umount_e) = mount::umount(target) {
            if let Err(umount_force_e) = mount::umount2(target, MntFlags::MNT_FORCE) {
                return Err(anyhow!(
                    "failed to un-mount the target path={:?}, \
                        the un-mount error is: {:?} and the force un-mount error is: {}",
                    target,
                    umount_e,
                    umount_force_e,
                ));
            }
            warn!("force un-mounted {:?}", target);
        }
        Ok(())
    }

    fn is_mount_point(&self, target: &Path) -> anyhow::Result<bool> {
        let target = match fs::canonicalize(target) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).context(format!("failed to canonicalize {:?}", target));
            }
        };
        let mount_info = fs::read_to_string(MOUNT_INFO_PATH)
            .context(format!("failed to read {}", MOUNT_INFO_PATH))?;
        Ok(parse_mount_points(&mount_info).any(|p| p == target))
    }
}

/// Iterate the mount points of a mountinfo table
fn parse_mount_points(mount_info: &str) -> impl Iterator<Item = PathBuf> + '_ {
    // The fifth field is the mount point, with space, tab, newline and backslash octal escaped
    mount_info
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|p| PathBuf::from(unescape_octal(p)))
}

/// Decode `\NNN` octal escapes used by the kernel in mountinfo
fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('\\') {
        out.push_str(&rest[..idx]);
        let escaped = rest.get(idx.saturating_add(1)..idx.saturating_add(4));
        match escaped.and_then(|oct| u8::from_str_radix(oct, 8).ok()) {
            Some(b) => {
                out.push(char::from(b));
                rest = &rest[idx.saturating_add(4)..];
            }
            None => {
                out.push('\\');
                rest = &rest[idx.saturating_add(1)..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Mounter that only records mounts in memory
#[derive(Debug, Default)]
pub struct FakeMounter {
    /// Mount target to mount source
    mounts: Mutex<HashMap<PathBuf, String>>,
}

impl FakeMounter {
    /// Create `FakeMounter`
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mount
    fn record(&self, source: String, target: &Path) -> anyhow::Result<()> {
        let mut mounts = self
            .mounts
            .lock()
            .map_err(|e| anyhow!("mount table lock poisoned: {}", e))?;
        debug!("fake mount {} to {:?}", source, target);
        let _ = mounts.insert(target.to_owned(), source);
        Ok(())
    }
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        _options: &[String],
    ) -> anyhow::Result<()> {
        debug!("fake mount of type {}", fs_type);
        self.record(source.to_owned(), target)
    }

    fn bind_mount(&self, source: &Path, target: &Path, _read_only: bool) -> anyhow::Result<()> {
        self.record(source.display().to_string(), target)
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        let mut mounts = self
            .mounts
            .lock()
            .map_err(|e| anyhow!("mount table lock poisoned: {}", e))?;
        if mounts.remove(target).is_none() {
            return Err(anyhow!("{:?} is not mounted", target));
        }
        Ok(())
    }

    fn is_mount_point(&self, target: &Path) -> anyhow::Result<bool> {
        let mounts = self
            .mounts
            .lock()
            .map_err(|e| anyhow!("mount table lock poisoned: {}", e))?;
        Ok(mounts.contains_key(target))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_mount_points() {
        let mount_info = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
97 22 0:45 / /mnt/with\\040space rw - lustre 10.0.0.4@tcp:/lustrefs rw
";
        let points: Vec<PathBuf> = parse_mount_points(mount_info).collect();
        assert_eq!(
            points,
            vec![PathBuf::from("/"), PathBuf::from("/mnt/with space")]
        );
        assert_eq!(unescape_octal("a\\bc"), "a\\bc");
    }

    #[test]
    fn test_fake_mounter() -> anyhow::Result<()> {
        let mounter = FakeMounter::new();
        let staging = Path::new("/staging");
        let target = Path::new("/target");
        assert!(!mounter.is_mount_point(staging)?);

        mounter.mount("127.0.0.1@tcp:/test", staging, "lustre", &[])?;
        mounter.bind_mount(staging, target, true)?;
        assert!(mounter.is_mount_point(staging)?);
        assert!(mounter.is_mount_point(target)?);

        mounter.unmount(target)?;
        assert!(!mounter.is_mount_point(target)?);
        assert!(mounter.unmount(target).is_err());
        Ok(())
    }
}
