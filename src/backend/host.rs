//! Host resources: memory, storage, CPU

use crate::error::{Result, ResultExt, StreamError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use sysinfo::System;

/// Prefix of per-link output directories under the output root
pub const OUTPUT_PREFIX: &str = "afhba.";

/// Filesystem types that live in RAM
const VOLATILE_FS: [&str; 2] = ["tmpfs", "ramfs"];

/// Host resource queries
pub trait HostSystem: Send + Sync {
    /// Free physical memory in bytes
    fn free_memory(&self) -> Result<u64>;

    /// True if `path` lives on a RAM-backed filesystem
    fn is_volatile(&self, path: &Path) -> Result<bool>;

    /// Remove stale `afhba.*` output under `root`
    fn purge_outputs(&self, root: &Path) -> Result<()>;

    /// Global CPU usage in percent since the previous call
    fn cpu_usage(&self) -> f32;
}

/// The machine this process runs on
pub struct LocalHost {
    mounts_file: PathBuf,
    sudo: bool,
    system: Mutex<System>,
}

impl LocalHost {
    pub fn new(mounts_file: impl Into<PathBuf>, sudo: bool) -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first reading has a baseline
        system.refresh_cpu_usage();
        Self {
            mounts_file: mounts_file.into(),
            sudo,
            system: Mutex::new(system),
        }
    }
}

/// Filesystem type of the mount containing `path`
///
/// `mounts` is in `/proc/mounts` format. The longest matching mount point wins.
pub fn mount_fs_type<'a>(mounts: &'a str, path: &Path) -> Option<&'a str> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            path.starts_with(mount_point)
                .then_some((mount_point.len(), fs_type))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, fs_type)| fs_type)
}

impl HostSystem for LocalHost {
    fn free_memory(&self) -> Result<u64> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| StreamError::Internal("sysinfo lock poisoned".to_string()))?;
        system.refresh_memory();
        Ok(system.free_memory())
    }

    fn is_volatile(&self, path: &Path) -> Result<bool> {
        let mounts = fs::read_to_string(&self.mounts_file)
            .with_context(|| format!("Reading {}", self.mounts_file.display()))?;
        Ok(mount_fs_type(&mounts, path).is_some_and(|fs| VOLATILE_FS.contains(&fs)))
    }

    fn purge_outputs(&self, root: &Path) -> Result<()> {
        if self.sudo {
            let command = format!("sudo rm -rf {}/{}*", root.display(), OUTPUT_PREFIX);
            let status = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status()
                .with_context(|| format!("Failed to execute: {}", command))?;
            if !status.success() {
                return Err(StreamError::Internal(format!("'{}' exited with {}", command, status)));
            }
            return Ok(());
        }

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StreamError::Io(e).with_context(format!("Listing {}", root.display()))),
        };
        for entry in entries.flatten() {
            let is_output = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(OUTPUT_PREFIX));
            if !is_output {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.with_context(|| format!("Removing {}", path.display()))?;
        }
        Ok(())
    }

    fn cpu_usage(&self) -> f32 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu_usage();
                system.global_cpu_usage()
            }
            Err(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/sda1 / ext4 rw,relatime 0 0
tmpfs /mnt tmpfs rw,size=64g 0 0
/dev/sdb1 /mnt/archive xfs rw 0 0
";

    #[test]
    fn test_mount_fs_type_longest_prefix() {
        assert_eq!(mount_fs_type(MOUNTS, Path::new("/mnt")), Some("tmpfs"));
        assert_eq!(mount_fs_type(MOUNTS, Path::new("/mnt/afhba.0")), Some("tmpfs"));
        assert_eq!(mount_fs_type(MOUNTS, Path::new("/mnt/archive/x")), Some("xfs"));
        assert_eq!(mount_fs_type(MOUNTS, Path::new("/home")), Some("ext4"));
        // Component-wise: /mntx is not under /mnt
        assert_eq!(mount_fs_type(MOUNTS, Path::new("/mntx")), Some("ext4"));
    }

    #[test]
    fn test_is_volatile_reads_mounts_file() {
        let dir = TempDir::new().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, MOUNTS).unwrap();

        let host = LocalHost::new(&mounts, false);
        assert!(host.is_volatile(Path::new("/mnt")).unwrap());
        assert!(!host.is_volatile(Path::new("/mnt/archive")).unwrap());
    }

    #[test]
    fn test_purge_outputs_only_removes_link_dirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("afhba.0/acq2106_007")).unwrap();
        fs::create_dir_all(dir.path().join("afhba.12")).unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();

        let host = LocalHost::new("/proc/mounts", false);
        host.purge_outputs(dir.path()).unwrap();

        assert!(!dir.path().join("afhba.0").exists());
        assert!(!dir.path().join("afhba.12").exists());
        assert!(dir.path().join("keep").exists());
    }

    #[test]
    fn test_free_memory_is_reported() {
        let host = LocalHost::new("/proc/mounts", false);
        assert!(host.free_memory().unwrap() > 0);
    }
}
