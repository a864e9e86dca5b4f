//! Launching and killing data-mover processes
//!
//! [`ProcessLauncher`] is the seam for everything that touches host
//! processes or output directories. [`ShellLauncher`] spawns `sh -c` with
//! the child detached into a new session.

use crate::error::{Result, ResultExt, StreamError};
use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Host process control
pub trait ProcessLauncher: Send + Sync {
    /// Start a shell command detached from this process
    ///
    /// Returns as soon as the shell is running; liveness of the data-mover
    /// is observed through the link registry.
    fn spawn_detached(&self, command: &str) -> Result<()>;

    /// Force-kill a process
    fn kill(&self, pid: u32) -> Result<()>;

    /// Create an output directory writable by everyone
    fn prepare_dir(&self, dir: &Path) -> Result<()>;

    /// Create an empty file writable by everyone, if it does not exist
    fn touch(&self, file: &Path) -> Result<()>;
}

/// Production launcher using `sh -c`
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher {
    /// Use `sudo` for directory creation and kills
    pub sudo: bool,
}

impl ShellLauncher {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn run(&self, command: &str) -> Result<()> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute: {}", command))?;
        if status.success() {
            Ok(())
        } else {
            Err(StreamError::Internal(format!("'{}' exited with {}", command, status)))
        }
    }
}

impl ProcessLauncher for ShellLauncher {
    fn spawn_detached(&self, command: &str) -> Result<()> {
        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and touches no parent state
        unsafe {
            shell.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = shell
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", command))?;

        // Reap the shell when it exits so it does not linger as a zombie
        std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                let _ = child.wait();
            })?;
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        if self.sudo {
            return self.run(&format!("sudo kill -9 {}", pid));
        }
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if ret == 0 {
            Ok(())
        } else {
            Err(StreamError::Io(std::io::Error::last_os_error()).with_context(format!("kill {}", pid)))
        }
    }

    fn prepare_dir(&self, dir: &Path) -> Result<()> {
        if self.sudo {
            return self.run(&format!("sudo mkdir -p {} -m 0777", dir.display()));
        }
        fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("chmod {}", dir.display()))
    }

    fn touch(&self, file: &Path) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .with_context(|| format!("touch {}", file.display()))?;
        fs::set_permissions(file, fs::Permissions::from_mode(0o666))
            .with_context(|| format!("chmod {}", file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_prepare_dir_and_touch() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("afhba.0/acq2106_007");
        let launcher = ShellLauncher::new(false);

        launcher.prepare_dir(&out).unwrap();
        assert!(out.is_dir());
        let mode = fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        let log = out.join("checker.log");
        launcher.touch(&log).unwrap();
        fs::write(&log, "ok\n").unwrap();
        // Touching again keeps the content
        launcher.touch(&log).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "ok\n");
    }

    #[test]
    fn test_spawn_detached_starts_new_session() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("stat");
        let launcher = ShellLauncher::new(false);

        launcher
            .spawn_detached(&format!(
                "read -r line < /proc/$$/stat; echo \"$$ $line\" > {0}.tmp && mv {0}.tmp {0}",
                out.display()
            ))
            .unwrap();

        let start = Instant::now();
        while !out.exists() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let text = fs::read_to_string(&out).unwrap();
        let pid: i32 = text.split_whitespace().next().unwrap().parse().unwrap();
        // Fields after the command name: state ppid pgrp session
        let fields: Vec<&str> = text[text.rfind(')').unwrap() + 1..].split_whitespace().collect();
        let session: i32 = fields[3].parse().unwrap();

        assert_eq!(session, pid);
        assert_ne!(session, unsafe { libc::getsid(0) });
    }

    #[test]
    fn test_spawn_detached_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let launcher = ShellLauncher::new(false);

        launcher
            .spawn_detached(&format!("touch {}", marker.display()))
            .unwrap();

        let start = Instant::now();
        while !marker.exists() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(marker.exists());
    }
}
