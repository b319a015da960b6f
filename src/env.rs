//! Facts about the calling process: working directory, host, and the pid that
//! owns the shell session.

use std::path::{Path, PathBuf};

use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Absolute working directory.
    pub cwd: PathBuf,
    pub hostname: String,
    pub process_id: u32,
    /// Pid shared by every command run from the same shell.
    pub session_pid: u32,
}

impl Environment {
    pub fn detect() -> std::io::Result<Self> {
        Ok(Self {
            cwd: std::env::current_dir()?,
            hostname: hostname(),
            process_id: std::process::id(),
            session_pid: session_owner_pid(),
        })
    }

    /// Same process facts, different working directory.
    pub fn with_cwd(mut self, cwd: &Path) -> std::io::Result<Self> {
        self.cwd = std::path::absolute(cwd)?;
        Ok(self)
    }

    pub fn with_session_pid(mut self, pid: u32) -> Self {
        self.session_pid = pid;
        self
    }
}

pub fn hostname() -> String {
    System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The parent shell's pid on Unix; this process's pid elsewhere.
pub fn session_owner_pid() -> u32 {
    #[cfg(unix)]
    {
        std::os::unix::process::parent_id()
    }
    #[cfg(not(unix))]
    {
        std::process::id()
    }
}
