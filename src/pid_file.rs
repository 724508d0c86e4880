//! PID file handling and privilege dropping.

use anyhow::Context;
use std::path::{Path, PathBuf};

/// Writes the process id on creation, removes the file on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<PidFile> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {:?}", path))?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("could not remove pid file {:?}: {}", self.path, e);
        }
    }
}

/// Drop root privileges after the listeners are bound. Group first - once
/// the uid is gone, setgid is no longer permitted.
pub fn drop_privileges(uid: u32, gid: u32) -> anyhow::Result<()> {
    // SAFETY: setgid/setuid take plain integers and touch no memory
    unsafe {
        if libc::setgid(gid) != 0 {
            return Err(std::io::Error::last_os_error()).context("setgid failed");
        }
        if libc::setuid(uid) != 0 {
            return Err(std::io::Error::last_os_error()).context("setuid failed");
        }
    }
    tracing::info!("dropped privileges to {}:{}", uid, gid);
    Ok(())
}
