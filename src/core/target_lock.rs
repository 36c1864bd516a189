//! Exclusive per-target lock shared by every shipgate process on a host.
//!
//! `serve` and `run` both drive a DeploymentTarget and append to the same
//! run logs. Holding `<home>/locks/<target>.lock` keeps a second process
//! from doing either while the first is alive.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tracing::debug;

/// Held for as long as this process owns the target; released on drop
#[derive(Debug)]
pub struct TargetLock {
    path: PathBuf,
    _file: File,
}

impl TargetLock {
    /// Take the lock for `target`, failing at once if another process holds it
    pub fn acquire(home: &Path, target: &str) -> Result<Self> {
        let dir = home.join("locks");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock directory: {}", dir.display()))?;

        let path = dir.join(format!("{}.lock", target));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "Target '{}' is in use by another shipgate process (lock: {})",
                target,
                path.display()
            );
        }

        // Owner pid, for operators only
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = %path.display(), "Target lock acquired");

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
