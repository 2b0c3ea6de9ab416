//! Advisory file locking for the keystore.
//!
//! Generation deletes and recreates the keystore directory while the lock is
//! held, so the lock must live outside that directory; callers pass a
//! sibling path. The lock is a plain exclusive flock(2) held for the
//! lifetime of the guard.

use std::fs::{File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use rustix::fs::{flock, FlockOperation};
use tracing::{debug, trace};

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct Lockfile {
    file: File,
    path: Utf8PathBuf,
}

impl Lockfile {
    /// Acquire the lock at `path`, blocking until it is available. The file
    /// is created if absent.
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        let file = Self::open(path)?;
        trace!("Acquiring lock {path}");
        flock(&file, FlockOperation::LockExclusive)
            .with_context(|| format!("Failed to lock {path}"))?;
        debug!("Acquired lock {path}");
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// Try to acquire the lock without blocking; `None` if another process
    /// holds it.
    pub fn try_acquire(path: &Utf8Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_owned(),
            })),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {path}")),
        }
    }

    fn open(path: &Utf8Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {path}"))
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        trace!("Releasing lock {}", self.path);
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}
