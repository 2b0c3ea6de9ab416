//! Entry into the container's namespaces.
//!
//! All namespace file descriptors are opened before the first setns(2) so
//! the remaining opens are not affected by namespaces already joined. The
//! user namespace is applied first (id mappings must be in effect before the
//! other namespaces are interpreted) and the mount namespace last.

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use color_eyre::eyre::Context;
use color_eyre::Result;
use nix::sched::{setns, CloneFlags};
use tracing::{debug, trace};

const NAMESPACES: [(&str, CloneFlags); 7] = [
    ("user", CloneFlags::CLONE_NEWUSER),
    ("cgroup", CloneFlags::CLONE_NEWCGROUP),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

/// Join the namespaces of `pid`. Namespaces the calling process already
/// shares with the target are skipped, as are kinds the running kernel does
/// not expose.
pub fn enter_namespaces_of(pid: i32) -> Result<()> {
    debug!("Entering namespaces of process {pid}");

    let mut pending: Vec<(&str, CloneFlags, File)> = Vec::with_capacity(NAMESPACES.len());
    for (name, flag) in NAMESPACES {
        let theirs = format!("/proc/{pid}/ns/{name}");
        if !std::path::Path::new(&theirs).exists() {
            trace!("Kernel does not expose {name} namespaces, skipping");
            continue;
        }
        if same_namespace(&format!("/proc/self/ns/{name}"), &theirs)? {
            trace!("Already in the {name} namespace of {pid}, skipping");
            continue;
        }
        let file =
            File::open(&theirs).with_context(|| format!("Failed to open namespace {theirs}"))?;
        pending.push((name, flag, file));
    }

    for (name, flag, file) in pending {
        setns(&file, flag)
            .with_context(|| format!("Failed to enter {name} namespace of process {pid}"))?;
        trace!("Entered {name} namespace");
    }

    debug!("Successfully entered namespaces of process {pid}");
    Ok(())
}

/// Two namespace links denote the same namespace iff they resolve to the
/// same inode on the nsfs.
fn same_namespace(ours: &str, theirs: &str) -> Result<bool> {
    let a = std::fs::metadata(ours).with_context(|| format!("Failed to stat {ours}"))?;
    let b = std::fs::metadata(theirs).with_context(|| format!("Failed to stat {theirs}"))?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_namespaces_compare_equal() {
        assert!(same_namespace("/proc/self/ns/mnt", "/proc/self/ns/mnt").unwrap());
    }

    #[test]
    fn test_entering_own_namespaces_is_a_noop() {
        // Every kind is skipped because the target is ourselves.
        enter_namespaces_of(std::process::id() as i32).unwrap();
    }
}
