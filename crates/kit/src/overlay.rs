//! Bundle-scoped overlayfs over the container's `~/.ssh`.
//!
//! Writing keys straight into the home directory would leak into the host
//! whenever `/home` is bind-mounted into the container, so an overlay backed
//! by bundle-owned directories confines the writes to the container's
//! lifetime: the runtime reclaims the bundle (and with it the upper layer)
//! when the container is removed.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use nix::mount::{mount, MsFlags};
use nix::unistd::{Gid, Uid};
use tracing::debug;

use crate::identity::chown_to;

/// The lower/upper/work triple under `⟨bundle⟩/overlay/`.
#[derive(Debug)]
pub struct OverlayDirs {
    lower: Utf8PathBuf,
    upper: Utf8PathBuf,
    work: Utf8PathBuf,
}

impl OverlayDirs {
    /// Create the triple. The lower layer stays empty; the upper layer is
    /// owned by the target user so files written through the mount get the
    /// right ownership.
    pub fn create(bundle_dir: &Utf8Path, uid: Uid, gid: Gid) -> Result<Self> {
        let base = bundle_dir.join("overlay");
        let dirs = Self {
            lower: base.join("ssh-lower"),
            upper: base.join("ssh-upper"),
            work: base.join("ssh-work"),
        };
        for dir in [&dirs.lower, &dirs.upper, &dirs.work] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create overlay directory {dir}"))?;
        }
        chown_to(&dirs.upper, uid, gid)?;
        Ok(dirs)
    }

    /// Mount the overlay onto `target`.
    pub fn mount_over(&self, target: &Utf8Path) -> Result<()> {
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower, self.upper, self.work
        );
        debug!("Mounting overlayfs ({data}) on {target}");
        mount(
            Some("overlay"),
            target.as_std_path(),
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_context(|| format!("Failed to mount overlayfs on {target}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getegid, geteuid};

    #[test]
    fn test_create_builds_triple_under_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = Utf8Path::from_path(tmp.path()).unwrap();

        let dirs = OverlayDirs::create(bundle, geteuid(), getegid()).unwrap();
        assert!(dirs.lower.is_dir());
        assert!(dirs.upper.is_dir());
        assert!(dirs.work.is_dir());
        assert!(dirs.lower.starts_with(bundle.join("overlay")));
        // The lower layer must stay empty.
        assert_eq!(std::fs::read_dir(&dirs.lower).unwrap().count(), 0);
    }
}
