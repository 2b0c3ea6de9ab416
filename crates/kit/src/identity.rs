//! Temporary effective-identity switches.
//!
//! The in-container `~/.ssh` directory must be created with the target
//! user's permissions (the home may be a bind mount of a root_squashed
//! filesystem), so the hook briefly assumes the user's effective ids and
//! switches back afterwards. Only the effective ids change; the saved ids
//! keep the way back open.

use camino::Utf8Path;
use color_eyre::eyre::Context;
use color_eyre::Result;
use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use tracing::{trace, warn};

/// Guard restoring the previous effective identity. `restore` reports
/// failures; dropping without it falls back to a best-effort switch.
#[derive(Debug)]
pub struct IdentityGuard {
    saved_uid: Uid,
    saved_gid: Gid,
    restored: bool,
}

/// Assume `uid:gid` as the effective identity.
pub fn become_user(uid: Uid, gid: Gid) -> Result<IdentityGuard> {
    let saved_uid = geteuid();
    let saved_gid = getegid();
    trace!("Switching effective identity to {uid}:{gid}");

    setegid(gid).with_context(|| format!("Failed to setegid({gid})"))?;
    if let Err(e) = seteuid(uid) {
        let _ = setegid(saved_gid);
        return Err(e).with_context(|| format!("Failed to seteuid({uid})"));
    }

    Ok(IdentityGuard {
        saved_uid,
        saved_gid,
        restored: false,
    })
}

impl IdentityGuard {
    /// Switch back to the identity saved at construction. Uid first: only
    /// the privileged identity may change groups.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        trace!(
            "Restoring effective identity {}:{}",
            self.saved_uid,
            self.saved_gid
        );
        seteuid(self.saved_uid)
            .with_context(|| format!("Failed to seteuid({})", self.saved_uid))?;
        setegid(self.saved_gid)
            .with_context(|| format!("Failed to setegid({})", self.saved_gid))?;
        Ok(())
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if seteuid(self.saved_uid).is_err() || setegid(self.saved_gid).is_err() {
            warn!(
                "Failed to restore effective identity {}:{}",
                self.saved_uid, self.saved_gid
            );
        }
    }
}

/// Chown `path` to `uid:gid`.
pub fn chown_to(path: &Utf8Path, uid: Uid, gid: Gid) -> Result<()> {
    std::os::unix::fs::chown(path, Some(uid.as_raw()), Some(gid.as_raw()))
        .with_context(|| format!("Failed to change ownership of {path} to {uid}:{gid}"))
}
