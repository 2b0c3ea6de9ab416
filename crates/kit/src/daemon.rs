//! Launch of the Dropbear daemon inside the container.
//!
//! The daemon is spawned as a forked child whose pre-exec sequence runs, in
//! this order: chroot into the rootfs, drop the whole capability bounding
//! set, clear supplementary groups, set the real/effective/saved gid, then
//! uid, then no_new_privs, then exec. Capabilities go before the uid
//! transition so setuid cannot bring them back; no_new_privs goes after it
//! so the exec itself cannot re-escalate; the chroot comes first so the
//! capability drop cannot be escaped through a directory handle outside the
//! rootfs.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use tracing::{debug, info};

use crate::activate::DROPBEAR_DIR_IN_CONTAINER;
use crate::caps;
use crate::keystore::HOST_KEY_FILE;

/// Build the Dropbear argv: stderr logging, the injected host key (as seen
/// from inside the container), and the configured port.
fn dropbear_args(home_in_container: &str, port: u16) -> Vec<String> {
    vec![
        "-E".to_string(),
        "-r".to_string(),
        format!("{home_in_container}/.ssh/{HOST_KEY_FILE}"),
        "-p".to_string(),
        port.to_string(),
    ]
}

/// Start Dropbear inside `rootfs` as `uid:gid`, listening on `port`. A zero
/// exit status means the daemon forked itself into the background.
pub fn start(
    rootfs: &Utf8Path,
    uid: Uid,
    gid: Gid,
    home_in_container: &str,
    port: u16,
) -> Result<()> {
    debug!("Starting SSH daemon in container");

    let dropbear = format!("{DROPBEAR_DIR_IN_CONTAINER}/bin/dropbear");
    let mut cmd = Command::new(&dropbear);
    cmd.args(dropbear_args(home_in_container, port));

    let rootfs = rootfs.to_owned();
    // SAFETY: the closure only performs async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            std::os::unix::fs::chroot(rootfs.as_std_path())?;
            std::env::set_current_dir("/")?;
            caps::drop_bounding_set()?;
            setgroups(&[]).map_err(io::Error::from)?;
            setresgid(gid, gid, gid).map_err(io::Error::from)?;
            setresuid(uid, uid, uid).map_err(io::Error::from)?;
            caps::set_no_new_privs()?;
            Ok(())
        });
    }

    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute {dropbear}"))?;
    if !status.success() {
        return Err(eyre!("{dropbear} exited with status {status}"));
    }

    info!("Successfully started SSH daemon in container (port {port})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropbear_args_reference_in_container_paths() {
        let args = dropbear_args("/home/alice", 2222);
        assert_eq!(
            args,
            vec![
                "-E",
                "-r",
                "/home/alice/.ssh/dropbear_ecdsa_host_key",
                "-p",
                "2222",
            ]
        );
    }
}
