//! The container-side activation pipeline behind `start-ssh-daemon`.
//!
//! Runs at `createContainer`, after the runtime forked the container's init
//! but before it executes the user command. The pipeline enters the
//! container's namespaces, injects the Dropbear binaries and the user's key
//! material, reconciles `/etc/passwd`, installs the login-time environment
//! plumbing, and hands off to the daemon launcher. Step order is
//! load-bearing; see the per-step comments.

use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indoc::formatdoc;
use nix::unistd::{Gid, Uid};
use tracing::{debug, error, info};

use crate::config;
use crate::daemon;
use crate::identity::{become_user, chown_to};
use crate::keystore::{keystore_of_uid, KeyStore, AUTHORIZED_KEYS_FILE, HOST_KEY_FILE, USER_KEY_FILE};
use crate::namespaces::enter_namespaces_of;
use crate::overlay::OverlayDirs;
use crate::passwd::PasswdDb;
use crate::state::BundleState;

/// Hook-owned location inside the rootfs; not expected to exist in any sane
/// base image.
pub const DROPBEAR_DIR_IN_CONTAINER: &str = "/opt/oci-hooks/dropbear";

/// Interpret the absolute in-container path `path` under `rootfs`.
pub(crate) fn join_rootfs(rootfs: &Utf8Path, path: &str) -> Utf8PathBuf {
    rootfs.join(path.trim_start_matches('/'))
}

/// `start-ssh-daemon` subcommand body: steps 2–10 of the injection pipeline
/// (step 1, state consumption, happens in the caller before logging is
/// reconfigured).
pub fn run(state: &BundleState) -> Result<()> {
    info!("Activating SSH in container");

    // Environment validation happens before any namespace work so that
    // configuration errors exit without side effects.
    let dropbear_dir = config::dropbear_dir()?;
    let server_port = config::server_port()?;
    let keystore = keystore_of_uid(state.uid)?;

    let uid = Uid::from_raw(state.uid);
    let gid = Gid::from_raw(state.gid);

    enter_namespaces_of(state.container_pid)?;

    // The home lookup rejects bogus passwd entries before the rootfs is
    // touched.
    let home = container_home(&state.rootfs_dir, state.uid)?;

    copy_dropbear_into_container(&dropbear_dir, &state.rootfs_dir)?;
    let ssh_dir = setup_ssh_dir(state, &home, uid, gid)?;
    copy_keys_into_container(&keystore, &ssh_dir, uid, gid)?;
    patch_passwd_if_necessary(&state.rootfs_dir)?;
    create_environment_file(state)?;
    create_etc_profile_module(&state.rootfs_dir)?;
    create_ssh_executable(&state.rootfs_dir, server_port)?;

    daemon::start(&state.rootfs_dir, uid, gid, &home, server_port)?;

    info!("Successfully activated SSH in container");
    Ok(())
}

/// Home directory of `uid` as recorded in the container's `/etc/passwd`.
/// Empty and `/nonexistent` homes have no place to mount keys over.
fn container_home(rootfs: &Utf8Path, uid: u32) -> Result<String> {
    let passwd = PasswdDb::load(&join_rootfs(rootfs, "/etc/passwd"))?;
    let home = passwd
        .home_of(uid)
        .ok_or_else(|| eyre!("No entry for uid {uid} in container's /etc/passwd"))?;
    if home.is_empty() || home == "/nonexistent" {
        error!("Found invalid home directory in container's /etc/passwd for uid {uid}: {home:?}");
        return Err(eyre!(
            "Invalid home directory {home:?} in container's /etc/passwd for uid {uid}"
        ));
    }
    debug!("Container home of uid {uid} is {home}");
    Ok(home.to_string())
}

/// Copy `dropbear` and `dbclient` from the host staging directory into the
/// hook-owned path in the rootfs, preserving the executable bit.
fn copy_dropbear_into_container(dropbear_dir: &Utf8Path, rootfs: &Utf8Path) -> Result<()> {
    let target_bin = join_rootfs(rootfs, DROPBEAR_DIR_IN_CONTAINER).join("bin");
    debug!("Copying Dropbear binaries into container under {target_bin}");
    std::fs::create_dir_all(&target_bin)
        .with_context(|| format!("Failed to create directory {target_bin}"))?;

    for binary in ["dbclient", "dropbear"] {
        let src = dropbear_dir.join("bin").join(binary);
        let dst = target_bin.join(binary);
        remove_existing(&dst)?;
        // fs::copy carries the source permissions, including the exec bit.
        std::fs::copy(&src, &dst).with_context(|| format!("Failed to copy {src} to {dst}"))?;
    }
    Ok(())
}

/// Create `~/.ssh` with the user's own permissions, then hide it behind a
/// bundle-scoped overlay so the host home is never modified.
fn setup_ssh_dir(state: &BundleState, home: &str, uid: Uid, gid: Gid) -> Result<Utf8PathBuf> {
    let ssh_dir = join_rootfs(&state.rootfs_dir, home).join(".ssh");
    debug!("Setting up directory for SSH keys in container under {ssh_dir}");

    let guard = become_user(uid, gid)?;
    let created = std::fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("Failed to create {ssh_dir} as uid {uid}"));
    guard.restore()?;
    created?;

    let overlay = OverlayDirs::create(&state.bundle_dir, uid, gid)?;
    overlay.mount_over(&ssh_dir)?;
    Ok(ssh_dir)
}

/// Copy the key triple from the host keystore into the overlay-mounted
/// `.ssh`, owned by the container user.
fn copy_keys_into_container(
    keystore: &KeyStore,
    ssh_dir: &Utf8Path,
    uid: Uid,
    gid: Gid,
) -> Result<()> {
    debug!("Copying SSH keys into container");
    for name in [HOST_KEY_FILE, USER_KEY_FILE, AUTHORIZED_KEYS_FILE] {
        let src = keystore.dir().join(name);
        let dst = ssh_dir.join(name);
        remove_existing(&dst)?;
        std::fs::copy(&src, &dst).with_context(|| format!("Failed to copy {src} to {dst}"))?;
        chown_to(&dst, uid, gid)?;
    }
    Ok(())
}

/// Rewrite `/etc/passwd` entries whose command interpreter does not exist in
/// the rootfs. An untouched database is not rewritten at all.
fn patch_passwd_if_necessary(rootfs: &Utf8Path) -> Result<()> {
    debug!("Patching container's /etc/passwd if necessary (ensure that command interpreter is valid)");
    let passwd_path = join_rootfs(rootfs, "/etc/passwd");
    let mut passwd = PasswdDb::load(&passwd_path)?;
    let patched = passwd.patch_missing_shells(rootfs);
    if patched > 0 {
        debug!("Rewrote the shell of {patched} passwd entries to /bin/sh");
        passwd.write_to(&passwd_path)?;
    }
    Ok(())
}

/// Render `process.env` as a sourceable script. SSH sessions do not inherit
/// the OCI environment block, so login shells replay it from here. Values
/// are emitted literally between double quotes.
fn create_environment_file(state: &BundleState) -> Result<()> {
    let path = join_rootfs(&state.rootfs_dir, DROPBEAR_DIR_IN_CONTAINER).join("environment");
    debug!("Creating script to export container environment upon login in {path}");

    let mut script = String::from("#!/bin/sh\n");
    for (key, value) in &state.env {
        script.push_str(&format!("export {key}=\"{value}\"\n"));
    }
    write_script(&path, &script, 0o755)
}

/// Install the login hook: `/etc/profile.d` scripts run for login shells,
/// which is exactly the path SSH sessions take.
fn create_etc_profile_module(rootfs: &Utf8Path) -> Result<()> {
    let path = join_rootfs(rootfs, "/etc/profile.d/ssh-hook.sh");
    debug!("Creating module in container's /etc/profile.d");

    let script = formatdoc! {"
        #!/bin/sh
        if [ \"$SSH_CONNECTION\" ]; then
            . {DROPBEAR_DIR_IN_CONTAINER}/environment
        fi
    "};
    write_script(&path, &script, 0o644)
}

/// Overwrite `/usr/bin/ssh` with a dbclient shim so tools inside the
/// container can keep using the familiar binary name.
fn create_ssh_executable(rootfs: &Utf8Path, port: u16) -> Result<()> {
    let path = join_rootfs(rootfs, "/usr/bin/ssh");
    debug!("Creating ssh binary (shell script) in container");

    let script = formatdoc! {"
        #!/bin/sh
        {DROPBEAR_DIR_IN_CONTAINER}/bin/dbclient -y -p {port} \"$@\"
    "};
    write_script(&path, &script, 0o755)
}

fn write_script(path: &Utf8Path, contents: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {parent}"))?;
    }
    remove_existing(path)?;
    std::fs::write(path, contents).with_context(|| format!("Failed to write {path}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {path}"))?;
    Ok(())
}

fn remove_existing(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove existing {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BundleState;

    fn rootfs_fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = Utf8Path::from_path(tmp.path()).unwrap().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        (tmp, rootfs)
    }

    fn state_with_env(rootfs: &Utf8Path, env: Vec<(String, String)>) -> BundleState {
        BundleState {
            bundle_dir: rootfs.parent().unwrap().to_owned(),
            container_pid: 1,
            rootfs_dir: rootfs.to_owned(),
            uid: 1000,
            gid: 1000,
            env,
            log_override: None,
        }
    }

    #[test]
    fn test_join_rootfs_strips_leading_slash() {
        assert_eq!(
            join_rootfs(Utf8Path::new("/rootfs"), "/home/alice"),
            Utf8Path::new("/rootfs/home/alice")
        );
        assert_eq!(
            join_rootfs(Utf8Path::new("/rootfs"), "etc/passwd"),
            Utf8Path::new("/rootfs/etc/passwd")
        );
    }

    #[test]
    fn test_container_home_resolution() {
        let (_tmp, rootfs) = rootfs_fixture();
        std::fs::write(
            rootfs.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nalice:x:1000:1000::/home/alice:/bin/bash\n",
        )
        .unwrap();

        assert_eq!(container_home(&rootfs, 1000).unwrap(), "/home/alice");
        assert!(container_home(&rootfs, 4242).is_err());
    }

    #[test]
    fn test_container_home_rejects_invalid_homes() {
        let (_tmp, rootfs) = rootfs_fixture();
        std::fs::write(
            rootfs.join("etc/passwd"),
            "nobody:x:65534:65534::/nonexistent:/bin/sh\nsync:x:4:65534:sync::/bin/sync\n",
        )
        .unwrap();

        assert!(container_home(&rootfs, 65534).is_err());
        assert!(container_home(&rootfs, 4).is_err());
    }

    #[test]
    fn test_environment_file_rendering() {
        let (_tmp, rootfs) = rootfs_fixture();
        let state = state_with_env(
            &rootfs,
            vec![
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("GREETING".into(), "hello world".into()),
            ],
        );

        create_environment_file(&state).unwrap();
        let path = rootfs.join("opt/oci-hooks/dropbear/environment");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "#!/bin/sh\nexport PATH=\"/usr/bin:/bin\"\nexport GREETING=\"hello world\"\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_empty_environment_renders_shebang_only() {
        let (_tmp, rootfs) = rootfs_fixture();
        let state = state_with_env(&rootfs, Vec::new());

        create_environment_file(&state).unwrap();
        let contents =
            std::fs::read_to_string(rootfs.join("opt/oci-hooks/dropbear/environment")).unwrap();
        assert_eq!(contents, "#!/bin/sh\n");
    }

    #[test]
    fn test_environment_value_quotes_are_left_literal() {
        let (_tmp, rootfs) = rootfs_fixture();
        let state = state_with_env(&rootfs, vec![("MOTD".into(), "say \"hi\"".into())]);

        create_environment_file(&state).unwrap();
        let contents =
            std::fs::read_to_string(rootfs.join("opt/oci-hooks/dropbear/environment")).unwrap();
        // Preserved behavior: embedded quotes produce a broken line rather
        // than being escaped.
        assert_eq!(contents, "#!/bin/sh\nexport MOTD=\"say \"hi\"\"\n");
    }

    #[test]
    fn test_profile_module_guards_on_ssh_connection() {
        let (_tmp, rootfs) = rootfs_fixture();
        create_etc_profile_module(&rootfs).unwrap();

        let path = rootfs.join("etc/profile.d/ssh-hook.sh");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "#!/bin/sh\n\
             if [ \"$SSH_CONNECTION\" ]; then\n    \
                 . /opt/oci-hooks/dropbear/environment\n\
             fi\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_ssh_shim_overwrites_existing_binary() {
        let (_tmp, rootfs) = rootfs_fixture();
        std::fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        std::fs::write(rootfs.join("usr/bin/ssh"), "ELF...").unwrap();

        create_ssh_executable(&rootfs, 2222).unwrap();
        let path = rootfs.join("usr/bin/ssh");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "#!/bin/sh\n/opt/oci-hooks/dropbear/bin/dbclient -y -p 2222 \"$@\"\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_copy_dropbear_preserves_exec_bit() {
        let (_tmp, rootfs) = rootfs_fixture();
        let host = rootfs.parent().unwrap().join("dropbear");
        std::fs::create_dir_all(host.join("bin")).unwrap();
        for binary in ["dropbear", "dbclient"] {
            let path = host.join("bin").join(binary);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        copy_dropbear_into_container(&host, &rootfs).unwrap();
        for binary in ["dropbear", "dbclient"] {
            let copied = rootfs.join("opt/oci-hooks/dropbear/bin").join(binary);
            assert!(copied.is_file());
            let mode = std::fs::metadata(&copied).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_patch_passwd_leaves_untouched_database_alone() {
        let (_tmp, rootfs) = rootfs_fixture();
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        std::fs::write(rootfs.join("bin/sh"), "").unwrap();
        let original = "root:x:0:0:root:/root:/bin/sh\n";
        std::fs::write(rootfs.join("etc/passwd"), original).unwrap();
        let mtime_before = std::fs::metadata(rootfs.join("etc/passwd"))
            .unwrap()
            .modified()
            .unwrap();

        patch_passwd_if_necessary(&rootfs).unwrap();
        let after = std::fs::read_to_string(rootfs.join("etc/passwd")).unwrap();
        assert_eq!(after, original);
        let mtime_after = std::fs::metadata(rootfs.join("etc/passwd"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn test_patch_passwd_rewrites_missing_shells() {
        let (_tmp, rootfs) = rootfs_fixture();
        std::fs::write(
            rootfs.join("etc/passwd"),
            "alice:x:1000:1000::/home/alice:/bin/bash\n",
        )
        .unwrap();

        patch_passwd_if_necessary(&rootfs).unwrap();
        let after = std::fs::read_to_string(rootfs.join("etc/passwd")).unwrap();
        assert_eq!(after, "alice:x:1000:1000::/home/alice:/bin/sh\n");
    }
}
