//! Per-user host-side store of Dropbear key material.
//!
//! Layout: `⟨HOOK_BASE_DIR⟩/⟨username⟩/.oci-hooks/ssh/keys` holding the host
//! key, the user key, and the derived `authorized_keys`. The three files
//! co-exist or the store counts as absent. Mutation happens under an
//! exclusive lock held on a sibling lock file; every file reaches its final
//! name through a rename so readers never observe a partial write.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info};

use crate::command_run::CommandRun;
use crate::config;
use crate::lockfile::Lockfile;
use crate::passwd::PasswdDb;

pub const HOST_KEY_FILE: &str = "dropbear_ecdsa_host_key";
pub const USER_KEY_FILE: &str = "id_dropbear";
pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

const KEY_FILES: [&str; 3] = [HOST_KEY_FILE, USER_KEY_FILE, AUTHORIZED_KEYS_FILE];

/// Outcome of a generation request.
#[derive(Debug, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// A complete store was already present and `overwrite` was not given.
    AlreadyPresent,
    Generated,
}

/// A user's keystore directory on the host.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: Utf8PathBuf,
}

impl KeyStore {
    pub fn for_user(hook_base_dir: &Utf8Path, username: &str) -> Self {
        Self {
            dir: hook_base_dir.join(username).join(".oci-hooks/ssh/keys"),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn key_files(&self) -> [Utf8PathBuf; 3] {
        KEY_FILES.map(|name| self.dir.join(name))
    }

    /// Whether all three expected key files exist.
    pub fn is_complete(&self) -> bool {
        for path in self.key_files() {
            if !path.exists() {
                debug!("Expected SSH key file {path} not found");
                return false;
            }
        }
        debug!("Found SSH keys in {}", self.dir);
        true
    }

    /// Generate the key triple with the Dropbear key generator, replacing
    /// any existing store when `overwrite` is set.
    pub fn generate(&self, dropbear_dir: &Utf8Path, overwrite: bool) -> Result<GenerateOutcome> {
        let parent = self
            .dir
            .parent()
            .ok_or_else(|| eyre!("Keystore path {} has no parent directory", self.dir))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {parent}"))?;

        // Protect the keys from concurrent generation for the same user.
        let _lock = Lockfile::acquire(&parent.join("keys.lock"))?;

        if self.is_complete() && !overwrite {
            return Ok(GenerateOutcome::AlreadyPresent);
        }

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", self.dir));
            }
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory {}", self.dir))?;

        let keygen = dropbear_dir.join("bin/dropbearkey");
        self.keygen(&keygen, HOST_KEY_FILE)?;
        self.keygen(&keygen, USER_KEY_FILE)?;
        self.derive_authorized_keys(&keygen)?;

        Ok(GenerateOutcome::Generated)
    }

    /// Run `dropbearkey -t ecdsa` against a temporary name, then rename the
    /// key into place.
    fn keygen(&self, keygen: &Utf8Path, name: &str) -> Result<()> {
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        info!("Generating {target}");
        Command::new(keygen)
            .args(["-t", "ecdsa", "-f", tmp.as_str()])
            .run()
            .with_context(|| format!("Failed to generate key {target}"))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("Failed to move {tmp} into place"))?;
        Ok(())
    }

    /// Print the user key's public half and keep the first `ecdsa-` line as
    /// `authorized_keys`.
    fn derive_authorized_keys(&self, keygen: &Utf8Path) -> Result<()> {
        let user_key = self.dir.join(USER_KEY_FILE);
        let target = self.dir.join(AUTHORIZED_KEYS_FILE);
        info!("Generating \"authorized_keys\" file ({target})");

        let output = Command::new(keygen)
            .args(["-y", "-f", user_key.as_str()])
            .run_get_string()
            .with_context(|| format!("Failed to print public key of {user_key}"))?;

        let public_key = output
            .lines()
            .find(|line| line.starts_with("ecdsa-"))
            .ok_or_else(|| eyre!("Failed to parse public key from {user_key}"))?;

        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temporary file in {}", self.dir))?;
        std::fs::write(tmp.path(), format!("{public_key}\n"))?;
        tmp.persist(&target)
            .with_context(|| format!("Failed to replace {target}"))?;
        Ok(())
    }
}

/// Resolve the keystore of `uid`, looked up in the host passwd database
/// named by the environment.
pub fn keystore_of_uid(uid: u32) -> Result<KeyStore> {
    let passwd = PasswdDb::load(&config::passwd_file()?)?;
    let username = passwd
        .username_of(uid)
        .ok_or_else(|| eyre!("No entry for uid {uid} in host passwd database"))?;
    Ok(KeyStore::for_user(&config::hook_base_dir()?, username))
}

/// Keystore of the invoking user. The key subcommands run with the user's
/// own identity, so the real uid picks the store.
pub fn keystore_of_invoking_user() -> Result<KeyStore> {
    keystore_of_uid(nix::unistd::getuid().as_raw())
}

/// `generate-ssh-keys` subcommand body.
pub fn generate(overwrite: bool) -> Result<()> {
    debug!("Generating SSH keys");
    let store = keystore_of_invoking_user()?;
    let dropbear_dir = config::dropbear_dir()?;

    match store.generate(&dropbear_dir, overwrite)? {
        GenerateOutcome::AlreadyPresent => {
            info!(
                "SSH keys not generated because they already exist in {}. \
                 Use the '--overwrite' option to overwrite the existing keys.",
                store.dir()
            );
        }
        GenerateOutcome::Generated => {
            info!("Successfully generated SSH keys");
        }
    }
    Ok(())
}

/// `check-user-has-ssh-keys` subcommand body; the `false` outcome is an
/// expected result, not an error.
pub fn check() -> Result<bool> {
    debug!("Checking that user has SSH keys");
    let store = keystore_of_invoking_user()?;
    if !store.is_complete() {
        debug!("Could not find SSH keys in {}", store.dir());
        return Ok(false);
    }
    Ok(true)
}
