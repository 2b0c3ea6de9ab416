//! Shared fixtures for the shk integration tests.

use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use xshell::{cmd, Shell};

/// The three files a complete keystore holds.
pub const KEY_FILES: [&str; 3] = ["dropbear_ecdsa_host_key", "id_dropbear", "authorized_keys"];

/// Username the fixture passwd database assigns to the invoking uid.
pub const TEST_USERNAME: &str = "testuser";

/// Path to the shk binary under test: `SHK_PATH` wins, then the workspace
/// target directory, then whatever `shk` resolves to on PATH.
pub fn shk_binary() -> Result<Utf8PathBuf> {
    if let Ok(path) = std::env::var("SHK_PATH") {
        return Ok(Utf8PathBuf::from(path));
    }
    let target = Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target");
    for profile in ["debug", "release"] {
        let candidate = target.join(profile).join("shk");
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(Utf8PathBuf::from("shk"))
}

/// A self-contained hook environment: keystore base, passwd database naming
/// the invoking uid, and a stub Dropbear toolchain.
pub struct HookFixture {
    _dir: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub hook_base_dir: Utf8PathBuf,
    pub passwd_file: Utf8PathBuf,
    pub dropbear_dir: Utf8PathBuf,
    pub binary: Utf8PathBuf,
}

impl HookFixture {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned())
            .map_err(|p| eyre!("Temporary directory {} is not UTF-8", p.display()))?;

        let sh = Shell::new()?;
        let uid = cmd!(sh, "id -u").read()?.trim().to_string();
        let gid = cmd!(sh, "id -g").read()?.trim().to_string();

        let hook_base_dir = root.join("hook");
        std::fs::create_dir_all(&hook_base_dir)?;

        let passwd_file = root.join("passwd");
        std::fs::write(
            &passwd_file,
            format!("root:x:0:0:root:/root:/bin/sh\n{TEST_USERNAME}:x:{uid}:{gid}::/home/{TEST_USERNAME}:/bin/sh\n"),
        )?;

        let dropbear_dir = root.join("dropbear");
        std::fs::create_dir_all(dropbear_dir.join("bin"))?;
        write_stub_dropbearkey(&dropbear_dir.join("bin/dropbearkey"))?;

        Ok(Self {
            _dir: dir,
            root,
            hook_base_dir,
            passwd_file,
            dropbear_dir,
            binary: shk_binary()?,
        })
    }

    /// Run `shk` with the fixture environment; the caller inspects the
    /// captured status and stderr.
    pub fn run_shk(&self, args: &[&str], stdin: Option<&str>) -> Result<std::process::Output> {
        let sh = Shell::new()?;
        let binary = &self.binary;
        let mut command = cmd!(sh, "{binary}")
            .args(args)
            .env("HOOK_BASE_DIR", &self.hook_base_dir)
            .env("PASSWD_FILE", &self.passwd_file)
            .env("DROPBEAR_DIR", &self.dropbear_dir)
            .env("SERVER_PORT", "2222")
            .ignore_status();
        if let Some(stdin) = stdin {
            command = command.stdin(stdin);
        }
        command.output().context("Failed to run shk")
    }

    /// The keystore directory the fixture user maps to.
    pub fn keys_dir(&self) -> Utf8PathBuf {
        self.hook_base_dir
            .join(TEST_USERNAME)
            .join(".oci-hooks/ssh/keys")
    }
}

/// A stand-in for `dropbearkey`: `-t ecdsa -f ⟨path⟩` writes a unique key
/// file, `-y -f ⟨path⟩` prints a public-key block derived from it.
fn write_stub_dropbearkey(path: &Utf8Path) -> Result<()> {
    let script = concat!(
        "#!/bin/sh\n",
        "if [ \"$1\" = -y ]; then\n",
        "    echo 'Public key portion is:'\n",
        "    echo \"ecdsa-sha2-nistp256 AAAA-stub-$(cat \"$3\")\"\n",
        "    exit 0\n",
        "fi\n",
        "date +%s%N > \"$4\"\n",
    );
    std::fs::write(path, script)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
