//! Keystore subcommand scenarios: cold start, idempotent and forced
//! regeneration, and the check exit-code contract.

use integration_tests::{HookFixture, KEY_FILES};
use libtest_mimic::Failed;

pub fn cold_start() -> Result<(), Failed> {
    let fixture = HookFixture::new()?;

    let output = fixture.run_shk(&["generate-ssh-keys"], None)?;
    if !output.status.success() {
        return Err(format!(
            "generate-ssh-keys failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }

    let keys_dir = fixture.keys_dir();
    for file in KEY_FILES {
        if !keys_dir.join(file).is_file() {
            return Err(format!("expected key file {file} missing from {keys_dir}").into());
        }
    }

    // authorized_keys must be the ecdsa line derived from the user key.
    let authorized = std::fs::read_to_string(keys_dir.join("authorized_keys"))?;
    let user_key = std::fs::read_to_string(keys_dir.join("id_dropbear"))?;
    if !authorized.starts_with("ecdsa-") || !authorized.contains(user_key.trim()) {
        return Err(format!("unexpected authorized_keys contents: {authorized:?}").into());
    }
    Ok(())
}

pub fn idempotent_regenerate() -> Result<(), Failed> {
    let fixture = HookFixture::new()?;
    fixture.run_shk(&["generate-ssh-keys"], None)?;
    let keys_dir = fixture.keys_dir();
    let before: Vec<String> = KEY_FILES
        .iter()
        .map(|f| std::fs::read_to_string(keys_dir.join(f)))
        .collect::<Result<_, _>>()?;

    let output = fixture.run_shk(&["generate-ssh-keys"], None)?;
    if !output.status.success() {
        return Err("regenerating without --overwrite must succeed".into());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("already exist") {
        return Err(format!("expected the already-exist message, got: {stderr}").into());
    }

    let after: Vec<String> = KEY_FILES
        .iter()
        .map(|f| std::fs::read_to_string(keys_dir.join(f)))
        .collect::<Result<_, _>>()?;
    if before != after {
        return Err("key files changed without --overwrite".into());
    }
    Ok(())
}

pub fn forced_regenerate() -> Result<(), Failed> {
    let fixture = HookFixture::new()?;
    fixture.run_shk(&["generate-ssh-keys"], None)?;
    let keys_dir = fixture.keys_dir();
    let before = std::fs::read_to_string(keys_dir.join("dropbear_ecdsa_host_key"))?;

    let output = fixture.run_shk(&["generate-ssh-keys", "--overwrite"], None)?;
    if !output.status.success() {
        return Err("generate-ssh-keys --overwrite failed".into());
    }

    let after = std::fs::read_to_string(keys_dir.join("dropbear_ecdsa_host_key"))?;
    if before == after {
        return Err("--overwrite did not replace the key material".into());
    }
    Ok(())
}

pub fn check_exit_codes() -> Result<(), Failed> {
    let fixture = HookFixture::new()?;

    let output = fixture.run_shk(&["check-user-has-ssh-keys"], None)?;
    if output.status.success() {
        return Err("check must exit non-zero with an empty keystore".into());
    }

    fixture.run_shk(&["generate-ssh-keys"], None)?;
    let output = fixture.run_shk(&["check-user-has-ssh-keys"], None)?;
    if !output.status.success() {
        return Err("check must exit zero once all key files exist".into());
    }

    // A partial store counts as missing.
    std::fs::remove_file(fixture.keys_dir().join("authorized_keys"))?;
    let output = fixture.run_shk(&["check-user-has-ssh-keys"], None)?;
    if output.status.success() {
        return Err("check must exit non-zero with a partial keystore".into());
    }
    Ok(())
}
