//! Environment-supplied configuration.
//!
//! The hook is configured entirely through environment variables set by the
//! site administrator in the OCI hook definition; there is no config file.

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::debug;

/// Host directory under which per-user keystores live.
pub fn hook_base_dir() -> Result<Utf8PathBuf> {
    required_var("HOOK_BASE_DIR").map(Utf8PathBuf::from)
}

/// Host passwd database consulted for UID to username resolution.
pub fn passwd_file() -> Result<Utf8PathBuf> {
    required_var("PASSWD_FILE").map(Utf8PathBuf::from)
}

/// Host directory containing `bin/dropbear`, `bin/dbclient`, `bin/dropbearkey`.
pub fn dropbear_dir() -> Result<Utf8PathBuf> {
    required_var("DROPBEAR_DIR").map(Utf8PathBuf::from)
}

/// TCP port the in-container daemon listens on.
pub fn server_port() -> Result<u16> {
    let raw = required_var("SERVER_PORT")?;
    let port: u16 = raw
        .parse()
        .map_err(|_| eyre!("Invalid SERVER_PORT value {raw:?}: expected a TCP port number"))?;
    if port == 0 {
        return Err(eyre!("Invalid SERVER_PORT value 0: expected a positive port number"));
    }
    Ok(port)
}

fn required_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            debug!("Got environment variable {name}={value}");
            Ok(value)
        }
        _ => Err(eyre!("Environment doesn't contain variable {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global; keep every case in one test to
    // avoid interleaving with parallel test threads.
    #[test]
    fn test_server_port_parsing() {
        std::env::remove_var("SERVER_PORT");
        assert!(server_port().is_err());

        std::env::set_var("SERVER_PORT", "not-a-port");
        let err = server_port().unwrap_err();
        assert!(err.to_string().contains("Invalid SERVER_PORT"));

        std::env::set_var("SERVER_PORT", "0");
        assert!(server_port().is_err());

        std::env::set_var("SERVER_PORT", "15263");
        assert_eq!(server_port().unwrap(), 15263);

        std::env::remove_var("SERVER_PORT");
    }
}
