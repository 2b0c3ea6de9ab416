//! Consumption of the OCI runtime state and the bundle configuration.
//!
//! At `createContainer` the runtime writes a single JSON state object to the
//! hook's stdin; the rest of the inputs live in the bundle's `config.json`.
//! Everything path- or id-shaped is validated here, before any namespace
//! entry, so failures leave the host untouched.

use std::collections::HashMap;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::Deserialize;
use tracing::debug;

/// Bundle annotation requesting more verbose hook logging.
const ANNOTATION_VERBOSE: &str = "com.hooks.ssh.verbose";
/// Bundle annotation requesting full debug hook logging.
const ANNOTATION_DEBUG: &str = "com.hooks.ssh.debug";

/// Log-level override carried in the bundle's annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOverride {
    Verbose,
    Debug,
}

/// Validated, invocation-scoped snapshot of everything the activation
/// pipeline needs from the runtime.
#[derive(Debug, Clone)]
pub struct BundleState {
    /// Absolute path to the OCI bundle directory.
    pub bundle_dir: Utf8PathBuf,
    /// PID of the container's init process, the anchor for namespace entry.
    pub container_pid: i32,
    /// Absolute path to the container's root filesystem.
    pub rootfs_dir: Utf8PathBuf,
    /// In-container user identity from `process.user`.
    pub uid: u32,
    pub gid: u32,
    /// `process.env`, split into key/value pairs.
    pub env: Vec<(String, String)>,
    pub log_override: Option<LogOverride>,
}

/// The state object the runtime writes to stdin. Only the fields the hook
/// consumes are modeled; unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct ContainerState {
    pid: i32,
    bundle: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
struct BundleConfig {
    root: Root,
    process: Process,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Root {
    path: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
struct Process {
    user: User,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    uid: u32,
    gid: u32,
}

impl BundleState {
    /// Read the runtime state from `input` (until EOF) and the bundle's
    /// `config.json`, producing a validated snapshot.
    pub fn from_runtime(mut input: impl Read) -> Result<Self> {
        let mut raw = String::new();
        input
            .read_to_string(&mut raw)
            .context("Failed to read container state from stdin")?;
        let state: ContainerState = serde_json::from_str(&raw)
            .context("Failed to parse container state from stdin")?;
        if state.pid <= 0 {
            return Err(eyre!("Invalid container pid {} in runtime state", state.pid));
        }
        debug!("Container state: pid={} bundle={}", state.pid, state.bundle);
        Self::from_bundle(state.bundle, state.pid)
    }

    fn from_bundle(bundle_dir: Utf8PathBuf, container_pid: i32) -> Result<Self> {
        let config_path = bundle_dir.join("config.json");
        let config_raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read bundle configuration {config_path}"))?;
        let config: BundleConfig = serde_json::from_str(&config_raw)
            .with_context(|| format!("Failed to parse bundle configuration {config_path}"))?;

        let rootfs_dir = resolve_rootfs(&bundle_dir, &config.root.path)?;
        let env = parse_env(&config.process.env)?;
        let log_override = log_override_from_annotations(&config.annotations);

        debug!(
            "Bundle configuration: rootfs={} uid={} gid={}",
            rootfs_dir, config.process.user.uid, config.process.user.gid
        );

        Ok(Self {
            bundle_dir,
            container_pid,
            rootfs_dir,
            uid: config.process.user.uid,
            gid: config.process.user.gid,
            env,
            log_override,
        })
    }
}

/// Resolve `root.path` against the bundle directory; relative paths are
/// interpreted from the bundle, and the result must be absolute.
fn resolve_rootfs(bundle_dir: &Utf8Path, root_path: &Utf8Path) -> Result<Utf8PathBuf> {
    let rootfs = if root_path.is_absolute() {
        root_path.to_owned()
    } else {
        bundle_dir.join(root_path)
    };
    if !rootfs.is_absolute() {
        return Err(eyre!(
            "Rootfs path {rootfs} is not absolute (bundle directory {bundle_dir})"
        ));
    }
    Ok(rootfs)
}

fn parse_env(env: &[String]) -> Result<Vec<(String, String)>> {
    env.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    eyre!("Failed to parse environment variable {entry:?}. Expected symbol '='.")
                })
        })
        .collect()
}

fn log_override_from_annotations(annotations: &HashMap<String, String>) -> Option<LogOverride> {
    let enabled = |key: &str| annotations.get(key).map(String::as_str) == Some("true");
    if enabled(ANNOTATION_DEBUG) {
        Some(LogOverride::Debug)
    } else if enabled(ANNOTATION_VERBOSE) {
        Some(LogOverride::Verbose)
    } else {
        None
    }
}
