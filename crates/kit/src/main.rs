//! SSH Hook Kit (shk) - an OCI createContainer hook that provisions a
//! Dropbear-based SSH service inside starting containers.
//!
//! The binary serves two callers: users run the key subcommands on the host
//! with their own identity, and the container runtime invokes
//! `start-ssh-daemon` with the OCI state on stdin.

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};
use tracing_subscriber::{reload, EnvFilter, Registry};

mod activate;
mod caps;
mod command_run;
mod config;
mod daemon;
mod identity;
mod keystore;
mod lockfile;
mod namespaces;
mod overlay;
mod passwd;
#[allow(dead_code)]
mod solib;
mod state;

use state::LogOverride;

/// Provision SSH connectivity between containers in a cluster.
///
/// shk injects a static Dropbear server and per-user key material into a
/// container at creation time, without relying on the host's SSH
/// infrastructure or on the image shipping an SSH implementation.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
struct GenerateSshKeysOpts {
    /// Replace the keys even when a complete keystore already exists
    #[clap(long)]
    overwrite: bool,
}

/// Available shk commands.
#[derive(Subcommand)]
enum Commands {
    /// Generate per-user ECDSA key material in the host keystore
    GenerateSshKeys(GenerateSshKeysOpts),

    /// Exit 0 iff the invoking user's keystore holds all three key files
    CheckUserHasSshKeys,

    /// OCI createContainer hook: read the container state from stdin and
    /// start the SSH daemon inside the container (hidden from help)
    #[clap(hide = true)]
    StartSshDaemon,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Install and configure the tracing/logging system.
///
/// Structured logs go to stderr, filtered by RUST_LOG and defaulting to
/// 'info'. The filter sits behind a reload handle so the bundle's logging
/// annotation can raise verbosity once the state has been parsed.
fn install_tracing() -> FilterHandle {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    let (filter_layer, handle) = reload::Layer::new(filter_layer);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
    handle
}

fn apply_log_override(handle: &FilterHandle, log_override: Option<LogOverride>) -> Result<()> {
    let directive = match log_override {
        Some(LogOverride::Debug) => "trace",
        Some(LogOverride::Verbose) => "debug",
        None => return Ok(()),
    };
    handle.reload(EnvFilter::try_new(directive)?)?;
    Ok(())
}

fn main() -> Result<(), Report> {
    let filter_handle = install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::GenerateSshKeys(opts) => keystore::generate(opts.overwrite)?,
        Commands::CheckUserHasSshKeys => {
            // Missing keys are the expected negative outcome here, reported
            // through the exit code alone.
            if !keystore::check()? {
                std::process::exit(1);
            }
        }
        Commands::StartSshDaemon => {
            let bundle_state = state::BundleState::from_runtime(std::io::stdin().lock())?;
            apply_log_override(&filter_handle, bundle_state.log_override)?;
            activate::run(&bundle_state)?;
        }
    }

    Ok(())
}
