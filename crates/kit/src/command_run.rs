use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning an error (including the trailing
    /// stderr output) if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string. This
    /// uses `run` internally and fails if the child exits abnormally.
    fn run_get_string(&mut self) -> Result<String>;
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let status = self.status()?;
        if status.success() {
            return Ok(());
        }
        let stderr_tail = last_utf8_content_from_file(stderr);
        Err(eyre!("Subprocess failed: {status:?}\n{stderr_tail}"))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0))?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }
}

/// Read the trailing bytes of a spooled stderr file, truncated so a noisy
/// child cannot produce a pathological error message.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        assert!(Command::new("true").run().is_ok());
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Subprocess failed"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_run_get_string() {
        let out = Command::new("sh")
            .args(["-c", "printf hello"])
            .run_get_string()
            .unwrap();
        assert_eq!(out, "hello");
    }
}
