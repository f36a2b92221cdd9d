// src/repository/gpg.rs

//! Detached signature verification for archive Release files
//!
//! Verification is delegated to `gpgv`, which checks a detached signature
//! against a fixed set of trusted keyrings and needs no GnuPG home
//! directory. [`SignatureVerifier`] is the seam the archive loader uses, so
//! tests can substitute their own implementation.

use crate::error::{Error, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default time allowed for one signature check
const GPGV_TIMEOUT: Duration = Duration::from_secs(60);

/// Checks a detached signature over a file
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `file` using the trusted `keyrings`
    ///
    /// Fails with [`Error::GpgVerificationFailed`] carrying a readable
    /// reason.
    fn verify(&self, file: &Path, signature: &Path, keyrings: &[PathBuf]) -> Result<()>;
}

/// Runs the external `gpgv` binary
#[derive(Debug, Clone)]
pub struct GpgvVerifier {
    program: PathBuf,
    timeout: Duration,
}

impl Default for GpgvVerifier {
    fn default() -> Self {
        Self::new("gpgv")
    }
}

impl GpgvVerifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: GPGV_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Turn gpgv diagnostics into a one-line reason
fn diagnostics(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| line.strip_prefix("gpgv: ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SignatureVerifier for GpgvVerifier {
    fn verify(&self, file: &Path, signature: &Path, keyrings: &[PathBuf]) -> Result<()> {
        debug!("Verifying {} with {}", file.display(), signature.display());

        let mut command = Command::new(&self.program);
        for keyring in keyrings {
            command.arg("--keyring").arg(keyring);
        }
        command.arg("--").arg(signature).arg(file);

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::GpgVerificationFailed(format!(
                    "Failed to spawn '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::GpgVerificationFailed(format!(
                    "'{}' timed out after {} seconds",
                    self.program.display(),
                    self.timeout.as_secs()
                )));
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        if status.success() {
            return Ok(());
        }

        for line in stderr.lines() {
            warn!("[gpgv] {}", line);
        }
        let reason = diagnostics(&stderr);
        Err(Error::GpgVerificationFailed(if reason.is_empty() {
            format!(
                "{} exited with status {}",
                self.program.display(),
                status.code().unwrap_or(-1)
            )
        } else {
            reason
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_diagnostics_strip_prefix() {
        let stderr = "gpgv: Signature made Mon 01 Jan 2024\ngpgv: BAD signature from \"Archive\"\n";
        assert_eq!(
            diagnostics(stderr),
            "Signature made Mon 01 Jan 2024; BAD signature from \"Archive\""
        );
    }

    #[test]
    fn test_missing_program() {
        let temp = TempDir::new().unwrap();
        let verifier = GpgvVerifier::new(temp.path().join("no-such-gpgv"));
        let result = verifier.verify(
            &temp.path().join("Release"),
            &temp.path().join("Release.gpg"),
            &[],
        );
        assert!(matches!(result, Err(Error::GpgVerificationFailed(_))));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-gpgv");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_gpgv_arguments_and_success() {
        let temp = TempDir::new().unwrap();
        let program = script(
            temp.path(),
            r#"[ "$1" = "--keyring" ] && [ "$2" = "/k.gpg" ] && [ "$3" = "--" ] && [ "$4" = "sig" ] && [ "$5" = "file" ]"#,
        );

        let verifier = GpgvVerifier::new(program);
        verifier
            .verify(Path::new("file"), Path::new("sig"), &[PathBuf::from("/k.gpg")])
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_gpgv_failure_reason() {
        let temp = TempDir::new().unwrap();
        let program = script(
            temp.path(),
            "echo 'gpgv: Can'\\''t check signature: No public key' >&2\nexit 2",
        );

        let verifier = GpgvVerifier::new(program);
        let result = verifier.verify(Path::new("file"), Path::new("sig"), &[]);
        assert_eq!(
            result,
            Err(Error::GpgVerificationFailed(
                "Can't check signature: No public key".to_string()
            ))
        );
    }
}
