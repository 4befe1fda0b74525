//! Error types for packaging.
//!
//! Every failure surfaced by [`crate::package::Packager`] is one of the kinds below.  None of
//! them is retried; all are fatal to the build in progress.
//!
//! - [`PackageError::Validation`]: the request is malformed.  Raised before any privileged
//!   resource is acquired.
//! - [`PackageError::Space`]: `btrfs receive` ran out of space inside the image.
//! - [`PackageError::ExternalTool`]: any other privileged command exited non-zero.
//! - [`PackageError::Io`]: a host-side file operation (pipe, temp dir, output file) failed.

use std::{ffi::OsString, process::ExitStatus};

use thiserror::Error;

/// Result type alias for packaging operations.
pub type Result<T> = std::result::Result<T, PackageError>;

/// Packaging failed.
#[derive(Error, Debug)] // can't derive PartialEq because of std::io::Error
pub enum PackageError {
    #[error("invalid package request: {0}")]
    Validation(String),
    #[error(
        "Receive failed. Subvol of {estimated} bytes did not fit into loopback of {allocated} \
         bytes: {stderr}"
    )]
    Space {
        estimated: u64,
        allocated: u64,
        stderr: String,
    },
    #[error("{command} failed ({status}): {stderr}")]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PackageError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Builds an [`PackageError::ExternalTool`] from a failed invocation.
    pub(crate) fn external(argv: &[OsString], status: Option<ExitStatus>, stderr: &[u8]) -> Self {
        Self::ExternalTool {
            command: display_argv(argv),
            status: match status {
                Some(status) => status.to_string(),
                None => "did not run".to_string(),
            },
            stderr: String::from_utf8_lossy(stderr).trim_end().to_string(),
        }
    }
}

/// Renders an argv for log and error messages.
pub(crate) fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_external_message() {
        let err = PackageError::external(
            &["mv".into(), "/a".into(), "/b".into()],
            Some(ExitStatus::from_raw(1 << 8)),
            b"mv: cannot move\n",
        );
        assert_eq!(
            err.to_string(),
            "mv /a /b failed (exit status: 1): mv: cannot move"
        );
    }

    #[test]
    fn test_space_message_carries_sizes() {
        let err = PackageError::Space {
            estimated: 1234,
            allocated: 5678,
            stderr: "ERROR: write x: No space left on device".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1234"), "{msg}");
        assert!(msg.contains("5678"), "{msg}");
    }
}
