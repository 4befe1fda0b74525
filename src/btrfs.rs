//! The btrfs-progs commands we drive, and parsers for their output.
//!
//! Everything here is a thin wrapper around [`run_checked`], so that the same helpers work both
//! on the host and inside an isolation scope.

use std::{ffi::OsString, path::Path};

use crate::{
    error::{PackageError, Result},
    exec::{argv, run_checked, Invocation, PrivilegedExecutor},
};

/// `btrfs receive` prints this (after the failing path) when the image is full.
pub const OUT_OF_SPACE_SUFFIX: &[u8] = b": No space left on device\n";

/// Sets or clears the read-only property of the subvolume at `path`.
pub fn set_readonly(exec: &dyn PrivilegedExecutor, path: &Path, readonly: bool) -> Result<()> {
    let value = if readonly { "true" } else { "false" };
    run_checked(
        exec,
        Invocation::new(argv!["btrfs", "property", "set", "-ts", path, "ro", value]),
    )?;
    Ok(())
}

/// Looks up the numeric id of the subvolume at `path`.
pub fn subvolume_id(exec: &dyn PrivilegedExecutor, path: &Path) -> Result<u64> {
    let output = run_checked(
        exec,
        Invocation::new(argv!["btrfs", "inspect-internal", "rootid", path]),
    )?;
    parse_rootid(&output.stdout_str())
}

/// Makes subvolume `id` the default of the filesystem mounted at `mount_dir`.
pub fn set_default_subvolume(exec: &dyn PrivilegedExecutor, mount_dir: &Path, id: u64) -> Result<()> {
    run_checked(
        exec,
        Invocation::new(argv!["btrfs", "subvolume", "set-default", id.to_string(), mount_dir]),
    )?;
    Ok(())
}

/// Returns the smallest size the filesystem mounted at `mount_dir` can be shrunk to.
pub fn min_dev_size(exec: &dyn PrivilegedExecutor, mount_dir: &Path) -> Result<u64> {
    let output = run_checked(
        exec,
        Invocation::new(argv!["btrfs", "inspect-internal", "min-dev-size", mount_dir]),
    )?;
    parse_min_dev_size(&output.stdout_str())
}

/// Resizes the filesystem mounted at `mount_dir` to exactly `bytes`.
pub fn resize(exec: &dyn PrivilegedExecutor, mount_dir: &Path, bytes: u64) -> Result<()> {
    run_checked(
        exec,
        Invocation::new(argv!["btrfs", "filesystem", "resize", bytes.to_string(), mount_dir]),
    )?;
    Ok(())
}

/// Flags the (unmounted) image as a seed device.
pub fn mark_seed_device(exec: &dyn PrivilegedExecutor, image: &Path) -> Result<()> {
    run_checked(exec, Invocation::new(argv!["btrfstune", "-S", "1", image]))?;
    Ok(())
}

pub fn send_argv(subvol: &Path) -> Vec<OsString> {
    argv!["btrfs", "send", subvol]
}

pub fn receive_argv(dest: &Path) -> Vec<OsString> {
    argv!["btrfs", "receive", dest]
}

/// Output of `btrfs inspect-internal rootid`: a single decimal number.
fn parse_rootid(stdout: &str) -> Result<u64> {
    let trimmed = stdout.trim();
    trimmed.parse().map_err(|_| PackageError::ExternalTool {
        command: "btrfs inspect-internal rootid".into(),
        status: "unparseable output".into(),
        stderr: trimmed.to_string(),
    })
}

/// Output of `btrfs inspect-internal min-dev-size` looks like `123456 bytes (117.74MiB)`.
fn parse_min_dev_size(stdout: &str) -> Result<u64> {
    let mut words = stdout.split_whitespace();
    match (words.next().map(str::parse::<u64>), words.next()) {
        (Some(Ok(bytes)), Some("bytes")) => Ok(bytes),
        _ => Err(PackageError::ExternalTool {
            command: "btrfs inspect-internal min-dev-size".into(),
            status: "unparseable output".into(),
            stderr: stdout.trim().to_string(),
        }),
    }
}

/// True if `btrfs receive` failed because the destination filled up.
pub fn is_out_of_space(stderr: &[u8]) -> bool {
    stderr.ends_with(OUT_OF_SPACE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::FakeExecutor;

    #[test]
    fn test_parse_rootid() {
        assert_eq!(parse_rootid("256\n").unwrap(), 256);
        assert!(parse_rootid("ERROR: not a subvolume").is_err());
    }

    #[test]
    fn test_parse_min_dev_size() {
        assert_eq!(
            parse_min_dev_size("123456 bytes (120.56KiB)\n").unwrap(),
            123456
        );
        assert!(parse_min_dev_size("").is_err());
        assert!(parse_min_dev_size("123456 blocks").is_err());
    }

    #[test]
    fn test_out_of_space() {
        assert!(is_out_of_space(
            b"ERROR: writing to foo/bar failed: No space left on device\n"
        ));
        assert!(!is_out_of_space(b"ERROR: something else\n"));
        // the marker has to be trailing
        assert!(!is_out_of_space(
            b": No space left on device\nbut then more\n"
        ));
    }

    #[test]
    fn test_commands() {
        let exec = FakeExecutor::new();
        exec.respond("btrfs inspect-internal rootid", b"257\n");
        set_readonly(&exec, Path::new("/mnt/a"), true).unwrap();
        assert_eq!(subvolume_id(&exec, Path::new("/mnt/a")).unwrap(), 257);
        set_default_subvolume(&exec, Path::new("/mnt"), 257).unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                "btrfs property set -ts /mnt/a ro true",
                "btrfs inspect-internal rootid /mnt/a",
                "btrfs subvolume set-default 257 /mnt",
            ]
        );
    }
}
