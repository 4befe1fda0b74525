//! Source subvolumes: the things being packaged.

use std::{
    fmt::Debug,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;

use crate::{
    btrfs,
    error::{PackageError, Result},
    exec::{argv, check, run_checked, Invocation, PrivilegedExecutor},
};

/// A subvolume that can be serialized into a send stream.
///
/// Sources are borrowed from the caller; the only mutation allowed is forcing them read-only,
/// which `btrfs send` requires.
pub trait SubvolumeSource: Send + Sync + Debug {
    /// An upper-bound estimate of the bytes the content occupies.
    fn estimate_content_bytes(&self) -> Result<u64>;

    /// Where the subvolume lives on the host.  Its basename is where `btrfs receive` will land
    /// it inside the image.
    fn path(&self) -> &Path;

    /// Marks the subvolume read-only and writes its send stream into `dest`, returning once the
    /// stream is complete.  `dest` is closed on return, success or not.
    fn mark_readonly_and_stream(&self, dest: OwnedFd) -> Result<()>;
}

/// A subvolume on a btrfs filesystem of the host.
#[derive(Clone)]
pub struct HostSubvolume {
    path: PathBuf,
    exec: Arc<dyn PrivilegedExecutor>,
}

impl Debug for HostSubvolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSubvolume")
            .field("path", &self.path)
            .finish()
    }
}

impl HostSubvolume {
    pub fn open(path: impl AsRef<Path>, exec: Arc<dyn PrivilegedExecutor>) -> Result<Self> {
        let path = path.as_ref().canonicalize()?;
        if !path.is_dir() {
            return Err(PackageError::validation(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        if path.file_name().is_none() {
            return Err(PackageError::validation("cannot package the filesystem root"));
        }
        Ok(HostSubvolume { path, exec })
    }
}

impl SubvolumeSource for HostSubvolume {
    fn estimate_content_bytes(&self) -> Result<u64> {
        // du over-counts shared extents, which is what we want here
        let output = run_checked(
            self.exec.as_ref(),
            Invocation::new(argv![
                "du",
                "--block-size=1",
                "--summarize",
                "--one-file-system",
                self.path
            ]),
        )?;
        let stdout = output.stdout_str();
        let bytes = stdout
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| PackageError::ExternalTool {
                command: "du".into(),
                status: "unparseable output".into(),
                stderr: stdout.trim().to_string(),
            })?;
        debug!("estimated {} at {bytes} bytes", self.path.display());
        Ok(bytes)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn mark_readonly_and_stream(&self, dest: OwnedFd) -> Result<()> {
        if let Err(e) = btrfs::set_readonly(self.exec.as_ref(), &self.path, true) {
            drop(dest);
            return Err(e);
        }
        let argv = btrfs::send_argv(&self.path);
        let output = self
            .exec
            .run(Invocation::new(argv.clone()).stdout(dest))
            .map_err(|e| PackageError::external(&argv, None, e.to_string().as_bytes()))?;
        check(&argv, output)?;
        Ok(())
    }
}
