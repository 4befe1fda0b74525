//! Moving received subvolumes to their in-image paths.

use std::path::{Path, PathBuf};

use log::info;

use crate::{error::Result, exec::argv, isolate::IsolationScope};

/// Resolves an absolute in-image path against the directory the image is mounted on.
pub fn host_path(mount_dir: &Path, in_image: &Path) -> PathBuf {
    match in_image.strip_prefix("/") {
        Ok(relative) => mount_dir.join(relative),
        Err(_) => mount_dir.join(in_image),
    }
}

/// Moves the subvolume received at `landing` to `target` (both in-image paths), creating any
/// missing parents as plain directories.  Does nothing if the two are the same.
pub fn place(scope: &IsolationScope, mount_dir: &Path, landing: &Path, target: &Path) -> Result<()> {
    if landing == target {
        return Ok(());
    }
    let src = host_path(mount_dir, landing);
    let dest = host_path(mount_dir, target);
    info!("Placing {} at {}", landing.display(), target.display());

    if let Some(parent) = dest.parent().filter(|p| *p != mount_dir) {
        scope.run_privileged(argv!["mkdir", "-p", parent])?;
    }
    scope.run_privileged(argv!["mv", src, dest])?;
    Ok(())
}
