//! Steps that run once every subvolume is in place: sealing and picking the default.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::{
    error::Result,
    isolate::IsolationScope,
    place::host_path,
    request::PackageRequest,
};

/// Marks every non-writable subvolume read-only, walking `order` backwards.
///
/// Descendants are sealed before their ancestors, since nothing may be written under a subvolume
/// once it is read-only.  A writable subvolume is left alone even when an ancestor gets sealed:
/// the read-only property belongs to a single subvolume and does not extend to those nested in
/// it.
pub fn seal(
    scope: &IsolationScope,
    mount_dir: &Path,
    request: &PackageRequest,
    order: &[PathBuf],
) -> Result<()> {
    for path in order.iter().rev() {
        if request.subvols[path].writable {
            debug!("leaving {} writable", path.display());
            continue;
        }
        info!("Sealing {}", path.display());
        scope.set_readonly(&host_path(mount_dir, path), true)?;
    }
    Ok(())
}

/// Makes the subvolume at `default_path` the filesystem's default, returning its id.
pub fn set_default(scope: &IsolationScope, mount_dir: &Path, default_path: &Path) -> Result<u64> {
    let id = scope.subvolume_id(&host_path(mount_dir, default_path))?;
    info!("Default subvolume is {} (id {id})", default_path.display());
    scope.set_default_subvolume(mount_dir, id)?;
    Ok(id)
}
