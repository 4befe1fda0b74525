//! A btrfs filesystem on a loop-mounted image file.

use std::{
    fs::OpenOptions,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::{debug, info, warn};
use tempfile::TempDir;

use crate::{
    btrfs,
    error::{PackageError, Result},
    exec::{argv, run_checked, CommandOutput, Invocation, PrivilegedExecutor},
};

const SECTOR_BYTES: u64 = 4096;

/// The attached loop device, while it exists.
#[derive(Debug)]
struct Attached {
    device: PathBuf,
    size_bytes: u64,
}

/// A mounted btrfs image.  Must be [released](LoopbackVolume::release) before the isolation
/// scope it was created in goes away; dropping it releases as a last resort.
pub struct LoopbackVolume {
    exec: Arc<dyn PrivilegedExecutor>,
    image_path: PathBuf,
    label: Option<String>,
    compression_level: u32,
    mount_dir: Option<TempDir>,
    mount_path: PathBuf,
    attached: Mutex<Option<Attached>>,
}

impl std::fmt::Debug for LoopbackVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackVolume")
            .field("image_path", &self.image_path)
            .field("mount_dir", &self.mount_path)
            .field("label", &self.label)
            .field("compression_level", &self.compression_level)
            .finish()
    }
}

fn mount_options(compression_level: u32) -> String {
    let mut opts = String::from("discard,nobarrier");
    if compression_level > 0 {
        opts.push_str(&format!(",compress-force=zstd:{compression_level}"));
    }
    opts
}

impl LoopbackVolume {
    /// Sizes `image_path` to `size_bytes`, formats it as btrfs, attaches it to a loop device and
    /// mounts it on a fresh temporary directory.  Steps that succeeded are undone if a later one
    /// fails.
    pub fn create(
        exec: Arc<dyn PrivilegedExecutor>,
        image_path: &Path,
        size_bytes: u64,
        label: Option<&str>,
        compression_level: u32,
    ) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .open(image_path)?
            .set_len(size_bytes)?;

        let mut mkfs = argv!["mkfs.btrfs", "--metadata", "single"];
        if let Some(label) = label {
            mkfs.extend(argv!["--label", label]);
        }
        mkfs.push(image_path.as_os_str().to_owned());
        run_checked(exec.as_ref(), Invocation::new(mkfs))?;

        let output = run_checked(
            exec.as_ref(),
            Invocation::new(argv!["losetup", "--find", "--show", image_path]),
        )?;
        let device = PathBuf::from(output.stdout_str().trim());
        debug!("attached {} to {}", image_path.display(), device.display());

        let detach = |err: PackageError| {
            if let Err(e) = run_checked(
                exec.as_ref(),
                Invocation::new(argv!["losetup", "--detach", device]),
            ) {
                warn!("failed to detach {}: {e}", device.display());
            }
            err
        };

        let mount_dir = tempfile::Builder::new()
            .prefix("subvolpack-")
            .tempdir()
            .map_err(|e| detach(e.into()))?;
        run_checked(
            exec.as_ref(),
            Invocation::new(argv![
                "mount",
                "-t",
                "btrfs",
                "-o",
                mount_options(compression_level),
                device,
                mount_dir.path()
            ]),
        )
        .map_err(detach)?;
        info!(
            "mounted {} ({size_bytes} bytes) at {}",
            image_path.display(),
            mount_dir.path().display()
        );

        Ok(LoopbackVolume {
            exec,
            image_path: image_path.to_path_buf(),
            label: label.map(str::to_string),
            compression_level,
            mount_path: mount_dir.path().to_path_buf(),
            mount_dir: Some(mount_dir),
            attached: Mutex::new(Some(Attached { device, size_bytes })),
        })
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_path
    }

    /// Current size of the image, or `None` once released.
    pub fn size_bytes(&self) -> Option<u64> {
        self.lock().ok()?.as_ref().map(|a| a.size_bytes)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Attached>>> {
        self.attached
            .lock()
            .map_err(|_| std::io::Error::other("loopback state lock poisoned").into())
    }

    /// Runs `btrfs receive` into the mount root, reading the stream from `src`.  The exit status
    /// is returned as-is for the caller to classify.
    pub fn receive(&self, src: OwnedFd) -> Result<CommandOutput> {
        let argv = btrfs::receive_argv(&self.mount_path);
        self.exec
            .run(Invocation::new(argv.clone()).stdin(src))
            .map_err(|e| PackageError::external(&argv, None, e.to_string().as_bytes()))
    }

    /// Shrinks the filesystem and its backing file to the smallest size that holds the content.
    /// Never grows the image.  Returns the resulting size.
    pub fn minimize_size(&self) -> Result<u64> {
        let mut attached = self.lock()?;
        let Some(attached) = attached.as_mut() else {
            return Err(std::io::Error::other("loopback volume already released").into());
        };

        let min_bytes = btrfs::min_dev_size(self.exec.as_ref(), &self.mount_path)?
            .div_ceil(SECTOR_BYTES)
            * SECTOR_BYTES;
        if min_bytes >= attached.size_bytes {
            info!(
                "{} is already minimal at {} bytes",
                self.image_path.display(),
                attached.size_bytes
            );
            return Ok(attached.size_bytes);
        }

        btrfs::resize(self.exec.as_ref(), &self.mount_path, min_bytes)?;
        run_checked(
            self.exec.as_ref(),
            Invocation::new(argv!["truncate", "-s", min_bytes.to_string(), self.image_path]),
        )?;
        run_checked(
            self.exec.as_ref(),
            Invocation::new(argv!["losetup", "--set-capacity", attached.device]),
        )?;
        info!(
            "shrank {} from {} to {min_bytes} bytes",
            self.image_path.display(),
            attached.size_bytes
        );
        attached.size_bytes = min_bytes;
        Ok(min_bytes)
    }

    /// Unmounts and detaches.  Only the first successful call does anything.
    pub fn release(&self) -> Result<()> {
        let mut attached = self.lock()?;
        let Some(state) = attached.as_ref() else {
            return Ok(());
        };
        run_checked(
            self.exec.as_ref(),
            Invocation::new(argv!["umount", self.mount_path]),
        )?;
        run_checked(
            self.exec.as_ref(),
            Invocation::new(argv!["losetup", "--detach", state.device]),
        )?;
        debug!("released {}", self.image_path.display());
        *attached = None;
        Ok(())
    }
}

impl Drop for LoopbackVolume {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release {}: {e}", self.image_path.display());
            // don't let TempDir clean up beneath a mount that is still live
            if let Some(dir) = self.mount_dir.take() {
                let _ = dir.into_path();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::FakeExecutor;

    fn image() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn test_mount_options() {
        assert_eq!(mount_options(0), "discard,nobarrier");
        assert_eq!(mount_options(3), "discard,nobarrier,compress-force=zstd:3");
    }

    #[test]
    fn test_create_and_release() {
        let img = image();
        let exec = Arc::new(FakeExecutor::btrfs());
        let vol = LoopbackVolume::create(exec.clone(), img.path(), 1 << 27, Some("root"), 0).unwrap();
        assert_eq!(std::fs::metadata(img.path()).unwrap().len(), 1 << 27);
        assert_eq!(vol.size_bytes(), Some(1 << 27));
        let mnt = vol.mount_dir().display().to_string();
        let path = img.path().display().to_string();

        vol.release().unwrap();
        vol.release().unwrap();
        assert_eq!(vol.size_bytes(), None);

        assert_eq!(
            exec.commands(),
            vec![
                format!("mkfs.btrfs --metadata single --label root {path}"),
                format!("losetup --find --show {path}"),
                format!("mount -t btrfs -o discard,nobarrier /dev/loop7 {mnt}"),
                format!("umount {mnt}"),
                "losetup --detach /dev/loop7".to_string(),
            ]
        );
    }

    #[test]
    fn test_failed_mount_detaches() {
        let img = image();
        let exec = Arc::new(FakeExecutor::btrfs());
        exec.fail("mount", b"mount: wrong fs type");
        let err = LoopbackVolume::create(exec.clone(), img.path(), 1 << 27, None, 0).unwrap_err();
        assert!(matches!(err, PackageError::ExternalTool { .. }), "{err:?}");
        assert_eq!(
            exec.commands().last().unwrap(),
            "losetup --detach /dev/loop7"
        );
    }

    #[test]
    fn test_failed_mkfs_attaches_nothing() {
        let img = image();
        let exec = Arc::new(FakeExecutor::btrfs());
        exec.fail("mkfs.btrfs", b"ERROR: not enough free space");
        LoopbackVolume::create(exec.clone(), img.path(), 1 << 20, None, 0).unwrap_err();
        assert_eq!(exec.commands().len(), 1);
    }

    #[test]
    fn test_minimize() {
        let img = image();
        let exec = Arc::new(FakeExecutor::new());
        exec.respond("losetup --find --show", b"/dev/loop3\n");
        exec.respond("btrfs inspect-internal min-dev-size", b"1000000 bytes (976.56KiB)\n");
        let vol = LoopbackVolume::create(exec.clone(), img.path(), 1 << 30, None, 0).unwrap();
        // rounded up to the sector size
        assert_eq!(vol.minimize_size().unwrap(), 1003520);
        assert_eq!(vol.size_bytes(), Some(1003520));
        let mnt = vol.mount_dir().display().to_string();
        let path = img.path().display().to_string();
        assert_eq!(
            exec.commands()[3..].to_vec(),
            vec![
                format!("btrfs inspect-internal min-dev-size {mnt}"),
                format!("btrfs filesystem resize 1003520 {mnt}"),
                format!("truncate -s 1003520 {path}"),
                "losetup --set-capacity /dev/loop3".to_string(),
            ]
        );
    }

    #[test]
    fn test_minimize_never_grows() {
        let img = image();
        let exec = Arc::new(FakeExecutor::new());
        exec.respond("losetup --find --show", b"/dev/loop3\n");
        exec.respond("btrfs inspect-internal min-dev-size", b"2147483648 bytes (2.00GiB)\n");
        let vol = LoopbackVolume::create(exec.clone(), img.path(), 1 << 30, None, 0).unwrap();
        assert_eq!(vol.minimize_size().unwrap(), 1 << 30);
        assert!(exec.commands_of("truncate").is_empty());
    }
}
