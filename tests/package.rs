//! Builds a real image from real subvolumes.  Needs root, btrfs-progs and loop devices, so it only
//! runs when SUBVOLPACK_PRIVILEGED_TESTS is set.

use std::{
    ffi::OsStr,
    fs::{File, Permissions},
    os::unix::fs::{chown, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use rustix::fs::XattrFlags;
use similar_asserts::assert_eq;

use subvolpack::{
    exec::HostExecutor, isolate::UnshareSandbox, opts::PackageOpts, sizing::MIB, Packager,
};

fn privileged() -> bool {
    if std::env::var_os("SUBVOLPACK_PRIVILEGED_TESTS").is_none() {
        eprintln!("SUBVOLPACK_PRIVILEGED_TESTS not set, skipping");
        return false;
    }
    if !rustix::process::getuid().is_root() {
        eprintln!("not root, skipping");
        return false;
    }
    true
}

fn run<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let output = Command::new(&args[0]).args(&args[1..]).output().unwrap();
    assert!(
        output.status.success(),
        "{args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

/// Unmounts on drop, so a failed assertion doesn't leave mounts behind.
struct Mounted(PathBuf);

impl Mounted {
    fn new(image: &Path, dir: PathBuf, opts: &str) -> Self {
        std::fs::create_dir_all(&dir).unwrap();
        run([
            OsStr::new("mount"),
            OsStr::new("-o"),
            OsStr::new(opts),
            image.as_os_str(),
            dir.as_os_str(),
        ]);
        Mounted(dir)
    }

    fn join(&self, path: &str) -> PathBuf {
        self.0.join(path)
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        let _ = Command::new("umount").arg(&self.0).status();
    }
}

fn ro_property(path: &Path) -> String {
    run([
        OsStr::new("btrfs"),
        OsStr::new("property"),
        OsStr::new("get"),
        OsStr::new("-ts"),
        path.as_os_str(),
        OsStr::new("ro"),
    ])
    .trim()
    .to_string()
}

/// Name, uid, gid, mode and `user.` xattrs of every entry directly in `dir`, sorted by name.
type Listing = Vec<(String, u32, u32, u32, Vec<(String, Vec<u8>)>)>;

fn xattrs(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut names = [0 as _; 4096];
    let len = rustix::fs::llistxattr(path, &mut names).unwrap();
    let names: Vec<u8> = names[..len].iter().map(|&c| c as u8).collect();
    let mut attrs: Vec<_> = names
        .split(|&b| b == 0)
        .filter(|name| name.starts_with(b"user."))
        .map(|name| {
            let name = String::from_utf8(name.to_vec()).unwrap();
            let mut value = [0u8; 256];
            let len = rustix::fs::lgetxattr(path, name.as_str(), &mut value).unwrap();
            (name, value[..len].to_vec())
        })
        .collect();
    attrs.sort();
    attrs
}

fn listing(dir: &Path) -> Listing {
    let mut entries: Listing = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            (
                path.file_name().unwrap().to_string_lossy().into_owned(),
                meta.uid(),
                meta.gid(),
                meta.mode(),
                xattrs(&path),
            )
        })
        .collect();
    entries.sort();
    entries
}

#[test_with::executable(btrfs, mkfs.btrfs, losetup, unshare, nsenter)]
fn test_package_nested() {
    if !privileged() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch.btrfs");
    File::create(&scratch).unwrap().set_len(256 * MIB).unwrap();
    run([OsStr::new("mkfs.btrfs"), scratch.as_os_str()]);
    let sources = Mounted::new(&scratch, dir.path().join("sources"), "loop");

    for name in ["root", "data"] {
        run([
            OsStr::new("btrfs"),
            OsStr::new("subvolume"),
            OsStr::new("create"),
            sources.join(name).as_os_str(),
        ]);
        std::fs::write(sources.join(name).join("hello"), format!("hello from {name}\n")).unwrap();
    }
    let attrs = [("user.origin", b"root".as_slice()), ("user.second", b"2".as_slice())];
    for (name, value) in attrs {
        rustix::fs::setxattr(sources.join("root/hello"), name, value, XattrFlags::empty()).unwrap();
    }
    let owned = sources.join("root/owned");
    std::fs::write(&owned, "not root's\n").unwrap();
    chown(&owned, Some(1234), Some(5678)).unwrap();
    std::fs::set_permissions(&owned, Permissions::from_mode(0o640)).unwrap();
    std::fs::create_dir(sources.join("data/sub")).unwrap();
    chown(sources.join("data/sub"), Some(4321), None).unwrap();

    let output = dir.path().join("out.btrfs");
    let opts: PackageOpts = serde_json::json!({
        "subvols": {
            "/root": { "path": sources.join("root") },
            "/root/var/data": { "path": sources.join("data"), "writable": true },
        },
        "default_subvol": "/root/var/data",
        "label": "packaged",
    })
    .to_string()
    .parse()
    .unwrap();

    let host = HostExecutor::unprefixed();
    let request = opts.into_request(&output, Arc::new(host.clone())).unwrap();
    let report = tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(Packager::new(Arc::new(UnshareSandbox::new(host))).package(&request))
        .unwrap();

    assert_eq!(
        report.placed,
        vec![PathBuf::from("/root"), PathBuf::from("/root/var/data")]
    );
    assert_eq!(std::fs::metadata(&output).unwrap().len(), report.image_bytes);
    assert_eq!(ro_property(&sources.join("root")), "ro=true");

    let image = Mounted::new(&output, dir.path().join("image"), "loop,subvolid=5");
    assert_eq!(
        std::fs::read_to_string(image.join("root/hello")).unwrap(),
        "hello from root\n"
    );
    assert_eq!(
        std::fs::read_to_string(image.join("root/var/data/hello")).unwrap(),
        "hello from data\n"
    );
    let mut xattr = [0u8; 16];
    let len = rustix::fs::getxattr(image.join("root/hello"), "user.origin", &mut xattr).unwrap();
    assert_eq!(&xattr[..len], b"root".as_slice());

    // var/ only exists in the image, it holds the placed data subvolume
    let mut packaged = listing(&image.join("root"));
    packaged.retain(|(name, ..)| name != "var");
    assert_eq!(listing(&sources.join("root")), packaged);
    assert!(listing(&sources.join("root"))
        .iter()
        .any(|(name, uid, gid, mode, _)| name == "owned"
            && (*uid, *gid, mode & 0o7777) == (1234, 5678, 0o640)));
    assert_eq!(listing(&sources.join("data")), listing(&image.join("root/var/data")));

    assert_eq!(ro_property(&image.join("root")), "ro=true");
    assert_eq!(ro_property(&image.join("root/var/data")), "ro=false");

    let default = run([
        OsStr::new("btrfs"),
        OsStr::new("subvolume"),
        OsStr::new("get-default"),
        image.0.as_os_str(),
    ]);
    assert!(default.trim_end().ends_with("path root/var/data"), "{default}");
    assert!(report.default_subvol_id.is_some_and(|id| default.starts_with(&format!("ID {id} "))));
}
