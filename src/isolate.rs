//! Private mount/pid namespaces for the duration of one build.
//!
//! An [`IsolationScope`] is backed by a keepalive process (`unshare ... sleep infinity`).  Every
//! privileged command is run inside its namespaces via `nsenter`, so mounts made during the build
//! never show up in the host's mount table.  Killing the keepalive tears the namespaces down,
//! taking any leftover mounts with them.

use std::{
    ffi::OsString,
    path::Path,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    btrfs,
    error::{display_argv, PackageError, Result},
    exec::{argv, run_checked, spawn_and_wait, CommandOutput, HostExecutor, Invocation, PrivilegedExecutor},
};

const KEEPALIVE_COMM: &str = "sleep";
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// A kernel namespace the scope unshares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Mount,
    Pid,
}

impl Namespace {
    fn flag(self) -> &'static str {
        match self {
            Namespace::Mount => "--mount",
            Namespace::Pid => "--pid",
        }
    }
}

/// Opens isolation scopes, and runs the few privileged steps that must happen outside of one.
pub trait Sandbox: Send + Sync {
    fn open(&self, namespaces: &[Namespace]) -> Result<IsolationScope>;

    /// Executor for privileged commands on the host itself.
    fn host(&self) -> Arc<dyn PrivilegedExecutor>;
}

type Closer = Box<dyn FnOnce() -> Result<()> + Send>;

/// A live isolation scope.  All mount, receive, rename and property operations of a build run
/// through it.
pub struct IsolationScope {
    exec: Arc<dyn PrivilegedExecutor>,
    closer: Mutex<Option<Closer>>,
}

impl IsolationScope {
    pub fn from_parts(exec: Arc<dyn PrivilegedExecutor>, closer: Closer) -> Self {
        IsolationScope {
            exec,
            closer: Mutex::new(Some(closer)),
        }
    }

    pub fn executor(&self) -> Arc<dyn PrivilegedExecutor> {
        Arc::clone(&self.exec)
    }

    /// Runs `argv` inside the scope, failing on a non-zero exit.
    pub fn run_privileged(&self, argv: Vec<OsString>) -> Result<CommandOutput> {
        run_checked(self.exec.as_ref(), Invocation::new(argv))
    }

    pub fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        btrfs::set_readonly(self.exec.as_ref(), path, readonly)
    }

    pub fn subvolume_id(&self, path: &Path) -> Result<u64> {
        btrfs::subvolume_id(self.exec.as_ref(), path)
    }

    pub fn set_default_subvolume(&self, mount_dir: &Path, id: u64) -> Result<()> {
        btrfs::set_default_subvolume(self.exec.as_ref(), mount_dir, id)
    }

    /// Tears the scope down.  Only the first call does anything.
    pub fn close(&self) -> Result<()> {
        let closer = self
            .closer
            .lock()
            .map_err(|_| std::io::Error::other("isolation scope lock poisoned"))?
            .take();
        match closer {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}

impl Drop for IsolationScope {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close isolation scope: {e}");
        }
    }
}

/// Runs commands inside the namespaces of a target process.
struct NsenterExecutor {
    host: HostExecutor,
    target: u32,
    namespaces: Vec<Namespace>,
}

impl NsenterExecutor {
    fn wrap(&self, argv: Vec<OsString>) -> Vec<OsString> {
        let mut wrapped = argv!["nsenter", "--target", self.target.to_string()];
        wrapped.extend(self.namespaces.iter().map(|ns| ns.flag().into()));
        wrapped.push("--".into());
        wrapped.extend(argv);
        self.host.wrap(wrapped)
    }
}

impl PrivilegedExecutor for NsenterExecutor {
    fn run(&self, mut invocation: Invocation) -> std::io::Result<CommandOutput> {
        let argv = self.wrap(std::mem::take(&mut invocation.argv));
        spawn_and_wait(&argv, invocation)
    }
}

/// The process pinning the namespaces alive.
struct Keepalive {
    child: Child,
    pid: u32,
    host: HostExecutor,
}

impl Keepalive {
    fn spawn(host: &HostExecutor, namespaces: &[Namespace]) -> Result<Self> {
        let mut unshare = argv!["unshare"];
        unshare.extend(namespaces.iter().map(|ns| ns.flag().into()));
        if namespaces.contains(&Namespace::Pid) {
            unshare.extend(argv!["--fork", "--kill-child"]);
        }
        unshare.extend(argv!["--", KEEPALIVE_COMM, "infinity"]);
        let argv = host.wrap(unshare);
        debug!("spawning keepalive: {}", display_argv(&argv));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        match find_keepalive(&mut child) {
            Ok(pid) => {
                debug!("keepalive is pid {pid}");
                Ok(Keepalive {
                    child,
                    pid,
                    host: host.clone(),
                })
            }
            Err(e) => {
                let _ = child.kill();
                let output = child.wait_with_output()?;
                if output.status.success() {
                    Err(e)
                } else {
                    Err(PackageError::external(&argv, Some(output.status), &output.stderr))
                }
            }
        }
    }

    fn terminate(mut self) -> Result<()> {
        debug!("killing keepalive {}", self.pid);
        run_checked(&self.host, Invocation::new(argv!["kill", "-KILL", self.pid.to_string()]))?;
        self.child.wait()?;
        Ok(())
    }
}

fn comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim_end().to_string())
}

fn first_child(pid: u32) -> Option<u32> {
    std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Follows the process tree below `child` (sudo, unshare, ...) down to the keepalive itself.
fn find_keepalive(child: &mut Child) -> Result<u32> {
    let deadline = Instant::now() + KEEPALIVE_TIMEOUT;
    let mut pid = child.id();
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(std::io::Error::other(format!("keepalive exited early: {status}")).into());
        }
        if comm(pid).as_deref() == Some(KEEPALIVE_COMM) {
            return Ok(pid);
        }
        match first_child(pid) {
            Some(next) => pid = next,
            None if Instant::now() > deadline => {
                return Err(std::io::Error::other("timed out waiting for keepalive").into());
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

/// The real sandbox: `unshare` for scopes, `sudo` where needed.
#[derive(Debug, Clone, Default)]
pub struct UnshareSandbox {
    host: HostExecutor,
}

impl UnshareSandbox {
    pub fn new(host: HostExecutor) -> Self {
        UnshareSandbox { host }
    }
}

impl Sandbox for UnshareSandbox {
    fn open(&self, namespaces: &[Namespace]) -> Result<IsolationScope> {
        let keepalive = Keepalive::spawn(&self.host, namespaces)?;
        let exec = NsenterExecutor {
            host: self.host.clone(),
            target: keepalive.pid,
            namespaces: namespaces.to_vec(),
        };
        Ok(IsolationScope::from_parts(
            Arc::new(exec),
            Box::new(move || keepalive.terminate()),
        ))
    }

    fn host(&self) -> Arc<dyn PrivilegedExecutor> {
        Arc::new(self.host.clone())
    }
}
