//! Privileged command execution.
//!
//! Every mount, receive, rename, property change and tuning step goes through a
//! [`PrivilegedExecutor`].  The real implementations spawn processes (optionally via `sudo`, or
//! inside an isolation scope via `nsenter`); tests substitute a scripted fake.

use std::{
    ffi::{OsStr, OsString},
    os::fd::OwnedFd,
    process::{Command, ExitStatus, Stdio},
};

use log::debug;

use crate::error::{display_argv, PackageError, Result};

/// Builds a `Vec<OsString>` out of anything that is `AsRef<OsStr>`.
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$(::std::ffi::OsStr::new(&$arg).to_os_string()),*]
    };
}
pub(crate) use argv;

/// A single command to run with elevated privileges.
#[derive(Debug)]
pub struct Invocation {
    pub argv: Vec<OsString>,
    /// Bound to the child's stdin.  Otherwise stdin is `/dev/null`.
    pub stdin: Option<OwnedFd>,
    /// Bound to the child's stdout.  Otherwise stdout is captured.
    pub stdout: Option<OwnedFd>,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Invocation {
            argv: argv.into_iter().map(|a| a.as_ref().to_owned()).collect(),
            stdin: None,
            stdout: None,
        }
    }

    pub fn stdin(mut self, fd: OwnedFd) -> Self {
        self.stdin = Some(fd);
        self
    }

    pub fn stdout(mut self, fd: OwnedFd) -> Self {
        self.stdout = Some(fd);
        self
    }
}

/// What a finished command left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs commands with the privileges needed to manipulate btrfs filesystems.
pub trait PrivilegedExecutor: Send + Sync {
    /// Runs the invocation to completion.  A non-zero exit is *not* an error at this level; see
    /// [`run_checked`].
    fn run(&self, invocation: Invocation) -> std::io::Result<CommandOutput>;
}

/// Runs the invocation and converts a non-zero exit into [`PackageError::ExternalTool`].
pub fn run_checked(exec: &dyn PrivilegedExecutor, invocation: Invocation) -> Result<CommandOutput> {
    let argv = invocation.argv.clone();
    let output = exec
        .run(invocation)
        .map_err(|e| PackageError::external(&argv, None, e.to_string().as_bytes()))?;
    check(&argv, output)
}

/// Converts a non-zero exit into [`PackageError::ExternalTool`].
pub fn check(argv: &[OsString], output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(PackageError::external(argv, Some(output.status), &output.stderr))
    }
}

/// Spawns `argv` and waits for it, wiring up the optional stdio descriptors.
pub(crate) fn spawn_and_wait(argv: &[OsString], invocation: Invocation) -> std::io::Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::other("empty argv"));
    };
    debug!("running: {}", display_argv(argv));

    let mut cmd = Command::new(program);
    cmd.args(args).stderr(Stdio::piped());
    match invocation.stdin {
        Some(fd) => cmd.stdin(Stdio::from(fd)),
        None => cmd.stdin(Stdio::null()),
    };
    match invocation.stdout {
        Some(fd) => cmd.stdout(Stdio::from(fd)),
        None => cmd.stdout(Stdio::piped()),
    };

    // The Command holds the only copies of the passed descriptors; it must be gone before we
    // wait, or a pipe peer would never see EOF.
    let child = cmd.spawn();
    drop(cmd);
    let output = child?.wait_with_output()?;

    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Runs commands directly on the host, prefixed with `sudo` when we aren't root.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    sudo: bool,
}

impl HostExecutor {
    /// Uses `sudo --non-interactive` unless the current process already runs as root.
    pub fn new() -> Self {
        HostExecutor {
            sudo: !rustix::process::getuid().is_root(),
        }
    }

    /// Never uses `sudo`.
    pub fn unprefixed() -> Self {
        HostExecutor { sudo: false }
    }

    /// Prepends the privilege-escalation prefix, if any, to `argv`.
    pub fn wrap(&self, argv: Vec<OsString>) -> Vec<OsString> {
        if self.sudo {
            let mut wrapped: Vec<OsString> = vec!["sudo".into(), "--non-interactive".into()];
            wrapped.extend(argv);
            wrapped
        } else {
            argv
        }
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivilegedExecutor for HostExecutor {
    fn run(&self, mut invocation: Invocation) -> std::io::Result<CommandOutput> {
        let argv = self.wrap(std::mem::take(&mut invocation.argv));
        spawn_and_wait(&argv, invocation)
    }
}
