use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Command;

use nix::fcntl::{open, OFlag};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, getgid, getuid, write};

use super::{FakerootError, Result};

/// Set in the environment of a build re-executed under a root-mapped user
/// namespace.
pub const FAKEFAKEROOT_ENV: &str = "_APPTAINER_FAKEFAKEROOT";

/// Runs a command as root of a fresh user namespace that maps only the
/// caller, the way `unshare -r` does.
pub trait RootMappedExecutor {
    /// Runs `args` and returns its exit status.
    fn run(&self, args: &[OsString], mount_ns: bool, env: &[(String, String)]) -> Result<i32>;

    /// Probes whether an unprivileged user namespace can be created.
    fn userns_available(&self) -> bool {
        matches!(self.run(&[OsString::from("/bin/true")], false, &[]), Ok(0))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnshareExecutor;

fn write_proc(path: &str, content: &[u8]) -> nix::Result<()> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    let res = write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, content);
    let _ = close(fd);
    res.map(|_| ())
}

impl RootMappedExecutor for UnshareExecutor {
    fn run(&self, args: &[OsString], mount_ns: bool, env: &[(String, String)]) -> Result<i32> {
        let Some((program, rest)) = args.split_first() else {
            return Err(FakerootError::Unshare(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            )));
        };
        let mut flags = CloneFlags::CLONE_NEWUSER;
        if mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        // formatted before fork, the child must not allocate
        let uid_map = format!("0 {} 1", getuid());
        let gid_map = format!("0 {} 1", getgid());

        let mut cmd = Command::new(program);
        cmd.args(rest).envs(env.iter().map(|(k, v)| (k, v)));
        unsafe {
            cmd.pre_exec(move || {
                unshare(flags)?;
                write_proc("/proc/self/setgroups", b"deny")?;
                write_proc("/proc/self/uid_map", uid_map.as_bytes())?;
                write_proc("/proc/self/gid_map", gid_map.as_bytes())?;
                Ok(())
            });
        }

        tracing::debug!(?program, "Executing in root-mapped unprivileged user namespace");
        let status = cmd.status().map_err(FakerootError::Unshare)?;
        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(sig)) => Ok(128 + sig),
            (None, None) => Ok(255),
        }
    }
}
