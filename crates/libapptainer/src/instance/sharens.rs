//! `--sharens` rendezvous.
//!
//! Processes sharing a parent elect the first of them through an exclusive
//! lock on `/dev/shm/sharens_instance_<ppid>`. The first starts an instance
//! named like the lock file and writes a non-zero byte at offset 0 once it
//! runs; the others block on a shared lock until then and join it.
//!
//! Locks are open file description locks: they belong to the descriptor,
//! not the process, so two descriptors conflict even within one process.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

const SHM_DIR: &str = "/dev/shm";
const PREFIX: &str = "sharens_instance_";

#[derive(Debug, thiserror::Error)]
pub enum SharensError {
    #[error("failed to open sharens lock {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to lock {path:?}")]
    Lock { path: PathBuf, source: Errno },
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("first process has already exited")]
    FirstExited,
}

type Result<T> = std::result::Result<T, SharensError>;

/// Instance name shared by the processes of one parent.
pub fn instance_name(ppid: i32) -> String {
    format!("{PREFIX}{ppid}")
}

pub fn lock_path(ppid: i32) -> PathBuf {
    Path::new(SHM_DIR).join(instance_name(ppid))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Starts the instance.
    First,
    /// Joins once the first process signals success.
    Waiter,
}

#[derive(Debug)]
pub struct Rendezvous {
    file: File,
    path: PathBuf,
    role: Role,
}

fn flock(typ: libc::c_int) -> libc::flock {
    // zeroed start and length cover the whole file
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = typ as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock
}

fn set_lock(fd: RawFd, typ: libc::c_int, wait: bool) -> nix::Result<()> {
    let lock = flock(typ);
    let arg = if wait {
        FcntlArg::F_OFD_SETLKW(&lock)
    } else {
        FcntlArg::F_OFD_SETLK(&lock)
    };
    fcntl(fd, arg).map(|_| ())
}

impl Rendezvous {
    /// Joins the rendezvous of `ppid` under `/dev/shm`.
    pub fn open(ppid: i32) -> Result<Self> {
        Self::open_at(&lock_path(ppid))
    }

    #[tracing::instrument(level = "trace")]
    pub fn open_at(path: &Path) -> Result<Self> {
        let open_err = |source| SharensError::Open {
            path: path.to_path_buf(),
            source,
        };
        let (file, existing) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(path)
        {
            Ok(file) => (file, false),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(open_err)?;
                (file, true)
            }
            Err(err) => return Err(open_err(err)),
        };

        let mut rendezvous = Self {
            file,
            path: path.to_path_buf(),
            role: Role::Waiter,
        };
        match set_lock(rendezvous.file.as_raw_fd(), libc::F_WRLCK, false) {
            Ok(()) => {
                if existing && rendezvous.started()? {
                    // the group already started, behave like a late waiter
                    rendezvous.unlock()?;
                } else {
                    rendezvous.role = Role::First;
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EACCES) => {}
            Err(source) => {
                return Err(SharensError::Lock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        tracing::debug!(?path, role = ?rendezvous.role, "sharens rendezvous");
        Ok(rendezvous)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_first(&self) -> bool {
        self.role == Role::First
    }

    /// Descriptor handed to the starter of the first process.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn io_err(&self) -> impl FnOnce(std::io::Error) -> SharensError + '_ {
        move |source| SharensError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn started(&mut self) -> Result<bool> {
        let mut byte = [0u8; 1];
        self.file.seek(SeekFrom::Start(0)).map_err(self.io_err())?;
        let n = self.file.read(&mut byte).map_err(self.io_err())?;
        Ok(n == 1 && byte[0] != 0)
    }

    fn unlock(&self) -> Result<()> {
        set_lock(self.file.as_raw_fd(), libc::F_UNLCK, false).map_err(|source| SharensError::Lock {
            path: self.path.clone(),
            source,
        })
    }

    /// Called by the first process once its instance runs. Waiters are
    /// released.
    pub fn mark_started(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).map_err(self.io_err())?;
        self.file.write_all(&[1]).map_err(self.io_err())?;
        self.file.sync_all().map_err(self.io_err())?;
        self.unlock()
    }

    /// Releases waiters without marking success, they will find no instance.
    pub fn abandon(&self) -> Result<()> {
        self.unlock()
    }

    /// Blocks until the first process is done starting and reports whether
    /// it succeeded.
    pub fn wait(&mut self) -> Result<bool> {
        set_lock(self.file.as_raw_fd(), libc::F_RDLCK, true).map_err(|source| SharensError::Lock {
            path: self.path.clone(),
            source,
        })?;
        let started = self.started();
        self.unlock()?;
        started
    }
}
