//! Hand-off to the starter binary.
//!
//! The engine config is written to an unlinked temporary file whose
//! descriptor the starter inherits through `PIPE_EXEC_FD`. Interactive runs
//! replace the current process, instances are spawned with their output
//! routed to log files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

/// Environment variable holding the config descriptor number.
pub const CONFIG_FD_ENV: &str = "PIPE_EXEC_FD";
const LOAD_OVERLAY_ENV: &str = "LOAD_OVERLAY_MODULE";
const INSTANCE_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StarterError {
    #[error("failed to pass the engine config to the starter")]
    Config(#[source] std::io::Error),
    #[error("failed to clear close-on-exec on the config descriptor")]
    Inherit(#[source] nix::Error),
    #[error("failed to execute {binary:?}")]
    Exec {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open instance log {path:?}")]
    Log {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start instance: exit status {0}")]
    InstanceFailed(i32),
}

type Result<T> = std::result::Result<T, StarterError>;

/// What the starter is invoked with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StarterRequest {
    /// Process name shown by `ps`.
    pub procname: String,
    pub binary: PathBuf,
    pub config: Vec<u8>,
    pub env: Vec<(String, String)>,
    pub load_overlay: bool,
}

/// Instance process spawned in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub pid: i32,
    /// Exit status of the starter, `None` when it was not waited for.
    pub exited: Option<i32>,
}

pub trait Starter {
    /// Replaces the current process. Only returns on failure, or from test
    /// doubles.
    fn exec(&self, req: &StarterRequest) -> Result<()>;

    /// Spawns the starter with its output redirected, waits for it to
    /// return and then lets the instance settle for `settle`.
    fn run(&self, req: &StarterRequest, stdout: File, stderr: File, settle: Duration) -> Result<Spawned>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessStarter;

fn config_file(config: &[u8]) -> Result<File> {
    let mut file = tempfile::tempfile().map_err(StarterError::Config)?;
    file.write_all(config).map_err(StarterError::Config)?;
    file.seek(SeekFrom::Start(0)).map_err(StarterError::Config)?;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())).map_err(StarterError::Inherit)?;
    Ok(file)
}

impl ProcessStarter {
    fn command(&self, req: &StarterRequest, config: &File) -> Command {
        let mut cmd = Command::new(&req.binary);
        cmd.arg0(&req.procname)
            .envs(req.env.iter().map(|(k, v)| (k, v)))
            .env(CONFIG_FD_ENV, config.as_raw_fd().to_string());
        if req.load_overlay {
            cmd.env(LOAD_OVERLAY_ENV, "1");
        }
        cmd
    }
}

impl Starter for ProcessStarter {
    fn exec(&self, req: &StarterRequest) -> Result<()> {
        let config = config_file(&req.config)?;
        tracing::debug!(binary = ?req.binary, procname = %req.procname, "executing starter");
        let err = self.command(req, &config).exec();
        Err(StarterError::Exec {
            binary: req.binary.clone(),
            source: err,
        })
    }

    fn run(&self, req: &StarterRequest, stdout: File, stderr: File, settle: Duration) -> Result<Spawned> {
        let config = config_file(&req.config)?;
        let mut child = self
            .command(req, &config)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| StarterError::Exec {
                binary: req.binary.clone(),
                source,
            })?;
        drop(config);
        // the starter returns once the instance is running in the background
        let status = child.wait().map_err(|source| StarterError::Exec {
            binary: req.binary.clone(),
            source,
        })?;
        std::thread::sleep(settle);
        Ok(Spawned {
            pid: child.id() as i32,
            exited: Some(status.code().unwrap_or(255)),
        })
    }
}

/// `ps` name of an interactive run.
pub fn interactive_procname() -> String {
    "Apptainer runtime parent".to_string()
}

/// `ps` name of an instance process.
pub fn instance_procname(name: &str, username: &str) -> String {
    format!("Apptainer instance: {username} [{name}]")
}

/// Replaces the current process with the starter.
pub fn dispatch_interactive(starter: &dyn Starter, req: &StarterRequest) -> Result<()> {
    starter.exec(req)
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .map_err(|source| StarterError::Log {
            path: path.to_path_buf(),
            source,
        })
}

/// Starts an instance with its output appended to `out` and `err`. What the
/// starter wrote to `err` during start up is echoed to our stderr.
pub fn dispatch_instance(starter: &dyn Starter, req: &StarterRequest, out: &Path, err: &Path) -> Result<Spawned> {
    let stdout = open_log(out)?;
    let mut stderr = open_log(err)?;
    let offset = stderr
        .seek(SeekFrom::End(0))
        .map_err(|source| StarterError::Log {
            path: err.to_path_buf(),
            source,
        })?;

    let spawned = starter.run(req, stdout, stderr, INSTANCE_SETTLE)?;

    match echo_tail(err, offset) {
        Ok(tail) if !tail.is_empty() => eprint!("{tail}"),
        Ok(_) => {}
        Err(err) => tracing::warn!(?err, "could not read instance error log"),
    }
    match spawned.exited {
        Some(code) if code != 0 => Err(StarterError::InstanceFailed(code)),
        _ => {
            tracing::info!("instance started successfully");
            Ok(spawned)
        }
    }
}

fn echo_tail(path: &Path, offset: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut tail = String::new();
    file.read_to_string(&mut tail)?;
    Ok(tail)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use std::cell::RefCell;

    /// Records requests, optionally writes to the error log on `run`.
    #[derive(Default)]
    pub(crate) struct RecordingStarter {
        pub(crate) execs: RefCell<Vec<StarterRequest>>,
        pub(crate) runs: RefCell<Vec<StarterRequest>>,
        pub(crate) exit: Option<i32>,
        pub(crate) stderr: &'static str,
    }

    impl Starter for RecordingStarter {
        fn exec(&self, req: &StarterRequest) -> super::Result<()> {
            self.execs.borrow_mut().push(req.clone());
            Ok(())
        }

        fn run(
            &self,
            req: &StarterRequest,
            _stdout: File,
            mut stderr: File,
            _settle: Duration,
        ) -> super::Result<Spawned> {
            self.runs.borrow_mut().push(req.clone());
            let _ = stderr.write_all(self.stderr.as_bytes());
            Ok(Spawned {
                pid: std::process::id() as i32,
                exited: self.exit,
            })
        }
    }

    fn request() -> StarterRequest {
        StarterRequest {
            procname: instance_procname("web", "alice"),
            binary: PathBuf::from("/bin/true"),
            config: b"{}".to_vec(),
            env: Vec::new(),
            load_overlay: false,
        }
    }

    #[test]
    fn test_dispatch_instance() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let (out, err) = (tmp.path().join("web.out"), tmp.path().join("web.err"));
        std::fs::write(&err, "previous run\n")?;

        let starter = RecordingStarter {
            stderr: "starting\n",
            ..Default::default()
        };
        let spawned = dispatch_instance(&starter, &request(), &out, &err)?;
        assert_eq!(spawned.pid, std::process::id() as i32);
        assert_eq!(echo_tail(&err, 13)?, "starting\n");
        assert_eq!(starter.runs.borrow()[0].procname, "Apptainer instance: alice [web]");

        let failing = RecordingStarter {
            exit: Some(255),
            ..Default::default()
        };
        assert!(matches!(
            dispatch_instance(&failing, &request(), &out, &err),
            Err(StarterError::InstanceFailed(255))
        ));
        Ok(())
    }

    #[test]
    fn test_process_starter_run() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let req = StarterRequest {
            binary: PathBuf::from("/bin/sh"),
            ..request()
        };
        let out = File::create(tmp.path().join("out"))?;
        let err = File::create(tmp.path().join("err"))?;
        // /bin/sh reads no script from a closed stdin and exits 0
        let spawned = ProcessStarter.run(&req, out, err, Duration::from_millis(200))?;
        assert!(spawned.pid > 0);
        assert_eq!(spawned.exited, Some(0));
        Ok(())
    }

    #[test]
    fn test_late_starter_failure() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir()?;
        let script = tmp.path().join("starter");
        std::fs::write(&script, "#!/bin/sh\necho 'no space left' >&2\nsleep 0.4\nexit 3\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        let req = StarterRequest {
            binary: script,
            ..request()
        };
        let (out, err) = (tmp.path().join("web.out"), tmp.path().join("web.err"));
        assert!(matches!(
            dispatch_instance(&ProcessStarter, &req, &out, &err),
            Err(StarterError::InstanceFailed(3))
        ));
        assert_eq!(std::fs::read_to_string(&err)?, "no space left\n");
        Ok(())
    }
}
