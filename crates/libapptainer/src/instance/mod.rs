//! Instance records.
//!
//! Each instance owns a directory `<root>/<hostname>/<user>/<name>` holding
//! `<name>.json` with its log files `<name>.out` and `<name>.err` next to
//! it. Only the owner writes into it.

pub mod sharens;
pub mod stats;
pub mod stop;

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance name {0:?} is not valid, only alphanumeric characters, '.', '_' and '-' are allowed")]
    InvalidName(String),
    #[error("instance {0} already exists")]
    Exists(String),
    #[error("no instance found with name {0}")]
    NotFound(String),
    #[error("no instance found")]
    NoneMatched,
    #[error("failed to open instance file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse instance file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write instance file {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write pid file {path:?}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("instance {0} was not started with cgroups")]
    NoCgroup(String),
    #[error("instance stats are not available for fakeroot instances")]
    StatsFakeroot,
    #[error("instance stats are not available when /proc is mounted with hidepid")]
    StatsHidepid,
    #[error("failed to read instance cgroup")]
    Cgroup(String),
    #[error("failed to signal instance {name}")]
    Signal { name: String, source: nix::Error },
    #[error("failed to scan {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, InstanceError>;

/// Persisted state of a running instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub image: String,
    pub pid: i32,
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// The container runs in a user namespace.
    pub user_ns: bool,
    /// The container was placed in its own cgroup.
    pub cgroup: bool,
    #[serde(default)]
    pub fakeroot: bool,
    /// Started by the first process of a `--sharens` group.
    #[serde(default)]
    pub share_ns: bool,
    pub created: DateTime<Utc>,
    pub log_out_path: PathBuf,
    pub log_err_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl InstanceRecord {
    /// Whether the instance process still runs. Zombies count as gone.
    pub fn is_alive(&self) -> bool {
        if kill(Pid::from_raw(self.pid), None).is_err() {
            return false;
        }
        match procfs::process::Process::new(self.pid).and_then(|p| p.stat()) {
            Ok(stat) => stat.state != 'Z',
            Err(_) => false,
        }
    }
}

/// Instance directories of one user on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStore {
    dir: PathBuf,
}

/// Converts a shell style pattern into an anchored regex.
fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

pub fn check_name(name: &str) -> Result<()> {
    if !VALID_NAME.is_match(name) {
        return Err(InstanceError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl InstanceStore {
    /// `root` is the instances directory of the user.
    pub fn new(root: &Path, hostname: &str, user: &str) -> Self {
        Self {
            dir: root.join(hostname).join(user),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(format!("{name}.json"))
    }

    /// Log files of `name`, stdout first.
    pub fn log_paths(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = self.instance_dir(name);
        (dir.join(format!("{name}.out")), dir.join(format!("{name}.err")))
    }

    /// Creates the instance directory so logs can be written before the
    /// record exists.
    pub fn prepare(&self, name: &str) -> Result<(PathBuf, PathBuf)> {
        check_name(name)?;
        let dir = self.instance_dir(name);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|source| InstanceError::Write {
                path: dir.clone(),
                source,
            })?;
        Ok(self.log_paths(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    #[instrument(level = "trace", skip(record), fields(name = %record.name))]
    pub fn save(&self, record: &InstanceRecord) -> Result<()> {
        self.prepare(&record.name)?;
        let path = self.record_path(&record.name);
        let write_err = |source| InstanceError::Write {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record).map_err(|source| InstanceError::Parse {
            path: path.clone(),
            source,
        })?;
        writer.flush().map_err(write_err)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<InstanceRecord> {
        check_name(name)?;
        let path = self.record_path(name);
        let file = File::open(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => InstanceError::NotFound(name.to_string()),
            _ => InstanceError::Open {
                path: path.clone(),
                source,
            },
        })?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| InstanceError::Parse { path, source })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.instance_dir(name);
        fs::remove_dir_all(&dir).map_err(|source| InstanceError::Write { path: dir, source })
    }

    /// Records matching the glob `pattern`, sorted by name. Records of
    /// exited instances are removed on the way.
    pub fn list(&self, pattern: &str) -> Result<Vec<InstanceRecord>> {
        let Some(matcher) = glob_regex(pattern) else {
            return Err(InstanceError::InvalidName(pattern.to_string()));
        };
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(InstanceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matcher.is_match(&name) || !self.exists(&name) {
                continue;
            }
            let record = match self.get(&name) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(?err, "skipping unreadable instance {name}");
                    continue;
                }
            };
            if !record.is_alive() {
                tracing::debug!(pid = record.pid, "removing record of exited instance {name}");
                if let Err(err) = self.delete(&name) {
                    tracing::warn!(?err, "could not remove instance {name}");
                }
                continue;
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// Writes `<pid>\n` to `path` without following a symlink there.
pub fn write_pid_file(path: &Path, pid: i32) -> Result<()> {
    let pid_err = |source| InstanceError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(pid_err)?;
    writeln!(file, "{pid}").map_err(pid_err)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;

    pub(crate) fn record(store: &InstanceStore, name: &str, pid: i32) -> InstanceRecord {
        let (out, err) = store.log_paths(name);
        InstanceRecord {
            name: name.to_string(),
            image: "/images/alpine.sif".to_string(),
            pid,
            user: "alice".to_string(),
            ip: String::new(),
            user_ns: true,
            cgroup: false,
            fakeroot: false,
            share_ns: false,
            created: Utc::now(),
            log_out_path: out,
            log_err_path: err,
            checkpoint: None,
        }
    }

    #[test]
    fn test_save_get_delete() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = InstanceStore::new(tmp.path(), "node1", "alice");
        let rec = record(&store, "web", std::process::id() as i32);
        store.save(&rec)?;
        assert!(store.exists("web"));
        assert!(tmp.path().join("node1/alice/web/web.json").is_file());
        assert_eq!(store.get("web")?, rec);
        assert_eq!(rec.log_err_path, tmp.path().join("node1/alice/web/web.err"));

        store.delete("web")?;
        assert!(matches!(store.get("web"), Err(InstanceError::NotFound(_))));
        assert!(matches!(store.get("../x"), Err(InstanceError::InvalidName(_))));
        Ok(())
    }

    #[test]
    fn test_list_glob_and_prune() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = InstanceStore::new(tmp.path(), "node1", "alice");
        let me = std::process::id() as i32;
        for name in ["web1", "web2", "db"] {
            store.save(&record(&store, name, me))?;
        }
        // pid beyond the default pid_max is never alive
        store.save(&record(&store, "gone", 4_194_305))?;

        let names: Vec<_> = store.list("web*")?.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["web1", "web2"]);
        assert_eq!(store.list("*")?.len(), 3);
        assert!(!store.exists("gone"));
        assert_eq!(store.list("d?")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_pid_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("web.pid");
        write_pid_file(&path, 4242)?;
        assert_eq!(std::fs::read_to_string(&path)?, "4242\n");

        let link = tmp.path().join("link.pid");
        std::os::unix::fs::symlink(&path, &link)?;
        assert!(matches!(
            write_pid_file(&link, 1),
            Err(InstanceError::PidFile { .. })
        ));
        Ok(())
    }
}
