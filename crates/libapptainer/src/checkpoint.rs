//! DMTCP checkpoint state directories and the launch/restart wiring.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::bind::BindPath;
use crate::gpu::GpuProbe;

/// Where the state directory appears inside the container.
pub const CONTAINER_STATE_PATH: &str = "/.checkpoint";
const PORT_FILE: &str = "coord.port";
const LOG_FILE: &str = "coord.log";
/// Lists the DMTCP binaries and libraries, under the admin config dir.
pub const DMTCP_CONF: &str = "dmtcp-conf.yaml";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint name must not be empty")]
    EmptyName,
    #[error("checkpoint {0:?} not found")]
    NotFound(String),
    #[error("checkpoint {0:?} already exists")]
    Exists(String),
    #[error("unable to scan port from checkpoint data")]
    NoPort,
    #[error("could not read {path:?}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {path:?}")]
    ConfigSyntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("while resolving DMTCP files")]
    Resolve(#[from] crate::gpu::GpuError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    path: PathBuf,
}

impl Entry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Port written by the coordinator on its first line.
    pub fn coordinator_port(&self) -> Result<String> {
        let content = std::fs::read_to_string(self.path.join(PORT_FILE))?;
        content
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or(CheckpointError::NoPort)
    }

    pub fn bind_path(&self) -> BindPath {
        BindPath::new(self.path.to_string_lossy(), CONTAINER_STATE_PATH)
    }
}

/// Checkpoint directories of one user.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(CheckpointError::EmptyName);
        }
        Ok(self.root.join(name))
    }

    pub fn create(&self, name: &str) -> Result<Entry> {
        let path = self.entry_path(name)?;
        if path.exists() {
            return Err(CheckpointError::Exists(name.to_string()));
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)?;
        Ok(Entry { path })
    }

    pub fn get(&self, name: &str) -> Result<Entry> {
        let path = self.entry_path(name)?;
        if !path.is_dir() {
            return Err(CheckpointError::NotFound(name.to_string()));
        }
        Ok(Entry { path })
    }

    pub fn list(&self) -> Result<Vec<Entry>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries: Vec<Entry> = dir
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| Entry { path: e.path() })
            .collect();
        entries.sort_by_key(|e| e.name());
        Ok(entries)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let entry = self.get(name)?;
        std::fs::remove_dir_all(entry.path())?;
        Ok(())
    }
}

/// Checkpoint part of the engine config.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmtcpConfig {
    pub enabled: bool,
    pub restart: bool,
    pub checkpoint: String,
    pub args: Vec<String>,
}

impl DmtcpConfig {
    pub fn launch(checkpoint: &str) -> Self {
        Self {
            enabled: true,
            restart: false,
            checkpoint: checkpoint.to_string(),
            args: launch_args(),
        }
    }

    pub fn restart(checkpoint: &str) -> Self {
        Self {
            enabled: true,
            restart: true,
            checkpoint: checkpoint.to_string(),
            args: restart_args(),
        }
    }

    /// Container argv: a restart ignores the user arguments, a launch runs
    /// them under `dmtcp_launch`.
    pub fn inject_args(&self, argv: &[String]) -> Vec<String> {
        if self.restart {
            return self.args.clone();
        }
        self.args.iter().chain(argv).cloned().collect()
    }
}

fn state_file(name: &str) -> String {
    format!("{CONTAINER_STATE_PATH}/{name}")
}

pub fn launch_args() -> Vec<String> {
    vec![
        "dmtcp_launch".to_string(),
        "--coord-port".to_string(),
        "0".to_string(),
        "--coord-logfile".to_string(),
        state_file(LOG_FILE),
        "--port-file".to_string(),
        state_file(PORT_FILE),
        "--ckptdir".to_string(),
        CONTAINER_STATE_PATH.to_string(),
        "--no-gzip".to_string(),
        "--ckpt-open-files".to_string(),
    ]
}

pub fn restart_args() -> Vec<String> {
    vec![state_file("dmtcp_restart_script.sh")]
}

/// Command asking the coordinator on `port` to checkpoint.
pub fn checkpoint_args(port: &str) -> Vec<String> {
    ["dmtcp_command", "--coord-port", port, "-c"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default, serde::Deserialize)]
struct DmtcpFiles {
    #[serde(default)]
    bins: Vec<String>,
    #[serde(default)]
    libs: Vec<String>,
}

/// `src:/usr/bin/<name>` binds for the binaries and library paths of the
/// DMTCP installation described in `conf`.
pub fn dmtcp_paths(conf: &Path, probe: &dyn GpuProbe) -> Result<(Vec<String>, Vec<String>)> {
    let content = std::fs::read_to_string(conf).map_err(|source| CheckpointError::Config {
        path: conf.to_path_buf(),
        source,
    })?;
    let files: DmtcpFiles =
        serde_yaml::from_str(&content).map_err(|source| CheckpointError::ConfigSyntax {
            path: conf.to_path_buf(),
            source,
        })?;
    let list: Vec<String> = files.bins.into_iter().chain(files.libs).collect();
    let found = probe.resolve(&list)?;
    let bins = found
        .bins
        .iter()
        .map(|bin| {
            let name = Path::new(bin)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{bin}:/usr/bin/{name}")
        })
        .collect();
    Ok((bins, found.libs))
}
