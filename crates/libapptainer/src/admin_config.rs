//! Administrator configuration, `apptainer.conf`.
//!
//! The file is a list of `key = value` lines. Comment lines start with `#`
//! and list directives such as `bind path` may repeat. [`AdminConfigFile`]
//! keeps the raw lines so `config global` can edit the file without losing
//! comments, [`AdminConfig`] is the typed view the launcher consumes.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum AdminConfigError {
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{key} is not a valid configuration directive")]
    UnknownDirective { key: String },
    #[error("bad value {value:?} for directive {key:?}: expected {expected}")]
    BadValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("{key} is not a multi-valued directive and is already set")]
    AlreadySet { key: String },
}

type Result<T> = std::result::Result<T, AdminConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Bool,
    Uint,
    Text,
    List,
    Choice(&'static [&'static str]),
}

#[derive(Debug)]
struct Directive {
    key: &'static str,
    default: &'static str,
    kind: ValueKind,
}

const MOUNT_DEV: &[&str] = &["yes", "no", "minimal"];
const TRI_STATE: &[&str] = &["yes", "no", "try", "driver"];
const ROOT_CAPS: &[&str] = &["full", "file", "no", "default"];
const MOUNT_ALLOWED: &[&str] = &["yes", "no", "iflimited"];

const DIRECTIVES: &[Directive] = &[
    Directive { key: "allow setuid", default: "yes", kind: ValueKind::Bool },
    Directive { key: "max loop devices", default: "256", kind: ValueKind::Uint },
    Directive { key: "allow pid ns", default: "yes", kind: ValueKind::Bool },
    Directive { key: "config passwd", default: "yes", kind: ValueKind::Bool },
    Directive { key: "config group", default: "yes", kind: ValueKind::Bool },
    Directive { key: "config resolv_conf", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount proc", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount sys", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount dev", default: "yes", kind: ValueKind::Choice(MOUNT_DEV) },
    Directive { key: "mount devpts", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount home", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount tmp", default: "yes", kind: ValueKind::Bool },
    Directive { key: "mount hostfs", default: "no", kind: ValueKind::Bool },
    Directive { key: "bind path", default: "", kind: ValueKind::List },
    Directive { key: "user bind control", default: "yes", kind: ValueKind::Bool },
    Directive { key: "enable fusemount", default: "yes", kind: ValueKind::Bool },
    Directive { key: "enable overlay", default: "try", kind: ValueKind::Choice(TRI_STATE) },
    Directive { key: "enable underlay", default: "yes", kind: ValueKind::Bool },
    Directive { key: "image driver", default: "", kind: ValueKind::Text },
    Directive { key: "mount slave", default: "yes", kind: ValueKind::Bool },
    Directive { key: "sessiondir max size", default: "64", kind: ValueKind::Uint },
    Directive { key: "allow container sif", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow container extfs", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow container dir", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow container squashfs", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow container encrypted", default: "yes", kind: ValueKind::Bool },
    Directive { key: "always use nv", default: "no", kind: ValueKind::Bool },
    Directive { key: "always use rocm", default: "no", kind: ValueKind::Bool },
    Directive { key: "use nvidia-container-cli", default: "no", kind: ValueKind::Bool },
    Directive { key: "root default capabilities", default: "full", kind: ValueKind::Choice(ROOT_CAPS) },
    Directive { key: "memory fs type", default: "tmpfs", kind: ValueKind::Choice(&["tmpfs", "ramfs"]) },
    Directive { key: "cni configuration path", default: "", kind: ValueKind::Text },
    Directive { key: "cni plugin path", default: "", kind: ValueKind::Text },
    Directive { key: "systemd cgroups", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow setuid-mount encrypted", default: "yes", kind: ValueKind::Bool },
    Directive { key: "allow setuid-mount extfs", default: "no", kind: ValueKind::Bool },
    Directive { key: "allow setuid-mount squashfs", default: "iflimited", kind: ValueKind::Choice(MOUNT_ALLOWED) },
];

fn directive(key: &str) -> Option<&'static Directive> {
    DIRECTIVES.iter().find(|d| d.key == key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Other(String),
    Entry { key: String, value: String },
}

/// Raw, order preserving representation of `apptainer.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminConfigFile {
    lines: Vec<Line>,
}

impl AdminConfigFile {
    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(raw.to_string());
                }
                match trimmed.split_once('=') {
                    Some((key, value)) => Line::Entry {
                        key: normalize_key(key),
                        value: value.trim().to_string(),
                    },
                    None => Line::Other(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    /// Loads the file, a missing file yields the builtin defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(?path, "admin configuration not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(AdminConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|source| AdminConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Other(raw) => {
                    let _ = writeln!(out, "{raw}");
                }
                Line::Entry { key, value } => {
                    let _ = writeln!(out, "{key} = {value}");
                }
            }
        }
        out
    }

    /// All values recorded for `key`, in file order.
    pub fn values(&self, key: &str) -> Vec<&str> {
        let key = normalize_key(key);
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Entry { key: k, value } if *k == key => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Current value, falling back to the builtin default.
    pub fn get(&self, key: &str) -> Result<String> {
        let d = known(key)?;
        let values = self.values(key);
        if values.is_empty() {
            return Ok(d.default.to_string());
        }
        Ok(values.join(", "))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let d = known(key)?;
        validate(d, value)?;
        let key = normalize_key(key);
        if d.kind == ValueKind::List {
            if !self.values(&key).contains(&value) {
                self.lines.push(Line::Entry {
                    key,
                    value: value.to_string(),
                });
            }
            return Ok(());
        }
        let mut replaced = false;
        for line in self.lines.iter_mut() {
            if let Line::Entry { key: k, value: v } = line {
                if *k == key {
                    *v = value.to_string();
                    replaced = true;
                }
            }
        }
        if !replaced {
            self.lines.push(Line::Entry {
                key,
                value: value.to_string(),
            });
        }
        Ok(())
    }

    /// Removes `value` from a directive, or every occurrence when `value`
    /// is `None`.
    pub fn unset(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        known(key)?;
        let key = normalize_key(key);
        self.lines.retain(|l| match l {
            Line::Entry { key: k, value: v } if *k == key => match value {
                Some(value) => v != value,
                None => false,
            },
            _ => true,
        });
        Ok(())
    }

    /// Restores the builtin default of a directive.
    pub fn reset(&mut self, key: &str) -> Result<()> {
        let d = known(key)?;
        self.unset(key, None)?;
        if !d.default.is_empty() {
            self.set(key, d.default)?;
        }
        Ok(())
    }

    /// Builds the typed view, rejecting out of range values.
    pub fn typed(&self) -> Result<AdminConfig> {
        for line in &self.lines {
            if let Line::Entry { key, value } = line {
                match directive(key) {
                    Some(d) => validate(d, value)?,
                    None => tracing::warn!(%key, "ignoring unknown configuration directive"),
                }
            }
        }
        let flag = |key: &str| -> Result<bool> { Ok(self.get(key)? == "yes") };
        let number = |key: &str| -> Result<u64> {
            let value = self.get(key)?;
            value.parse().map_err(|_| AdminConfigError::BadValue {
                key: key.to_string(),
                value,
                expected: "an unsigned integer",
            })
        };
        Ok(AdminConfig {
            allow_setuid: flag("allow setuid")?,
            max_loop_devices: number("max loop devices")?,
            allow_pid_ns: flag("allow pid ns")?,
            mount_proc: flag("mount proc")?,
            mount_sys: flag("mount sys")?,
            mount_dev: self.get("mount dev")?,
            mount_devpts: flag("mount devpts")?,
            mount_home: flag("mount home")?,
            mount_tmp: flag("mount tmp")?,
            mount_hostfs: flag("mount hostfs")?,
            bind_paths: self.values("bind path").iter().map(|s| s.to_string()).collect(),
            user_bind_control: flag("user bind control")?,
            enable_fusemount: flag("enable fusemount")?,
            enable_overlay: self.get("enable overlay")?,
            image_driver: self.get("image driver")?,
            sessiondir_max_size: number("sessiondir max size")?,
            always_use_nv: flag("always use nv")?,
            always_use_rocm: flag("always use rocm")?,
            use_nvidia_container_cli: flag("use nvidia-container-cli")?,
            root_default_capabilities: self.get("root default capabilities")?,
            systemd_cgroups: flag("systemd cgroups")?,
            allow_setuid_mount_squashfs: self.get("allow setuid-mount squashfs")?,
            allow_setuid_mount_encrypted: flag("allow setuid-mount encrypted")?,
            allow_container_extfs: flag("allow container extfs")?,
            allow_container_encrypted: flag("allow container encrypted")?,
        })
    }
}

fn normalize_key(key: &str) -> String {
    key.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn known(key: &str) -> Result<&'static Directive> {
    directive(&normalize_key(key)).ok_or_else(|| AdminConfigError::UnknownDirective {
        key: key.to_string(),
    })
}

fn validate(d: &Directive, value: &str) -> Result<()> {
    let bad = |expected| AdminConfigError::BadValue {
        key: d.key.to_string(),
        value: value.to_string(),
        expected,
    };
    match d.kind {
        ValueKind::Bool if value != "yes" && value != "no" => Err(bad("yes or no")),
        ValueKind::Uint if value.parse::<u64>().is_err() => Err(bad("an unsigned integer")),
        ValueKind::Choice(choices) if !choices.contains(&value) => Err(bad("one of the documented choices")),
        _ => Ok(()),
    }
}

/// Typed administrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConfig {
    pub allow_setuid: bool,
    pub max_loop_devices: u64,
    pub allow_pid_ns: bool,
    pub mount_proc: bool,
    pub mount_sys: bool,
    pub mount_dev: String,
    pub mount_devpts: bool,
    pub mount_home: bool,
    pub mount_tmp: bool,
    pub mount_hostfs: bool,
    pub bind_paths: Vec<String>,
    pub user_bind_control: bool,
    pub enable_fusemount: bool,
    pub enable_overlay: String,
    /// Name of a registered user space driver able to mount images.
    pub image_driver: String,
    pub sessiondir_max_size: u64,
    pub always_use_nv: bool,
    pub always_use_rocm: bool,
    pub use_nvidia_container_cli: bool,
    pub root_default_capabilities: String,
    pub systemd_cgroups: bool,
    pub allow_setuid_mount_squashfs: String,
    pub allow_setuid_mount_encrypted: bool,
    pub allow_container_extfs: bool,
    pub allow_container_encrypted: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            max_loop_devices: 256,
            allow_pid_ns: true,
            mount_proc: true,
            mount_sys: true,
            mount_dev: "yes".to_string(),
            mount_devpts: true,
            mount_home: true,
            mount_tmp: true,
            mount_hostfs: false,
            bind_paths: Vec::new(),
            user_bind_control: true,
            enable_fusemount: true,
            enable_overlay: "try".to_string(),
            image_driver: String::new(),
            sessiondir_max_size: 64,
            always_use_nv: false,
            always_use_rocm: false,
            use_nvidia_container_cli: false,
            root_default_capabilities: "full".to_string(),
            systemd_cgroups: true,
            allow_setuid_mount_squashfs: "iflimited".to_string(),
            allow_setuid_mount_encrypted: true,
            allow_container_extfs: true,
            allow_container_encrypted: true,
        }
    }
}

impl AdminConfig {
    pub fn load(path: &Path) -> Result<Self> {
        AdminConfigFile::load(path)?.typed()
    }

    /// Whether an image driver is registered to mount images without
    /// privileges, so user namespace runs don't need to extract them.
    pub fn image_driver_can_mount(&self) -> bool {
        !self.image_driver.is_empty()
    }
}
