//! Remote endpoints configuration (`remote.yaml`).
//!
//! The user file lives in the user config directory, the global one under
//! the install configuration directory. Global remotes are merged into the
//! user view with [`RemoteConfig::sync_from`].

pub mod credentials;
pub mod endpoint;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use credentials::{same_uri, Credential};
use endpoint::{EndPoint, ServiceConfig};

/// Name of the built-in remote.
pub const DEFAULT_REMOTE_NAME: &str = "DefaultRemote";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{0} is not a remote")]
    NotARemote(String),
    #[error("{0} is already a remote")]
    AlreadyARemote(String),
    #[error("{0} is global and can't be removed")]
    GlobalRemove(String),
    #[error("exclusive can't be set by user")]
    ExclusiveByUser,
    #[error("could not use {name}: remote {exclusive} has been set exclusive by the system administrator")]
    Exclusive { name: String, exclusive: String },
    #[error("no default remote")]
    NoDefault,
    #[error("keyserver {0} is already configured")]
    KeyserverExists(String),
    #[error("keyserver {0} is not configured")]
    KeyserverNotFound(String),
    #[error("no external keyserver configuration found for {0}")]
    NoKeyserverConfig(String),
    #[error("{0} transport is not supported")]
    UnsupportedLogin(String),
    #[error("failed to read remote config {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode remote config {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to write remote config {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode remote config")]
    Encode(#[source] serde_yaml::Error),
    #[error(transparent)]
    Credentials(#[from] credentials::CredentialsError),
}

type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(rename = "Active", default)]
    pub active: String,
    #[serde(rename = "Remotes", default)]
    pub remotes: BTreeMap<String, EndPoint>,
    #[serde(rename = "Credentials", default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<Credential>,
    /// Loaded from the global file, which may set exclusivity.
    #[serde(skip)]
    system: bool,
}

impl RemoteConfig {
    /// The configuration used when no file exists yet.
    pub fn builtin() -> Self {
        let mut remotes = BTreeMap::new();
        remotes.insert(DEFAULT_REMOTE_NAME.to_string(), EndPoint::default_cloud());
        Self {
            active: DEFAULT_REMOTE_NAME.to_string(),
            remotes,
            ..Default::default()
        }
    }

    /// Parses `path`. A missing or empty file gives an empty config.
    #[tracing::instrument(level = "trace")]
    pub fn load(path: &Path, system: bool) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(RemoteError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut config = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).map_err(|source| RemoteError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.system = system;
        Ok(config)
    }

    /// Writes the config in place: 0600 for a user file, 0644 for the
    /// global one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |source| RemoteError::Write {
            path: path.to_path_buf(),
            source,
        };
        let data = serde_yaml::to_string(self).map_err(RemoteError::Encode)?;
        let mode = if self.system { 0o644 } else { 0o600 };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .map_err(write_err)?;
        file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        file.write_all(data.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)
    }

    pub fn add(&mut self, name: &str, ep: EndPoint) -> Result<()> {
        if self.remotes.contains_key(name) {
            return Err(RemoteError::AlreadyARemote(name.to_string()));
        }
        self.remotes.insert(name.to_string(), ep);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        match self.remotes.get(name) {
            None => return Err(RemoteError::NotARemote(name.to_string())),
            Some(ep) if ep.system && !self.system => {
                return Err(RemoteError::GlobalRemove(name.to_string()))
            }
            Some(_) => {}
        }
        if self.active == name {
            self.active.clear();
        }
        self.remotes.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&EndPoint> {
        self.remotes
            .get(name)
            .ok_or_else(|| RemoteError::NotARemote(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut EndPoint> {
        self.remotes
            .get_mut(name)
            .ok_or_else(|| RemoteError::NotARemote(name.to_string()))
    }

    /// Makes `name` the active remote. Only the global config may mark it
    /// exclusive, and an exclusive remote can't be replaced by a user.
    pub fn set_default(&mut self, name: &str, exclusive: bool) -> Result<()> {
        if !self.remotes.contains_key(name) {
            return Err(RemoteError::NotARemote(name.to_string()));
        }
        if !self.system && exclusive {
            return Err(RemoteError::ExclusiveByUser);
        }
        if name != self.active && !self.system {
            if let Some((other, _)) = self.remotes.iter().find(|(_, ep)| ep.exclusive) {
                return Err(RemoteError::Exclusive {
                    name: name.to_string(),
                    exclusive: other.clone(),
                });
            }
        }
        if exclusive && self.active != name {
            if let Some(previous) = self.remotes.get_mut(&self.active) {
                previous.exclusive = false;
            }
        }
        self.get_mut(name)?.exclusive = exclusive;
        self.active = name.to_string();
        Ok(())
    }

    pub fn default_remote(&self) -> Result<(&str, &EndPoint)> {
        if self.active.is_empty() {
            return Err(RemoteError::NoDefault);
        }
        Ok((self.active.as_str(), self.get(&self.active)?))
    }

    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<()> {
        if self.remotes.contains_key(new_name) {
            return Err(RemoteError::AlreadyARemote(new_name.to_string()));
        }
        let ep = self
            .remotes
            .remove(name)
            .ok_or_else(|| RemoteError::NotARemote(name.to_string()))?;
        if self.active == name {
            self.active = new_name.to_string();
        }
        self.remotes.insert(new_name.to_string(), ep);
        Ok(())
    }

    /// Merges the global remotes into this user config.
    pub fn sync_from(&mut self, sys: &RemoteConfig) -> Result<()> {
        for (name, sys_ep) in &sys.remotes {
            if let Some(user_ep) = self.remotes.get_mut(name) {
                if !user_ep.system {
                    tracing::info!("{name} defined both globally and individually, using individual");
                    continue;
                }
                user_ep.uri = sys_ep.uri.clone();
                user_ep.exclusive = sys_ep.exclusive;
                user_ep.keyservers = sys_ep.keyservers.clone();
                if sys_ep.exclusive {
                    self.active = name.clone();
                }
                continue;
            }
            if sys_ep.exclusive {
                self.active = name.clone();
            }
            self.add(
                name,
                EndPoint {
                    uri: sys_ep.uri.clone(),
                    system: true,
                    exclusive: sys_ep.exclusive,
                    keyservers: sys_ep.keyservers.clone(),
                    ..Default::default()
                },
            )?;
        }
        if self.active.is_empty() && !sys.active.is_empty() {
            self.active = sys.active.clone();
        }
        Ok(())
    }

    /// Records a credential for a keyserver or library service. OCI
    /// registries go through [`credentials::DockerConfig`] instead.
    pub fn login(&mut self, uri: &str, username: &str, password: &str, insecure: bool) -> Result<()> {
        let scheme = uri.split_once("://").map(|(s, _)| s).unwrap_or("https");
        if !matches!(scheme, "http" | "https") {
            return Err(RemoteError::UnsupportedLogin(scheme.to_string()));
        }
        if password.is_empty() {
            return Err(credentials::CredentialsError::NoPassword.into());
        }
        let mut insecure = insecure;
        if let Some(ks) = self.keyserver(uri) {
            if ks.insecure && !insecure {
                tracing::warn!("{uri} is configured as insecure, forcing insecure flag for login");
                insecure = true;
            } else if !ks.insecure {
                insecure = false;
            }
        } else if self.remotes.values().any(|ep| !ep.keyservers.is_empty())
            && self.remotes.values().all(|ep| !same_uri(&ep.uri, uri))
        {
            return Err(RemoteError::NoKeyserverConfig(uri.to_string()));
        }
        self.credentials.retain(|c| !same_uri(&c.uri, uri));
        self.credentials
            .push(Credential::new(uri, username, password, insecure));
        Ok(())
    }

    pub fn logout(&mut self, uri: &str) -> Result<()> {
        let before = self.credentials.len();
        self.credentials.retain(|c| !same_uri(&c.uri, uri));
        if before == self.credentials.len() {
            return Err(credentials::CredentialsError::NotLoggedIn(uri.to_string()).into());
        }
        Ok(())
    }

    fn keyserver(&self, uri: &str) -> Option<&ServiceConfig> {
        self.remotes
            .values()
            .flat_map(|ep| ep.keyservers.iter())
            .find(|k| k.external && same_uri(&k.uri, uri))
    }

    /// Adds an external keyserver to `remote` at 1-based `order`, appending
    /// when `order` is 0.
    pub fn add_keyserver(&mut self, remote: &str, uri: &str, order: usize, insecure: bool) -> Result<()> {
        let ep = self.get_mut(remote)?;
        if ep.keyservers.iter().any(|k| same_uri(&k.uri, uri)) {
            return Err(RemoteError::KeyserverExists(uri.to_string()));
        }
        let ks = ServiceConfig {
            uri: uri.to_string(),
            skip: false,
            external: true,
            insecure,
        };
        if order == 0 || order > ep.keyservers.len() {
            ep.keyservers.push(ks);
        } else {
            ep.keyservers.insert(order - 1, ks);
        }
        Ok(())
    }

    pub fn remove_keyserver(&mut self, remote: &str, uri: &str) -> Result<()> {
        let ep = self.get_mut(remote)?;
        let before = ep.keyservers.len();
        ep.keyservers.retain(|k| !same_uri(&k.uri, uri));
        if before == ep.keyservers.len() {
            return Err(RemoteError::KeyserverNotFound(uri.to_string()));
        }
        Ok(())
    }
}

/// Loads the user config merged with the global remotes, falling back to
/// the built-in default when neither defines any.
pub fn load_user_view(user: &Path, global: &Path) -> Result<RemoteConfig> {
    let mut config = RemoteConfig::load(user, false)?;
    match RemoteConfig::load(global, true) {
        Ok(sys) => config.sync_from(&sys)?,
        Err(err) => tracing::warn!(?err, "could not read global remote config"),
    }
    if config.remotes.is_empty() {
        let builtin = RemoteConfig::builtin();
        config.sync_from(&RemoteConfig {
            system: true,
            ..builtin
        })?;
    }
    Ok(config)
}
