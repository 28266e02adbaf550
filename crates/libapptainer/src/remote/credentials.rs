//! Registry and keyserver credentials.
//!
//! OCI registries (`docker://`, `oras://`) are stored docker style in
//! `~/.apptainer/docker-config.json`, falling back to `~/.docker/config.json`
//! for reads. Other services keep a credential entry in `remote.yaml`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::uri::DockerAuth;

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0:?} is not logged in")]
    NotLoggedIn(String),
    #[error("Docker/OCI registry requires a username")]
    NoUsername,
    #[error("a password is required")]
    NoPassword,
    #[error("invalid auth entry for {0}")]
    BadAuth(String),
}

type Result<T> = std::result::Result<T, CredentialsError>;

/// A credential entry of `remote.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "URI")]
    pub uri: String,
    /// Value of the `Authorization` header.
    #[serde(rename = "Auth")]
    pub auth: String,
    #[serde(rename = "Insecure", default)]
    pub insecure: bool,
}

impl Credential {
    /// Basic auth with a username, a bearer token without one.
    pub fn new(uri: &str, username: &str, password: &str, insecure: bool) -> Self {
        let auth = if username.is_empty() {
            format!("Bearer {password}")
        } else {
            format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
        };
        Self {
            uri: uri.to_string(),
            auth,
            insecure,
        }
    }
}

/// Compares service URIs ignoring scheme and trailing slash.
pub fn same_uri(a: &str, b: &str) -> bool {
    fn strip(s: &str) -> &str {
        s.split_once("://").map(|(_, r)| r).unwrap_or(s).trim_end_matches('/')
    }
    strip(a) == strip(b)
}

/// Registry key for an OCI login URI: host and path without scheme.
pub fn registry_name(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(u) if u.host_str().is_some() => {
            let host = u.host_str().unwrap_or_default();
            let host = match u.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            format!("{host}{}", u.path().trim_end_matches('/'))
        }
        _ => uri
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(uri)
            .trim_end_matches('/')
            .to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    pub auth: String,
}

/// Docker compatible credential file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, AuthEntry>,
    /// Whatever else docker keeps in the file.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

fn read_config(path: &Path) -> Result<Option<DockerConfig>> {
    match fs::read(path) {
        Ok(data) if data.is_empty() => Ok(Some(DockerConfig::default())),
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl DockerConfig {
    /// Loads `path`, or `fallback` when `path` does not exist.
    pub fn load(path: &Path, fallback: Option<&Path>) -> Result<Self> {
        if let Some(config) = read_config(path)? {
            return Ok(config);
        }
        if let Some(fallback) = fallback {
            if let Some(config) = read_config(fallback)? {
                tracing::debug!(?fallback, "using docker credentials");
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |source| CredentialsError::Write {
            path: path.to_path_buf(),
            source,
        };
        let data = serde_json::to_vec_pretty(self).map_err(|source| CredentialsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(write_err)?;
        file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        file.write_all(&data).map_err(write_err)?;
        file.sync_all().map_err(write_err)
    }

    pub fn login(&mut self, registry: &str, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Err(CredentialsError::NoUsername);
        }
        if password.is_empty() {
            return Err(CredentialsError::NoPassword);
        }
        self.auths.insert(
            registry.to_string(),
            AuthEntry {
                auth: STANDARD.encode(format!("{username}:{password}")),
            },
        );
        Ok(())
    }

    pub fn logout(&mut self, registry: &str) -> Result<()> {
        self.auths
            .remove(registry)
            .map(|_| ())
            .ok_or_else(|| CredentialsError::NotLoggedIn(registry.to_string()))
    }

    /// Decoded credentials of `registry`.
    pub fn lookup(&self, registry: &str) -> Result<Option<DockerAuth>> {
        let Some(entry) = self.auths.get(registry) else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(&entry.auth)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| CredentialsError::BadAuth(registry.to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| CredentialsError::BadAuth(registry.to_string()))?;
        Ok(Some(DockerAuth {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }

    /// Registries with stored credentials.
    pub fn registries(&self) -> Vec<&str> {
        self.auths.keys().map(String::as_str).collect()
    }
}
