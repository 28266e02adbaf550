use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Endpoint used when nothing else is configured.
pub const DEFAULT_CLOUD_URI: &str = "cloud.apptainer.org";
/// Age after which cached service configs are fetched again.
pub const CACHE_DURATION: Duration = Duration::from_secs(720 * 3600);

/// A remote endpoint as stored in `remote.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndPoint {
    /// Host and path, no scheme.
    #[serde(rename = "URI", default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(rename = "Token", default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Defined in the global configuration.
    #[serde(rename = "System", default)]
    pub system: bool,
    #[serde(rename = "Exclusive", default)]
    pub exclusive: bool,
    /// Service discovery over plain http.
    #[serde(rename = "Insecure", default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    #[serde(rename = "Keyservers", default, skip_serializing_if = "Vec::is_empty")]
    pub keyservers: Vec<ServiceConfig>,
}

/// A keyserver attached to an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(rename = "Skip", default)]
    pub skip: bool,
    /// Added by the user rather than discovered from the endpoint.
    #[serde(rename = "External", default)]
    pub external: bool,
    #[serde(rename = "Insecure", default)]
    pub insecure: bool,
}

impl EndPoint {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    pub fn default_cloud() -> Self {
        Self {
            system: true,
            ..Self::new(DEFAULT_CLOUD_URI)
        }
    }

    /// Base URL of the endpoint, with the scheme chosen by `insecure`.
    pub fn url(&self) -> Option<url::Url> {
        if self.uri.is_empty() {
            return None;
        }
        let scheme = if self.insecure { "http" } else { "https" };
        let host = self
            .uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.uri);
        url::Url::parse(&format!("{scheme}://{host}")).ok()
    }
}

/// Lowercase, dash separated form of `uri` used as a file name.
pub fn slug(uri: &str) -> String {
    let mut out = String::new();
    let mut dash = false;
    for c in uri.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Service configs fetched from endpoints, kept under
/// `~/.apptainer/remote-cache`.
#[derive(Debug, Clone)]
pub struct EndpointCache {
    dir: PathBuf,
}

impl EndpointCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn entry(&self, uri: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slug(uri)))
    }

    /// The cached config of `uri` unless it expired.
    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        let path = self.entry(uri);
        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > CACHE_DURATION {
            tracing::debug!(?path, "cached endpoint config expired");
            return None;
        }
        fs::read(&path).ok()
    }

    /// Stores a config. Failures only lose the cache entry.
    pub fn put(&self, uri: &str, data: &[u8]) {
        let path = self.entry(uri);
        let written = fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .and_then(|()| {
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(&path)
            })
            .and_then(|mut f| f.write_all(data));
        if let Err(err) = written {
            tracing::debug!(?path, ?err, "could not cache endpoint config");
        }
    }
}

/// What `remote status` can report without contacting the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStatus {
    pub name: String,
    pub url: Option<String>,
    pub logged_in: bool,
    pub cached: bool,
    pub keyservers: Vec<String>,
}

pub fn local_status(name: &str, ep: &EndPoint, cache: &EndpointCache) -> LocalStatus {
    LocalStatus {
        name: name.to_string(),
        url: ep.url().map(|u| u.to_string()),
        logged_in: !ep.token.is_empty(),
        cached: cache.get(&ep.uri).is_some(),
        keyservers: ep
            .keyservers
            .iter()
            .filter(|k| !k.skip)
            .map(|k| k.uri.clone())
            .collect(),
    }
}
