//! Image URI resolution.
//!
//! A URI is split on its first `:` into a transport and a reference. Local
//! paths and `instance://` references are handed back untouched, every other
//! transport is routed to the [`ImageClient`] registered for it, which pulls
//! the image through the cache and returns a local path.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{CacheConfig, CacheError, CacheHandle};

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("Unsupported transport type: {0}")]
    UnsupportedTransport(String),
    #[error("no image client is available for the {0} transport")]
    NoClient(Transport),
    #[error("Unable to handle {uri} uri: {reason}")]
    Pull { uri: String, reason: String },
    #[error("pulled image {0:?} does not exist")]
    MissingResult(PathBuf),
    #[error("invalid platform {0:?}, expected os/arch[/variant]")]
    BadPlatform(String),
    #[error("operation interrupted")]
    Cancelled,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

type Result<T> = std::result::Result<T, UriError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Library,
    Oras,
    Ipfs,
    Shub,
    Http,
    Https,
    Docker,
    OciArchive,
    Oci,
    DockerDaemon,
    DockerArchive,
    Instance,
    Local,
}

impl Transport {
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Library => "library",
            Transport::Oras => "oras",
            Transport::Ipfs => "ipfs",
            Transport::Shub => "shub",
            Transport::Http => "http",
            Transport::Https => "https",
            Transport::Docker => "docker",
            Transport::OciArchive => "oci-archive",
            Transport::Oci => "oci",
            Transport::DockerDaemon => "docker-daemon",
            Transport::DockerArchive => "docker-archive",
            Transport::Instance => "instance",
            Transport::Local => "",
        }
    }

    /// Transports served by the OCI image client.
    pub fn is_oci(&self) -> bool {
        matches!(
            self,
            Transport::Docker
                | Transport::OciArchive
                | Transport::Oci
                | Transport::DockerDaemon
                | Transport::DockerArchive
        )
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Transport {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self> {
        let t = match s {
            "library" => Transport::Library,
            "oras" => Transport::Oras,
            "ipfs" => Transport::Ipfs,
            "shub" => Transport::Shub,
            "http" => Transport::Http,
            "https" => Transport::Https,
            "docker" => Transport::Docker,
            "oci-archive" => Transport::OciArchive,
            "oci" => Transport::Oci,
            "docker-daemon" => Transport::DockerDaemon,
            "docker-archive" => Transport::DockerArchive,
            "instance" => Transport::Instance,
            "" => Transport::Local,
            other => return Err(UriError::UnsupportedTransport(other.to_string())),
        };
        Ok(t)
    }
}

/// Splits `uri` into its transport and reference. The `//` following the
/// colon is dropped from the reference.
pub fn split(uri: &str) -> (&str, &str) {
    match uri.split_once(':') {
        Some((scheme, rest)) => (scheme, rest.strip_prefix("//").unwrap_or(rest)),
        None => ("", uri),
    }
}

/// A classified image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub transport: Transport,
    pub reference: String,
    raw: String,
}

impl Uri {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, reference) = split(input);
        match Transport::from_str(scheme) {
            Ok(transport) => Ok(Self {
                transport,
                reference: reference.to_string(),
                raw: input.to_string(),
            }),
            // a colon in a plain file name is not a transport
            Err(_) if !input.contains("://") => Ok(Self {
                transport: Transport::Local,
                reference: input.to_string(),
                raw: input.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Local paths and instance joins need no pull.
    pub fn is_local(&self) -> bool {
        matches!(self.transport, Transport::Local | Transport::Instance)
    }
}

/// Cancellation flag shared with the signal handler of the front-end.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerAuth {
    pub username: String,
    pub password: String,
}

/// Endpoint used by the library client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub variant: Option<String>,
}

impl FromStr for Platform {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Platform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(UriError::BadPlatform(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub tmp_dir: PathBuf,
    pub docker_auth: Option<DockerAuth>,
    pub auth_file: Option<PathBuf>,
    pub library: Option<LibraryConfig>,
    pub platform: Option<Platform>,
    pub no_https: bool,
    pub cancel: CancelFlag,
}

/// A client able to fetch images of one transport into the cache.
pub trait ImageClient {
    fn pull(&self, cache: &CacheHandle, reference: &str, opts: &PullOptions) -> Result<PathBuf>;
}

/// Splits a `library://` reference into an optional host override and the
/// library path. Library paths have at most three components, a fourth
/// leading component is a host.
pub fn library_host(reference: &str) -> (Option<&str>, &str) {
    let trimmed = reference.trim_start_matches('/');
    if trimmed.split('/').count() == 4 {
        if let Some((host, path)) = trimmed.split_once('/') {
            return (Some(host), path);
        }
    }
    (None, trimmed)
}

/// Routes URIs to image clients.
#[derive(Default)]
pub struct Resolver {
    clients: HashMap<Transport, Box<dyn ImageClient>>,
    oci: Option<Box<dyn ImageClient>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, transport: Transport, client: Box<dyn ImageClient>) -> Self {
        self.clients.insert(transport, client);
        self
    }

    /// Client serving every OCI transport.
    pub fn with_oci_client(mut self, client: Box<dyn ImageClient>) -> Self {
        self.oci = Some(client);
        self
    }

    fn client(&self, transport: Transport) -> Result<&dyn ImageClient> {
        let client = if transport.is_oci() {
            self.oci.as_deref()
        } else {
            self.clients.get(&transport).map(|c| c.as_ref())
        };
        client.ok_or(UriError::NoClient(transport))
    }

    /// Resolves `input` to something the launcher can open. Inputs without a
    /// transport come back unchanged and never touch the cache.
    #[tracing::instrument(level = "debug", skip(self, opts))]
    pub fn resolve(&self, input: &str, cache: &CacheConfig, opts: &PullOptions) -> Result<String> {
        let uri = Uri::parse(input)?;
        if uri.is_local() {
            return Ok(input.to_string());
        }

        let client = self.client(uri.transport)?;
        let handle = CacheHandle::new(cache)?;
        let path = client
            .pull(&handle, &uri.reference, opts)
            .map_err(|err| match err {
                UriError::Pull { .. } | UriError::Cancelled => err,
                other => UriError::Pull {
                    uri: input.to_string(),
                    reason: other.to_string(),
                },
            })?;
        if !path.exists() {
            return Err(UriError::MissingResult(path));
        }
        tracing::debug!(?path, "resolved {input}");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Default destination of `pull` when none is given: `<name>_<tag>.<ext>`.
pub fn default_pull_name(uri: &Uri, ext: &str) -> String {
    let last = uri
        .reference
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("image");
    let (name, tag) = match last.split_once('@') {
        Some((name, _digest)) => (name, "latest"),
        None => match last.rsplit_once(':') {
            Some((name, tag)) => (name, tag),
            None => (last, "latest"),
        },
    };
    match uri.transport {
        Transport::Http | Transport::Https => last.to_string(),
        _ => format!("{name}_{tag}.{ext}"),
    }
}

/// Transports accepted by `push`.
pub fn check_push_transport(uri: &Uri) -> Result<()> {
    match uri.transport {
        Transport::Library | Transport::Oras => Ok(()),
        other => Err(UriError::UnsupportedTransport(other.scheme().to_string())),
    }
}

/// Uploads a local image to a remote transport.
pub trait ImagePusher {
    fn push(&self, file: &Path, reference: &str, opts: &PullOptions) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::cell::Cell;

    struct FakeClient {
        calls: Cell<usize>,
        target: PathBuf,
    }

    impl ImageClient for FakeClient {
        fn pull(&self, cache: &CacheHandle, reference: &str, _: &PullOptions) -> super::Result<PathBuf> {
            self.calls.set(self.calls.get() + 1);
            assert!(!cache.is_disabled());
            assert_eq!(reference, "alpine:3.19");
            Ok(self.target.clone())
        }
    }

    struct Rc(std::rc::Rc<FakeClient>);

    impl ImageClient for Rc {
        fn pull(&self, cache: &CacheHandle, reference: &str, opts: &PullOptions) -> super::Result<PathBuf> {
            self.0.pull(cache, reference, opts)
        }
    }

    #[test]
    fn test_split() {
        assert_eq!(split("docker://alpine"), ("docker", "alpine"));
        assert_eq!(split("docker-daemon:alpine:3"), ("docker-daemon", "alpine:3"));
        assert_eq!(split("/tmp/img.sif"), ("", "/tmp/img.sif"));
        assert_eq!(split("instance://web"), ("instance", "web"));
    }

    #[test]
    fn test_parse() -> Result<()> {
        assert_eq!(Uri::parse("oras://reg/img:1")?.transport, Transport::Oras);
        assert_eq!(Uri::parse("my:image.sif")?.transport, Transport::Local);
        assert!(matches!(
            Uri::parse("ftp://host/file"),
            Err(UriError::UnsupportedTransport(s)) if s == "ftp"
        ));
        Ok(())
    }

    #[test]
    fn test_local_input_skips_cache() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = CacheConfig {
            parent_dir: tmp.path().join("cache-parent"),
            disable: false,
        };
        let resolver = Resolver::new();
        let opts = PullOptions::default();
        assert_eq!(resolver.resolve("/tmp/x.sif", &cache, &opts)?, "/tmp/x.sif");
        assert_eq!(resolver.resolve("instance://web", &cache, &opts)?, "instance://web");
        assert!(!cache.parent_dir.exists());
        Ok(())
    }

    #[test]
    fn test_oci_family_routed_to_oci_client() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let target = tmp.path().join("alpine.sif");
        std::fs::write(&target, b"sif")?;
        let fake = std::rc::Rc::new(FakeClient {
            calls: Cell::new(0),
            target: target.clone(),
        });
        let resolver = Resolver::new().with_oci_client(Box::new(Rc(fake.clone())));
        let cache = CacheConfig {
            parent_dir: tmp.path().to_path_buf(),
            disable: false,
        };
        let path = resolver.resolve("docker://alpine:3.19", &cache, &PullOptions::default())?;
        assert_eq!(path, target.to_string_lossy());
        assert_eq!(fake.calls.get(), 1);

        assert!(matches!(
            resolver.resolve("library://alpine", &cache, &PullOptions::default()),
            Err(UriError::NoClient(Transport::Library))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_result_is_an_error() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let fake = FakeClient {
            calls: Cell::new(0),
            target: tmp.path().join("absent.sif"),
        };
        let resolver = Resolver::new().with_oci_client(Box::new(fake));
        let cache = CacheConfig {
            parent_dir: tmp.path().to_path_buf(),
            disable: false,
        };
        assert!(matches!(
            resolver.resolve("docker://alpine:3.19", &cache, &PullOptions::default()),
            Err(UriError::MissingResult(_))
        ));
        Ok(())
    }

    #[test]
    fn test_library_host() {
        assert_eq!(
            library_host("cloud.example.com/entity/collection/image:1"),
            (Some("cloud.example.com"), "entity/collection/image:1")
        );
        assert_eq!(
            library_host("/entity/collection/image"),
            (None, "entity/collection/image")
        );
        assert_eq!(library_host("alpine"), (None, "alpine"));
    }

    #[test]
    fn test_default_pull_name() -> Result<()> {
        assert_eq!(
            default_pull_name(&Uri::parse("docker://alpine:3.19")?, "sif"),
            "alpine_3.19.sif"
        );
        assert_eq!(
            default_pull_name(&Uri::parse("library://user/col/lolcow")?, "sif"),
            "lolcow_latest.sif"
        );
        assert_eq!(
            default_pull_name(&Uri::parse("https://example.com/files/img.sif")?, "sif"),
            "img.sif"
        );
        Ok(())
    }

    #[test]
    fn test_push_transport() -> Result<()> {
        assert!(check_push_transport(&Uri::parse("oras://reg/img:1")?).is_ok());
        assert!(matches!(
            check_push_transport(&Uri::parse("docker://alpine")?),
            Err(UriError::UnsupportedTransport(s)) if s == "docker"
        ));
        Ok(())
    }

    #[test]
    fn test_platform() {
        assert_eq!(
            "linux/arm64/v8".parse::<Platform>().ok(),
            Some(Platform {
                os: "linux".into(),
                arch: "arm64".into(),
                variant: Some("v8".into())
            })
        );
        assert!("linux".parse::<Platform>().is_err());
    }
}
