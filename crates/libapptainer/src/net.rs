//! Image client for plain `http://` and `https://` downloads.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::cache::CacheHandle;
use crate::uri::{CancelFlag, ImageClient, PullOptions, UriError};

const CACHE_TYPE: &str = "net";

pub struct NetClient {
    scheme: &'static str,
}

impl NetClient {
    pub fn http() -> Self {
        Self { scheme: "http" }
    }

    pub fn https() -> Self {
        Self { scheme: "https" }
    }

    fn url(&self, reference: &str, opts: &PullOptions) -> Result<url::Url, UriError> {
        let scheme = if opts.no_https { "http" } else { self.scheme };
        url::Url::parse(&format!("{scheme}://{reference}")).map_err(|err| UriError::Pull {
            uri: format!("{}://{reference}", self.scheme),
            reason: err.to_string(),
        })
    }
}

/// Cache fingerprint of a download.
pub fn fingerprint(url: &url::Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

struct Cancellable<R> {
    inner: R,
    cancel: CancelFlag,
}

impl<R: Read> Read for Cancellable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "download cancelled"));
        }
        self.inner.read(buf)
    }
}

fn download(url: &url::Url, dest: &Path, cancel: &CancelFlag) -> Result<(), UriError> {
    let pull_err = |reason: String| UriError::Pull {
        uri: url.to_string(),
        reason,
    };
    let resp = ureq::get(url.as_str())
        .call()
        .map_err(|err| pull_err(err.to_string()))?;
    let mut reader = Cancellable {
        inner: resp.into_body().into_reader(),
        cancel: cancel.clone(),
    };
    let mut file = File::create(dest).map_err(|err| pull_err(err.to_string()))?;
    match io::copy(&mut reader, &mut file) {
        Ok(size) => {
            tracing::debug!(%url, size, "download complete");
            Ok(())
        }
        Err(_) if cancel.is_cancelled() => Err(UriError::Cancelled),
        Err(err) => Err(pull_err(err.to_string())),
    }
}

impl ImageClient for NetClient {
    fn pull(&self, cache: &CacheHandle, reference: &str, opts: &PullOptions) -> Result<PathBuf, UriError> {
        let url = self.url(reference, opts)?;
        if cache.is_disabled() {
            let dest = opts.tmp_dir.join(format!("net-{}", fingerprint(&url)));
            download(&url, &dest, &opts.cancel)?;
            return Ok(dest);
        }

        let fp = fingerprint(&url);
        if let Some(path) = cache.lookup(CACHE_TYPE, &fp)? {
            tracing::info!("Using cached image");
            return Ok(path);
        }
        tracing::info!("Downloading network image");
        cache.store(CACHE_TYPE, &fp, |tmp| download(&url, tmp, &opts.cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use anyhow::Result;

    #[test]
    fn test_fingerprint_is_stable() -> Result<()> {
        let a = url::Url::parse("https://example.com/img.sif")?;
        let b = url::Url::parse("https://example.com/other.sif")?;
        assert_eq!(fingerprint(&a).len(), 64);
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        Ok(())
    }

    #[test]
    fn test_cached_entry_is_reused() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = CacheHandle::new(&CacheConfig {
            parent_dir: tmp.path().to_path_buf(),
            disable: false,
        })?;
        let client = NetClient::https();
        let opts = PullOptions::default();
        let url = client.url("example.invalid/img.sif", &opts)?;
        let entry = cache.entry_path(CACHE_TYPE, &fingerprint(&url))?;
        std::fs::write(&entry, b"cached")?;

        // no network access happens on a hit
        let path = client.pull(&cache, "example.invalid/img.sif", &opts)?;
        assert_eq!(path, entry);
        Ok(())
    }

    #[test]
    fn test_no_https_downgrades() -> Result<()> {
        let opts = PullOptions {
            no_https: true,
            ..Default::default()
        };
        let url = NetClient::https().url("example.com/a.sif", &opts)?;
        assert_eq!(url.scheme(), "http");
        Ok(())
    }
}
