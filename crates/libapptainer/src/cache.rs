//! Content addressed image cache.
//!
//! Entries live under `<parent>/cache/<type>/<fingerprint>`. Readers only
//! ever see complete entries: writers fill a temporary file in the type
//! directory and rename it into place, so two concurrent pulls of the same
//! fingerprint converge on one entry.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Cache entry types, in the order `cache list` reports them.
pub const CACHE_TYPES: &[&str] = &["library", "oci-tmp", "oci-sif", "oras", "shub", "net", "blob"];

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache is disabled")]
    Disabled,
    #[error("{0} is not a valid cache type")]
    UnknownType(String),
    #[error("invalid cache fingerprint {0:?}")]
    BadFingerprint(String),
    #[error("cache I/O on {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, CacheError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory under which the `cache` tree is created.
    pub parent_dir: PathBuf,
    pub disable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub kind: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// An opened cache. A disabled handle refuses every entry operation.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    root: PathBuf,
    disabled: bool,
}

impl CacheHandle {
    #[tracing::instrument(level = "trace")]
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let root = config.parent_dir.join("cache");
        if config.disable {
            tracing::debug!("image cache disabled");
            return Ok(Self {
                root,
                disabled: true,
            });
        }
        for kind in CACHE_TYPES {
            let dir = root.join(kind);
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
                .map_err(io_err(&dir))?;
        }
        Ok(Self {
            root,
            disabled: false,
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, kind: &str) -> Result<PathBuf> {
        if self.disabled {
            return Err(CacheError::Disabled);
        }
        if !CACHE_TYPES.contains(&kind) {
            return Err(CacheError::UnknownType(kind.to_string()));
        }
        Ok(self.root.join(kind))
    }

    /// Path an entry has, or will have once stored.
    pub fn entry_path(&self, kind: &str, fingerprint: &str) -> Result<PathBuf> {
        if fingerprint.is_empty()
            || fingerprint.contains('/')
            || fingerprint.starts_with('.')
        {
            return Err(CacheError::BadFingerprint(fingerprint.to_string()));
        }
        Ok(self.type_dir(kind)?.join(fingerprint))
    }

    pub fn lookup(&self, kind: &str, fingerprint: &str) -> Result<Option<PathBuf>> {
        let path = self.entry_path(kind, fingerprint)?;
        Ok(path.exists().then_some(path))
    }

    /// Stores an entry. `fill` writes the content into the temporary path it
    /// receives, which is then renamed over the final entry path.
    pub fn store<F, E>(&self, kind: &str, fingerprint: &str, fill: F) -> std::result::Result<PathBuf, E>
    where
        F: FnOnce(&Path) -> std::result::Result<(), E>,
        E: From<CacheError>,
    {
        let dest = self.entry_path(kind, fingerprint)?;
        let dir = self.type_dir(kind)?;
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{fingerprint}-"))
            .tempfile_in(&dir)
            .map_err(io_err(&dir))?;
        let (_, tmp_path) = tmp.keep().map_err(|err| CacheError::Io {
            path: dir.clone(),
            source: err.error,
        })?;
        if let Err(err) = fill(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, &dest).map_err(io_err(&dest))?;
        Ok(dest)
    }

    pub fn list(&self, kinds: &[&str]) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for kind in kinds {
            let dir = self.type_dir(kind)?;
            let read = match fs::read_dir(&dir) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(CacheError::Io { path: dir, source }),
            };
            for entry in read.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let meta = entry.metadata().map_err(io_err(&path))?;
                entries.push(CacheEntry {
                    kind: kind.to_string(),
                    name,
                    size: dir_size(&path),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    path,
                });
            }
        }
        entries.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        Ok(entries)
    }

    /// Removes entries of the given types, optionally only those older than
    /// `days`. Returns what was (or with `dry_run`, would be) removed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn clean(&self, kinds: &[&str], days: Option<u64>, dry_run: bool) -> Result<Vec<CacheEntry>> {
        let cutoff = days.and_then(|d| SystemTime::now().checked_sub(Duration::from_secs(d * 86400)));
        let mut removed = Vec::new();
        for entry in self.list(kinds)? {
            if let Some(cutoff) = cutoff {
                if entry.modified > cutoff {
                    continue;
                }
            }
            if !dry_run {
                let res = if entry.path.is_dir() {
                    crate::utils::fix_perms_for_removal(&entry.path);
                    fs::remove_dir_all(&entry.path)
                } else {
                    fs::remove_file(&entry.path)
                };
                res.map_err(io_err(&entry.path))?;
            }
            tracing::debug!(path = ?entry.path, dry_run, "removing cache entry");
            removed.push(entry);
        }
        Ok(removed)
    }
}

fn dir_size(path: &Path) -> u64 {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::read_dir(path)
            .map(|rd| rd.flatten().map(|e| dir_size(&e.path())).sum())
            .unwrap_or(0),
        Ok(m) => m.len(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn handle(dir: &Path) -> Result<CacheHandle> {
        Ok(CacheHandle::new(&CacheConfig {
            parent_dir: dir.to_path_buf(),
            disable: false,
        })?)
    }

    #[test]
    fn test_store_and_lookup() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = handle(tmp.path())?;
        assert!(cache.lookup("net", "abc")?.is_none());
        let stored = cache.store::<_, CacheError>("net", "abc", |p| {
            fs::write(p, b"data").map_err(io_err(p))
        })?;
        assert_eq!(cache.lookup("net", "abc")?, Some(stored.clone()));
        assert_eq!(fs::read(stored)?, b"data");
        Ok(())
    }

    #[test]
    fn test_failed_store_leaves_nothing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = handle(tmp.path())?;
        let res = cache.store("net", "abc", |_| Err(CacheError::BadFingerprint("x".into())));
        assert!(res.is_err());
        assert!(cache.list(&["net"])?.is_empty());
        assert_eq!(fs::read_dir(cache.root().join("net"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_bad_inputs() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = handle(tmp.path())?;
        assert!(matches!(
            cache.entry_path("nope", "abc"),
            Err(CacheError::UnknownType(_))
        ));
        assert!(matches!(
            cache.entry_path("net", "../escape"),
            Err(CacheError::BadFingerprint(_))
        ));
        let disabled = CacheHandle::new(&CacheConfig {
            parent_dir: tmp.path().join("other"),
            disable: true,
        })?;
        assert!(matches!(disabled.lookup("net", "a"), Err(CacheError::Disabled)));
        assert!(!tmp.path().join("other").exists());
        Ok(())
    }

    #[test]
    fn test_list_and_clean() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = handle(tmp.path())?;
        fs::write(cache.entry_path("library", "one")?, b"12345")?;
        fs::write(cache.entry_path("oci-tmp", "two")?, b"1")?;
        let all = cache.list(CACHE_TYPES)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, "library");
        assert_eq!(all[0].size, 5);

        let would = cache.clean(&["library"], None, true)?;
        assert_eq!(would.len(), 1);
        assert!(cache.entry_path("library", "one")?.exists());

        // entries are fresh, an age filter keeps them
        assert!(cache.clean(CACHE_TYPES, Some(30), false)?.is_empty());
        assert_eq!(cache.clean(CACHE_TYPES, None, false)?.len(), 2);
        assert!(cache.list(CACHE_TYPES)?.is_empty());
        Ok(())
    }
}
