//! `pull`: fetch an image through the resolver into a local file or
//! sandbox.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::image::{convert_image, ImageError, SifInspector, Unsquasher};
use crate::uri::{default_pull_name, PullOptions, Resolver, Uri, UriError};
use crate::utils::fix_perms_for_removal;

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("image file already exists: {0:?} - will not overwrite")]
    Exists(PathBuf),
    #[error("{0} is a local image, nothing to pull")]
    Local(String),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("while writing {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, PullError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PullError + '_ {
    move |source| PullError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub source: String,
    /// Destination, derived from the source when unset.
    pub dest: Option<PathBuf>,
    pub force: bool,
    pub sandbox: bool,
    /// Directory relative destinations are resolved against.
    pub cwd: PathBuf,
}

/// Destination of `req`: the explicit one, or `<name>_<tag>.sif` in the
/// working directory. A sandbox has no extension.
pub fn destination(req: &PullRequest, uri: &Uri) -> PathBuf {
    let dest = match &req.dest {
        Some(dest) => dest.clone(),
        None => {
            let name = default_pull_name(uri, "sif");
            let name = match (req.sandbox, name.strip_suffix(".sif")) {
                (true, Some(stem)) => stem.to_string(),
                _ => name,
            };
            PathBuf::from(name)
        }
    };
    if dest.is_absolute() {
        dest
    } else {
        req.cwd.join(dest)
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    tracing::debug!(?path, "removing existing destination");
    if meta.is_dir() {
        fix_perms_for_removal(path);
        fs::remove_dir_all(path).map_err(io_err(path))
    } else {
        fs::remove_file(path).map_err(io_err(path))
    }
}

/// Pulls `req.source` and writes it to its destination, which is returned.
#[tracing::instrument(level = "debug", skip(resolver, opts, inspector, unsquasher))]
pub fn pull(
    req: &PullRequest,
    resolver: &Resolver,
    cache: &CacheConfig,
    opts: &PullOptions,
    inspector: &dyn SifInspector,
    unsquasher: &dyn Unsquasher,
) -> Result<PathBuf> {
    let uri = Uri::parse(&req.source)?;
    if uri.is_local() {
        return Err(PullError::Local(req.source.clone()));
    }
    let dest = destination(req, &uri);
    if dest.symlink_metadata().is_ok() {
        if !req.force {
            return Err(PullError::Exists(dest));
        }
        remove_existing(&dest)?;
    }

    let pulled = PathBuf::from(resolver.resolve(&req.source, cache, opts)?);
    // pulls without a cache land in a temporary file owned by this run
    let temporary = cache.disable;

    if req.sandbox {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let (rootfs_dir, image_dir) = convert_image(&pulled, parent, inspector, unsquasher)?;
        let moved = fs::rename(&image_dir, &dest).map_err(io_err(&dest));
        fix_perms_for_removal(&rootfs_dir);
        if let Err(err) = fs::remove_dir_all(&rootfs_dir) {
            tracing::debug!(?rootfs_dir, ?err, "could not clean up extraction directory");
        }
        moved?;
    } else if temporary {
        fs::rename(&pulled, &dest)
            .or_else(|_| fs::copy(&pulled, &dest).map(|_| ()))
            .map_err(io_err(&dest))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).map_err(io_err(&dest))?;
    } else {
        fs::copy(&pulled, &dest).map_err(io_err(&dest))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).map_err(io_err(&dest))?;
    }

    if temporary && pulled.exists() {
        if let Err(err) = fs::remove_file(&pulled) {
            tracing::debug!(?pulled, ?err, "could not remove temporary pull");
        }
    }
    tracing::info!("Download complete: {}", dest.display());
    Ok(dest)
}
