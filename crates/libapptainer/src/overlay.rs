//! Writable ext3 overlay images.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Smallest overlay accepted, in MiB.
pub const MIN_SIZE_MIB: u64 = 64;
const MIB: u64 = 1024 * 1024;
const MKFS: &str = "mkfs.ext3";

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("image size must be equal or greater than {MIN_SIZE_MIB} MiB")]
    TooSmall,
    #[error("overlay image {0:?} already exists")]
    Exists(PathBuf),
    #[error("{MKFS} not found")]
    MkfsNotFound(#[source] which::Error),
    #[error("{MKFS} seems too old as it doesn't support -d, this is required to create the overlay layout")]
    MkfsTooOld,
    #[error("overlay directory {0:?} created outside of overlay layout")]
    OutsideLayout(String),
    #[error("while creating ext3 partition in {path:?}: {stderr}")]
    Mkfs { path: PathBuf, stderr: String },
    #[error("overlay I/O on {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, OverlayError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OverlayError + '_ {
    move |source| OverlayError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Formats an ext3 filesystem populated from a directory.
pub trait Mkfs {
    /// Whether the `-d` population option is available.
    fn supports_populate(&self) -> Result<bool>;
    fn make(&self, root: &Path, image: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// `mkfs.ext3` found on `$PATH`.
#[derive(Debug, Clone)]
pub struct Mkfs3Command {
    path: PathBuf,
}

impl Mkfs3Command {
    pub fn find() -> Result<Self> {
        let path = which::which(MKFS).map_err(OverlayError::MkfsNotFound)?;
        Ok(Self { path })
    }
}

impl Mkfs for Mkfs3Command {
    fn supports_populate(&self) -> Result<bool> {
        // --help always exits with status 1
        let output = Command::new(&self.path)
            .arg("--help")
            .output()
            .map_err(io_err(&self.path))?;
        Ok(String::from_utf8_lossy(&output.stderr).contains("[-d "))
    }

    fn make(&self, root: &Path, image: &Path, uid: u32, gid: u32) -> Result<()> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-E")
            .arg(format!("root_owner={uid}:{gid}"))
            .arg("-d")
            .arg(root)
            .arg(image);
        tracing::debug!(?cmd, "formatting overlay");
        let output = cmd.output().map_err(io_err(&self.path))?;
        if !output.status.success() {
            return Err(OverlayError::Mkfs {
                path: image.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverlayRequest {
    pub path: PathBuf,
    pub size_mib: u64,
    pub sparse: bool,
    /// Directories pre-created under `upper`.
    pub create_dirs: Vec<String>,
    pub tmp_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

fn upper_subdir(upper: &Path, dir: &str) -> Result<PathBuf> {
    let rel = Path::new(dir.trim_start_matches('/'));
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(OverlayError::OutsideLayout(dir.to_string()));
    }
    Ok(upper.join(rel))
}

fn allocate(path: &Path, size_mib: u64, sparse: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err(path))?;
    if sparse {
        file.set_len(size_mib * MIB).map_err(io_err(path))?;
    } else {
        let zeros = vec![0u8; MIB as usize];
        for _ in 0..size_mib {
            file.write_all(&zeros).map_err(io_err(path))?;
        }
    }
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err(path))
}

/// Creates an ext3 overlay image at `req.path` laid out with the `upper`
/// and `work` directories overlayfs needs.
#[tracing::instrument(level = "trace", skip(mkfs))]
pub fn create_overlay(req: &OverlayRequest, mkfs: &dyn Mkfs) -> Result<()> {
    if req.size_mib < MIN_SIZE_MIB {
        return Err(OverlayError::TooSmall);
    }
    if req.path.symlink_metadata().is_ok() {
        return Err(OverlayError::Exists(req.path.clone()));
    }
    if !mkfs.supports_populate()? {
        return Err(OverlayError::MkfsTooOld);
    }

    let layout = tempfile::Builder::new()
        .prefix("overlay-")
        .tempdir_in(&req.tmp_dir)
        .map_err(io_err(&req.tmp_dir))?;
    // ids outside the 16 bit range can't own files in ext3 without mapping
    let mode = if req.uid > 65535 || req.gid > 65535 {
        0o777
    } else {
        0o755
    };
    let upper = layout.path().join("upper");
    let work = layout.path().join("work");
    let mut dirs = vec![upper.clone(), work];
    for dir in &req.create_dirs {
        dirs.push(upper_subdir(&upper, dir)?);
    }
    for dir in &dirs {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(dir)
            .map_err(io_err(dir))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(io_err(dir))?;
    }

    let mut tmp_image = req.path.clone().into_os_string();
    tmp_image.push(".ext3");
    let tmp_image = PathBuf::from(tmp_image);
    let result = allocate(&tmp_image, req.size_mib, req.sparse)
        .and_then(|()| mkfs.make(layout.path(), &tmp_image, req.uid, req.gid))
        .and_then(|()| fs::rename(&tmp_image, &req.path).map_err(io_err(&req.path)));
    if result.is_err() {
        if let Err(err) = fs::remove_file(&tmp_image) {
            tracing::debug!(?tmp_image, ?err, "could not remove partial overlay");
        }
    }
    result
}
