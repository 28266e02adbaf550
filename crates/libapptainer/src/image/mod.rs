//! Image inspection and preparation before the starter runs.
//!
//! An [`ImageHandle`] owns the descriptor opened for inspection. It must be
//! closed with [`ImageHandle::close`] before the starter is dispatched so the
//! descriptor never reaches the container.

pub mod sif;
pub mod unsquash;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::crypt::KeyInfo;

pub use sif::{DescriptorTable, Partition, SifInspector};
pub use unsquash::{convert_image, LookupUnsquasher, Unsquasher, UnsquashfsCommand};

const SQUASHFS_MAGIC: &[u8] = b"hsqs";
const EXT3_MAGIC_OFFSET: u64 = 1080;
const EXT3_MAGIC: [u8; 2] = [0x53, 0xef];
const LAUNCH_SCRIPT: &[u8] = b"#!";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("could not open image {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image is not a SIF file")]
    NotSif,
    #[error("while getting root filesystem: no primary system partition")]
    NoRootFs,
    #[error("image format of {0:?} is not recognized")]
    UnknownFormat(PathBuf),
    #[error("not a squashfs root filesystem")]
    NotSquashfs,
    #[error("required option --passphrase or --pem-path missing")]
    KeyMissing,
    #[error("unprivileged decryption of {0:?} requires user namespaces")]
    DecryptNoUserNs(PathBuf),
    #[error("could not find unsquashfs")]
    Unsquashfs(#[source] which::Error),
    #[error("root filesystem extraction failed: {0}")]
    Extract(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Container file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Sif,
    Squashfs,
    Ext3,
    SandboxDir,
}

/// Root filesystem type, inside a SIF or standalone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootFsType {
    Squashfs,
    EncryptedSquashfs,
    Ext3,
    Sandbox,
    Other,
}

#[derive(Debug)]
pub struct ImageHandle {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub rootfs: RootFsType,
    /// Offset of the root filesystem inside the file.
    pub offset: u64,
    file: Option<File>,
}

fn has_magic(file: &mut File, offset: u64, magic: &[u8]) -> std::io::Result<bool> {
    let mut buf = vec![0u8; magic.len()];
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(buf == magic),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

/// End of a leading `#!...` launch line, where the filesystem starts.
fn launch_offset(file: &mut File) -> std::io::Result<u64> {
    if !has_magic(file, 0, LAUNCH_SCRIPT)? {
        return Ok(0);
    }
    let mut head = [0u8; 512];
    file.seek(SeekFrom::Start(0))?;
    let n = file.read(&mut head)?;
    Ok(head[..n]
        .iter()
        .position(|b| *b == b'\n')
        .map(|p| p as u64 + 1)
        .unwrap_or(0))
}

impl ImageHandle {
    /// Opens `path` read-only and detects its format.
    #[tracing::instrument(level = "trace", skip(inspector))]
    pub fn open(path: &Path, inspector: &dyn SifInspector) -> Result<Self> {
        let open_err = |source| ImageError::Open {
            path: path.to_path_buf(),
            source,
        };
        if path.is_dir() {
            return Ok(Self {
                path: path.to_path_buf(),
                format: ImageFormat::SandboxDir,
                rootfs: RootFsType::Sandbox,
                offset: 0,
                file: None,
            });
        }
        let mut file = File::open(path).map_err(open_err)?;

        let (format, rootfs, offset) = if has_magic(&mut file, sif::MAGIC_OFFSET, sif::SIF_MAGIC)? {
            let part = inspector.root_partition(&mut file)?;
            (ImageFormat::Sif, part.fs, part.offset)
        } else {
            let offset = launch_offset(&mut file)?;
            if has_magic(&mut file, offset, SQUASHFS_MAGIC)? {
                (ImageFormat::Squashfs, RootFsType::Squashfs, offset)
            } else if has_magic(&mut file, offset + EXT3_MAGIC_OFFSET, &EXT3_MAGIC)? {
                (ImageFormat::Ext3, RootFsType::Ext3, offset)
            } else {
                return Err(ImageError::UnknownFormat(path.to_path_buf()));
            }
        };
        tracing::debug!(?path, ?format, ?rootfs, "image detected");
        Ok(Self {
            path: path.to_path_buf(),
            format,
            rootfs,
            offset,
            file: Some(file),
        })
    }

    pub fn is_file(&self) -> bool {
        self.format != ImageFormat::SandboxDir
    }

    pub fn is_encrypted(&self) -> bool {
        self.rootfs == RootFsType::EncryptedSquashfs
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the inspection descriptor.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
        }
    }
}

/// Verifies key material is present for an encrypted root filesystem and
/// closes the handle.
pub fn check_encryption_key(
    handle: &mut ImageHandle,
    key: Option<&KeyInfo>,
    unprivileged: bool,
    userns_available: bool,
) -> Result<Option<KeyInfo>> {
    tracing::debug!("Checking for encrypted system partition");
    let result = if handle.is_encrypted() {
        tracing::debug!("Encrypted container filesystem detected");
        match key {
            None => Err(ImageError::KeyMissing),
            Some(_) if unprivileged && !userns_available => {
                Err(ImageError::DecryptNoUserNs(handle.path.clone()))
            }
            Some(key) => Ok(Some(key.clone())),
        }
    } else {
        Ok(None)
    };
    handle.close();
    result
}

/// What the preparation step needs to know.
#[derive(Debug, Clone, Default)]
pub struct PrepareRequest {
    pub unsquash: bool,
    /// The container runs in a user namespace, or we are already inside one.
    pub user_ns: bool,
    /// A registered image driver can mount the image without privileges.
    pub driver_can_mount: bool,
    pub tmp_dir: PathBuf,
    pub cache_disabled: bool,
}

/// Result of preparation: the image the engine should use, and a temporary
/// tree to remove once the container exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub image: PathBuf,
    pub delete_temp_dir: Option<PathBuf>,
}

/// Extracts a squashfs image to a temporary sandbox when it cannot be
/// mounted directly. The caller's handle must already be closed.
pub fn prepare_image(
    image: &Path,
    req: &PrepareRequest,
    inspector: &dyn SifInspector,
    unsquasher: &dyn Unsquasher,
) -> Result<PreparedImage> {
    let unchanged = PreparedImage {
        image: image.to_path_buf(),
        delete_temp_dir: None,
    };
    if !image.is_file() {
        return Ok(unchanged);
    }
    let convert = req.unsquash || (req.user_ns && !req.driver_can_mount);
    if !convert {
        return Ok(unchanged);
    }

    tracing::info!("Converting SIF file to temporary sandbox...");
    let (rootfs_dir, image_dir) = convert_image(image, &req.tmp_dir, inspector, unsquasher)?;
    if req.cache_disabled {
        tracing::debug!(?image, "Removing tmp image");
        // the sandbox is already extracted, a stale pull is not fatal
        if let Err(err) = std::fs::remove_file(image) {
            tracing::error!(?image, ?err, "unable to remove tmp image");
        }
    }
    Ok(PreparedImage {
        image: image_dir,
        delete_temp_dir: Some(rootfs_dir),
    })
}
