use std::path::{Path, PathBuf};
use std::process::Command;

use super::{ImageError, ImageHandle, Result, RootFsType, SifInspector};
use crate::utils::fix_perms_for_removal;

/// Extracts a squashfs filesystem found at `offset` in `image`.
pub trait Unsquasher {
    fn extract(&self, image: &Path, offset: u64, dest: &Path) -> Result<()>;
}

/// Runs the `unsquashfs` program found on `$PATH`.
#[derive(Debug, Clone)]
pub struct UnsquashfsCommand {
    path: PathBuf,
}

impl UnsquashfsCommand {
    pub fn find() -> Result<Self> {
        let path = which::which("unsquashfs").map_err(ImageError::Unsquashfs)?;
        Ok(Self { path })
    }
}

impl Unsquasher for UnsquashfsCommand {
    fn extract(&self, image: &Path, offset: u64, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-f").arg("-d").arg(dest);
        if offset > 0 {
            cmd.arg("-o").arg(offset.to_string());
        }
        cmd.arg(image);
        tracing::debug!(?cmd, "extracting squashfs");
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(ImageError::Extract(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Looks `unsquashfs` up only when an extraction is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LookupUnsquasher;

impl Unsquasher for LookupUnsquasher {
    fn extract(&self, image: &Path, offset: u64, dest: &Path) -> Result<()> {
        UnsquashfsCommand::find()?.extract(image, offset, dest)
    }
}

/// Extracts `image` into `<tmp_dir>/rootfs-XXXXXX/root`. Returns the
/// `rootfs-` directory and the root inside it. On failure the whole tree is
/// removed.
pub fn convert_image(
    image: &Path,
    tmp_dir: &Path,
    inspector: &dyn SifInspector,
    unsquasher: &dyn Unsquasher,
) -> Result<(PathBuf, PathBuf)> {
    let mut handle = ImageHandle::open(image, inspector)?;
    let (rootfs, offset) = (handle.rootfs, handle.offset);
    handle.close();

    if rootfs == RootFsType::Ext3 {
        tracing::error!("File {:?} is an ext3 format container image.", image);
        tracing::error!("Only SIF and squashfs images can be extracted in unprivileged mode.");
        tracing::error!(
            "Use `apptainer build` to convert this image to a SIF file using a setuid install of Apptainer."
        );
    }
    if rootfs != RootFsType::Squashfs {
        return Err(ImageError::NotSquashfs);
    }

    let rootfs_dir = tempfile::Builder::new()
        .prefix("rootfs-")
        .tempdir_in(tmp_dir)?
        .keep();
    let image_dir = rootfs_dir.join("root");

    let extracted = std::fs::create_dir(&image_dir)
        .map_err(ImageError::from)
        .and_then(|()| unsquasher.extract(image, offset, &image_dir));
    if let Err(err) = extracted {
        tracing::info!(?rootfs_dir, "Cleaning up");
        fix_perms_for_removal(&rootfs_dir);
        if let Err(err) = std::fs::remove_dir_all(&rootfs_dir) {
            tracing::debug!(?err, "RemoveAll had a problem");
        }
        return Err(err);
    }
    Ok((rootfs_dir, image_dir))
}
