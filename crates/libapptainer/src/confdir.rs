//! User configuration directory setup and migration from the legacy
//! `~/.singularity` directory.
//!
//! Every step is best effort: failures are reported as warnings with a
//! manual `cp -a` hint and never abort the command. A partially migrated
//! directory is kept as is.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::paths::UserDirs;
use crate::remote::RemoteConfig;

const PUBLIC_KEYRING: &str = "pgp-public";
const SECRET_KEYRING: &str = "pgp-secret";

/// What [`handle_conf_dir`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfDirOutcome {
    pub created: bool,
    pub migrated_from_legacy: bool,
}

fn copy_private(src: &Path, dst: &Path) -> io::Result<()> {
    let data = fs::read(src)?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dst)?;
    io::Write::write_all(&mut out, &data)
}

fn manual_hint(src: &Path, dst: &Path) {
    tracing::warn!(
        "Migration failed, you can migrate manually with \"cp -a {} {}\"",
        src.display(),
        dst.display()
    );
}

fn migrate_file(src: &Path, dst: &Path, what: &str) {
    if !src.exists() {
        return;
    }
    tracing::info!("Detected Singularity {what}, migrating...");
    if let Err(err) = copy_private(src, dst) {
        tracing::warn!("Failed to migrate {} to {}: {err}", src.display(), dst.display());
        manual_hint(src, dst);
    }
}

fn migrate_remote_conf(dirs: &UserDirs) {
    let legacy = dirs.legacy_remote_config();
    if !legacy.exists() {
        return;
    }
    // refuse formats the current reader does not understand
    if let Err(err) = RemoteConfig::load(&legacy, false) {
        tracing::warn!("Migration failed, unable to read legacy remote configuration: {err}");
        tracing::warn!(
            "It may be of an incompatible format and needs to be reconstructed manually with the \"apptainer remote\" command group."
        );
        return;
    }
    migrate_file(&legacy, &dirs.remote_config(), "remote configuration");
}

fn migrate_keys(dirs: &UserDirs) {
    let legacy = dirs.legacy_keys_dir();
    let keys = dirs.keys_dir();
    if !legacy.exists() {
        return;
    }
    if let Err(err) = fs::DirBuilder::new().mode(0o700).create(&keys) {
        tracing::debug!(?keys, ?err, "could not create keys directory");
        manual_hint(&legacy, &keys);
        return;
    }
    migrate_file(
        &legacy.join(PUBLIC_KEYRING),
        &keys.join(PUBLIC_KEYRING),
        "public pgp keyring",
    );
    migrate_file(
        &legacy.join(SECRET_KEYRING),
        &keys.join(SECRET_KEYRING),
        "private pgp keyring",
    );
}

/// Ensures the user config directory exists with mode 0700. A directory
/// created here is populated from the legacy one when present.
#[tracing::instrument(level = "trace")]
pub fn handle_conf_dir(dirs: &UserDirs) -> ConfDirOutcome {
    let dir = &dirs.config_dir;
    let mut outcome = ConfDirOutcome::default();
    match fs::metadata(dir) {
        Ok(meta) => {
            tracing::debug!(?dir, "already exists, not creating");
            if meta.permissions().mode() & 0o777 != 0o700 {
                tracing::debug!(?dir, "enforcing permission 0700");
                if let Err(err) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!("Couldn't enforce permission 0700 on {}: {err}", dir.display());
                }
            }
            return outcome;
        }
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            tracing::warn!("Unable to retrieve information for {}: {err}", dir.display());
            return outcome;
        }
        Err(_) => {}
    }

    if let Err(err) = fs::DirBuilder::new().mode(0o700).create(dir) {
        tracing::debug!(?dir, ?err, "could not create config directory");
        return outcome;
    }
    tracing::debug!(?dir, "created");
    outcome.created = true;

    if !dirs.legacy_config_dir.exists() {
        return outcome;
    }
    tracing::info!("Detected Singularity user configuration directory");
    migrate_remote_conf(dirs);
    migrate_file(
        &dirs.legacy_docker_config(),
        &dirs.docker_config(),
        "docker configuration",
    );
    migrate_keys(dirs);
    outcome.migrated_from_legacy = true;
    outcome
}

/// Brings an existing `remote.yaml` back to mode 0600.
pub fn ensure_remote_conf_perms(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o777 != 0o600 => {
            tracing::debug!(?path, "ensuring file permission of 0600");
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_creates_and_migrates() -> Result<()> {
        let home = tempfile::tempdir()?;
        let dirs = UserDirs::new(home.path());
        fs::create_dir_all(dirs.legacy_keys_dir())?;
        fs::write(dirs.legacy_remote_config(), "Active: x\nRemotes:\n  x:\n    URI: a.example.org\n")?;
        fs::write(dirs.legacy_docker_config(), "{}")?;
        fs::write(dirs.legacy_keys_dir().join(PUBLIC_KEYRING), "pub")?;

        let outcome = handle_conf_dir(&dirs);
        assert!(outcome.created && outcome.migrated_from_legacy);
        assert_eq!(fs::metadata(&dirs.config_dir)?.permissions().mode() & 0o777, 0o700);
        assert!(dirs.remote_config().is_file());
        assert_eq!(fs::read_to_string(dirs.docker_config())?, "{}");
        assert_eq!(fs::read_to_string(dirs.keys_dir().join(PUBLIC_KEYRING))?, "pub");
        assert!(!dirs.keys_dir().join(SECRET_KEYRING).exists());
        Ok(())
    }

    #[test]
    fn test_repeat_keeps_user_files() -> Result<()> {
        let home = tempfile::tempdir()?;
        let dirs = UserDirs::new(home.path());
        fs::create_dir_all(&dirs.legacy_config_dir)?;
        fs::write(dirs.legacy_docker_config(), "legacy")?;
        handle_conf_dir(&dirs);

        fs::write(dirs.docker_config(), "mine")?;
        fs::set_permissions(&dirs.config_dir, fs::Permissions::from_mode(0o755))?;
        let outcome = handle_conf_dir(&dirs);
        assert!(!outcome.created);
        assert_eq!(fs::read_to_string(dirs.docker_config())?, "mine");
        assert_eq!(fs::metadata(&dirs.config_dir)?.permissions().mode() & 0o777, 0o700);
        Ok(())
    }

    #[test]
    fn test_incompatible_remote_not_migrated() -> Result<()> {
        let home = tempfile::tempdir()?;
        let dirs = UserDirs::new(home.path());
        fs::create_dir_all(&dirs.legacy_config_dir)?;
        fs::write(dirs.legacy_remote_config(), "Unknown: true\n")?;
        handle_conf_dir(&dirs);
        assert!(!dirs.remote_config().exists());
        Ok(())
    }

    #[test]
    fn test_remote_conf_perms() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("remote.yaml");
        ensure_remote_conf_perms(&path)?;
        fs::write(&path, "")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        ensure_remote_conf_perms(&path)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }
}
