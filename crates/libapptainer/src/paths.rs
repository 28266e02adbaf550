//! Install layout and per-user directories.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

const DEFAULT_PREFIX: &str = "/usr/local";

/// Locations fixed at install time. Packagers set the `APPTAINER_*DIR`
/// variables while building to relocate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    pub prefix: PathBuf,
    pub sysconfdir: PathBuf,
    pub libexecdir: PathBuf,
    pub localstatedir: PathBuf,
    /// Directory holding `apptainer.conf` and the GPU library lists.
    pub confdir: PathBuf,
}

impl Default for InstallPaths {
    fn default() -> Self {
        let prefix = PathBuf::from(option_env!("APPTAINER_PREFIX").unwrap_or(DEFAULT_PREFIX));
        let sysconfdir = option_env!("APPTAINER_SYSCONFDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| prefix.join("etc"));
        let libexecdir = option_env!("APPTAINER_LIBEXECDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| prefix.join("libexec"));
        let localstatedir = option_env!("APPTAINER_LOCALSTATEDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| prefix.join("var"));
        let confdir = sysconfdir.join("apptainer");
        Self {
            prefix,
            sysconfdir,
            libexecdir,
            localstatedir,
            confdir,
        }
    }
}

impl InstallPaths {
    /// Applies the runtime `APPTAINER_CONFDIR` override.
    pub fn with_confdir(mut self, confdir: Option<PathBuf>) -> Self {
        if let Some(dir) = confdir {
            self.confdir = dir;
        }
        self
    }

    pub fn admin_config(&self) -> PathBuf {
        self.confdir.join("apptainer.conf")
    }

    pub fn capability_file(&self) -> PathBuf {
        self.confdir.join("capability.json")
    }

    pub fn nvliblist(&self) -> PathBuf {
        self.confdir.join("nvliblist.conf")
    }

    pub fn rocmliblist(&self) -> PathBuf {
        self.confdir.join("rocmliblist.conf")
    }

    pub fn global_remote_config(&self) -> PathBuf {
        self.confdir.join("remote.yaml")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.libexecdir.join("apptainer").join("bin")
    }

    /// Path of the starter binary, setuid flavour or not.
    pub fn starter(&self, suid: bool) -> PathBuf {
        let name = if suid { "starter-suid" } else { "starter" };
        self.bin_dir().join(name)
    }

    /// A setuid install ships a root owned `starter-suid` with the setuid bit.
    pub fn is_suid_install(&self) -> bool {
        is_setuid_root(&self.starter(true))
    }
}

fn is_setuid_root(path: &Path) -> bool {
    match path.metadata() {
        Ok(m) => m.uid() == 0 && m.permissions().mode() & 0o4000 != 0,
        Err(_) => false,
    }
}

/// Per-user directories rooted at `~/.apptainer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDirs {
    pub config_dir: PathBuf,
    pub legacy_config_dir: PathBuf,
}

impl UserDirs {
    pub fn new(home: &Path) -> Self {
        Self {
            config_dir: home.join(".apptainer"),
            legacy_config_dir: home.join(".singularity"),
        }
    }

    /// Honors `APPTAINER_CONFIGDIR` for the primary directory.
    pub fn with_config_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.config_dir = dir;
        }
        self
    }

    pub fn remote_config(&self) -> PathBuf {
        self.config_dir.join("remote.yaml")
    }

    pub fn legacy_remote_config(&self) -> PathBuf {
        self.legacy_config_dir.join("remote.yaml")
    }

    pub fn docker_config(&self) -> PathBuf {
        self.config_dir.join("docker-config.json")
    }

    pub fn legacy_docker_config(&self) -> PathBuf {
        self.legacy_config_dir.join("docker-config.json")
    }

    pub fn remote_cache_dir(&self) -> PathBuf {
        self.config_dir.join("remote-cache")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.config_dir.join("keys")
    }

    pub fn legacy_keys_dir(&self) -> PathBuf {
        self.legacy_config_dir.join("sypgp")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.config_dir.join("instances")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config_dir.join("checkpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_paths_layout() {
        let paths = InstallPaths {
            prefix: PathBuf::from("/opt/apptainer"),
            sysconfdir: PathBuf::from("/opt/apptainer/etc"),
            libexecdir: PathBuf::from("/opt/apptainer/libexec"),
            localstatedir: PathBuf::from("/opt/apptainer/var"),
            confdir: PathBuf::from("/opt/apptainer/etc/apptainer"),
        };
        assert_eq!(
            paths.starter(true),
            PathBuf::from("/opt/apptainer/libexec/apptainer/bin/starter-suid")
        );
        assert_eq!(
            paths.admin_config(),
            PathBuf::from("/opt/apptainer/etc/apptainer/apptainer.conf")
        );
        let relocated = paths.with_confdir(Some(PathBuf::from("/etc/custom")));
        assert_eq!(relocated.nvliblist(), PathBuf::from("/etc/custom/nvliblist.conf"));
        assert!(!relocated.is_suid_install());
    }

    #[test]
    fn test_user_dirs() {
        let dirs = UserDirs::new(Path::new("/home/alice"));
        assert_eq!(
            dirs.remote_config(),
            PathBuf::from("/home/alice/.apptainer/remote.yaml")
        );
        assert_eq!(
            dirs.legacy_keys_dir(),
            PathBuf::from("/home/alice/.singularity/sypgp")
        );
        let dirs = dirs.with_config_dir(Some(PathBuf::from("/scratch/conf")));
        assert_eq!(dirs.instances_dir(), PathBuf::from("/scratch/conf/instances"));
    }
}
