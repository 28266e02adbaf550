//! Process wide facts gathered once before any planning.

use std::path::{Path, PathBuf};

use crate::admin_config::{AdminConfig, AdminConfigError};
use crate::cache::CacheConfig;
use crate::env::split_environ;
use crate::instance::InstanceStore;
use crate::paths::{InstallPaths, UserDirs};
use crate::remote::{self, RemoteConfig, RemoteError};
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("unable to parse apptainer.conf file")]
    AdminConfig(#[from] AdminConfigError),
    #[error("unable to read remote configuration")]
    Remote(#[from] RemoteError),
    #[error("could not determine the home directory of uid {0}")]
    NoHome(u32),
    #[error("could not get current working directory")]
    Cwd(#[source] std::io::Error),
}

type Result<T> = std::result::Result<T, ContextError>;

/// Immutable view of the host, the install and the user configuration.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub install: InstallPaths,
    pub admin: AdminConfig,
    pub user_dirs: UserDirs,
    /// Home directory of the invoking user.
    pub home: PathBuf,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub suid_install: bool,
    pub inside_userns: bool,
    pub hostname: String,
    /// Environment of the invoking process.
    pub host_env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub tmp_dir: PathBuf,
}

impl LaunchContext {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.host_env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Boolean variables are set when non-empty and not `0` or `false`.
    pub fn env_flag(&self, key: &str) -> bool {
        matches!(self.env(key), Some(v) if !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
    }

    pub fn instance_store(&self) -> InstanceStore {
        self.instance_store_for(&self.username)
    }

    /// Instances of another user, reachable by root through the same
    /// layout under that user's home.
    pub fn instance_store_for(&self, user: &str) -> InstanceStore {
        if user == self.username {
            return InstanceStore::new(&self.user_dirs.instances_dir(), &self.hostname, user);
        }
        let home = nix::unistd::User::from_name(user)
            .ok()
            .flatten()
            .map(|u| u.dir)
            .unwrap_or_else(|| PathBuf::from("/nonexistent"));
        InstanceStore::new(&UserDirs::new(&home).instances_dir(), &self.hostname, user)
    }
}

/// Builds a [`LaunchContext`], probing the running process for anything not
/// provided explicitly.
#[derive(Debug, Default)]
pub struct LaunchContextBuilder {
    install: Option<InstallPaths>,
    admin: Option<AdminConfig>,
    home: Option<PathBuf>,
    host_env: Option<Vec<(String, String)>>,
    identity: Option<(u32, u32, String)>,
    suid_install: Option<bool>,
    inside_userns: Option<bool>,
    hostname: Option<String>,
    cwd: Option<PathBuf>,
}

impl LaunchContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_install_paths(mut self, install: InstallPaths) -> Self {
        self.install = Some(install);
        self
    }

    /// Skips reading `apptainer.conf`.
    pub fn with_admin_config(mut self, admin: AdminConfig) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_home(mut self, home: &Path) -> Self {
        self.home = Some(home.to_path_buf());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.host_env = Some(env);
        self
    }

    pub fn with_identity(mut self, uid: u32, gid: u32, username: &str) -> Self {
        self.identity = Some((uid, gid, username.to_string()));
        self
    }

    pub fn with_suid_install(mut self, suid: bool) -> Self {
        self.suid_install = Some(suid);
        self
    }

    pub fn with_inside_userns(mut self, inside: bool) -> Self {
        self.inside_userns = Some(inside);
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn with_cwd(mut self, cwd: &Path) -> Self {
        self.cwd = Some(cwd.to_path_buf());
        self
    }

    pub fn build(self) -> Result<LaunchContext> {
        let host_env = self.host_env.unwrap_or_else(|| std::env::vars().collect());
        let lookup = |key: &str| -> Option<String> {
            host_env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };

        let install = self
            .install
            .unwrap_or_default()
            .with_confdir(lookup("APPTAINER_CONFDIR").map(PathBuf::from));
        let admin = match self.admin {
            Some(admin) => admin,
            None => {
                let path = install.admin_config();
                tracing::debug!(?path, "parsing configuration file");
                AdminConfig::load(&path)?
            }
        };

        let (uid, gid, username) = self.identity.unwrap_or_else(|| {
            let uid = nix::unistd::getuid().as_raw();
            (uid, nix::unistd::getgid().as_raw(), utils::get_username(uid))
        });
        let home = match self.home {
            Some(home) => home,
            None => utils::get_user_home(uid).ok_or(ContextError::NoHome(uid))?,
        };
        let user_dirs =
            UserDirs::new(&home).with_config_dir(lookup("APPTAINER_CONFIGDIR").map(PathBuf::from));

        let remote = remote::load_user_view(&user_dirs.remote_config(), &install.global_remote_config())?;

        let cache = CacheConfig {
            parent_dir: lookup("APPTAINER_CACHEDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| user_dirs.config_dir.clone()),
            disable: matches!(lookup("APPTAINER_DISABLE_CACHE").as_deref(), Some(v) if v != "0" && v != "false"),
        };

        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().map_err(ContextError::Cwd)?,
        };
        let hostname = self.hostname.unwrap_or_else(|| {
            nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        });

        Ok(LaunchContext {
            suid_install: self.suid_install.unwrap_or_else(|| install.is_suid_install()),
            inside_userns: self.inside_userns.unwrap_or_else(utils::is_in_new_userns),
            tmp_dir: lookup("APPTAINER_TMPDIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            install,
            admin,
            user_dirs,
            home,
            remote,
            cache,
            uid,
            gid,
            username,
            hostname,
            host_env,
            cwd,
        })
    }
}

/// Splits `KEY=VALUE` lines, used by tests and the CLI for `--env`
/// style input.
pub fn env_pairs(lines: &[&str]) -> Vec<(String, String)> {
    split_environ(lines.iter().copied())
}
