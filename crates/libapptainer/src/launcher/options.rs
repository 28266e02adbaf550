use std::path::PathBuf;

use crate::cgroups::LimitFlags;
use crate::crypt::KeyRequest;
use crate::engine_config::Action;

/// Everything an action command asks of the launcher. Field names follow
/// the command line flags.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub action: Action,
    /// Image as given on the command line.
    pub image_arg: String,
    /// Local image path or `instance://` reference after resolution.
    pub image: String,
    pub args: Vec<String>,
    pub app: Option<String>,

    pub bind: Vec<String>,
    pub mount: Vec<String>,
    pub home: Option<String>,
    pub no_home: bool,
    pub no_mount: Vec<String>,
    pub overlay: Vec<String>,
    pub writable: bool,
    pub writable_tmpfs: bool,
    pub scratch: Vec<String>,
    pub workdir: Option<String>,
    pub pwd: Option<String>,
    pub contain: bool,
    pub containall: bool,
    pub cleanenv: bool,
    pub compat: bool,

    pub env: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub no_env: Vec<String>,
    pub hostname: Option<String>,
    pub net: bool,
    pub network: Option<String>,
    pub network_args: Vec<String>,
    pub dns: Vec<String>,

    pub ipc: bool,
    pub pid: bool,
    pub no_pid: bool,
    pub uts: bool,
    pub userns: bool,
    pub no_init: bool,

    pub fakeroot: bool,
    pub ignore_subuid: bool,
    pub ignore_fakeroot_command: bool,
    pub ignore_userns: bool,

    pub keep_privs: bool,
    pub no_privs: bool,
    pub add_caps: Option<String>,
    pub drop_caps: Option<String>,
    pub allow_setuid: bool,
    pub security: Vec<String>,

    pub nv: bool,
    pub nvccli: bool,
    pub no_nv: bool,
    pub rocm: bool,
    pub no_rocm: bool,
    pub contain_libs: Vec<String>,
    pub fusemount: Vec<String>,

    pub apply_cgroups: Option<PathBuf>,
    pub limits: LimitFlags,

    pub boot: bool,
    pub no_umask: bool,
    pub no_eval: bool,
    pub unsquash: bool,
    pub sharens: bool,
    pub shell: Option<String>,

    pub key: KeyRequest,
    pub disable_cache: bool,

    pub dmtcp_launch: Option<String>,
    pub dmtcp_restart: Option<String>,

    /// Name of the instance to start.
    pub instance: Option<String>,
    pub pid_file: Option<PathBuf>,
}

impl LaunchOptions {
    /// `--compat` stands for the flags giving OCI runtime like behavior.
    pub fn apply_compat(&mut self) {
        if !self.compat {
            return;
        }
        self.containall = true;
        self.writable_tmpfs = true;
        self.no_init = true;
        self.no_umask = true;
    }

    /// `--containall` implies `--contain`, `--pid`, `--ipc` and `--cleanenv`.
    pub fn apply_containall(&mut self) {
        if !self.containall {
            return;
        }
        self.contain = true;
        self.pid = true;
        self.ipc = true;
        self.cleanenv = true;
    }

    pub fn is_instance(&self) -> bool {
        self.instance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compat_implies_containall() {
        let mut opts = LaunchOptions {
            compat: true,
            ..Default::default()
        };
        opts.apply_compat();
        opts.apply_containall();
        assert!(opts.contain && opts.pid && opts.ipc && opts.cleanenv);
        assert!(opts.writable_tmpfs && opts.no_init && opts.no_umask);
        assert!(!opts.writable);
    }
}
