//! Flags shared by `exec`, `run`, `shell`, `test` and `instance start|run`.
use std::path::PathBuf;

use clap::builder::FalseyValueParser;
use clap::{Args, Parser};

/// Options controlling how the container is launched
#[derive(Args, Debug, Clone, Default)]
pub struct ActionOpts {
    /// User-bind path specification, src[:dest[:opts]]
    #[clap(short = 'B', long, env = "APPTAINER_BINDPATH", value_delimiter = ',')]
    pub bind: Vec<String>,
    /// Mount specification, type=bind,source=...,destination=...
    #[clap(long, env = "APPTAINER_MOUNT")]
    pub mount: Vec<String>,
    /// Home directory specification, src[:dest]
    #[clap(short = 'H', long, env = "APPTAINER_HOME")]
    pub home: Option<String>,
    #[clap(long, env = "APPTAINER_NO_HOME", value_parser = FalseyValueParser::new())]
    pub no_home: bool,
    /// Disable one or more mount/bind entries, comma separated
    #[clap(long, env = "APPTAINER_NO_MOUNT", value_delimiter = ',')]
    pub no_mount: Vec<String>,
    /// Overlay filesystem images or directories
    #[clap(short = 'o', long, env = "APPTAINER_OVERLAY", value_delimiter = ',')]
    pub overlay: Vec<String>,
    #[clap(short, long, env = "APPTAINER_WRITABLE", value_parser = FalseyValueParser::new())]
    pub writable: bool,
    #[clap(long, env = "APPTAINER_WRITABLE_TMPFS", value_parser = FalseyValueParser::new())]
    pub writable_tmpfs: bool,
    /// Scratch directories mounted from the workdir or a tmpfs
    #[clap(short = 'S', long, env = "APPTAINER_SCRATCH", value_delimiter = ',')]
    pub scratch: Vec<String>,
    #[clap(short = 'W', long, env = "APPTAINER_WORKDIR")]
    pub workdir: Option<String>,
    /// Initial working directory inside the container
    #[clap(long, env = "APPTAINER_PWD")]
    pub pwd: Option<String>,
    #[clap(short, long, env = "APPTAINER_CONTAIN", value_parser = FalseyValueParser::new())]
    pub contain: bool,
    #[clap(short = 'C', long, env = "APPTAINER_CONTAINALL", value_parser = FalseyValueParser::new())]
    pub containall: bool,
    #[clap(short = 'e', long, env = "APPTAINER_CLEANENV", value_parser = FalseyValueParser::new())]
    pub cleanenv: bool,
    /// OCI runtime like behavior: containall, writable-tmpfs, no-init, no-umask
    #[clap(long, env = "APPTAINER_COMPAT", value_parser = FalseyValueParser::new())]
    pub compat: bool,

    /// Container environment variable, NAME=VALUE
    #[clap(long, value_delimiter = ',')]
    pub env: Vec<String>,
    #[clap(long, env = "APPTAINER_ENV_FILE")]
    pub env_file: Option<PathBuf>,
    /// Host variables not passed to the container
    #[clap(long, value_delimiter = ',')]
    pub no_env: Vec<String>,
    #[clap(long, env = "APPTAINER_HOSTNAME")]
    pub hostname: Option<String>,
    #[clap(short, long, env = "APPTAINER_NET", value_parser = FalseyValueParser::new())]
    pub net: bool,
    #[clap(long, env = "APPTAINER_NETWORK")]
    pub network: Option<String>,
    #[clap(long, env = "APPTAINER_NETWORK_ARGS")]
    pub network_args: Vec<String>,
    #[clap(long, env = "APPTAINER_DNS", value_delimiter = ',')]
    pub dns: Vec<String>,

    #[clap(short, long, env = "APPTAINER_IPC", value_parser = FalseyValueParser::new())]
    pub ipc: bool,
    #[clap(short, long, env = "APPTAINER_PID", value_parser = FalseyValueParser::new())]
    pub pid: bool,
    #[clap(long, env = "APPTAINER_NO_PID", value_parser = FalseyValueParser::new())]
    pub no_pid: bool,
    #[clap(short, long, env = "APPTAINER_UTS", value_parser = FalseyValueParser::new())]
    pub uts: bool,
    #[clap(long, env = "APPTAINER_USERNS", value_parser = FalseyValueParser::new())]
    pub userns: bool,
    #[clap(long, env = "APPTAINER_NO_INIT", value_parser = FalseyValueParser::new())]
    pub no_init: bool,

    #[clap(short, long, env = "APPTAINER_FAKEROOT", value_parser = FalseyValueParser::new())]
    pub fakeroot: bool,
    #[clap(long, env = "APPTAINER_IGNORE_SUBUID", value_parser = FalseyValueParser::new())]
    pub ignore_subuid: bool,
    #[clap(long, env = "APPTAINER_IGNORE_FAKEROOT_COMMAND", value_parser = FalseyValueParser::new())]
    pub ignore_fakeroot_command: bool,
    #[clap(long, env = "APPTAINER_IGNORE_USERNS", value_parser = FalseyValueParser::new())]
    pub ignore_userns: bool,

    #[clap(long, env = "APPTAINER_KEEP_PRIVS", value_parser = FalseyValueParser::new())]
    pub keep_privs: bool,
    #[clap(long, env = "APPTAINER_NO_PRIVS", value_parser = FalseyValueParser::new())]
    pub no_privs: bool,
    #[clap(long, env = "APPTAINER_ADD_CAPS")]
    pub add_caps: Option<String>,
    #[clap(long, env = "APPTAINER_DROP_CAPS")]
    pub drop_caps: Option<String>,
    #[clap(long, env = "APPTAINER_ALLOW_SETUID", value_parser = FalseyValueParser::new())]
    pub allow_setuid: bool,
    /// Security options: uid:N, gid:N[:N...], selinux:, apparmor:, seccomp:
    #[clap(long, env = "APPTAINER_SECURITY", value_delimiter = ',')]
    pub security: Vec<String>,

    #[clap(long, env = "APPTAINER_NV", value_parser = FalseyValueParser::new())]
    pub nv: bool,
    #[clap(long, env = "APPTAINER_NVCCLI", value_parser = FalseyValueParser::new())]
    pub nvccli: bool,
    #[clap(long, env = "APPTAINER_NO_NV", value_parser = FalseyValueParser::new())]
    pub no_nv: bool,
    #[clap(long, env = "APPTAINER_ROCM", value_parser = FalseyValueParser::new())]
    pub rocm: bool,
    #[clap(long, env = "APPTAINER_NO_ROCM", value_parser = FalseyValueParser::new())]
    pub no_rocm: bool,
    #[clap(long, env = "APPTAINER_CONTAINLIBS", value_delimiter = ',')]
    pub contain_libs: Vec<String>,
    /// FUSE mount specification, <type>:<fuse command> <mountpoint>
    #[clap(long, env = "APPTAINER_FUSESPEC")]
    pub fusemount: Vec<String>,

    /// Cgroups resources file in TOML format
    #[clap(long, env = "APPTAINER_APPLY_CGROUPS")]
    pub apply_cgroups: Option<PathBuf>,
    #[clap(long, env = "APPTAINER_BLKIO_WEIGHT", default_value_t = 0)]
    pub blkio_weight: i64,
    #[clap(long, env = "APPTAINER_BLKIO_WEIGHT_DEVICE")]
    pub blkio_weight_device: Vec<String>,
    #[clap(long, env = "APPTAINER_CPU_SHARES", default_value_t = 0)]
    pub cpu_shares: i64,
    #[clap(long, env = "APPTAINER_CPUS")]
    pub cpus: Option<String>,
    #[clap(long, env = "APPTAINER_CPUSET_CPUS")]
    pub cpuset_cpus: Option<String>,
    #[clap(long, env = "APPTAINER_CPUSET_MEMS")]
    pub cpuset_mems: Option<String>,
    #[clap(long, env = "APPTAINER_MEMORY")]
    pub memory: Option<String>,
    #[clap(long, env = "APPTAINER_MEMORY_RESERVATION")]
    pub memory_reservation: Option<String>,
    #[clap(long, env = "APPTAINER_MEMORY_SWAP")]
    pub memory_swap: Option<String>,
    #[clap(long, env = "APPTAINER_OOM_KILL_DISABLE", value_parser = FalseyValueParser::new())]
    pub oom_kill_disable: bool,
    #[clap(long, env = "APPTAINER_PIDS_LIMIT", default_value_t = 0)]
    pub pids_limit: i64,

    #[clap(long, env = "APPTAINER_BOOT", value_parser = FalseyValueParser::new())]
    pub boot: bool,
    #[clap(long, env = "APPTAINER_NO_UMASK", value_parser = FalseyValueParser::new())]
    pub no_umask: bool,
    #[clap(long, env = "APPTAINER_NO_EVAL", value_parser = FalseyValueParser::new())]
    pub no_eval: bool,
    /// Extract SIF and squashfs images to a temporary sandbox
    #[clap(short = 'U', long, env = "APPTAINER_UNSQUASH", value_parser = FalseyValueParser::new())]
    pub unsquash: bool,
    /// Share namespaces with the other processes of the same parent
    #[clap(long, env = "APPTAINER_SHARENS", value_parser = FalseyValueParser::new())]
    pub sharens: bool,
    #[clap(long, env = "APPTAINER_APP")]
    pub app: Option<String>,
    #[clap(short = 's', long, env = "APPTAINER_SHELL")]
    pub shell: Option<String>,

    /// RSA private key used to decrypt an encrypted container
    #[clap(long, env = "APPTAINER_ENCRYPTION_PEM_PATH")]
    pub pem_path: Option<PathBuf>,
    /// Prompt for the encryption passphrase
    #[clap(long)]
    pub passphrase: bool,

    #[clap(long, env = "APPTAINER_DISABLE_CACHE", value_parser = FalseyValueParser::new())]
    pub disable_cache: bool,
    #[clap(flatten)]
    pub pull: PullAuthOpts,

    #[clap(long, env = "APPTAINER_DMTCP_LAUNCH")]
    pub dmtcp_launch: Option<String>,
    #[clap(long, env = "APPTAINER_DMTCP_RESTART")]
    pub dmtcp_restart: Option<String>,
}

/// Registry options shared by every command fetching images
#[derive(Args, Debug, Clone, Default)]
pub struct PullAuthOpts {
    /// Prompt for registry credentials
    #[clap(long)]
    pub docker_login: bool,
    #[clap(long, env = "APPTAINER_DOCKER_USERNAME", hide_env_values = true)]
    pub docker_username: Option<String>,
    #[clap(long, env = "APPTAINER_DOCKER_PASSWORD", hide_env_values = true)]
    pub docker_password: Option<String>,
    /// Docker style authentication file
    #[clap(long, env = "APPTAINER_AUTHFILE")]
    pub authfile: Option<PathBuf>,
    /// Use http instead of https for registries and libraries
    #[clap(long, env = "APPTAINER_NOHTTPS", value_parser = FalseyValueParser::new())]
    pub no_https: bool,
    /// Platform of the image, os/arch[/variant]
    #[clap(long, env = "APPTAINER_PLATFORM")]
    pub platform: Option<String>,
    #[clap(long, env = "APPTAINER_LIBRARY")]
    pub library: Option<String>,
}

/// Run a command within a container
#[derive(Parser, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Exec {
    #[clap(flatten)]
    pub opts: ActionOpts,
    pub image: String,
    #[clap(required = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Run the user-defined default command within a container
#[derive(Parser, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Run {
    #[clap(flatten)]
    pub opts: ActionOpts,
    pub image: String,
    #[clap(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Run a shell within a container
#[derive(Parser, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Shell {
    #[clap(flatten)]
    pub opts: ActionOpts,
    pub image: String,
    #[clap(allow_hyphen_values = true, hide = true)]
    pub args: Vec<String>,
}

/// Run the user-defined tests within a container
#[derive(Parser, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Test {
    #[clap(flatten)]
    pub opts: ActionOpts,
    pub image: String,
    #[clap(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
