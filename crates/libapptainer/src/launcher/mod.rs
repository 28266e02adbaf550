//! Turns the options of an action command into an engine config and hands
//! it to the starter.
//!
//! [`Launcher::assemble`] runs the planners in a fixed order, each step may
//! depend on the decisions of the previous ones, and [`Launcher::dispatch`]
//! either replaces the process or starts an instance in the background.

mod options;

pub use options::LaunchOptions;

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use chrono::Utc;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::stat::{umask, Mode};

use crate::bind::{self, BindError};
use crate::cgroups::{plan_cgroups, requested_resources, CgroupHost, CgroupsError};
use crate::checkpoint::{dmtcp_paths, CheckpointError, CheckpointManager, DmtcpConfig, DMTCP_CONF};
use crate::context::LaunchContext;
use crate::crypt::{ask_no_echo, key_material, CryptError, KeyPurpose};
use crate::engine_config::{Action, EngineConfig, EngineConfigError, Namespaces};
use crate::env::{parse_env_file, set_container_env, EnvError, READ_ONLY_VARS};
use crate::fakeroot::{
    self, FakerootError, FakerootLocator, PathLocator, RootMappedExecutor, UnshareExecutor, FAKE_ARGS,
};
use crate::gpu::{plan_gpu, GpuError, GpuProbe, GpuRequest, HostGpuProbe};
use crate::home::{plan_home, HomeError, HomeRequest};
use crate::image::{
    check_encryption_key, prepare_image, DescriptorTable, ImageError, ImageFormat, ImageHandle,
    LookupUnsquasher, PrepareRequest, SifInspector, Unsquasher,
};
use crate::instance::sharens::{self, Rendezvous, SharensError};
use crate::instance::{check_name, write_pid_file, InstanceError, InstanceRecord};
use crate::mounts::{parse_no_mount, MountError};
use crate::privilege::{
    self, check_instance_hidepid, with_privilege, HostFacts, PlanOutcome, PrivilegeError,
    PrivilegePlan, PrivilegeRequest,
};
use crate::security::{target_ids, SecurityError, SecurityOptions, TargetIds};
use crate::starter::{
    dispatch_instance, dispatch_interactive, instance_procname, interactive_procname,
    ProcessStarter, Starter, StarterError, StarterRequest,
};
use crate::uri::{Transport, Uri, UriError};
use crate::utils;

/// Level handed to the starter when the front-end did not set one.
const DEFAULT_MESSAGE_LEVEL: i32 = 1;
const BOOT_DROP_CAPS: [&str; 2] = ["CAP_SYS_BOOT", "CAP_SYS_RAWIO"];
const PASSPHRASE_PROMPT: &str = "Enter passphrase for encrypted container: ";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("starting an instance from another is not allowed")]
    InstanceFromInstance,
    #[error("joining non-root instance with cgroups requires systemd as cgroups manager")]
    JoinCgroups,
    #[error(
        "{0:?} is an ext3 format container image, only SIF and squashfs images can be used \
         unprivileged, use `apptainer build` on a setuid installation to convert it"
    )]
    Ext3Unprivileged(PathBuf),
    #[error("could not read {path:?} environment file")]
    EnvFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("while processing {path:?}")]
    EnvFileSyntax { path: PathBuf, source: EnvError },
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error("while getting fakeroot bindpoints")]
    Fakeroot(#[from] FakerootError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Home(#[from] HomeError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Cgroups(#[from] CgroupsError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Sharens(#[from] SharensError),
    #[error(transparent)]
    Starter(#[from] StarterError),
    #[error(transparent)]
    EngineConfig(#[from] EngineConfigError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Uri(#[from] UriError),
}

type Result<T> = std::result::Result<T, LaunchError>;

/// How a launch ended when it returned at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The work ran in a re-executed child, exit with its status.
    ExitWithStatus(i32),
    /// The starter was executed. Only test doubles return here.
    Executed,
    InstanceStarted { name: String, pid: i32 },
}

/// A fully planned run, ready for the starter.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub config: EngineConfig,
    pub plan: PrivilegePlan,
    /// Name of the instance to start.
    pub instance: Option<String>,
    pub pid_file: Option<PathBuf>,
    /// Image recorded for an instance, before any conversion.
    pub image: String,
    /// Environment added for the starter process itself.
    pub starter_env: Vec<(String, String)>,
}

/// Drives a launch against a [`LaunchContext`]. Host interactions go
/// through replaceable seams, the defaults act on the real system.
pub struct Launcher<'a> {
    ctx: &'a LaunchContext,
    host: HostFacts,
    locator: &'a dyn FakerootLocator,
    executor: &'a dyn RootMappedExecutor,
    inspector: &'a dyn SifInspector,
    unsquasher: &'a dyn Unsquasher,
    gpu_probe: &'a dyn GpuProbe,
    starter: &'a dyn Starter,
    cgroup_host: CgroupHost,
    hidepid: bool,
    num_cpu: usize,
    ppid: i32,
    sharens_dir: Option<PathBuf>,
    umask: Option<u32>,
    overlay_loaded: bool,
    message_level: i32,
    argv: Vec<OsString>,
}

fn overlay_module_loaded() -> bool {
    match std::fs::read_to_string("/proc/filesystems") {
        Ok(content) => content
            .lines()
            .any(|line| line.split_whitespace().last() == Some("overlay")),
        Err(err) => {
            tracing::debug!(?err, "could not read /proc/filesystems");
            false
        }
    }
}

/// Sets the launcher umask to 0022 and returns the previous one.
fn snapshot_umask() -> u32 {
    umask(Mode::from_bits_truncate(0o022)).bits()
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn upsert(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => env.push((key.to_string(), value.to_string())),
    }
}

fn dmtcp_config(opts: &LaunchOptions) -> Option<DmtcpConfig> {
    if let Some(name) = opts.dmtcp_restart.as_deref().filter(|n| !n.is_empty()) {
        return Some(DmtcpConfig::restart(name));
    }
    opts.dmtcp_launch
        .as_deref()
        .filter(|n| !n.is_empty())
        .map(DmtcpConfig::launch)
}

impl<'a> Launcher<'a> {
    /// Probes the host for everything the context does not carry.
    pub fn new(ctx: &'a LaunchContext) -> Result<Self> {
        let mut host = HostFacts::probe(ctx.suid_install, ctx.admin.allow_setuid)?;
        host.uid = ctx.uid;
        host.gid = ctx.gid;
        host.username = ctx.username.clone();
        host.inside_userns = ctx.inside_userns;

        let hidepid = privilege::hidepid_proc();
        let mut launcher = Self::with_host(ctx, host);
        launcher.hidepid = hidepid;
        launcher.cgroup_host = CgroupHost::probe(ctx.uid, ctx.admin.systemd_cgroups, hidepid);
        launcher.num_cpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        launcher.ppid = nix::unistd::getppid().as_raw();
        launcher.overlay_loaded = overlay_module_loaded();
        launcher.argv = std::env::args_os().collect();
        Ok(launcher)
    }

    /// A launcher with the given host facts and no further probing.
    pub fn with_host(ctx: &'a LaunchContext, host: HostFacts) -> Self {
        Self {
            ctx,
            cgroup_host: CgroupHost {
                uid: ctx.uid,
                unprivileged: ctx.inside_userns,
                unified: false,
                systemd_cgroups: ctx.admin.systemd_cgroups,
                hidepid: false,
                xdg_runtime_dir: ctx.env("XDG_RUNTIME_DIR").map(str::to_string),
                dbus_session_bus_address: ctx.env("DBUS_SESSION_BUS_ADDRESS").map(str::to_string),
            },
            host,
            locator: &PathLocator,
            executor: &UnshareExecutor,
            inspector: &DescriptorTable,
            unsquasher: &LookupUnsquasher,
            gpu_probe: &HostGpuProbe,
            starter: &ProcessStarter,
            hidepid: false,
            num_cpu: 1,
            ppid: 1,
            sharens_dir: None,
            umask: None,
            overlay_loaded: true,
            message_level: DEFAULT_MESSAGE_LEVEL,
            argv: Vec::new(),
        }
    }

    pub fn with_fakeroot_locator(mut self, locator: &'a dyn FakerootLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_root_mapped_executor(mut self, executor: &'a dyn RootMappedExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_sif_inspector(mut self, inspector: &'a dyn SifInspector) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_unsquasher(mut self, unsquasher: &'a dyn Unsquasher) -> Self {
        self.unsquasher = unsquasher;
        self
    }

    pub fn with_gpu_probe(mut self, probe: &'a dyn GpuProbe) -> Self {
        self.gpu_probe = probe;
        self
    }

    pub fn with_starter(mut self, starter: &'a dyn Starter) -> Self {
        self.starter = starter;
        self
    }

    pub fn with_cgroup_host(mut self, host: CgroupHost) -> Self {
        self.cgroup_host = host;
        self
    }

    pub fn with_hidepid(mut self, hidepid: bool) -> Self {
        self.hidepid = hidepid;
        self
    }

    /// Uses `mask` instead of reading the process umask.
    pub fn with_umask(mut self, mask: u32) -> Self {
        self.umask = Some(mask);
        self
    }

    pub fn with_ppid(mut self, ppid: i32) -> Self {
        self.ppid = ppid;
        self
    }

    /// Directory of the `--sharens` lock files, `/dev/shm` by default.
    pub fn with_sharens_dir(mut self, dir: &Path) -> Self {
        self.sharens_dir = Some(dir.to_path_buf());
        self
    }

    /// Numeric level exported as `APPTAINER_MESSAGELEVEL`.
    pub fn with_message_level(mut self, level: i32) -> Self {
        self.message_level = level;
        self
    }

    /// Command line re-executed for a root-mapped fakeroot run.
    pub fn with_argv(mut self, argv: Vec<OsString>) -> Self {
        self.argv = argv;
        self
    }

    /// Plans, assembles and dispatches one action.
    #[tracing::instrument(level = "trace", skip_all, fields(image = %opts.image))]
    pub fn launch(&self, mut opts: LaunchOptions) -> Result<LaunchOutcome> {
        opts.apply_compat();
        opts.apply_containall();
        if opts.sharens {
            return self.launch_sharens(opts);
        }
        self.launch_one(&opts, None)
    }

    fn launch_one(&self, opts: &LaunchOptions, share_ns_fd: Option<RawFd>) -> Result<LaunchOutcome> {
        let plan = match self.plan_privilege(opts)? {
            PlanOutcome::Continue(plan) => plan,
            PlanOutcome::ExitWithStatus(status) => return Ok(LaunchOutcome::ExitWithStatus(status)),
        };
        tracing::debug!(mode = ?plan.mode, user_ns = plan.user_ns, "privilege plan");
        let assembled = self.assemble(opts, &plan, share_ns_fd)?;
        self.dispatch(assembled)
    }

    pub fn plan_privilege(&self, opts: &LaunchOptions) -> Result<PlanOutcome> {
        let req = PrivilegeRequest {
            fakeroot: opts.fakeroot,
            userns: opts.userns,
            ignore_subuid: opts.ignore_subuid,
            ignore_fakeroot_command: opts.ignore_fakeroot_command,
            ignore_userns: opts.ignore_userns,
            sandbox_source: self.ctx.cwd.join(&opts.image).is_dir(),
            build: false,
            argv: self.argv.clone(),
        };
        Ok(privilege::plan(&req, &self.host, self.locator, self.executor)?)
    }

    /// The first process of a parent starts a shared instance, every
    /// process, the first included, then joins it.
    fn launch_sharens(&self, opts: LaunchOptions) -> Result<LaunchOutcome> {
        let name = sharens::instance_name(self.ppid);
        let path = match &self.sharens_dir {
            Some(dir) => dir.join(&name),
            None => sharens::lock_path(self.ppid),
        };
        let mut rendezvous = Rendezvous::open_at(&path)?;

        if rendezvous.is_first() {
            tracing::debug!(%name, "starting shared instance");
            let first = LaunchOptions {
                action: Action::Start,
                args: Vec::new(),
                instance: Some(name.clone()),
                pid_file: None,
                ..opts.clone()
            };
            match self.launch_one(&first, Some(rendezvous.fd())) {
                Ok(LaunchOutcome::InstanceStarted { .. }) => rendezvous.mark_started()?,
                Ok(other) => {
                    rendezvous.abandon()?;
                    return Ok(other);
                }
                Err(err) => {
                    if let Err(unlock) = rendezvous.abandon() {
                        tracing::debug!(?unlock, "could not release the sharens lock");
                    }
                    return Err(err);
                }
            }
        } else if !rendezvous.wait()? || !self.ctx.instance_store().exists(&name) {
            return Err(SharensError::FirstExited.into());
        }

        let join = LaunchOptions {
            image: format!("{}://{name}", Transport::Instance.scheme()),
            instance: None,
            sharens: false,
            pid_file: None,
            ..opts
        };
        self.launch_one(&join, None)
    }

    /// Builds the engine config for `opts` under `plan`.
    pub fn assemble(
        &self,
        opts: &LaunchOptions,
        plan: &PrivilegePlan,
        share_ns_fd: Option<RawFd>,
    ) -> Result<Assembled> {
        let ctx = self.ctx;
        let mut cfg = EngineConfig {
            image_arg: opts.image_arg.clone(),
            namespaces: Namespaces {
                user: plan.user_ns,
                pid: opts.pid || opts.containall,
                ipc: opts.ipc || opts.containall,
                uts: opts.uts,
                net: opts.net,
                no_pid: opts.no_pid,
            },
            ..Default::default()
        };

        let mut args = Vec::with_capacity(opts.args.len() + FAKE_ARGS.len() + 1);
        if plan.fakeroot_path.is_some() {
            args.extend(FAKE_ARGS.iter().map(|a| a.to_string()));
        }
        args.push(opts.action.script());
        args.extend(opts.args.iter().cloned());
        cfg.args = args;

        if !opts.no_umask {
            let mask = self.umask.unwrap_or_else(snapshot_umask);
            tracing::debug!("Saving umask {mask:04o} for propagation into container");
            cfg.umask = Some(mask);
            cfg.restore_umask = true;
        }
        if opts.no_eval {
            cfg.no_eval = true;
            cfg.set_env_with_prefixes("NO_EVAL", "1");
        }

        let security = SecurityOptions::parse(&opts.security)?;
        let ids = target_ids(&security, ctx.uid, ctx.gid, plan.use_suid)?;
        cfg.target_uid = ids.target_uid;
        cfg.target_gids = ids.target_gids.clone();

        if !opts.image_arg.is_empty() {
            cfg.set_env_with_prefixes("IMAGE_ARG", &opts.image_arg);
        }
        let image = self.set_image(&mut cfg, opts)?;
        cfg.mounts.overlays = opts.overlay.clone();

        let mut format = None;
        if !cfg.instance_join {
            let mut handle = ImageHandle::open(Path::new(&cfg.image), self.inspector)?;
            format = Some(handle.format);
            let unprivileged = !plan.use_suid && ctx.uid != 0;
            let (key, userns) = if handle.is_encrypted() {
                let key = key_material(
                    &opts.key,
                    KeyPurpose::Private,
                    |k| ctx.env(k).map(str::to_string),
                    || ask_no_echo(PASSPHRASE_PROMPT),
                )?;
                (key, !unprivileged || self.executor.userns_available())
            } else {
                (None, true)
            };
            cfg.encryption_key = check_encryption_key(&mut handle, key.as_ref(), unprivileged, userns)?;
        }

        if plan.use_suid {
            match getrlimit(Resource::RLIMIT_STACK) {
                Ok(limits) => cfg.rlimit_stack = Some(limits),
                Err(err) => tracing::debug!(?err, "could not read RLIMIT_STACK"),
            }
        }

        let fake_binds = match &plan.fakeroot_path {
            Some(path) => fakeroot::fake_binds(path)?,
            None => Vec::new(),
        };
        cfg.mounts.set_binds(&opts.bind, &opts.mount, &fake_binds)?;
        let mut exported = bind::parse_bind_paths(&opts.bind)?;
        exported.extend(bind::parse_bind_paths(&fake_binds)?);
        if !exported.is_empty() {
            cfg.set_env_with_prefixes("BIND", &bind::nested_bind_env(&exported));
        }

        cfg.mounts
            .set_fuse_mounts(&opts.fusemount, ctx.admin.enable_fusemount)?;
        if !cfg.mounts.fuse_mounts.is_empty() {
            tracing::debug!("fuse mounts require a PID namespace");
            cfg.namespaces.pid = true;
        }

        let home = plan_home(
            &HomeRequest {
                home: opts
                    .home
                    .clone()
                    .unwrap_or_else(|| ctx.home.display().to_string()),
                custom_home: opts.home.is_some(),
                fakeroot: opts.fakeroot,
                target_uid: ids.target_uid,
            },
            |uid| utils::get_user_home(uid).map(|p| p.display().to_string()),
        )?;
        cfg.mounts.home_source = home.source;
        cfg.mounts.home_dest = home.dest;
        cfg.mounts.custom_home = home.custom_home;
        cfg.mounts.no_home = home.no_home || opts.no_home;
        cfg.mounts.no_mount = parse_no_mount(&opts.no_mount);

        let gpu = plan_gpu(
            &GpuRequest {
                nv: opts.nv,
                nvccli: opts.nvccli,
                rocm: opts.rocm,
                no_nv: opts.no_nv,
                no_rocm: opts.no_rocm,
                contain: opts.contain,
                writable: opts.writable,
                writable_tmpfs: opts.writable_tmpfs,
            },
            &ctx.admin,
            &ctx.install,
            &ctx.host_env,
            opts.fakeroot && ctx.admin.allow_setuid && ctx.suid_install,
            self.gpu_probe,
        )?;
        cfg.files_path.extend(gpu.files.iter().cloned());
        cfg.libraries_path.extend(gpu.libs.iter().cloned());
        let force_writable_tmpfs = gpu.force_writable_tmpfs;
        cfg.gpu = gpu;

        if let Some(dmtcp) = dmtcp_config(opts) {
            tracing::debug!("Injecting DMTCP configuration");
            let (bins, libs) = dmtcp_paths(&ctx.install.confdir.join(DMTCP_CONF), self.gpu_probe)?;
            let entry = CheckpointManager::new(ctx.user_dirs.checkpoint_dir()).get(&dmtcp.checkpoint)?;
            tracing::debug!("Injecting checkpoint state bind: {:?}", dmtcp.checkpoint);
            cfg.mounts.binds.push(entry.bind_path());
            cfg.files_path.extend(bins);
            cfg.libraries_path.extend(libs);
            cfg.dmtcp = Some(dmtcp);
        }

        cfg.mounts
            .set_writable(opts.writable, opts.writable_tmpfs || force_writable_tmpfs);
        cfg.mounts.contain_libs = opts.contain_libs.clone();
        cfg.libraries_path.extend(opts.contain_libs.iter().cloned());
        cfg.mounts.scratch = opts.scratch.clone();
        cfg.mounts.workdir = opts.workdir.clone();
        cfg.config_dir = ctx.user_dirs.config_dir.display().to_string();

        cfg.network.network = opts.network.clone().filter(|n| !n.is_empty());
        cfg.network.dns = opts.dns.clone();
        cfg.network.args = opts.network_args.clone();
        if let Some(hostname) = opts.hostname.as_deref().filter(|h| !h.is_empty()) {
            cfg.namespaces.uts = true;
            cfg.network.hostname = Some(hostname.to_string());
        }

        cfg.capabilities.add = split_list(opts.add_caps.as_deref());
        cfg.capabilities.drop = split_list(opts.drop_caps.as_deref());
        with_privilege(ctx.uid, opts.allow_setuid, "--allow-setuid", || ())?;
        cfg.capabilities.allow_suid = opts.allow_setuid;
        with_privilege(ctx.uid, opts.keep_privs, "--keep-privs", || ())?;
        cfg.capabilities.keep_privs = opts.keep_privs;
        cfg.capabilities.no_privs = opts.no_privs;
        cfg.security = security.profiles();

        if let Some(shell) = opts.shell.as_deref().filter(|s| !s.is_empty()) {
            cfg.shell = Some(shell.to_string());
            cfg.set_env_with_prefixes("SHELL", shell);
        }

        cfg.fakeroot = plan.fakeroot;
        if plan.fakeroot {
            cfg.namespaces.user = !opts.ignore_userns;
        }

        let requested = requested_resources(&opts.limits, opts.apply_cgroups.as_deref(), self.num_cpu)?;
        cfg.cgroups = plan_cgroups(
            requested,
            &self.cgroup_host,
            opts.is_instance(),
            plan.fakeroot,
            opts.sharens,
        )?;

        with_privilege(ctx.uid, opts.boot, "--boot", || ())?;
        cfg.contain = opts.contain || opts.containall || opts.boot;

        if let Some(name) = &opts.instance {
            self.set_instance(&mut cfg, opts, plan, name, share_ns_fd)?;
        }

        self.set_namespaces(&mut cfg, opts, &ids);
        self.set_env_vars(&mut cfg, opts)?;

        let host_cwd = ctx.cwd.display().to_string();
        cfg.cwd = Some(match &opts.pwd {
            Some(pwd) => {
                cfg.custom_cwd = true;
                pwd.clone()
            }
            None if cfg.contain => cfg.mounts.home_dest.clone(),
            None => host_cwd.clone(),
        });
        cfg.host_cwd = Some(host_cwd);

        if let Some(app) = opts.app.as_deref().filter(|a| !a.is_empty()) {
            cfg.set_env_with_prefixes("APPNAME", app);
        }
        if cfg.share_ns_mode && cfg.share_ns_fd.is_some() {
            cfg.set_env_with_prefixes("SHARENS_MASTER", "1");
        }

        if !cfg.instance_join {
            self.prepare(&mut cfg, opts, format)?;
        }

        cfg.load_overlay = !cfg.namespaces.user && (ctx.suid_install || ctx.uid == 0) && !self.overlay_loaded;

        let mut starter_env = vec![(
            "APPTAINER_MESSAGELEVEL".to_string(),
            self.message_level.to_string(),
        )];
        starter_env.extend(cfg.gpu.host_env.iter().cloned());

        Ok(Assembled {
            config: cfg,
            plan: plan.clone(),
            instance: opts.instance.clone(),
            pid_file: opts.pid_file.clone(),
            image,
            starter_env,
        })
    }

    /// Resolves the image to an absolute path or to a running instance.
    /// Returns the image to record for a new instance.
    fn set_image(&self, cfg: &mut EngineConfig, opts: &LaunchOptions) -> Result<String> {
        let uri = Uri::parse(&opts.image)?;
        if uri.transport == Transport::Instance {
            if opts.is_instance() {
                return Err(LaunchError::InstanceFromInstance);
            }
            let name = uri.reference.as_str();
            let record = self.ctx.instance_store().get(name)?;
            cfg.namespaces.user = record.user_ns;
            cfg.set_env_with_prefixes("CONTAINER", &record.image);
            cfg.set_env_with_prefixes("NAME", &base_name(&record.image));
            cfg.set_env_with_prefixes("INSTANCE", name);
            cfg.image = uri.as_str().to_string();
            cfg.instance_join = true;
            if record.cgroup && self.ctx.uid != 0 && !self.ctx.admin.systemd_cgroups {
                return Err(LaunchError::JoinCgroups);
            }
            return Ok(record.image);
        }

        let path = Path::new(&uri.reference);
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.ctx.cwd.join(path)
        };
        let abs = abs.display().to_string();
        cfg.set_env_with_prefixes("CONTAINER", &abs);
        cfg.set_env_with_prefixes("NAME", &base_name(&abs));
        cfg.image = abs.clone();
        Ok(abs)
    }

    fn set_instance(
        &self,
        cfg: &mut EngineConfig,
        opts: &LaunchOptions,
        plan: &PrivilegePlan,
        name: &str,
        share_ns_fd: Option<RawFd>,
    ) -> Result<()> {
        check_name(name)?;
        cfg.set_env_with_prefixes("INSTANCE", name);
        // a shared instance keeps the host PID namespace unless asked
        if !(opts.sharens && !opts.pid) {
            cfg.namespaces.pid = true;
        }
        cfg.instance = true;
        cfg.boot_instance = opts.boot;

        check_instance_hidepid(plan, self.hidepid)?;
        if self.ctx.instance_store().exists(name) {
            return Err(InstanceError::Exists(name.to_string()).into());
        }

        if opts.boot {
            cfg.namespaces.uts = true;
            cfg.namespaces.net = true;
            if cfg.network.hostname.is_none() {
                cfg.network.hostname = Some(name.to_string());
            }
            if !opts.keep_privs {
                cfg.capabilities.drop = BOOT_DROP_CAPS.iter().map(|c| c.to_string()).collect();
            }
            cfg.args = vec!["/sbin/init".to_string()];
        }

        cfg.share_ns_mode = opts.sharens;
        cfg.share_ns_fd = share_ns_fd;
        Ok(())
    }

    fn set_namespaces(&self, cfg: &mut EngineConfig, opts: &LaunchOptions, ids: &TargetIds) {
        if !cfg.namespaces.net && cfg.network.network.is_some() {
            tracing::info!("Setting --net (required by --network)");
            cfg.namespaces.net = true;
        }
        if !cfg.namespaces.net && !opts.network_args.is_empty() {
            tracing::info!("Setting --net (required by --network-args)");
            cfg.namespaces.net = true;
        }
        if cfg.namespaces.net {
            let unprivileged_install = !self.ctx.suid_install || !self.ctx.admin.allow_setuid;
            let network = cfg.network.network.get_or_insert_with(|| "bridge".to_string());
            if opts.fakeroot && network.as_str() != "none" && unprivileged_install {
                tracing::warn!(
                    "fakeroot with unprivileged installation or 'allow setuid = no' could not use 'fakeroot' network, fallback to 'none' network"
                );
                *network = "none".to_string();
            }
        }
        if cfg.namespaces.pid {
            cfg.no_init = opts.no_init;
        }
        if cfg.namespaces.user && !opts.fakeroot {
            cfg.add_user_mapping(self.ctx.uid, self.ctx.gid, ids.uid, ids.gid);
        }
    }

    /// `--env` and `--env-file` values become `APPTAINERENV_` overrides of
    /// a copy of the host environment, `--env` winning.
    fn set_env_vars(&self, cfg: &mut EngineConfig, opts: &LaunchOptions) -> Result<()> {
        let ctx = self.ctx;
        let mut vars: Vec<(String, String)> = Vec::new();
        for entry in &opts.env {
            match entry.split_once('=') {
                Some((key, value)) => upsert(&mut vars, key, value),
                None => tracing::warn!("Ignore environment variable {entry:?}: '=' is missing"),
            }
        }

        if let Some(path) = &opts.env_file {
            let mut context = ctx.host_env.clone();
            upsert(&mut context, "APPTAINER_IMAGE", &cfg.image);
            let content = std::fs::read_to_string(path).map_err(|source| LaunchError::EnvFile {
                path: path.clone(),
                source,
            })?;
            let from_file = parse_env_file(&content, &context).map_err(|source| LaunchError::EnvFileSyntax {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(?path, "Setting environment variables from file");
            for (key, value) in from_file {
                if READ_ONLY_VARS.contains(&key.as_str()) {
                    continue;
                }
                if vars.iter().any(|(k, _)| *k == key) {
                    tracing::warn!(
                        "Ignore environment variable {key} from {}: override from --env",
                        path.display()
                    );
                } else {
                    vars.push((key, value));
                }
            }
        }

        let mut host = ctx.host_env.clone();
        let user_path = format!("{}:{}", ctx.env("PATH").unwrap_or_default(), utils::DEFAULT_PATH);
        upsert(&mut host, "USER_PATH", &user_path);
        for (key, value) in &cfg.gpu.host_env {
            upsert(&mut host, key, value);
        }
        for (key, value) in vars {
            if key.is_empty() {
                tracing::warn!("Ignore environment variable {key}={value}: variable name missing");
                continue;
            }
            upsert(&mut host, &format!("APPTAINERENV_{key}"), &value);
        }

        let clean_env = opts.cleanenv || opts.containall;
        let home_dest = cfg.mounts.home_dest.clone();
        cfg.apptainer_env = set_container_env(&mut cfg.env, &host, &opts.no_env, clean_env, &home_dest);
        Ok(())
    }

    /// Extracts the image when it can't be mounted in the planned mode.
    fn prepare(&self, cfg: &mut EngineConfig, opts: &LaunchOptions, format: Option<ImageFormat>) -> Result<()> {
        let ctx = self.ctx;
        let user_ns = cfg.namespaces.user || ctx.inside_userns;
        if format == Some(ImageFormat::Ext3) && user_ns {
            return Err(LaunchError::Ext3Unprivileged(PathBuf::from(&cfg.image)));
        }
        let req = PrepareRequest {
            unsquash: opts.unsquash,
            user_ns,
            driver_can_mount: ctx.admin.image_driver_can_mount(),
            tmp_dir: ctx.tmp_dir.clone(),
            // only a temporary pull is removed, never the user's own file
            cache_disabled: (opts.disable_cache || ctx.cache.disable) && opts.image != opts.image_arg,
        };
        let prepared = prepare_image(Path::new(&cfg.image), &req, self.inspector, self.unsquasher)?;
        if let Some(dir) = prepared.delete_temp_dir {
            let image = prepared.image.display().to_string();
            cfg.set_env_with_prefixes("CONTAINER", &image);
            cfg.image = image;
            cfg.delete_temp_dir = Some(dir.display().to_string());
        }
        Ok(())
    }

    /// Hands an assembled run to the starter.
    pub fn dispatch(&self, assembled: Assembled) -> Result<LaunchOutcome> {
        let ctx = self.ctx;
        let Assembled {
            config,
            plan,
            instance,
            pid_file,
            image,
            starter_env,
        } = assembled;
        let mut req = StarterRequest {
            procname: interactive_procname(),
            binary: ctx.install.starter(plan.use_suid),
            config: config.to_json()?,
            env: starter_env,
            load_overlay: config.load_overlay,
        };

        let Some(name) = instance else {
            dispatch_interactive(self.starter, &req)?;
            return Ok(LaunchOutcome::Executed);
        };

        let store = ctx.instance_store();
        let (out, err) = store.prepare(&name)?;
        tracing::info!("you will find instance output here: {}", out.display());
        tracing::info!("you will find instance error here: {}", err.display());
        req.procname = instance_procname(&name, &ctx.username);
        let spawned = dispatch_instance(self.starter, &req, &out, &err)?;

        let record = InstanceRecord {
            name: name.clone(),
            image,
            pid: spawned.pid,
            user: ctx.username.clone(),
            ip: String::new(),
            user_ns: config.namespaces.user,
            cgroup: config.cgroups.resources.is_some(),
            fakeroot: config.fakeroot,
            share_ns: config.share_ns_mode,
            created: Utc::now(),
            log_out_path: out,
            log_err_path: err,
            checkpoint: config.dmtcp.as_ref().map(|d| d.checkpoint.clone()),
        };
        store.save(&record)?;
        if let Some(path) = pid_file {
            write_pid_file(&path, spawned.pid)?;
        }
        Ok(LaunchOutcome::InstanceStarted {
            name,
            pid: spawned.pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::user_context;
    use crate::engine_config::IdMapping;
    use crate::gpu::GpuFiles;
    use crate::image::unsquash::tests::Fake;
    use crate::instance::tests::record;
    use crate::privilege::PrivilegeMode;
    use crate::starter::tests::RecordingStarter;
    use anyhow::{bail, Result};
    use serial_test::serial;
    use std::fs;

    #[test]
    #[serial]
    fn test_snapshot_umask() {
        let original = umask(Mode::from_bits_truncate(0o002));
        assert_eq!(snapshot_umask(), 0o002);
        assert_eq!(umask(original).bits(), 0o022);
    }

    struct NoFake;

    impl FakerootLocator for NoFake {
        fn find_fake(&self) -> Option<PathBuf> {
            None
        }
    }

    struct NoUnshare;

    impl RootMappedExecutor for NoUnshare {
        fn run(
            &self,
            _args: &[OsString],
            _mount_ns: bool,
            _env: &[(String, String)],
        ) -> std::result::Result<i32, FakerootError> {
            Err(FakerootError::Unshare(std::io::Error::from_raw_os_error(libc::EPERM)))
        }
    }

    struct NoGpu;

    impl GpuProbe for NoGpu {
        fn resolve(&self, _list: &[String]) -> std::result::Result<GpuFiles, GpuError> {
            Ok(GpuFiles::default())
        }

        fn nvidia_ipcs(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn host(ctx: &LaunchContext) -> HostFacts {
        HostFacts {
            uid: ctx.uid,
            gid: ctx.gid,
            username: ctx.username.clone(),
            inside_userns: false,
            suid_install: false,
            allow_setuid: true,
            cap_sys_admin: false,
            subuid_mapped: false,
        }
    }

    fn launcher<'a>(ctx: &'a LaunchContext, starter: &'a RecordingStarter) -> Launcher<'a> {
        Launcher::with_host(ctx, host(ctx))
            .with_fakeroot_locator(&NoFake)
            .with_root_mapped_executor(&NoUnshare)
            .with_gpu_probe(&NoGpu)
            .with_unsquasher(&Fake)
            .with_starter(starter)
            .with_umask(0o027)
            .with_argv(vec![OsString::from("apptainer")])
    }

    fn sandbox(dir: &Path) -> Result<String> {
        let path = dir.join("alpine");
        fs::create_dir_all(path.join(".singularity.d"))?;
        Ok(path.display().to_string())
    }

    fn exec_opts(image: &str, args: &[&str]) -> LaunchOptions {
        LaunchOptions {
            action: Action::Exec,
            image_arg: image.to_string(),
            image: image.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn engine_config(req: &StarterRequest) -> Result<EngineConfig> {
        let doc: serde_json::Value = serde_json::from_slice(&req.config)?;
        Ok(serde_json::from_value(doc["engineConfig"].clone())?)
    }

    fn continued(launcher: &Launcher, opts: &LaunchOptions) -> Result<PrivilegePlan> {
        match launcher.plan_privilege(opts)? {
            PlanOutcome::Continue(plan) => Ok(plan),
            other => bail!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_userns_exec() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();

        let mut opts = exec_opts(&image, &["id"]);
        opts.env = vec!["FOO=bar".to_string()];
        let outcome = launcher(&ctx, &starter).launch(opts)?;
        assert_eq!(outcome, LaunchOutcome::Executed);

        let execs = starter.execs.borrow();
        assert_eq!(execs.len(), 1);
        let req = &execs[0];
        assert_eq!(req.procname, interactive_procname());
        assert_eq!(req.binary, ctx.install.starter(false));
        assert!(req
            .env
            .contains(&("APPTAINER_MESSAGELEVEL".to_string(), "1".to_string())));
        assert!(!req.load_overlay);

        let cfg = engine_config(req)?;
        assert!(cfg.namespaces.user);
        assert_eq!(
            cfg.uid_mappings,
            vec![IdMapping {
                container_id: 1000,
                host_id: 1000,
                size: 1
            }]
        );
        assert_eq!(cfg.args, vec![Action::Exec.script(), "id".to_string()]);
        assert_eq!(cfg.env.get("APPTAINER_CONTAINER"), Some(image.as_str()));
        assert_eq!(cfg.env.get("SINGULARITY_NAME"), Some("alpine"));
        assert_eq!(cfg.env.get("HOME"), Some(home.path().to_str().unwrap_or_default()));
        assert_eq!(cfg.apptainer_env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(cfg.cwd.as_deref(), Some("/work"));
        assert_eq!(cfg.umask, Some(0o027));
        assert!(cfg.restore_umask);
        Ok(())
    }

    #[test]
    fn test_containall_uses_home_cwd() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();

        let mut opts = exec_opts(&image, &["true"]);
        opts.containall = true;
        opts.no_umask = true;
        launcher(&ctx, &starter).launch(opts)?;

        let cfg = engine_config(&starter.execs.borrow()[0])?;
        assert!(cfg.contain && cfg.namespaces.pid && cfg.namespaces.ipc);
        assert_eq!(cfg.cwd.as_deref(), home.path().to_str());
        assert_eq!(cfg.umask, None);
        assert_eq!(cfg.env.get("LANG"), Some("C"));
        assert_eq!(cfg.env.get("TERM"), Some("xterm"));
        Ok(())
    }

    #[test]
    fn test_instance_start_and_duplicate() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter);

        let pid_file = images.path().join("web.pid");
        let opts = LaunchOptions {
            action: Action::Start,
            instance: Some("web".to_string()),
            pid_file: Some(pid_file.clone()),
            ..exec_opts(&image, &[])
        };
        let pid = std::process::id() as i32;
        assert_eq!(
            launcher.launch(opts.clone())?,
            LaunchOutcome::InstanceStarted {
                name: "web".to_string(),
                pid
            }
        );

        {
            let runs = starter.runs.borrow();
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].procname, instance_procname("web", "alice"));
            let cfg = engine_config(&runs[0])?;
            assert!(cfg.instance && cfg.namespaces.pid);
            assert_eq!(cfg.env.get("APPTAINER_INSTANCE"), Some("web"));
            assert_eq!(cfg.args, vec![Action::Start.script()]);
        }

        let rec = ctx.instance_store().get("web")?;
        assert_eq!(rec.image, image);
        assert_eq!(rec.pid, pid);
        assert!(rec.user_ns && !rec.share_ns && !rec.cgroup);
        assert_eq!(fs::read_to_string(&pid_file)?, format!("{pid}\n"));

        let err = launcher.launch(opts).unwrap_err();
        assert!(matches!(err, LaunchError::Instance(InstanceError::Exists(ref n)) if n == "web"));
        assert_eq!(starter.runs.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_instance_leaves_no_record() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter {
            exit: Some(255),
            stderr: "FATAL: container creation failed\n",
            ..Default::default()
        };

        let opts = LaunchOptions {
            instance: Some("db".to_string()),
            ..exec_opts(&image, &[])
        };
        let err = launcher(&ctx, &starter).launch(opts).unwrap_err();
        assert!(matches!(err, LaunchError::Starter(StarterError::InstanceFailed(255))));
        assert!(!ctx.instance_store().exists("db"));
        Ok(())
    }

    #[test]
    fn test_join_instance() -> Result<()> {
        let home = tempfile::tempdir()?;
        let mut ctx = user_context(home.path());
        let store = ctx.instance_store();
        store.save(&record(&store, "db", std::process::id() as i32))?;
        let starter = RecordingStarter::default();

        let opts = exec_opts("instance://db", &["ps"]);
        {
            let launcher = launcher(&ctx, &starter);
            let plan = continued(&launcher, &opts)?;
            let cfg = launcher.assemble(&opts, &plan, None)?.config;
            assert!(cfg.instance_join && cfg.namespaces.user);
            assert_eq!(cfg.image, "instance://db");
            assert_eq!(cfg.env.get("APPTAINER_CONTAINER"), Some("/images/alpine.sif"));
            assert_eq!(cfg.env.get("APPTAINER_INSTANCE"), Some("db"));

            let start = LaunchOptions {
                instance: Some("web".to_string()),
                ..opts.clone()
            };
            assert!(matches!(
                launcher.assemble(&start, &plan, None),
                Err(LaunchError::InstanceFromInstance)
            ));
        }

        let mut rec = record(&store, "db", std::process::id() as i32);
        rec.cgroup = true;
        store.save(&rec)?;
        ctx.admin.systemd_cgroups = false;
        let launcher = launcher(&ctx, &starter);
        let plan = continued(&launcher, &opts)?;
        assert!(matches!(
            launcher.assemble(&opts, &plan, None),
            Err(LaunchError::JoinCgroups)
        ));
        Ok(())
    }

    #[test]
    fn test_env_file_precedence() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let env_file = images.path().join("env");
        fs::write(&env_file, "FOO=file\nBAR=${APPTAINER_IMAGE}\nUID=5\n")?;
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter);

        let opts = LaunchOptions {
            env: vec!["FOO=cli".to_string(), "=orphan".to_string()],
            env_file: Some(env_file),
            ..exec_opts(&image, &["env"])
        };
        let plan = continued(&launcher, &opts)?;
        let cfg = launcher.assemble(&opts, &plan, None)?.config;
        assert_eq!(cfg.apptainer_env.get("FOO").map(String::as_str), Some("cli"));
        assert_eq!(cfg.apptainer_env.get("BAR"), Some(&image));
        assert!(!cfg.apptainer_env.contains_key("UID"));
        assert!(!cfg.apptainer_env.contains_key(""));
        assert_eq!(
            cfg.env.get("USER_PATH"),
            Some(format!("/usr/bin:/bin:{}", utils::DEFAULT_PATH).as_str())
        );
        Ok(())
    }

    #[test]
    fn test_privileged_flags_need_root() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter);

        for (opts, flag) in [
            (
                LaunchOptions {
                    boot: true,
                    instance: Some("vm".to_string()),
                    ..exec_opts(&image, &[])
                },
                "--boot",
            ),
            (
                LaunchOptions {
                    keep_privs: true,
                    ..exec_opts(&image, &[])
                },
                "--keep-privs",
            ),
        ] {
            let plan = continued(&launcher, &opts)?;
            match launcher.assemble(&opts, &plan, None) {
                Err(LaunchError::Privilege(PrivilegeError::RequiresRoot(desc))) => assert_eq!(desc, flag),
                other => bail!("unexpected result {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_fakeroot_network_fallback() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter);

        let opts = LaunchOptions {
            fakeroot: true,
            network_args: vec!["portmap=8080:80/tcp".to_string()],
            ..exec_opts(&image, &["true"])
        };
        let plan = PrivilegePlan {
            mode: PrivilegeMode::UserNs,
            use_suid: false,
            user_ns: true,
            fakeroot: true,
            fakeroot_path: None,
        };
        let cfg = launcher.assemble(&opts, &plan, None)?.config;
        assert!(cfg.namespaces.net && cfg.namespaces.user && cfg.fakeroot);
        assert_eq!(cfg.network.network.as_deref(), Some("none"));
        assert!(cfg.uid_mappings.is_empty());
        assert_eq!(cfg.mounts.home_dest, "/root");
        Ok(())
    }

    #[test]
    fn test_image_checks() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let mut ctx = user_context(home.path());
        ctx.tmp_dir = images.path().to_path_buf();
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter);

        let encrypted = images.path().join("enc.sif");
        crate::image::sif::tests::write_sif(&encrypted, 5, b"data")?;
        let opts = exec_opts(encrypted.to_str().unwrap_or_default(), &[]);
        let plan = continued(&launcher, &opts)?;
        assert!(matches!(
            launcher.assemble(&opts, &plan, None),
            Err(LaunchError::Image(ImageError::KeyMissing))
        ));

        let ext3 = images.path().join("old.img");
        let mut data = vec![0u8; 2048];
        data[1080..1082].copy_from_slice(&[0x53, 0xef]);
        fs::write(&ext3, data)?;
        let opts = exec_opts(ext3.to_str().unwrap_or_default(), &[]);
        assert!(matches!(
            launcher.assemble(&opts, &plan, None),
            Err(LaunchError::Ext3Unprivileged(_))
        ));

        let squashfs = images.path().join("img.sqfs");
        fs::write(&squashfs, b"hsqs")?;
        let opts = exec_opts(squashfs.to_str().unwrap_or_default(), &[]);
        let cfg = launcher.assemble(&opts, &plan, None)?.config;
        assert!(cfg.image.ends_with("/root"));
        assert!(cfg.delete_temp_dir.is_some());
        assert_eq!(cfg.env.get("APPTAINER_CONTAINER"), Some(cfg.image.as_str()));
        assert!(squashfs.exists());
        Ok(())
    }

    #[test]
    fn test_sharens_two_processes() -> Result<()> {
        let home = tempfile::tempdir()?;
        let images = tempfile::tempdir()?;
        let shm = tempfile::tempdir()?;
        let ctx = user_context(home.path());
        let image = sandbox(images.path())?;
        let starter = RecordingStarter::default();
        let launcher = launcher(&ctx, &starter)
            .with_ppid(4242)
            .with_sharens_dir(shm.path());

        let opts = LaunchOptions {
            sharens: true,
            ..exec_opts(&image, &["hostname"])
        };
        assert_eq!(launcher.launch(opts.clone())?, LaunchOutcome::Executed);
        let name = sharens::instance_name(4242);
        {
            let runs = starter.runs.borrow();
            assert_eq!(runs.len(), 1);
            let first = engine_config(&runs[0])?;
            assert!(first.instance && first.share_ns_mode);
            assert!(!first.namespaces.pid);
            assert_eq!(first.env.get("APPTAINER_SHARENS_MASTER"), Some("1"));

            let execs = starter.execs.borrow();
            let join = engine_config(&execs[0])?;
            assert!(join.instance_join);
            assert_eq!(join.image, format!("instance://{name}"));
            assert_eq!(join.args, vec![Action::Exec.script(), "hostname".to_string()]);
        }
        assert!(ctx.instance_store().get(&name)?.share_ns);

        // a sibling finds the instance running and only joins
        launcher.launch(opts)?;
        assert_eq!(starter.runs.borrow().len(), 1);
        assert_eq!(starter.execs.borrow().len(), 2);
        Ok(())
    }
}
