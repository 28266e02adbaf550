//! `exec`, `run`, `shell` and `test`.
use anyhow::{Context, Result};

use libapptainer::cgroups::LimitFlags;
use libapptainer::context::LaunchContext;
use libapptainer::crypt::KeyRequest;
use libapptainer::engine_config::Action;
use libapptainer::launcher::{LaunchOptions, LaunchOutcome, Launcher};
use libapptainer::uri::Uri;
use libapptainer_cli::{ActionOpts, Exec, Run, Shell, Test};

use super::{cache_config, pull_options, resolver};
use crate::observability::Verbosity;

/// Maps the action flags onto the launcher options.
pub fn launch_options(opts: ActionOpts, action: Action, image: &str, args: Vec<String>) -> LaunchOptions {
    LaunchOptions {
        action,
        image_arg: image.to_string(),
        image: image.to_string(),
        args,
        app: opts.app,
        bind: opts.bind,
        mount: opts.mount,
        home: opts.home,
        no_home: opts.no_home,
        no_mount: opts.no_mount,
        overlay: opts.overlay,
        writable: opts.writable,
        writable_tmpfs: opts.writable_tmpfs,
        scratch: opts.scratch,
        workdir: opts.workdir,
        pwd: opts.pwd,
        contain: opts.contain,
        containall: opts.containall,
        cleanenv: opts.cleanenv,
        compat: opts.compat,
        env: opts.env,
        env_file: opts.env_file,
        no_env: opts.no_env,
        hostname: opts.hostname,
        net: opts.net,
        network: opts.network,
        network_args: opts.network_args,
        dns: opts.dns,
        ipc: opts.ipc,
        pid: opts.pid,
        no_pid: opts.no_pid,
        uts: opts.uts,
        userns: opts.userns,
        no_init: opts.no_init,
        fakeroot: opts.fakeroot,
        ignore_subuid: opts.ignore_subuid,
        ignore_fakeroot_command: opts.ignore_fakeroot_command,
        ignore_userns: opts.ignore_userns,
        keep_privs: opts.keep_privs,
        no_privs: opts.no_privs,
        add_caps: opts.add_caps,
        drop_caps: opts.drop_caps,
        allow_setuid: opts.allow_setuid,
        security: opts.security,
        nv: opts.nv,
        nvccli: opts.nvccli,
        no_nv: opts.no_nv,
        rocm: opts.rocm,
        no_rocm: opts.no_rocm,
        contain_libs: opts.contain_libs,
        fusemount: opts.fusemount,
        apply_cgroups: opts.apply_cgroups,
        limits: LimitFlags {
            blkio_weight: opts.blkio_weight,
            blkio_weight_device: opts.blkio_weight_device,
            cpu_shares: opts.cpu_shares,
            cpus: opts.cpus,
            cpuset_cpus: opts.cpuset_cpus,
            cpuset_mems: opts.cpuset_mems,
            memory: opts.memory,
            memory_reservation: opts.memory_reservation,
            memory_swap: opts.memory_swap,
            oom_kill_disable: opts.oom_kill_disable,
            pids_limit: opts.pids_limit,
        },
        boot: opts.boot,
        no_umask: opts.no_umask,
        no_eval: opts.no_eval,
        unsquash: opts.unsquash,
        sharens: opts.sharens,
        shell: opts.shell,
        key: KeyRequest {
            pem_path: opts.pem_path,
            passphrase: opts.passphrase,
        },
        disable_cache: opts.disable_cache,
        dmtcp_launch: opts.dmtcp_launch,
        dmtcp_restart: opts.dmtcp_restart,
        instance: None,
        pid_file: None,
    }
}

/// Pulls the image when given as a URI. Local paths and instances are
/// left untouched.
pub fn resolve_image(ctx: &LaunchContext, opts: &ActionOpts, image: &str) -> Result<String> {
    let uri = Uri::parse(image)?;
    if uri.is_local() {
        return Ok(image.to_string());
    }
    let pull = pull_options(ctx, &opts.pull, image)?;
    resolver()
        .resolve(image, &cache_config(ctx, opts.disable_cache), &pull)
        .with_context(|| format!("could not resolve {image}"))
}

/// Runs one launch and converts its outcome into an exit status.
pub fn launch(ctx: &LaunchContext, opts: LaunchOptions, verbosity: Verbosity) -> Result<i32> {
    let launcher = Launcher::new(ctx)?.with_message_level(verbosity.message_level());
    match launcher.launch(opts)? {
        LaunchOutcome::ExitWithStatus(status) => Ok(status),
        LaunchOutcome::Executed => Ok(0),
        LaunchOutcome::InstanceStarted { name, pid } => {
            tracing::info!(pid, "instance started successfully: {name}");
            Ok(0)
        }
    }
}

fn action(
    ctx: &LaunchContext,
    opts: ActionOpts,
    action: Action,
    image: &str,
    args: Vec<String>,
    verbosity: Verbosity,
) -> Result<i32> {
    let resolved = resolve_image(ctx, &opts, image)?;
    let mut launch_opts = launch_options(opts, action, image, args);
    launch_opts.image = resolved;
    launch(ctx, launch_opts, verbosity)
}

pub fn exec(args: Exec, ctx: &LaunchContext, verbosity: Verbosity) -> Result<i32> {
    action(ctx, args.opts, Action::Exec, &args.image, args.command, verbosity)
}

pub fn run(args: Run, ctx: &LaunchContext, verbosity: Verbosity) -> Result<i32> {
    action(ctx, args.opts, Action::Run, &args.image, args.args, verbosity)
}

pub fn shell(args: Shell, ctx: &LaunchContext, verbosity: Verbosity) -> Result<i32> {
    if !args.args.is_empty() {
        tracing::warn!("Ignoring extra arguments to shell: {}", args.args.join(" "));
    }
    action(ctx, args.opts, Action::Shell, &args.image, Vec::new(), verbosity)
}

pub fn test(args: Test, ctx: &LaunchContext, verbosity: Verbosity) -> Result<i32> {
    action(ctx, args.opts, Action::Test, &args.image, args.args, verbosity)
}
