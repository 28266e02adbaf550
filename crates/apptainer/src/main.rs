//! # Apptainer
//! Command line front-end of the Apptainer container runtime. It turns the
//! user's intent into a launch plan and hands it to the starter.
mod commands;
mod observability;

use anyhow::{Context, Result};
use clap::{crate_version, Parser};

use libapptainer::confdir::handle_conf_dir;
use libapptainer::context::LaunchContextBuilder;
use libapptainer::env::promote_legacy_vars;
use libapptainer::error::ErrorKind;
use libapptainer_cli::{
    ActionCmd, CacheCmd, CapabilityCmd, ConfigCmd, GlobalOpts, ImageCmd, InstanceCmd,
    ManageCmd, OverlayCmd,
};

use crate::commands::ExitStatus;
use crate::observability::Verbosity;

// Global options come before the verb, every verb carries its own flags
#[derive(Parser, Debug)]
#[clap(version = crate_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    // Container actions and instances
    #[clap(flatten)]
    Action(ActionCmd),
    // Image production and transfer
    #[clap(flatten)]
    Image(ImageCmd),
    // Local state and configuration
    #[clap(flatten)]
    Manage(ManageCmd),
}

/// `SINGULARITY_*` variables become their `APPTAINER_*` synonyms before
/// the flags read their env fallbacks. Only warnings are shown this early.
fn promote_legacy_environment() {
    let host: Vec<(String, String)> = std::env::vars().collect();
    let early = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let promoted = tracing::subscriber::with_default(early, || promote_legacy_vars(&host));
    for (key, value) in promoted {
        std::env::set_var(key, value);
    }
}

fn parse_opts() -> Opts {
    match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            // help and version are not failures, usage errors exit with 1
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    }
}

fn run(opts: Opts) -> Result<i32> {
    let verbosity = Verbosity::from_flags(
        opts.global.debug,
        opts.global.verbose,
        opts.global.quiet,
        opts.global.silent,
    );
    let ctx = LaunchContextBuilder::new()
        .build()
        .context("failed to initialize the launch context")?;
    tracing::debug!(uid = ctx.uid, suid = ctx.suid_install, args = ?std::env::args_os(), "started");
    handle_conf_dir(&ctx.user_dirs);

    match opts.subcmd {
        SubCommand::Action(cmd) => match cmd {
            ActionCmd::Exec(exec) => commands::actions::exec(exec, &ctx, verbosity),
            ActionCmd::Run(run) => commands::actions::run(run, &ctx, verbosity),
            ActionCmd::Shell(shell) => commands::actions::shell(shell, &ctx, verbosity),
            ActionCmd::Test(test) => commands::actions::test(test, &ctx, verbosity),
            ActionCmd::Instance(instance) => match instance.cmd {
                InstanceCmd::Start(start) => {
                    commands::instance::start(start, &ctx, verbosity, false)
                }
                InstanceCmd::Run(start) => commands::instance::start(start, &ctx, verbosity, true),
                InstanceCmd::Stop(stop) => commands::instance::stop(stop, &ctx).map(|_| 0),
                InstanceCmd::List(list) => commands::instance::list(list, &ctx).map(|_| 0),
                InstanceCmd::Stats(stats) => commands::instance::stats(stats, &ctx).map(|_| 0),
            },
        },
        SubCommand::Image(cmd) => match cmd {
            ImageCmd::Pull(pull) => commands::pull::pull(pull, &ctx).map(|_| 0),
            ImageCmd::Push(push) => commands::push::push(push, &ctx).map(|_| 0),
            ImageCmd::Build(build) => commands::build::build(build, &ctx),
        },
        SubCommand::Manage(cmd) => match cmd {
            ManageCmd::Checkpoint(checkpoint) => commands::checkpoint::checkpoint(checkpoint, &ctx, verbosity),
            ManageCmd::Cache(cache) => match cache.cmd {
                CacheCmd::List(list) => commands::cache::list(list, &ctx),
                CacheCmd::Clean(clean) => commands::cache::clean(clean, &ctx),
            }
            .map(|_| 0),
            ManageCmd::Overlay(overlay) => match overlay.cmd {
                OverlayCmd::Create(create) => commands::overlay::create(create, &ctx),
            }
            .map(|_| 0),
            ManageCmd::Capability(capability) => match capability.cmd {
                CapabilityCmd::Add(target) => commands::capability::add(target, &ctx),
                CapabilityCmd::Drop(target) => commands::capability::drop(target, &ctx),
                CapabilityCmd::List { name } => commands::capability::list(name.as_deref(), &ctx),
                CapabilityCmd::Avail { caps } => commands::capability::avail(caps.as_deref()),
            }
            .map(|_| 0),
            ManageCmd::Config(config) => match config.cmd {
                ConfigCmd::Global(global) => commands::config::global(global, &ctx),
                ConfigCmd::Fakeroot(fakeroot) => commands::config::fakeroot(fakeroot, &ctx),
            }
            .map(|_| 0),
            ManageCmd::Remote(remote) => commands::remote::remote(remote, &ctx).map(|_| 0),
            ManageCmd::Keyserver(keyserver) => commands::remote::keyserver(keyserver, &ctx).map(|_| 0),
            ManageCmd::Registry(registry) => commands::remote::registry(registry, &ctx).map(|_| 0),
        },
    }
}

/// Status of a failed command: an explicit [`ExitStatus`], else the
/// classification of the first library error in the chain.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(ExitStatus(status)) = err.downcast_ref::<ExitStatus>() {
        return *status;
    }
    let root: &(dyn std::error::Error + 'static) = err.as_ref();
    ErrorKind::of(root).map(ErrorKind::exit_code).unwrap_or(1)
}

/// The error chain without the status markers.
fn error_message(err: &anyhow::Error) -> String {
    let marker = err.downcast_ref::<ExitStatus>().map(ToString::to_string);
    err.chain()
        .map(ToString::to_string)
        .filter(|message| Some(message) != marker.as_ref())
        .collect::<Vec<_>>()
        .join(": ")
}

fn main() {
    promote_legacy_environment();
    let opts = parse_opts();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {:?}", e);
    }

    let status = match run(opts) {
        Ok(status) => status,
        Err(err) => {
            tracing::error!("{}", error_message(&err));
            exit_code(&err)
        }
    };
    std::process::exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    use libapptainer::starter::StarterError;

    #[test]
    fn test_cli_is_consistent() {
        Opts::command().debug_assert();
    }

    #[test]
    #[serial]
    fn test_promote_legacy_environment() {
        std::env::set_var("SINGULARITY_CACHEDIR", "/scratch/legacy");
        std::env::set_var("SINGULARITY_TMPDIR", "/scratch/tmp");
        std::env::set_var("APPTAINER_TMPDIR", "/scratch/current");
        promote_legacy_environment();
        assert_eq!(std::env::var("APPTAINER_CACHEDIR").as_deref(), Ok("/scratch/legacy"));
        assert_eq!(std::env::var("APPTAINER_TMPDIR").as_deref(), Ok("/scratch/current"));
        for key in ["SINGULARITY_CACHEDIR", "SINGULARITY_TMPDIR", "APPTAINER_CACHEDIR", "APPTAINER_TMPDIR"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_exit_code() {
        let explicit = commands::with_status(2, anyhow::anyhow!("cache unreadable"));
        assert_eq!(exit_code(&explicit), 2);
        assert_eq!(error_message(&explicit), "cache unreadable");

        let plain = anyhow::anyhow!("something failed").context("while running");
        assert_eq!(exit_code(&plain), 1);
        assert_eq!(error_message(&plain), "while running: something failed");
    }

    #[test]
    fn test_starter_status_passes_through() {
        let err = anyhow::Error::new(StarterError::InstanceFailed(42)).context("exec failed");
        assert_eq!(exit_code(&err), 42);
    }

    #[test]
    fn test_global_flags_before_verb() -> Result<()> {
        let opts = Opts::try_parse_from(["apptainer", "-d", "exec", "-s", "/bin/zsh", "img.sif", "ls"])?;
        assert!(opts.global.debug);
        match opts.subcmd {
            SubCommand::Action(ActionCmd::Exec(exec)) => {
                assert_eq!(exec.opts.shell.as_deref(), Some("/bin/zsh"));
                assert_eq!(exec.image, "img.sif");
                assert_eq!(exec.command, vec!["ls"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }
}
