//! `build DEST SPEC`
use anyhow::{Context, Result};

use libapptainer::builder::{run_build, BuildEnv, BuildError, BuildOptions, BuildOutcome, BuildSpec, Builder};
use libapptainer::context::LaunchContext;
use libapptainer::crypt::KeyRequest;
use libapptainer::fakeroot::{PathLocator, UnshareExecutor};
use libapptainer::image::DescriptorTable;
use libapptainer::privilege::HostFacts;
use libapptainer_cli::Build;

use super::{confirm, is_interactive};

/// The definition file engine is a separate collaborator, this front-end
/// only validates and plans the build.
pub struct EngineUnavailable;

impl Builder for EngineUnavailable {
    fn build(&self, spec: &BuildSpec) -> Result<(), BuildError> {
        tracing::debug!(dest = ?spec.dest, mode = ?spec.plan.mode, "build planned");
        Err(BuildError::Engine("build engine not available".to_string()))
    }
}

pub fn build_options(args: Build) -> BuildOptions {
    BuildOptions {
        dest: args.dest,
        spec: args.spec,
        sandbox: args.sandbox,
        update: args.update,
        force: args.force,
        sections: args.section,
        no_test: args.notest,
        no_cleanup: args.no_cleanup,
        fix_perms: args.fix_perms,
        fakeroot: args.fakeroot,
        userns: args.userns,
        ignore_subuid: args.ignore_subuid,
        ignore_fakeroot_command: args.ignore_fakeroot_command,
        ignore_userns: args.ignore_userns,
        encrypt: args.encrypt,
        key: KeyRequest {
            pem_path: args.pem_path,
            passphrase: args.passphrase,
        },
        build_args: args.build_arg,
        build_arg_file: args.build_arg_file,
        nv: args.nv,
        nvccli: args.nvccli,
        rocm: args.rocm,
        bind: args.bind,
        mount: args.mount,
        writable_tmpfs: args.writable_tmpfs,
        disable_cache: args.disable_cache,
    }
}

pub fn build(args: Build, ctx: &LaunchContext) -> Result<i32> {
    let mut host = HostFacts::probe(ctx.suid_install, ctx.admin.allow_setuid)?;
    host.uid = ctx.uid;
    host.gid = ctx.gid;
    host.username = ctx.username.clone();
    host.inside_userns = ctx.inside_userns;

    let env = BuildEnv {
        ctx,
        host,
        locator: &PathLocator,
        executor: &UnshareExecutor,
        inspector: &DescriptorTable,
        argv: std::env::args_os().collect(),
        interactive: is_interactive(),
    };
    let opts = build_options(args);
    match run_build(&opts, &env, &EngineUnavailable, confirm)
        .with_context(|| format!("while performing build of {}", opts.dest))?
    {
        BuildOutcome::Built(path) => {
            tracing::info!("Build complete: {}", path.display());
            Ok(0)
        }
        BuildOutcome::ExitWithStatus(status) => Ok(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        build: Build,
    }

    #[test]
    fn test_build_options_from_flags() -> Result<()> {
        let cli = Cli::try_parse_from([
            "build",
            "--fakeroot",
            "--sandbox",
            "--build-arg",
            "VERSION=1.2",
            "--section",
            "post,test",
            "-T",
            "alpine",
            "alpine.def",
        ])?;
        let opts = build_options(cli.build);
        assert!(opts.fakeroot && opts.sandbox && opts.no_test);
        assert_eq!(opts.dest, "alpine");
        assert_eq!(opts.spec, "alpine.def");
        assert_eq!(opts.build_args, vec!["VERSION=1.2"]);
        assert_eq!(opts.sections, vec!["post", "test"]);
        assert!(opts.key.pem_path.is_none());
        Ok(())
    }
}
