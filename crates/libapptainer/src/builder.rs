//! `build`: target checks, build arguments and privilege selection in front
//! of an external build engine.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::context::LaunchContext;
use crate::crypt::{ask_no_echo, key_material, CryptError, KeyInfo, KeyPurpose, KeyRequest};
use crate::fakeroot::{FakerootLocator, RootMappedExecutor};
use crate::image::{ImageError, ImageHandle, SifInspector};
use crate::privilege::{self, HostFacts, PlanOutcome, PrivilegeError, PrivilegePlan, PrivilegeRequest};
use crate::uri::{Transport, Uri, UriError};

/// Set for the build engine so OCI tooling knows the invoking user.
pub const ROOTLESS_UID_ENV: &str = "_CONTAINERS_ROOTLESS_UID";
const SANDBOX_ENTRIES: [&str; 4] = [".singularity.d", "dev", "proc", "sys"];

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("only sandbox update is supported: --sandbox flag is missing")]
    UpdateNeedsSandbox,
    #[error("only sandbox update is supported: {0:?} is not a directory")]
    UpdateNotDir(PathBuf),
    #[error("could not update sandbox {0:?}: doesn't exist")]
    UpdateMissing(PathBuf),
    #[error("{0:?} is not empty and is not an Apptainer sandbox, check its content first and use --force if you want to overwrite it")]
    NotSandbox(PathBuf),
    #[error("build target '{0}' already exists. Use --force if you want to overwrite it")]
    TargetExists(String),
    #[error("stopping build")]
    Stopped,
    #[error("{0:?}: build argument must be in the form KEY=VALUE")]
    BuildArg(String),
    #[error("error while opening file {path:?}")]
    BuildArgFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("section specification error: cannot have {0} and any other option")]
    Sections(&'static str),
    #[error("--writable-tmpfs option is not supported for fakeroot build")]
    WritableTmpfsFakeroot,
    #[error("You must be root to build an encrypted container")]
    EncryptNeedsRoot,
    #[error("Unable to use container encryption. Must supply encryption material through environment variables or flags.")]
    NoEncryptionMaterial,
    #[error("You must be the root user, however you can --fakeroot to build from an Apptainer recipe file")]
    RecipeNeedsRoot,
    #[error("could not read build target {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error("while handling encryption material")]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error("While performing build: {0}")]
    Engine(String),
}

type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub dest: String,
    pub spec: String,
    pub sandbox: bool,
    pub update: bool,
    pub force: bool,
    pub sections: Vec<String>,
    pub no_test: bool,
    pub no_cleanup: bool,
    pub fix_perms: bool,

    pub fakeroot: bool,
    pub userns: bool,
    pub ignore_subuid: bool,
    pub ignore_fakeroot_command: bool,
    pub ignore_userns: bool,

    pub encrypt: bool,
    pub key: KeyRequest,
    pub build_args: Vec<String>,
    pub build_arg_file: Option<PathBuf>,

    pub nv: bool,
    pub nvccli: bool,
    pub rocm: bool,
    pub bind: Vec<String>,
    pub mount: Vec<String>,
    pub writable_tmpfs: bool,
    pub disable_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildFormat {
    Sif,
    Sandbox,
}

/// What the build engine receives.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub dest: PathBuf,
    pub spec: String,
    pub format: BuildFormat,
    pub update: bool,
    pub force: bool,
    pub sections: Vec<String>,
    pub no_test: bool,
    pub no_cleanup: bool,
    pub fix_perms: bool,
    pub build_args: BTreeMap<String, String>,
    pub encryption: Option<KeyInfo>,
    pub plan: PrivilegePlan,
    pub cache: CacheConfig,
    pub tmp_dir: PathBuf,
    /// Variables exported to the build engine.
    pub env: Vec<(String, String)>,
}

/// The engine turning a definition or a source image into a container.
pub trait Builder {
    fn build(&self, spec: &BuildSpec) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(PathBuf),
    /// The build ran in a re-executed child.
    ExitWithStatus(i32),
}

fn key_val(text: &str) -> Result<(String, String)> {
    match text.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(BuildError::BuildArg(text.to_string())),
    }
}

/// Merges `--build-arg-file` and `--build-arg` values, the flags winning.
/// Malformed lines of the file are skipped with a warning.
pub fn read_build_args(args: &[String], file: Option<&Path>) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if let Some(path) = file {
        let content = std::fs::read_to_string(path).map_err(|source| BuildError::BuildArgFile {
            path: path.to_path_buf(),
            source,
        })?;
        for line in content.lines() {
            match key_val(line) {
                Ok((k, v)) => {
                    vars.insert(k, v);
                }
                Err(err) => tracing::warn!("Skipping {line:?} in build arg file: {err}"),
            }
        }
    }
    for arg in args {
        let (k, v) = key_val(arg)?;
        vars.insert(k, v);
    }
    Ok(vars)
}

pub fn check_sections(sections: &[String]) -> Result<()> {
    if sections.len() > 1 {
        for word in ["all", "none"] {
            if sections.iter().any(|s| s == word) {
                return Err(BuildError::Sections(word));
            }
        }
    }
    Ok(())
}

/// Checks the build destination. Returns whether an existing target will be
/// overwritten. `confirm` asks the user and is only called when
/// `interactive`.
pub fn check_build_target<F>(
    dest: &Path,
    opts: &BuildOptions,
    interactive: bool,
    inspector: &dyn SifInspector,
    confirm: F,
) -> Result<bool>
where
    F: FnOnce(&str) -> bool,
{
    if !opts.sandbox && opts.update {
        return Err(BuildError::UpdateNeedsSandbox);
    }
    let meta = match std::fs::metadata(dest) {
        Ok(meta) => meta,
        Err(_) if opts.update => return Err(BuildError::UpdateMissing(dest.to_path_buf())),
        Err(_) => return Ok(opts.force),
    };
    if opts.update && !meta.is_dir() {
        return Err(BuildError::UpdateNotDir(dest.to_path_buf()));
    }
    if meta.is_dir() && !opts.force {
        let io_err = |source| BuildError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let names: Vec<String> = std::fs::read_dir(dest)
            .map_err(io_err)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        let required = names
            .iter()
            .filter(|n| SANDBOX_ENTRIES.contains(&n.as_str()))
            .count();
        if !names.is_empty() && required != SANDBOX_ENTRIES.len() {
            return Err(BuildError::NotSandbox(dest.to_path_buf()));
        }
    }
    if opts.update || opts.force {
        return Ok(opts.force);
    }

    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !interactive {
        return Err(BuildError::TargetExists(name));
    }
    let question = match ImageHandle::open(dest, inspector) {
        Ok(mut handle) => {
            handle.close();
            format!("Build target '{name}' already exists and will be deleted during the build process. Do you want to continue? [y/N] ")
        }
        Err(ImageError::UnknownFormat(_)) => format!(
            "Build target '{name}' may be a definition file or a text/binary file that will be overwritten. Do you still want to overwrite it? [y/N] "
        ),
        Err(err) => return Err(err.into()),
    };
    if !confirm(&question) {
        return Err(BuildError::Stopped);
    }
    Ok(true)
}

/// Host seams used by [`run_build`].
pub struct BuildEnv<'a> {
    pub ctx: &'a LaunchContext,
    pub host: HostFacts,
    pub locator: &'a dyn FakerootLocator,
    pub executor: &'a dyn RootMappedExecutor,
    pub inspector: &'a dyn SifInspector,
    pub argv: Vec<OsString>,
    pub interactive: bool,
}

fn gpu_and_mount_env(opts: &BuildOptions) -> Vec<(String, String)> {
    let mut env = Vec::new();
    for (set, key) in [(opts.nv, "APPTAINER_NV"), (opts.nvccli, "APPTAINER_NVCCLI"), (opts.rocm, "APPTAINER_ROCM")] {
        if set {
            env.push((key.to_string(), "1".to_string()));
        }
    }
    if !opts.bind.is_empty() {
        env.push(("APPTAINER_BINDPATH".to_string(), opts.bind.join(",")));
    }
    if !opts.mount.is_empty() {
        env.push(("APPTAINER_MOUNT".to_string(), opts.mount.join("\n")));
    }
    if opts.writable_tmpfs {
        env.push(("APPTAINER_WRITABLE_TMPFS".to_string(), "1".to_string()));
    }
    env
}

fn encryption(opts: &BuildOptions, env: &BuildEnv) -> Result<Option<KeyInfo>> {
    let ctx = env.ctx;
    let requested = opts.encrypt || opts.key.passphrase || opts.key.pem_path.is_some();
    if !requested {
        if ctx.env("APPTAINER_ENCRYPTION_PASSPHRASE").is_some() || ctx.env("APPTAINER_ENCRYPTION_PEM_PATH").is_some() {
            tracing::warn!("Encryption related env vars found, but --encrypt was not specified. NOT encrypting container.");
        }
        return Ok(None);
    }
    if ctx.uid != 0 {
        return Err(BuildError::EncryptNeedsRoot);
    }
    key_material(
        &opts.key,
        KeyPurpose::Public,
        |k| ctx.env(k).map(str::to_string),
        || ask_no_echo("Enter encryption passphrase: "),
    )?
    .map(Some)
    .ok_or(BuildError::NoEncryptionMaterial)
}

/// Validates the request, selects privileges and hands the build to
/// `builder`.
#[tracing::instrument(level = "debug", skip_all, fields(dest = %opts.dest))]
pub fn run_build<F>(opts: &BuildOptions, env: &BuildEnv, builder: &dyn Builder, confirm: F) -> Result<BuildOutcome>
where
    F: FnOnce(&str) -> bool,
{
    let ctx = env.ctx;
    if opts.writable_tmpfs && opts.fakeroot {
        return Err(BuildError::WritableTmpfsFakeroot);
    }
    if opts.fakeroot && opts.nvccli && !opts.no_test {
        tracing::warn!("Due to writable-tmpfs limitations, %test sections will fail with --nvccli & --fakeroot");
        tracing::info!("Use -T / --notest to disable running tests during the build");
    }

    let dest = ctx.cwd.join(&opts.dest);
    let force = check_build_target(&dest, opts, env.interactive, env.inspector, confirm)?;
    let encryption = encryption(opts, env)?;

    let source = Uri::parse(&opts.spec)?;
    let spec_path = ctx.cwd.join(&opts.spec);
    let recipe = source.transport == Transport::Local
        && spec_path.is_file()
        && ImageHandle::open(&spec_path, env.inspector)
            .map(|mut h| h.close())
            .is_err();
    if ctx.uid != 0 && !opts.fakeroot && recipe {
        return Err(BuildError::RecipeNeedsRoot);
    }
    check_sections(&opts.sections)?;
    let build_args = read_build_args(&opts.build_args, opts.build_arg_file.as_deref())?;

    let req = PrivilegeRequest {
        fakeroot: opts.fakeroot,
        userns: opts.userns,
        ignore_subuid: opts.ignore_subuid,
        ignore_fakeroot_command: opts.ignore_fakeroot_command,
        ignore_userns: opts.ignore_userns,
        sandbox_source: opts.sandbox,
        build: true,
        argv: env.argv.clone(),
    };
    let plan = match privilege::plan(&req, &env.host, env.locator, env.executor)? {
        PlanOutcome::Continue(plan) => plan,
        PlanOutcome::ExitWithStatus(status) => return Ok(BuildOutcome::ExitWithStatus(status)),
    };

    let mut build_env = gpu_and_mount_env(opts);
    if opts.fakeroot || source.transport.is_oci() {
        build_env.push((ROOTLESS_UID_ENV.to_string(), ctx.uid.to_string()));
    }

    let spec = BuildSpec {
        dest: dest.clone(),
        spec: opts.spec.clone(),
        format: if opts.sandbox {
            BuildFormat::Sandbox
        } else {
            BuildFormat::Sif
        },
        update: opts.update,
        force,
        sections: opts.sections.clone(),
        no_test: opts.no_test,
        no_cleanup: opts.no_cleanup,
        fix_perms: opts.fix_perms,
        build_args,
        encryption,
        plan,
        cache: CacheConfig {
            disable: ctx.cache.disable || opts.disable_cache,
            ..ctx.cache.clone()
        },
        tmp_dir: ctx.tmp_dir.clone(),
        env: build_env,
    };
    builder.build(&spec)?;
    tracing::info!("Build complete: {}", dest.display());
    Ok(BuildOutcome::Built(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::user_context;
    use crate::fakeroot::FakerootError;
    use crate::image::DescriptorTable;
    use anyhow::Result;
    use std::cell::RefCell;
    use std::fs;

    #[derive(Default)]
    struct RecordingBuilder {
        specs: RefCell<Vec<BuildSpec>>,
    }

    impl Builder for RecordingBuilder {
        fn build(&self, spec: &BuildSpec) -> super::Result<()> {
            self.specs.borrow_mut().push(spec.clone());
            Ok(())
        }
    }

    struct NoFake;

    impl FakerootLocator for NoFake {
        fn find_fake(&self) -> Option<PathBuf> {
            None
        }
    }

    struct ExitWith(i32);

    impl RootMappedExecutor for ExitWith {
        fn run(&self, _: &[OsString], _: bool, _: &[(String, String)]) -> std::result::Result<i32, FakerootError> {
            Ok(self.0)
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
            subuid_mapped: true,
        }
    }

    #[test]
    fn test_build_args() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("args");
        fs::write(&file, "OS=alpine\nbroken\nVERSION=1\n")?;
        let args = read_build_args(&["VERSION=2".to_string()], Some(&file))?;
        assert_eq!(args.get("OS").map(String::as_str), Some("alpine"));
        assert_eq!(args.get("VERSION").map(String::as_str), Some("2"));
        assert_eq!(args.len(), 2);
        assert!(matches!(
            read_build_args(&["novalue".to_string()], None),
            Err(BuildError::BuildArg(_))
        ));
        Ok(())
    }

    #[test]
    fn test_sections() {
        assert!(check_sections(&["all".to_string()]).is_ok());
        assert!(check_sections(&["post".to_string(), "test".to_string()]).is_ok());
        assert!(matches!(
            check_sections(&["none".to_string(), "post".to_string()]),
            Err(BuildError::Sections("none"))
        ));
    }

    #[test]
    fn test_build_target() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("box");
        let opts = BuildOptions::default();

        assert!(!check_build_target(&dest, &opts, false, &DescriptorTable, |_| false)?);
        let update = BuildOptions {
            update: true,
            ..Default::default()
        };
        assert!(matches!(
            check_build_target(&dest, &update, false, &DescriptorTable, |_| false),
            Err(BuildError::UpdateNeedsSandbox)
        ));
        let sandbox_update = BuildOptions {
            sandbox: true,
            ..update
        };
        assert!(matches!(
            check_build_target(&dest, &sandbox_update, false, &DescriptorTable, |_| false),
            Err(BuildError::UpdateMissing(_))
        ));

        fs::create_dir(&dest)?;
        fs::write(dest.join("notes.txt"), "keep")?;
        assert!(matches!(
            check_build_target(&dest, &opts, true, &DescriptorTable, |_| true),
            Err(BuildError::NotSandbox(_))
        ));
        for entry in SANDBOX_ENTRIES {
            fs::create_dir(dest.join(entry))?;
        }
        assert!(matches!(
            check_build_target(&dest, &opts, false, &DescriptorTable, |_| true),
            Err(BuildError::TargetExists(n)) if n == "box"
        ));
        assert!(matches!(
            check_build_target(&dest, &opts, true, &DescriptorTable, |_| false),
            Err(BuildError::Stopped)
        ));
        assert!(check_build_target(&dest, &opts, true, &DescriptorTable, |q| q.contains("'box'"))?);
        assert!(!check_build_target(&dest, &sandbox_update, false, &DescriptorTable, |_| false)?);
        Ok(())
    }

    #[test]
    fn test_run_build() -> Result<()> {
        let home = tempfile::tempdir()?;
        let mut ctx = user_context(home.path());
        ctx.cwd = home.path().to_path_buf();
        let env = BuildEnv {
            ctx: &ctx,
            host: host(&ctx),
            locator: &NoFake,
            executor: &ExitWith(0),
            inspector: &DescriptorTable,
            argv: vec![OsString::from("apptainer"), OsString::from("build")],
            interactive: false,
        };
        let builder = RecordingBuilder::default();

        let opts = BuildOptions {
            dest: "alpine.sif".to_string(),
            spec: "docker://alpine".to_string(),
            build_args: vec!["A=1".to_string()],
            nv: true,
            ..Default::default()
        };
        assert_eq!(
            run_build(&opts, &env, &builder, |_| false)?,
            BuildOutcome::Built(home.path().join("alpine.sif"))
        );
        let spec = builder.specs.borrow()[0].clone();
        assert_eq!(spec.format, BuildFormat::Sif);
        assert!(spec.plan.user_ns);
        assert!(spec.env.contains(&(ROOTLESS_UID_ENV.to_string(), "1000".to_string())));
        assert!(spec.env.contains(&("APPTAINER_NV".to_string(), "1".to_string())));
        assert_eq!(spec.build_args.get("A").map(String::as_str), Some("1"));

        let recipe = home.path().join("alpine.def");
        fs::write(&recipe, "Bootstrap: docker\nFrom: alpine\n")?;
        let unprivileged = BuildOptions {
            dest: "other.sif".to_string(),
            spec: "alpine.def".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            run_build(&unprivileged, &env, &builder, |_| false),
            Err(BuildError::RecipeNeedsRoot)
        ));

        let encrypted = BuildOptions {
            encrypt: true,
            ..unprivileged.clone()
        };
        assert!(matches!(
            run_build(&encrypted, &env, &builder, |_| false),
            Err(BuildError::EncryptNeedsRoot)
        ));
        Ok(())
    }

    #[test]
    fn test_fakeroot_build_reexecs() -> Result<()> {
        let home = tempfile::tempdir()?;
        let mut ctx = user_context(home.path());
        ctx.cwd = home.path().to_path_buf();
        let mut host = host(&ctx);
        host.subuid_mapped = false;
        let env = BuildEnv {
            ctx: &ctx,
            host,
            locator: &NoFake,
            executor: &ExitWith(3),
            inspector: &DescriptorTable,
            argv: vec![OsString::from("apptainer")],
            interactive: false,
        };
        let builder = RecordingBuilder::default();
        let opts = BuildOptions {
            dest: "alpine.sif".to_string(),
            spec: "alpine.def".to_string(),
            fakeroot: true,
            ..Default::default()
        };
        fs::write(home.path().join("alpine.def"), "Bootstrap: docker\n")?;
        assert_eq!(run_build(&opts, &env, &builder, |_| false)?, BuildOutcome::ExitWithStatus(3));
        assert!(builder.specs.borrow().is_empty());

        let tmpfs = BuildOptions {
            writable_tmpfs: true,
            ..opts
        };
        assert!(matches!(
            run_build(&tmpfs, &env, &builder, |_| false),
            Err(BuildError::WritableTmpfsFakeroot)
        ));
        Ok(())
    }
}
