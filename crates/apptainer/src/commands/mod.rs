use std::fmt;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use libapptainer::cache::CacheConfig;
use libapptainer::context::LaunchContext;
use libapptainer::crypt::ask_no_echo;
use libapptainer::net::NetClient;
use libapptainer::uri::{
    library_host, CancelFlag, DockerAuth, LibraryConfig, Platform, PullOptions, Resolver, Transport, Uri,
};
use libapptainer_cli::PullAuthOpts;

pub mod actions;
pub mod build;
pub mod cache;
pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod instance;
pub mod overlay;
pub mod pull;
pub mod push;
pub mod remote;

/// Attached to errors of commands reporting a status other than 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

pub fn with_status(status: i32, err: anyhow::Error) -> anyhow::Error {
    err.context(ExitStatus(status))
}

static INTERRUPTED: OnceLock<CancelFlag> = OnceLock::new();

extern "C" fn on_interrupt(_: libc::c_int) {
    if let Some(flag) = INTERRUPTED.get() {
        flag.cancel();
    }
}

/// Turns SIGINT into a cancellation of running downloads.
pub fn cancel_on_interrupt() -> Result<CancelFlag> {
    let flag = INTERRUPTED.get_or_init(CancelFlag::new).clone();
    let action = SigAction::new(SigHandler::Handler(on_interrupt), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only performs an atomic store
    unsafe { sigaction(Signal::SIGINT, &action) }.context("failed to install SIGINT handler")?;
    Ok(flag)
}

pub fn is_interactive() -> bool {
    io::stdin().is_terminal()
}

/// Asks a y/N question on the terminal.
pub fn confirm(question: &str) -> bool {
    eprint!("{question}");
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn read_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Username and password from the flags, prompting for what is missing.
pub fn credentials(
    username: Option<String>,
    password: Option<String>,
    password_stdin: bool,
) -> Result<(String, String)> {
    let username = match username {
        Some(u) => u,
        None => read_line("Username: ")?,
    };
    let password = match password {
        Some(p) => p,
        None if password_stdin => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
        None => ask_no_echo("Password / Token: ")?,
    };
    Ok((username, password))
}

/// Clients able to fetch images from this front-end.
pub fn resolver() -> Resolver {
    Resolver::new()
        .with_client(Transport::Http, Box::new(NetClient::http()))
        .with_client(Transport::Https, Box::new(NetClient::https()))
}

pub fn cache_config(ctx: &LaunchContext, disable_cache: bool) -> CacheConfig {
    CacheConfig {
        disable: ctx.cache.disable || disable_cache,
        ..ctx.cache.clone()
    }
}

fn docker_auth(auth: &PullAuthOpts) -> Result<Option<DockerAuth>> {
    if auth.docker_login {
        let (username, password) = credentials(auth.docker_username.clone(), None, false)?;
        return Ok(Some(DockerAuth { username, password }));
    }
    match (&auth.docker_username, &auth.docker_password) {
        (Some(username), Some(password)) => Ok(Some(DockerAuth {
            username: username.clone(),
            password: password.clone(),
        })),
        (Some(_), None) | (None, Some(_)) => {
            bail!("both a docker username and password must be provided")
        }
        // credentials stored by `registry login` are read by the clients
        (None, None) => Ok(None),
    }
}

/// Library endpoint for `source`. A host inside a `library://` reference
/// overrides the active remote.
fn library_config(
    ctx: &LaunchContext,
    library: Option<&str>,
    source: &str,
    no_https: bool,
) -> Result<Option<LibraryConfig>> {
    let host = match Uri::parse(source) {
        Ok(uri) if uri.transport == Transport::Library => library_host(&uri.reference).0.map(str::to_string),
        _ => None,
    };
    match (library, host) {
        (Some(_), Some(_)) => {
            bail!("conflicting arguments; do not use --library with a library URI containing host name")
        }
        (Some(url), None) => {
            return Ok(Some(LibraryConfig {
                base_url: url.to_string(),
                auth_token: None,
            }))
        }
        (None, Some(host)) => {
            let scheme = if no_https { "http" } else { "https" };
            return Ok(Some(LibraryConfig {
                base_url: format!("{scheme}://{host}"),
                auth_token: None,
            }));
        }
        (None, None) => {}
    }
    let Ok((_, ep)) = ctx.remote.default_remote() else {
        return Ok(None);
    };
    let Some(mut url) = ep.url() else {
        return Ok(None);
    };
    if no_https || ep.insecure {
        let _ = url.set_scheme("http");
    }
    Ok(Some(LibraryConfig {
        base_url: url.to_string(),
        auth_token: (!ep.token.is_empty()).then(|| ep.token.clone()),
    }))
}

/// Transfer options for fetching or uploading `source`.
pub fn pull_options(ctx: &LaunchContext, auth: &PullAuthOpts, source: &str) -> Result<PullOptions> {
    let platform: Option<Platform> = match &auth.platform {
        Some(p) => Some(p.parse().with_context(|| format!("invalid --platform {p}"))?),
        None => None,
    };
    Ok(PullOptions {
        tmp_dir: ctx.tmp_dir.clone(),
        docker_auth: docker_auth(auth)?,
        auth_file: Some(auth.authfile.clone().unwrap_or_else(|| ctx.user_dirs.docker_config())),
        library: library_config(ctx, auth.library.as_deref(), source, auth.no_https)?,
        platform,
        no_https: auth.no_https,
        cancel: cancel_on_interrupt()?,
    })
}

/// Mutating the system configuration needs root, unless the install is
/// unprivileged.
pub fn check_config_privilege(ctx: &LaunchContext, what: &str) -> Result<()> {
    if ctx.uid != 0 && ctx.suid_install {
        bail!("{what} requires root privileges");
    }
    Ok(())
}

/// Context of an unprivileged user whose home and install config live
/// under `root`.
#[cfg(test)]
pub(crate) fn test_context(root: &std::path::Path, uid: u32) -> Result<LaunchContext> {
    use libapptainer::admin_config::AdminConfig;
    use libapptainer::context::LaunchContextBuilder;

    let confdir = root.join("etc");
    std::fs::create_dir_all(&confdir)?;
    let home = root.join("home");
    std::fs::create_dir_all(&home)?;
    Ok(LaunchContextBuilder::new()
        .with_admin_config(AdminConfig::default())
        .with_home(&home)
        .with_env(vec![
            ("APPTAINER_CONFDIR".to_string(), confdir.display().to_string()),
            ("APPTAINER_TMPDIR".to_string(), root.display().to_string()),
        ])
        .with_identity(uid, uid, if uid == 0 { "root" } else { "alice" })
        .with_suid_install(true)
        .with_inside_userns(false)
        .with_hostname("node1")
        .with_cwd(root)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_context() {
        let err = with_status(2, anyhow::anyhow!("cache unreadable"));
        assert_eq!(err.downcast_ref::<ExitStatus>(), Some(&ExitStatus(2)));
        assert_eq!(err.root_cause().to_string(), "cache unreadable");
    }

    #[test]
    fn test_library_host_overrides_remote() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let base = |library: Option<&str>, source: &str, no_https: bool| -> Result<Option<String>> {
            Ok(library_config(&ctx, library, source, no_https)?.map(|c| c.base_url))
        };

        let hosted = "library://cloud.example.com/entity/collection/image:1";
        assert_eq!(base(None, hosted, false)?.as_deref(), Some("https://cloud.example.com"));
        assert_eq!(base(None, hosted, true)?.as_deref(), Some("http://cloud.example.com"));

        let plain = "library://entity/collection/image:1";
        assert_eq!(base(None, plain, false)?.as_deref(), Some("https://cloud.apptainer.org/"));
        assert_eq!(
            base(Some("https://lib.example"), plain, false)?.as_deref(),
            Some("https://lib.example")
        );

        let err = library_config(&ctx, Some("https://lib.example"), hosted, false).unwrap_err();
        assert!(err.to_string().starts_with("conflicting arguments"));
        Ok(())
    }
}
