//! `remote`, `keyserver` and `registry`: endpoints and stored credentials.
use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tabwriter::TabWriter;

use libapptainer::context::LaunchContext;
use libapptainer::crypt::ask_no_echo;
use libapptainer::remote::credentials::{registry_name, DockerConfig};
use libapptainer::remote::endpoint::{local_status, EndPoint, EndpointCache, LocalStatus};
use libapptainer::remote::{load_user_view, RemoteConfig};
use libapptainer_cli::{
    Keyserver, KeyserverCmd, Login, Registry, RegistryCmd, Remote, RemoteAdd, RemoteCmd, RemoteFile,
    RemoteUse,
};

use super::{check_config_privilege, credentials, with_status};

/// Remote configuration a command reads or edits.
struct Target {
    path: PathBuf,
    config: RemoteConfig,
}

impl Target {
    /// `--config` wins, then the global file with `--global`, then the
    /// user file merged with the global remotes.
    fn open(ctx: &LaunchContext, file: &RemoteFile, global: bool, what: &str) -> Result<Self> {
        if let Some(path) = &file.config {
            let config = RemoteConfig::load(path, global)?;
            return Ok(Self {
                path: path.clone(),
                config,
            });
        }
        if global {
            check_config_privilege(ctx, what)?;
            let path = ctx.install.global_remote_config();
            let mut config = RemoteConfig::load(&path, true)?;
            if config.remotes.is_empty() {
                let builtin = RemoteConfig::builtin();
                config.active = builtin.active;
                config.remotes = builtin.remotes;
            }
            return Ok(Self { path, config });
        }
        let path = ctx.user_dirs.remote_config();
        let config = load_user_view(&path, &ctx.install.global_remote_config())?;
        Ok(Self { path, config })
    }

    fn save(&self) -> Result<()> {
        self.config.save(&self.path)?;
        tracing::debug!(path = ?self.path, "remote configuration saved");
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "YES"
    } else {
        "NO"
    }
}

fn render_remotes<W: Write>(out: W, config: &RemoteConfig) -> Result<()> {
    let mut content = String::new();
    for (name, ep) in &config.remotes {
        let _ = writeln!(
            content,
            "{}\t{}\t{}\t{}\t{}\t{}",
            name,
            ep.uri,
            yes_no(config.active == *name),
            yes_no(ep.system),
            yes_no(ep.exclusive),
            yes_no(ep.insecure)
        );
    }

    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "NAME\tURI\tDEFAULT?\tGLOBAL?\tEXCLUSIVE?\tINSECURE?")?;
    write!(&mut tab_writer, "{content}")?;
    if !config.credentials.is_empty() {
        writeln!(&mut tab_writer, "\nAUTHENTICATED LOGINS\tINSECURE?")?;
        for credential in &config.credentials {
            writeln!(&mut tab_writer, "{}\t{}", credential.uri, yes_no(credential.insecure))?;
        }
    }
    tab_writer.flush()?;
    Ok(())
}

fn render_status<W: Write>(out: W, status: &LocalStatus) -> Result<()> {
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "NAME\t{}", status.name)?;
    writeln!(&mut tab_writer, "URL\t{}", status.url.as_deref().unwrap_or("-"))?;
    writeln!(&mut tab_writer, "LOGGED IN\t{}", yes_no(status.logged_in))?;
    writeln!(&mut tab_writer, "CONFIG CACHED\t{}", yes_no(status.cached))?;
    for keyserver in &status.keyservers {
        writeln!(&mut tab_writer, "KEYSERVER\t{keyserver}")?;
    }
    tab_writer.flush()?;
    Ok(())
}

fn add(ctx: &LaunchContext, file: &RemoteFile, args: RemoteAdd) -> Result<()> {
    let mut target = Target::open(ctx, file, args.global, "remote add --global")?;
    let ep = EndPoint {
        system: args.global,
        insecure: args.insecure,
        ..EndPoint::new(args.uri.trim_end_matches('/'))
    };
    target.config.add(&args.name, ep)?;
    if !args.no_default {
        target.config.set_default(&args.name, false)?;
    }
    target.save()?;
    tracing::info!("Remote {:?} added.", args.name);
    Ok(())
}

fn use_remote(ctx: &LaunchContext, file: &RemoteFile, args: RemoteUse) -> Result<()> {
    if args.exclusive && !args.global {
        bail!("--exclusive requires --global");
    }
    let mut target = Target::open(ctx, file, args.global, "remote use --global")?;
    target.config.set_default(&args.name, args.exclusive)?;
    target.save()?;
    tracing::info!("Remote {:?} now in use.", args.name);
    Ok(())
}

/// Token of a library endpoint: `--password`, standard input, or a prompt.
fn read_token(login: &Login) -> Result<String> {
    if let Some(token) = &login.password {
        return Ok(token.clone());
    }
    if login.password_stdin {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        return Ok(line.trim().to_string());
    }
    Ok(ask_no_echo("Access Token: ")?)
}

fn is_registry_uri(uri: &str) -> bool {
    matches!(uri.split_once("://"), Some(("docker" | "oras", _)))
}

/// Logs into a remote by name, an OCI registry, or a keyserver.
fn login(ctx: &LaunchContext, file: &RemoteFile, args: Login) -> Result<()> {
    let mut target = Target::open(ctx, file, false, "remote login")?;
    let name = match &args.uri {
        Some(uri) => uri.clone(),
        None => target.config.default_remote()?.0.to_string(),
    };

    if target.config.remotes.contains_key(&name) {
        let token = read_token(&args)?;
        if token.is_empty() {
            bail!("an access token is required to log into {name}");
        }
        if let Some(ep) = target.config.remotes.get_mut(&name) {
            ep.token = token;
        }
        target.save()?;
    } else if is_registry_uri(&name) {
        let path = ctx.user_dirs.docker_config();
        let mut docker = DockerConfig::load(&path, None)?;
        let (username, password) = credentials(args.username, args.password, args.password_stdin)?;
        docker.login(&registry_name(&name), &username, &password)?;
        docker.save(&path)?;
    } else {
        let (username, password) = credentials(args.username, args.password, args.password_stdin)?;
        target.config.login(&name, &username, &password, args.insecure)?;
        target.save()?;
    }
    tracing::info!("Login succeeded");
    Ok(())
}

fn logout(ctx: &LaunchContext, file: &RemoteFile, uri: Option<String>) -> Result<()> {
    let mut target = Target::open(ctx, file, false, "remote logout")?;
    let name = match uri {
        Some(uri) => uri,
        None => target.config.default_remote()?.0.to_string(),
    };

    if let Some(ep) = target.config.remotes.get_mut(&name) {
        ep.token.clear();
        target.save()?;
    } else if is_registry_uri(&name) {
        let path = ctx.user_dirs.docker_config();
        let mut docker = DockerConfig::load(&path, None)?;
        docker.logout(&registry_name(&name))?;
        docker.save(&path)?;
    } else {
        target.config.logout(&name)?;
        target.save()?;
    }
    tracing::info!("Logout succeeded");
    Ok(())
}

pub fn remote(args: Remote, ctx: &LaunchContext) -> Result<()> {
    let file = &args.file;
    match args.cmd {
        RemoteCmd::Add(add_args) => add(ctx, file, add_args),
        RemoteCmd::Remove { global, name } => {
            let mut target = Target::open(ctx, file, global, "remote remove --global")?;
            target.config.remove(&name)?;
            target.save()?;
            tracing::info!("Remote {name:?} removed.");
            Ok(())
        }
        RemoteCmd::Use(use_args) => use_remote(ctx, file, use_args),
        RemoteCmd::List => {
            let target = Target::open(ctx, file, false, "remote list")?;
            render_remotes(io::stdout(), &target.config)
        }
        RemoteCmd::Rename {
            global,
            name,
            new_name,
        } => {
            let mut target = Target::open(ctx, file, global, "remote rename --global")?;
            target.config.rename(&name, &new_name)?;
            target.save()?;
            tracing::info!("Remote {name:?} renamed to {new_name:?}.");
            Ok(())
        }
        RemoteCmd::Status { name } => {
            let target = Target::open(ctx, file, false, "remote status")?;
            let name = match name {
                Some(name) => name,
                None => target.config.default_remote()?.0.to_string(),
            };
            let ep = target.config.get(&name)?;
            let cache = EndpointCache::new(&ctx.user_dirs.remote_cache_dir());
            render_status(io::stdout(), &local_status(&name, ep, &cache))
        }
        RemoteCmd::Login(login_args) => login(ctx, file, login_args)
            .map_err(|err| with_status(2, err.context("could not log in"))),
        RemoteCmd::Logout { uri } => logout(ctx, file, uri),
    }
}

fn render_keyservers<W: Write>(out: W, config: &RemoteConfig, only: Option<&str>) -> Result<()> {
    let mut content = String::new();
    for (name, ep) in &config.remotes {
        if only.is_some_and(|only| only != name.as_str()) {
            continue;
        }
        let active = if config.active == *name { " *" } else { "" };
        for (order, keyserver) in ep.keyservers.iter().filter(|k| !k.skip).enumerate() {
            let _ = writeln!(
                content,
                "{}{}\t#{}\t{}\t{}",
                name,
                active,
                order + 1,
                keyserver.uri,
                yes_no(keyserver.insecure)
            );
        }
    }

    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "REMOTE\tORDER\tKEYSERVER\tINSECURE?")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    Ok(())
}

pub fn keyserver(args: Keyserver, ctx: &LaunchContext) -> Result<()> {
    let file = &args.file;
    match args.cmd {
        KeyserverCmd::Add {
            order,
            insecure,
            remote,
            uri,
        } => {
            let mut target = Target::open(ctx, file, true, "keyserver add")?;
            let remote = match remote {
                Some(remote) => remote,
                None => target.config.default_remote()?.0.to_string(),
            };
            target.config.add_keyserver(&remote, &uri, order, insecure)?;
            target.save()?;
            tracing::info!("Keyserver {uri} added to remote {remote:?}.");
            Ok(())
        }
        KeyserverCmd::Remove { remote, uri } => {
            let mut target = Target::open(ctx, file, true, "keyserver remove")?;
            let remote = match remote {
                Some(remote) => remote,
                None => target.config.default_remote()?.0.to_string(),
            };
            target.config.remove_keyserver(&remote, &uri)?;
            target.save()?;
            tracing::info!("Keyserver {uri} removed from remote {remote:?}.");
            Ok(())
        }
        KeyserverCmd::List { remote } => {
            let target = Target::open(ctx, file, false, "keyserver list")?;
            render_keyservers(io::stdout(), &target.config, remote.as_deref())
        }
        KeyserverCmd::Login(login_args) => {
            let Some(uri) = login_args.uri.clone() else {
                bail!("a keyserver URI is required");
            };
            let result = (|| -> Result<()> {
                let mut target = Target::open(ctx, file, false, "keyserver login")?;
                let (username, password) =
                    credentials(login_args.username, login_args.password, login_args.password_stdin)?;
                target.config.login(&uri, &username, &password, login_args.insecure)?;
                target.save()
            })();
            result.map_err(|err| with_status(2, err.context(format!("could not log into {uri}"))))
        }
        KeyserverCmd::Logout { uri } => {
            let mut target = Target::open(ctx, file, false, "keyserver logout")?;
            target.config.logout(&uri)?;
            target.save()
        }
    }
}

pub fn registry(args: Registry, ctx: &LaunchContext) -> Result<()> {
    let path = args
        .authfile
        .clone()
        .unwrap_or_else(|| ctx.user_dirs.docker_config());
    match args.cmd {
        RegistryCmd::Login(login_args) => {
            let Some(uri) = login_args.uri.clone() else {
                bail!("a registry URI is required");
            };
            let result = (|| -> Result<()> {
                let mut docker = DockerConfig::load(&path, None)?;
                let (username, password) =
                    credentials(login_args.username, login_args.password, login_args.password_stdin)?;
                docker.login(&registry_name(&uri), &username, &password)?;
                docker.save(&path)
                    .with_context(|| format!("could not store credentials in {}", path.display()))
            })();
            result.map_err(|err| with_status(2, err.context(format!("could not log into {uri}"))))?;
            tracing::info!("Token stored in {}", path.display());
            Ok(())
        }
        RegistryCmd::Logout { uri } => {
            let Some(uri) = uri else {
                bail!("a registry URI is required");
            };
            let mut docker = DockerConfig::load(&path, None)?;
            docker.logout(&registry_name(&uri))?;
            docker.save(&path)?;
            tracing::info!("Logout succeeded");
            Ok(())
        }
        RegistryCmd::List => {
            let docker = DockerConfig::load(&path, Some(&ctx.user_dirs.legacy_docker_config()))?;
            let mut tab_writer = TabWriter::new(io::stdout());
            writeln!(&mut tab_writer, "REGISTRY")?;
            for registry in docker.registries() {
                writeln!(&mut tab_writer, "{registry}")?;
            }
            tab_writer.flush()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{test_context, ExitStatus};

    fn file(path: &std::path::Path) -> RemoteFile {
        RemoteFile {
            config: Some(path.to_path_buf()),
        }
    }

    fn remote_cmd(path: &std::path::Path, cmd: RemoteCmd) -> Remote {
        Remote {
            file: file(path),
            cmd,
        }
    }

    #[test]
    fn test_add_use_rename_remove() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let path = tmp.path().join("remote.yaml");
        let add_cmd = |name: &str, no_default| {
            RemoteCmd::Add(RemoteAdd {
                global: false,
                insecure: false,
                no_default,
                name: name.to_string(),
                uri: "cloud.example.org/".to_string(),
            })
        };

        remote(remote_cmd(&path, add_cmd("site", false)), &ctx)?;
        remote(remote_cmd(&path, add_cmd("mirror", true)), &ctx)?;
        let config = RemoteConfig::load(&path, false)?;
        assert_eq!(config.active, "site");
        assert_eq!(config.get("mirror")?.uri, "cloud.example.org");

        let use_cmd = RemoteCmd::Use(RemoteUse {
            global: false,
            exclusive: false,
            name: "mirror".to_string(),
        });
        remote(remote_cmd(&path, use_cmd), &ctx)?;
        let rename = RemoteCmd::Rename {
            global: false,
            name: "mirror".to_string(),
            new_name: "backup".to_string(),
        };
        remote(remote_cmd(&path, rename), &ctx)?;
        let config = RemoteConfig::load(&path, false)?;
        assert_eq!(config.active, "backup");

        let remove = RemoteCmd::Remove {
            global: false,
            name: "site".to_string(),
        };
        remote(remote_cmd(&path, remove), &ctx)?;
        assert!(RemoteConfig::load(&path, false)?.get("site").is_err());
        Ok(())
    }

    #[test]
    fn test_exclusive_needs_global() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let args = RemoteUse {
            global: false,
            exclusive: true,
            name: "site".to_string(),
        };
        let err = use_remote(&ctx, &RemoteFile { config: None }, args).unwrap_err();
        assert_eq!(err.to_string(), "--exclusive requires --global");

        let global = RemoteUse {
            global: true,
            exclusive: true,
            name: "DefaultRemote".to_string(),
        };
        let err = use_remote(&ctx, &RemoteFile { config: None }, global).unwrap_err();
        assert_eq!(err.to_string(), "remote use --global requires root privileges");
        Ok(())
    }

    #[test]
    fn test_render_remotes() -> Result<()> {
        let mut config = RemoteConfig::builtin();
        config.add("site", EndPoint::new("cloud.example.org"))?;
        let mut out = Vec::new();
        render_remotes(&mut out, &config)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].starts_with("DefaultRemote") && lines[1].contains("YES"));
        assert!(lines[2].starts_with("site") && lines[2].contains("cloud.example.org"));
        Ok(())
    }

    #[test]
    fn test_keyservers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 0)?;
        let path = tmp.path().join("remote.yaml");
        RemoteConfig::builtin().save(&path)?;
        let add = Keyserver {
            file: file(&path),
            cmd: KeyserverCmd::Add {
                order: 1,
                insecure: false,
                remote: None,
                uri: "https://keys.example.org".to_string(),
            },
        };
        keyserver(add, &ctx)?;

        let config = RemoteConfig::load(&path, false)?;
        let mut out = Vec::new();
        render_keyservers(&mut out, &config, None)?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("DefaultRemote *"));
        assert!(text.contains("#1") && text.contains("https://keys.example.org"));
        Ok(())
    }

    #[test]
    fn test_registry_login_logout() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let authfile = tmp.path().join("auth.json");
        let login_cmd = |password: &str| Registry {
            authfile: Some(authfile.clone()),
            cmd: RegistryCmd::Login(Login {
                username: Some("alice".to_string()),
                password: Some(password.to_string()),
                password_stdin: false,
                insecure: false,
                uri: Some("docker://registry.example.org".to_string()),
            }),
        };

        registry(login_cmd("secret"), &ctx)?;
        let docker = DockerConfig::load(&authfile, None)?;
        assert_eq!(docker.registries(), vec!["registry.example.org"]);

        let err = registry(login_cmd(""), &ctx).unwrap_err();
        assert_eq!(err.downcast_ref::<ExitStatus>(), Some(&ExitStatus(2)));

        let logout = Registry {
            authfile: Some(authfile.clone()),
            cmd: RegistryCmd::Logout {
                uri: Some("docker://registry.example.org".to_string()),
            },
        };
        registry(logout, &ctx)?;
        assert!(DockerConfig::load(&authfile, None)?.registries().is_empty());
        Ok(())
    }
}
