//! `config global` and `config fakeroot`: edits of the system files.
use std::path::Path;

use anyhow::{bail, Context, Result};

use libapptainer::admin_config::AdminConfigFile;
use libapptainer::context::LaunchContext;
use libapptainer::fakeroot::subid::{SubidFile, SubidUser, SUBGID_FILE, SUBUID_FILE};
use libapptainer_cli::{ConfigFakeroot, ConfigGlobal};

use super::check_config_privilege;

/// Applies one `config global` operation. Returns what is printed.
fn edit_global(file: &mut AdminConfigFile, args: &ConfigGlobal) -> Result<Option<String>> {
    if args.get {
        return Ok(Some(file.get(&args.key)?));
    }
    if args.set {
        let value = args
            .value
            .as_deref()
            .with_context(|| format!("a value is required to set {:?}", args.key))?;
        file.set(&args.key, value)?;
    } else if args.unset {
        file.unset(&args.key, args.value.as_deref())?;
    } else if args.reset {
        file.reset(&args.key)?;
    }
    Ok(None)
}

pub fn global(args: ConfigGlobal, ctx: &LaunchContext) -> Result<()> {
    let path = ctx.install.admin_config();
    if !args.get && !args.dry_run {
        check_config_privilege(ctx, "config global")?;
    }
    let mut file = AdminConfigFile::load(&path)?;
    if let Some(value) = edit_global(&mut file, &args)? {
        println!("{value}");
        return Ok(());
    }
    // the typed view rejects out of range values before anything is written
    file.typed()?;
    if args.dry_run {
        print!("{}", file.render());
        return Ok(());
    }
    file.save(&path)?;
    tracing::debug!(?path, key = %args.key, "configuration updated");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubidOp {
    Add,
    Remove,
    Enable,
    Disable,
}

impl From<&ConfigFakeroot> for SubidOp {
    fn from(args: &ConfigFakeroot) -> Self {
        if args.add {
            SubidOp::Add
        } else if args.remove {
            SubidOp::Remove
        } else if args.enable {
            SubidOp::Enable
        } else {
            SubidOp::Disable
        }
    }
}

fn edit_subid(path: &Path, user: &SubidUser, op: SubidOp) -> Result<()> {
    let mut file = SubidFile::load(path)?;
    match op {
        SubidOp::Add => file.add_user(user)?,
        SubidOp::Remove => file.remove_user(user)?,
        SubidOp::Enable => file.enable_user(user)?,
        SubidOp::Disable => file.disable_user(user)?,
    }
    file.save()?;
    tracing::debug!(?path, user = %user.name, ?op, "mapping updated");
    Ok(())
}

pub fn fakeroot(args: ConfigFakeroot, ctx: &LaunchContext) -> Result<()> {
    if ctx.uid != 0 {
        bail!("config fakeroot requires root privileges");
    }
    let account = nix::unistd::User::from_name(&args.user)
        .with_context(|| format!("could not look up user {}", args.user))?
        .with_context(|| format!("user {} does not exist", args.user))?;
    let user = SubidUser {
        name: account.name,
        uid: account.uid.as_raw(),
    };
    let op = SubidOp::from(&args);
    for path in [SUBUID_FILE, SUBGID_FILE] {
        edit_subid(Path::new(path), &user, op)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_args(op: &str, key: &str, value: Option<&str>) -> ConfigGlobal {
        ConfigGlobal {
            set: op == "set",
            unset: op == "unset",
            get: op == "get",
            reset: op == "reset",
            dry_run: false,
            key: key.to_string(),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn test_edit_global() -> Result<()> {
        let mut file = AdminConfigFile::parse("# site config\nallow setuid = yes\n");
        assert_eq!(edit_global(&mut file, &global_args("get", "allow setuid", None))?, Some("yes".to_string()));

        edit_global(&mut file, &global_args("set", "allow setuid", Some("no")))?;
        assert_eq!(file.get("allow setuid")?, "no");
        assert!(file.render().starts_with("# site config\n"));

        edit_global(&mut file, &global_args("reset", "allow setuid", None))?;
        assert_eq!(file.get("allow setuid")?, "yes");

        assert!(edit_global(&mut file, &global_args("set", "allow setuid", None)).is_err());
        Ok(())
    }

    #[test]
    fn test_global_needs_root_on_suid_install() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = crate::commands::test_context(tmp.path(), 1000)?;
        let err = global(global_args("set", "allow setuid", Some("no")), &ctx).unwrap_err();
        assert_eq!(err.to_string(), "config global requires root privileges");

        let root = crate::commands::test_context(tmp.path(), 0)?;
        global(global_args("set", "allow setuid", Some("no")), &root)?;
        let saved = AdminConfigFile::load(&root.install.admin_config())?;
        assert_eq!(saved.get("allow setuid")?, "no");
        Ok(())
    }

    #[test]
    fn test_edit_subid() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("subuid");
        std::fs::write(&path, "bob:100000:65536\n")?;
        let alice = SubidUser {
            name: "alice".to_string(),
            uid: 1000,
        };
        edit_subid(&path, &alice, SubidOp::Add)?;
        assert_eq!(std::fs::read_to_string(&path)?, "bob:100000:65536\nalice:165536:65536\n");
        edit_subid(&path, &alice, SubidOp::Disable)?;
        assert!(std::fs::read_to_string(&path)?.contains("!alice:165536:65536"));
        Ok(())
    }
}
