//! `capability add|drop|list|avail`
use std::io::{self, Write};

use anyhow::Result;

use libapptainer::capability::{self, CapOp, CapabilityFile, ManageRequest, SystemAccounts};
use libapptainer::context::LaunchContext;
use libapptainer_cli::CapabilityTarget;

fn manage(target: CapabilityTarget, ctx: &LaunchContext, op: CapOp) -> Result<()> {
    let req = ManageRequest {
        caps: target.caps,
        user: target.user,
        group: target.group,
    };
    capability::manage(&ctx.install.capability_file(), &req, op, ctx.uid, &SystemAccounts)?;
    Ok(())
}

pub fn add(target: CapabilityTarget, ctx: &LaunchContext) -> Result<()> {
    manage(target, ctx, CapOp::Add)
}

pub fn drop(target: CapabilityTarget, ctx: &LaunchContext) -> Result<()> {
    manage(target, ctx, CapOp::Drop)
}

fn render_list<W: Write>(mut out: W, file: &CapabilityFile, name: Option<&str>) -> Result<()> {
    let wanted = |n: &str| name.map_or(true, |want| want == n);
    for (user, caps) in file.users.iter().filter(|(u, _)| wanted(u)) {
        writeln!(out, "{user} [user]: {}", caps.join(","))?;
    }
    for (group, caps) in file.groups.iter().filter(|(g, _)| wanted(g)) {
        writeln!(out, "{group} [group]: {}", caps.join(","))?;
    }
    Ok(())
}

pub fn list(name: Option<&str>, ctx: &LaunchContext) -> Result<()> {
    let file = CapabilityFile::load(&ctx.install.capability_file())?;
    render_list(io::stdout().lock(), &file, name)
}

pub fn avail(caps: Option<&str>) -> Result<()> {
    let mut out = io::stdout().lock();
    for (name, description) in capability::avail(caps.unwrap_or_default())? {
        writeln!(out, "{name}: {description}\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::commands::test_context;

    #[test]
    fn test_render_list() -> Result<()> {
        let file = CapabilityFile {
            users: BTreeMap::from([("alice".to_string(), vec!["CAP_CHOWN".to_string(), "CAP_NET_RAW".to_string()])]),
            groups: BTreeMap::from([("wheel".to_string(), vec!["CAP_SYS_ADMIN".to_string()])]),
        };
        let mut out = Vec::new();
        render_list(&mut out, &file, None)?;
        assert_eq!(
            String::from_utf8(out)?,
            "alice [user]: CAP_CHOWN,CAP_NET_RAW\nwheel [group]: CAP_SYS_ADMIN\n"
        );

        let mut out = Vec::new();
        render_list(&mut out, &file, Some("wheel"))?;
        assert_eq!(String::from_utf8(out)?, "wheel [group]: CAP_SYS_ADMIN\n");
        Ok(())
    }

    #[test]
    fn test_mutation_needs_root() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let target = CapabilityTarget {
            user: Some("alice".to_string()),
            group: None,
            caps: "CAP_CHOWN".to_string(),
        };
        assert!(add(target, &ctx).is_err());
        assert!(!ctx.install.capability_file().exists());
        Ok(())
    }
}
