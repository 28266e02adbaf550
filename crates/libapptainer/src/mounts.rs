//! Mount planning: `--no-mount` handling, FUSE mounts and the collected
//! mount section of the engine config.

use std::path::Path;

use crate::bind::{self, BindError, BindPath};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("while parsing bind path")]
    Bind(#[from] BindError),
    #[error("while parsing mount {spec:?}")]
    Mount {
        spec: String,
        #[source]
        source: BindError,
    },
    #[error("invalid FUSE mount {0:?}, expected <type>:<command> <mountpoint>")]
    Fuse(String),
    #[error("FUSE mounts are disabled by the system administrator")]
    FuseDisabled,
}

type Result<T> = std::result::Result<T, MountError>;

/// Default mounts that `--no-mount` can disable.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NoMount {
    pub proc: bool,
    pub sys: bool,
    pub dev: bool,
    pub devpts: bool,
    pub home: bool,
    pub tmp: bool,
    pub hostfs: bool,
    pub cwd: bool,
    /// Admin `bind path` entries to skip, `*` for all of them.
    pub skip_binds: Vec<String>,
}

impl NoMount {
    /// Whether the admin bind `path` is skipped.
    pub fn skips(&self, path: &str) -> bool {
        self.skip_binds.iter().any(|s| s == "*" || s == path)
    }
}

/// Interprets `--no-mount` values. Unknown values are warned about and
/// ignored.
pub fn parse_no_mount<S: AsRef<str>>(values: &[S]) -> NoMount {
    let mut no = NoMount::default();
    for v in values
        .iter()
        .flat_map(|v| v.as_ref().split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        match v {
            "proc" => no.proc = true,
            "sys" => no.sys = true,
            "dev" => no.dev = true,
            "devpts" => no.devpts = true,
            "home" => no.home = true,
            "tmp" => no.tmp = true,
            "hostfs" => no.hostfs = true,
            "cwd" => no.cwd = true,
            "bind-paths" | "*" => no.skip_binds.push("*".to_string()),
            abs if Path::new(abs).is_absolute() => no.skip_binds.push(abs.to_string()),
            other => tracing::warn!("Ignoring unknown mount type '{other}'"),
        }
    }
    no
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FuseKind {
    Container,
    Host,
    ContainerDaemon,
    HostDaemon,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FuseMount {
    pub kind: FuseKind,
    pub program: Vec<String>,
    pub mount_point: String,
}

/// Parses `--fusemount` values of the form `container:sshfs host: /mnt`.
pub fn parse_fuse_mount(spec: &str) -> Result<FuseMount> {
    let err = || MountError::Fuse(spec.to_string());
    let (kind, rest) = spec.split_once(':').ok_or_else(err)?;
    let kind = match kind {
        "container" => FuseKind::Container,
        "host" => FuseKind::Host,
        "container-daemon" => FuseKind::ContainerDaemon,
        "host-daemon" => FuseKind::HostDaemon,
        _ => return Err(err()),
    };
    let mut words: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
    if words.len() < 2 {
        return Err(err());
    }
    let mount_point = words.pop().ok_or_else(err)?;
    if !mount_point.starts_with('/') {
        return Err(err());
    }
    Ok(FuseMount {
        kind,
        program: words,
        mount_point,
    })
}

/// Mount section of the engine config.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MountPlan {
    pub binds: Vec<BindPath>,
    pub fuse_mounts: Vec<FuseMount>,
    pub overlays: Vec<String>,
    pub writable: bool,
    pub writable_tmpfs: bool,
    pub scratch: Vec<String>,
    pub workdir: Option<String>,
    pub contain_libs: Vec<String>,
    pub no_mount: NoMount,
    pub no_home: bool,
    pub custom_home: bool,
    pub home_source: String,
    pub home_dest: String,
}

impl MountPlan {
    /// Collects binds from `--bind`, `--mount` and the fakeroot binds. The
    /// `--mount` binds are not exported to nested runs but the others are.
    pub fn set_binds<S: AsRef<str>>(
        &mut self,
        bind_paths: &[S],
        mounts: &[S],
        fake_binds: &[String],
    ) -> Result<()> {
        let mut binds = bind::parse_bind_paths(bind_paths)?;
        for m in mounts {
            let parsed = bind::parse_mount_string(m.as_ref()).map_err(|source| MountError::Mount {
                spec: m.as_ref().to_string(),
                source,
            })?;
            binds.extend(parsed);
        }
        binds.extend(bind::parse_bind_paths(fake_binds)?);
        self.binds = binds;
        Ok(())
    }

    pub fn set_fuse_mounts<S: AsRef<str>>(&mut self, specs: &[S], enabled: bool) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        if !enabled {
            return Err(MountError::FuseDisabled);
        }
        self.fuse_mounts = specs
            .iter()
            .map(|s| parse_fuse_mount(s.as_ref()))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// `--writable` and `--writable-tmpfs` are exclusive, `--writable` wins.
    pub fn set_writable(&mut self, writable: bool, writable_tmpfs: bool) {
        self.writable = writable;
        if writable && writable_tmpfs {
            tracing::warn!("Disabling --writable-tmpfs flag, mutually exclusive with --writable");
            self.writable_tmpfs = false;
        } else {
            self.writable_tmpfs = writable_tmpfs;
        }
    }

    /// Admin binds that survive `--no-mount`.
    pub fn admin_binds<'a>(&self, admin: &'a [String]) -> Vec<&'a str> {
        admin
            .iter()
            .map(String::as_str)
            .filter(|b| {
                let src = b.split(':').next().unwrap_or(b);
                !self.no_mount.skips(src)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_no_mount() {
        let no = parse_no_mount(&["proc,home", "bogus", "/etc/localtime", "cwd"]);
        assert!(no.proc && no.home && no.cwd);
        assert!(!no.sys);
        assert_eq!(no.skip_binds, vec!["/etc/localtime"]);
        assert!(no.skips("/etc/localtime"));
        assert!(!no.skips("/etc/hosts"));

        let all = parse_no_mount(&["bind-paths"]);
        assert!(all.skips("/anything"));
    }

    #[test]
    fn test_admin_binds_filtered() {
        let plan = MountPlan {
            no_mount: parse_no_mount(&["/etc/hosts"]),
            ..Default::default()
        };
        let admin = vec!["/etc/hosts".to_string(), "/etc/localtime:/etc/localtime".to_string()];
        assert_eq!(plan.admin_binds(&admin), vec!["/etc/localtime:/etc/localtime"]);
    }

    #[test]
    fn test_fuse_mount() -> Result<()> {
        let m = parse_fuse_mount("container:sshfs server: /mnt")?;
        assert_eq!(m.kind, FuseKind::Container);
        assert_eq!(m.program, vec!["sshfs", "server:"]);
        assert_eq!(m.mount_point, "/mnt");
        assert!(parse_fuse_mount("nowhere:sshfs /mnt").is_err());
        assert!(parse_fuse_mount("host:/mnt").is_err());

        let mut plan = MountPlan::default();
        assert!(matches!(
            plan.set_fuse_mounts(&["host:cmd /m"], false),
            Err(MountError::FuseDisabled)
        ));
        plan.set_fuse_mounts(&["host:cmd /m"], true)?;
        assert_eq!(plan.fuse_mounts.len(), 1);
        Ok(())
    }

    #[test]
    fn test_writable_wins() {
        let mut plan = MountPlan::default();
        plan.set_writable(true, true);
        assert!(plan.writable && !plan.writable_tmpfs);
        plan.set_writable(false, true);
        assert!(plan.writable_tmpfs);
    }

    #[test]
    fn test_set_binds() -> Result<()> {
        let mut plan = MountPlan::default();
        plan.set_binds(
            &["/a:/b"],
            &["type=bind,src=/c,dst=/d"],
            &["/usr/bin/fakeroot:/.singularity.d/libs/fakeroot".to_string()],
        )?;
        let dsts: Vec<_> = plan.binds.iter().map(|b| b.destination.as_str()).collect();
        assert_eq!(dsts, vec!["/b", "/d", "/.singularity.d/libs/fakeroot"]);
        Ok(())
    }
}
