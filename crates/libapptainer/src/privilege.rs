//! Privilege planning: which starter flavour runs the container and under
//! which user namespace arrangement.
//!
//! Planning is pure over [`HostFacts`]; the only side effect is the
//! root-mapped re-execution, which goes through a [`RootMappedExecutor`]
//! and surfaces as [`PlanOutcome::ExitWithStatus`].

use std::ffi::OsString;
use std::path::PathBuf;

use caps::{CapSet, Capability};

use crate::fakeroot::subid::{SubidFile, SubidUser, SUBUID_FILE};
use crate::fakeroot::{FakerootLocator, RootMappedExecutor, FAKEFAKEROOT_ENV};

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("{0} requires root privileges")]
    RequiresRoot(String),
    #[error("--fakeroot requires either being in {SUBUID_FILE}, unprivileged user namespaces, or the fakeroot command")]
    FakerootUnavailable,
    #[error("--fakeroot used without sandbox image or user namespaces")]
    FakerootNeedsSandbox,
    #[error("hidepid option set on /proc mount, require 'hidepid=0' to start instance with setuid workflow")]
    Hidepid,
    #[error("could not get process effective capabilities")]
    Capabilities(#[from] caps::errors::CapsError),
}

type Result<T> = std::result::Result<T, PrivilegeError>;

/// How the container is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeMode {
    /// Through the setuid starter.
    SetuidHelper,
    /// Unprivileged starter inside a user namespace.
    UserNs,
    /// Already root of a namespace mapping only the caller.
    RootMappedUserNs,
    /// No user namespace, `fakeroot` preloaded into a sandbox.
    FakerootCmd,
    /// `fakeroot` preloaded inside a root-mapped namespace.
    FakerootCmdUnderUserNs,
    /// Real root, no setuid helper required.
    NativeRoot,
}

/// Observations about the host the plan is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub inside_userns: bool,
    pub suid_install: bool,
    /// `allow setuid` from the admin config.
    pub allow_setuid: bool,
    pub cap_sys_admin: bool,
    /// Whether the user has an enabled `/etc/subuid` entry.
    pub subuid_mapped: bool,
}

impl HostFacts {
    /// Probes the running process.
    pub fn probe(suid_install: bool, allow_setuid: bool) -> Result<Self> {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let username = crate::utils::get_username(uid);
        let cap_sys_admin = caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)?;
        let subuid_mapped = match SubidFile::load(std::path::Path::new(SUBUID_FILE)) {
            Ok(file) => file.has_mapping(&SubidUser {
                name: username.clone(),
                uid,
            }),
            Err(err) => {
                tracing::debug!(?err, "could not read {SUBUID_FILE}");
                false
            }
        };
        Ok(Self {
            uid,
            gid,
            username,
            inside_userns: crate::utils::is_in_new_userns(),
            suid_install,
            allow_setuid,
            cap_sys_admin,
            subuid_mapped,
        })
    }
}

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeRequest {
    pub fakeroot: bool,
    pub userns: bool,
    pub ignore_subuid: bool,
    pub ignore_fakeroot_command: bool,
    pub ignore_userns: bool,
    /// The image (or build source) is a sandbox directory.
    pub sandbox_source: bool,
    /// A build re-executes with the fake fakeroot marker.
    pub build: bool,
    /// Command line used for a root-mapped re-execution.
    pub argv: Vec<OsString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegePlan {
    pub mode: PrivilegeMode,
    pub use_suid: bool,
    /// Request a user namespace from the starter.
    pub user_ns: bool,
    /// Fakeroot through `/etc/subuid` ranges.
    pub fakeroot: bool,
    /// `fakeroot` command to bind and preload, if any.
    pub fakeroot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Continue(PrivilegePlan),
    /// The work already ran in a re-executed child; exit with its status.
    ExitWithStatus(i32),
}

fn find_fake(req: &PrivilegeRequest, locator: &dyn FakerootLocator) -> Option<PathBuf> {
    if req.ignore_fakeroot_command {
        tracing::debug!("fakeroot command is ignored because of --ignore-fakeroot-command");
        return None;
    }
    locator.find_fake()
}

/// Selects the privilege mode. The first matching rule wins.
pub fn plan(
    req: &PrivilegeRequest,
    host: &HostFacts,
    locator: &dyn FakerootLocator,
    executor: &dyn RootMappedExecutor,
) -> Result<PlanOutcome> {
    if req.fakeroot && host.uid == 0 && host.inside_userns {
        tracing::debug!("running root-mapped unprivileged");
        let fakeroot_path = find_fake(req, locator);
        let mode = if fakeroot_path.is_some() {
            tracing::info!("Using fakeroot command combined with root-mapped namespace");
            PrivilegeMode::FakerootCmdUnderUserNs
        } else {
            tracing::info!("fakeroot command not found, using only root-mapped namespace");
            PrivilegeMode::RootMappedUserNs
        };
        return Ok(PlanOutcome::Continue(PrivilegePlan {
            mode,
            use_suid: false,
            user_ns: false,
            fakeroot: false,
            fakeroot_path,
        }));
    }

    if req.fakeroot && host.uid != 0 && (!host.subuid_mapped || req.ignore_subuid) {
        tracing::info!("User not listed in {SUBUID_FILE}, trying root-mapped namespace");
        if req.ignore_userns {
            tracing::debug!("could not start root-mapped namespace because --ignore-userns is set");
        } else {
            let env: Vec<(String, String)> = if req.build {
                vec![(FAKEFAKEROOT_ENV.to_string(), "1".to_string())]
            } else {
                Vec::new()
            };
            match executor.run(&req.argv, false, &env) {
                Ok(status) => return Ok(PlanOutcome::ExitWithStatus(status)),
                Err(err) => tracing::debug!(?err, "UnshareRootMapped failed"),
            }
        }

        let Some(fakeroot_path) = find_fake(req, locator) else {
            return Err(PrivilegeError::FakerootUnavailable);
        };
        if !req.sandbox_source {
            tracing::info!("No user namespaces available");
            tracing::info!("The fakeroot command by itself is only useful with sandbox images");
            tracing::info!(" which can be built with 'apptainer build --sandbox'");
            return Err(PrivilegeError::FakerootNeedsSandbox);
        }
        tracing::info!("No user namespaces available, using only the fakeroot command");
        return Ok(PlanOutcome::Continue(PrivilegePlan {
            mode: PrivilegeMode::FakerootCmd,
            use_suid: false,
            user_ns: false,
            fakeroot: false,
            fakeroot_path: Some(fakeroot_path),
        }));
    }

    let mut user_ns = req.userns;
    let mut use_suid = host.suid_install;
    if !host.suid_install && !user_ns && host.uid != 0 {
        tracing::info!("Unprivileged installation: using user namespace");
        user_ns = true;
    }
    if host.uid == 0 || host.inside_userns || user_ns || !host.allow_setuid {
        use_suid = false;
        if host.uid != 0 && host.suid_install && !host.allow_setuid {
            tracing::info!("'allow setuid' set to 'no' by configuration, fallback to user namespace");
            user_ns = true;
        } else if host.uid == 0 && !user_ns && !host.cap_sys_admin {
            tracing::info!("Effective capability CAP_SYS_ADMIN is missing, fallback to user namespace");
            user_ns = true;
        }
    }
    user_ns = user_ns && !req.ignore_userns;

    // subuid fakeroot always runs in a user namespace
    let fakeroot = req.fakeroot;
    if fakeroot {
        user_ns = !req.ignore_userns;
    }

    let mode = if use_suid {
        PrivilegeMode::SetuidHelper
    } else if host.uid == 0 && !user_ns && !host.inside_userns {
        PrivilegeMode::NativeRoot
    } else {
        PrivilegeMode::UserNs
    };
    Ok(PlanOutcome::Continue(PrivilegePlan {
        mode,
        use_suid,
        user_ns,
        fakeroot,
        fakeroot_path: None,
    }))
}

/// Runs `fn` when `cond` holds, refusing unless `uid` is root.
pub fn with_privilege<T, F>(uid: u32, cond: bool, desc: &str, f: F) -> Result<Option<T>>
where
    F: FnOnce() -> T,
{
    if !cond {
        return Ok(None);
    }
    if uid != 0 {
        return Err(PrivilegeError::RequiresRoot(desc.to_string()));
    }
    Ok(Some(f()))
}

/// Whether `/proc` is mounted with a `hidepid` option.
pub fn hidepid_proc() -> bool {
    let mounts = match procfs::process::Process::myself().and_then(|p| p.mountinfo()) {
        Ok(m) => m,
        Err(err) => {
            tracing::debug!(?err, "could not read mountinfo");
            return false;
        }
    };
    mounts
        .into_iter()
        .filter(|m| m.mount_point == std::path::Path::new("/proc"))
        .any(|m| m.super_options.keys().any(|k| k == "hidepid"))
}

/// Instances started through the setuid starter without a user namespace
/// need a readable `/proc`.
pub fn check_instance_hidepid(plan: &PrivilegePlan, hidepid: bool) -> Result<()> {
    if plan.use_suid && !plan.user_ns && hidepid {
        return Err(PrivilegeError::Hidepid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakeroot::FakerootError;
    use anyhow::{bail, Result};
    use std::cell::RefCell;

    struct Locator(Option<&'static str>);

    impl FakerootLocator for Locator {
        fn find_fake(&self) -> Option<PathBuf> {
            self.0.map(PathBuf::from)
        }
    }

    #[derive(Default)]
    struct Executor {
        status: Option<i32>,
        calls: RefCell<Vec<(Vec<OsString>, Vec<(String, String)>)>>,
    }

    impl RootMappedExecutor for Executor {
        fn run(
            &self,
            args: &[OsString],
            _mount_ns: bool,
            env: &[(String, String)],
        ) -> std::result::Result<i32, FakerootError> {
            self.calls.borrow_mut().push((args.to_vec(), env.to_vec()));
            self.status.ok_or_else(|| {
                FakerootError::Unshare(std::io::Error::from_raw_os_error(libc::EPERM))
            })
        }
    }

    fn user_host() -> HostFacts {
        HostFacts {
            uid: 1000,
            gid: 1000,
            username: "alice".into(),
            inside_userns: false,
            suid_install: false,
            allow_setuid: true,
            cap_sys_admin: false,
            subuid_mapped: false,
        }
    }

    fn root_host() -> HostFacts {
        HostFacts {
            uid: 0,
            gid: 0,
            username: "root".into(),
            cap_sys_admin: true,
            suid_install: true,
            ..user_host()
        }
    }

    fn continued(outcome: PlanOutcome) -> Result<PrivilegePlan> {
        match outcome {
            PlanOutcome::Continue(planned) => Ok(planned),
            other => bail!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_unprivileged_install_uses_userns() -> Result<()> {
        let planned = continued(plan(
            &PrivilegeRequest::default(),
            &user_host(),
            &Locator(None),
            &Executor::default(),
        )?)?;
        assert_eq!(planned.mode, PrivilegeMode::UserNs);
        assert!(planned.user_ns);
        assert!(!planned.use_suid);
        Ok(())
    }

    #[test]
    fn test_suid_install_uses_helper() -> Result<()> {
        let host = HostFacts {
            suid_install: true,
            ..user_host()
        };
        let planned = continued(plan(
            &PrivilegeRequest::default(),
            &host,
            &Locator(None),
            &Executor::default(),
        )?)?;
        assert_eq!(planned.mode, PrivilegeMode::SetuidHelper);
        assert!(planned.use_suid && !planned.user_ns);

        let no_setuid = HostFacts {
            allow_setuid: false,
            ..host.clone()
        };
        let planned = continued(plan_default(&no_setuid)?)?;
        assert_eq!(planned.mode, PrivilegeMode::UserNs);

        let requested = PrivilegeRequest {
            userns: true,
            ..Default::default()
        };
        let planned = continued(plan(&requested, &host, &Locator(None), &Executor::default())?)?;
        assert_eq!(planned.mode, PrivilegeMode::UserNs);
        Ok(())
    }

    fn plan_default(host: &HostFacts) -> std::result::Result<PlanOutcome, PrivilegeError> {
        plan(
            &PrivilegeRequest::default(),
            host,
            &Locator(None),
            &Executor::default(),
        )
    }

    #[test]
    fn test_root() -> Result<()> {
        let planned = continued(plan_default(&root_host())?)?;
        assert_eq!(planned.mode, PrivilegeMode::NativeRoot);
        assert!(!planned.use_suid);

        let no_cap = HostFacts {
            cap_sys_admin: false,
            ..root_host()
        };
        let planned = continued(plan_default(&no_cap)?)?;
        assert_eq!(planned.mode, PrivilegeMode::UserNs);
        assert!(planned.user_ns);
        Ok(())
    }

    #[test]
    fn test_fakeroot_reexec_propagates_status() -> Result<()> {
        let executor = Executor {
            status: Some(3),
            ..Default::default()
        };
        let req = PrivilegeRequest {
            fakeroot: true,
            build: true,
            argv: vec!["apptainer".into(), "build".into()],
            ..Default::default()
        };
        let outcome = plan(&req, &user_host(), &Locator(None), &executor)?;
        assert_eq!(outcome, PlanOutcome::ExitWithStatus(3));
        let calls = executor.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, req.argv);
        assert_eq!(calls[0].1, vec![(FAKEFAKEROOT_ENV.to_string(), "1".to_string())]);
        Ok(())
    }

    #[test]
    fn test_fakeroot_fallbacks() -> Result<()> {
        let req = PrivilegeRequest {
            fakeroot: true,
            ..Default::default()
        };
        // no userns, no fakeroot command
        assert!(matches!(
            plan(&req, &user_host(), &Locator(None), &Executor::default()),
            Err(PrivilegeError::FakerootUnavailable)
        ));
        // fakeroot command but not a sandbox
        assert!(matches!(
            plan(&req, &user_host(), &Locator(Some("/usr/bin/fakeroot")), &Executor::default()),
            Err(PrivilegeError::FakerootNeedsSandbox)
        ));
        let sandbox = PrivilegeRequest {
            sandbox_source: true,
            ..req.clone()
        };
        let planned = continued(plan(
            &sandbox,
            &user_host(),
            &Locator(Some("/usr/bin/fakeroot")),
            &Executor::default(),
        )?)?;
        assert_eq!(planned.mode, PrivilegeMode::FakerootCmd);
        assert_eq!(planned.fakeroot_path, Some(PathBuf::from("/usr/bin/fakeroot")));
        Ok(())
    }

    #[test]
    fn test_ignore_userns_skips_reexec() -> Result<()> {
        let executor = Executor {
            status: Some(0),
            ..Default::default()
        };
        let req = PrivilegeRequest {
            fakeroot: true,
            ignore_userns: true,
            ..Default::default()
        };
        assert!(matches!(
            plan(&req, &user_host(), &Locator(None), &executor),
            Err(PrivilegeError::FakerootUnavailable)
        ));
        assert!(executor.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_fakeroot_inside_root_mapped_namespace() -> Result<()> {
        let host = HostFacts {
            inside_userns: true,
            ..root_host()
        };
        let req = PrivilegeRequest {
            fakeroot: true,
            ..Default::default()
        };
        let plan1 = continued(plan(&req, &host, &Locator(None), &Executor::default())?)?;
        assert_eq!(plan1.mode, PrivilegeMode::RootMappedUserNs);
        assert!(!plan1.user_ns && !plan1.fakeroot);

        let plan2 = continued(plan(
            &req,
            &host,
            &Locator(Some("/usr/bin/fakeroot-sysv")),
            &Executor::default(),
        )?)?;
        assert_eq!(plan2.mode, PrivilegeMode::FakerootCmdUnderUserNs);
        Ok(())
    }

    #[test]
    fn test_subuid_fakeroot() -> Result<()> {
        let host = HostFacts {
            suid_install: true,
            subuid_mapped: true,
            ..user_host()
        };
        let req = PrivilegeRequest {
            fakeroot: true,
            ..Default::default()
        };
        let planned = continued(plan(&req, &host, &Locator(None), &Executor::default())?)?;
        assert_eq!(planned.mode, PrivilegeMode::SetuidHelper);
        assert!(planned.fakeroot && planned.user_ns && planned.use_suid);
        Ok(())
    }

    #[test]
    fn test_with_privilege() -> Result<()> {
        assert_eq!(with_privilege(1000, false, "--boot", || 1)?, None);
        assert_eq!(with_privilege(0, true, "--boot", || 1)?, Some(1));
        let err = with_privilege(1000, true, "--keep-privs", || ()).unwrap_err();
        assert_eq!(err.to_string(), "--keep-privs requires root privileges");
        Ok(())
    }

    #[test]
    fn test_hidepid_check() -> Result<()> {
        let planned = PrivilegePlan {
            mode: PrivilegeMode::SetuidHelper,
            use_suid: true,
            user_ns: false,
            fakeroot: false,
            fakeroot_path: None,
        };
        assert!(matches!(
            check_instance_hidepid(&planned, true),
            Err(PrivilegeError::Hidepid)
        ));
        assert!(check_instance_hidepid(&planned, false).is_ok());
        Ok(())
    }
}
