//! The admin capability file granting capabilities to users and groups.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use caps::Capability;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown capabilities found in: {0}")]
    Unknown(String),
    #[error("you must specify a user or a group")]
    NoTarget,
    #[error("user {0} not found")]
    NoSuchUser(String),
    #[error("group {0} not found")]
    NoSuchGroup(String),
    #[error("only root user can manage capabilities")]
    RequiresRoot,
    #[error("could not read capability file {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write capability file {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed capability file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, CapabilityError>;

const DESCRIPTIONS: &[(&str, &str)] = &[
    ("CAP_AUDIT_CONTROL", "Enable and disable kernel auditing and change auditing filter rules."),
    ("CAP_AUDIT_READ", "Allow reading the audit log via a multicast netlink socket."),
    ("CAP_AUDIT_WRITE", "Write records to kernel auditing log."),
    ("CAP_BLOCK_SUSPEND", "Employ features that can block system suspend."),
    ("CAP_CHOWN", "Make arbitrary changes to file UIDs and GIDs."),
    ("CAP_DAC_OVERRIDE", "Bypass file read, write, and execute permission checks."),
    ("CAP_DAC_READ_SEARCH", "Bypass file read permission checks and directory read and execute permission checks."),
    ("CAP_FOWNER", "Bypass permission checks on operations that normally require the file owner."),
    ("CAP_FSETID", "Don't clear set-user-ID and set-group-ID mode bits when a file is modified."),
    ("CAP_IPC_LOCK", "Lock memory."),
    ("CAP_IPC_OWNER", "Bypass permission checks for operations on System V IPC objects."),
    ("CAP_KILL", "Bypass permission checks for sending signals."),
    ("CAP_LEASE", "Establish leases on arbitrary files."),
    ("CAP_LINUX_IMMUTABLE", "Set the FS_APPEND_FL and FS_IMMUTABLE_FL i-node flags."),
    ("CAP_MAC_ADMIN", "Override Mandatory Access Control."),
    ("CAP_MAC_OVERRIDE", "Allow MAC configuration or state changes."),
    ("CAP_MKNOD", "Create special files using mknod."),
    ("CAP_NET_ADMIN", "Perform various network-related operations."),
    ("CAP_NET_BIND_SERVICE", "Bind a socket to Internet domain privileged ports."),
    ("CAP_NET_BROADCAST", "Make socket broadcasts, and listen to multicasts."),
    ("CAP_NET_RAW", "Use RAW and PACKET sockets."),
    ("CAP_SETGID", "Make arbitrary manipulations of process GIDs and supplementary GID list."),
    ("CAP_SETFCAP", "Set file capabilities."),
    ("CAP_SETPCAP", "Modify the capability bounding set and process capabilities."),
    ("CAP_SETUID", "Make arbitrary manipulations of process UIDs."),
    ("CAP_SYS_ADMIN", "Perform a range of system administration operations."),
    ("CAP_SYS_BOOT", "Use reboot and kexec_load."),
    ("CAP_SYS_CHROOT", "Use chroot."),
    ("CAP_SYS_MODULE", "Load and unload kernel modules."),
    ("CAP_SYS_NICE", "Raise process nice value and change scheduling policies."),
    ("CAP_SYS_PACCT", "Use acct."),
    ("CAP_SYS_PTRACE", "Trace arbitrary processes using ptrace."),
    ("CAP_SYS_RAWIO", "Perform I/O port operations."),
    ("CAP_SYS_RESOURCE", "Override resource limits."),
    ("CAP_SYS_TIME", "Set system clock and real-time hardware clock."),
    ("CAP_SYS_TTY_CONFIG", "Use vhangup and employ privileged ioctl operations on virtual terminals."),
    ("CAP_SYSLOG", "Perform privileged syslog operations."),
    ("CAP_WAKE_ALARM", "Trigger something that will wake up the system."),
];

/// Sorted names of every capability the running kernel headers know.
pub fn all_names() -> Vec<String> {
    let mut names: Vec<String> = caps::all().into_iter().map(|c| c.to_string()).collect();
    names.sort();
    names
}

pub fn description(name: &str) -> &'static str {
    DESCRIPTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, d)| *d)
        .unwrap_or("No description available.")
}

/// Parses a comma separated list, `all` standing for every capability.
/// Names are case insensitive and the `CAP_` prefix is optional.
pub fn parse_caps(list: &str) -> Result<Vec<String>> {
    let mut caps = Vec::new();
    let mut unknown = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if item.eq_ignore_ascii_case("all") {
            return Ok(all_names());
        }
        let upper = item.to_ascii_uppercase();
        let name = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        match Capability::from_str(&name) {
            Ok(cap) => {
                let name = cap.to_string();
                if !caps.contains(&name) {
                    caps.push(name);
                }
            }
            Err(_) => unknown.push(item.to_string()),
        }
    }
    if !unknown.is_empty() {
        return Err(CapabilityError::Unknown(unknown.join(",")));
    }
    Ok(caps)
}

/// `capability.json`: capabilities granted per user and per group.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapabilityFile {
    #[serde(default)]
    pub users: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl CapabilityFile {
    /// A missing or empty file holds no grants.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(CapabilityError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).map_err(|source| CapabilityError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |source| CapabilityError::Write {
            path: path.to_path_buf(),
            source,
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        let data = serde_json::to_vec_pretty(self).map_err(|source| CapabilityError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tmp.write_all(&data).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    pub fn user_caps(&self, user: &str) -> &[String] {
        self.users.get(user).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn group_caps(&self, group: &str) -> &[String] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or_default()
    }
}

fn grant(map: &mut BTreeMap<String, Vec<String>>, name: &str, caps: &[String]) {
    let entry = map.entry(name.to_string()).or_default();
    for cap in caps {
        if !entry.contains(cap) {
            entry.push(cap.clone());
        }
    }
    entry.sort();
}

fn revoke(map: &mut BTreeMap<String, Vec<String>>, name: &str, caps: &[String]) {
    if let Some(entry) = map.get_mut(name) {
        entry.retain(|c| !caps.contains(c));
        if entry.is_empty() {
            map.remove(name);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapOp {
    Add,
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct ManageRequest {
    pub caps: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Resolves whether a user or group exists on the host.
pub trait AccountLookup {
    fn user_exists(&self, name: &str) -> bool;
    fn group_exists(&self, name: &str) -> bool;
}

/// Looks accounts up through the passwd and group databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

impl AccountLookup for SystemAccounts {
    fn user_exists(&self, name: &str) -> bool {
        matches!(nix::unistd::User::from_name(name), Ok(Some(_)))
    }

    fn group_exists(&self, name: &str) -> bool {
        matches!(nix::unistd::Group::from_name(name), Ok(Some(_)))
    }
}

/// Adds or drops capabilities of a user and/or a group in `path`.
#[tracing::instrument(level = "trace", skip(accounts))]
pub fn manage(
    path: &Path,
    req: &ManageRequest,
    op: CapOp,
    uid: u32,
    accounts: &dyn AccountLookup,
) -> Result<()> {
    if uid != 0 {
        return Err(CapabilityError::RequiresRoot);
    }
    let user = req.user.as_deref().filter(|u| !u.is_empty());
    let group = req.group.as_deref().filter(|g| !g.is_empty());
    if user.is_none() && group.is_none() {
        return Err(CapabilityError::NoTarget);
    }
    let caps = parse_caps(&req.caps)?;

    let mut file = CapabilityFile::load(path)?;
    if let Some(user) = user {
        if !accounts.user_exists(user) {
            return Err(CapabilityError::NoSuchUser(user.to_string()));
        }
        match op {
            CapOp::Add => grant(&mut file.users, user, &caps),
            CapOp::Drop => revoke(&mut file.users, user, &caps),
        }
        tracing::debug!(user, ?op, ?caps, "updated user capabilities");
    }
    if let Some(group) = group {
        if !accounts.group_exists(group) {
            return Err(CapabilityError::NoSuchGroup(group.to_string()));
        }
        match op {
            CapOp::Add => grant(&mut file.groups, group, &caps),
            CapOp::Drop => revoke(&mut file.groups, group, &caps),
        }
        tracing::debug!(group, ?op, ?caps, "updated group capabilities");
    }
    file.save(path)
}

/// Name and description of `list`, or of every capability when empty.
pub fn avail(list: &str) -> Result<Vec<(String, &'static str)>> {
    let names = if list.trim().is_empty() {
        all_names()
    } else {
        parse_caps(list)?
    };
    Ok(names
        .into_iter()
        .map(|n| {
            let d = description(&n);
            (n, d)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct Accounts;

    impl AccountLookup for Accounts {
        fn user_exists(&self, name: &str) -> bool {
            name == "alice"
        }

        fn group_exists(&self, name: &str) -> bool {
            name == "hpc"
        }
    }

    #[test]
    fn test_parse_caps() -> Result<()> {
        assert_eq!(
            parse_caps("chown, CAP_NET_RAW,cap_chown")?,
            vec!["CAP_CHOWN".to_string(), "CAP_NET_RAW".to_string()]
        );
        assert_eq!(parse_caps("all")?, all_names());
        assert!(matches!(
            parse_caps("CAP_CHOWN,CAP_FLY,warp"),
            Err(CapabilityError::Unknown(s)) if s == "CAP_FLY,warp"
        ));
        Ok(())
    }

    #[test]
    fn test_manage() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("capability.json");
        let req = ManageRequest {
            caps: "CAP_NET_RAW,CAP_CHOWN".to_string(),
            user: Some("alice".to_string()),
            group: Some("hpc".to_string()),
        };
        manage(&path, &req, CapOp::Add, 0, &Accounts)?;
        let file = CapabilityFile::load(&path)?;
        assert_eq!(file.user_caps("alice"), ["CAP_CHOWN", "CAP_NET_RAW"]);
        assert_eq!(file.group_caps("hpc"), ["CAP_CHOWN", "CAP_NET_RAW"]);

        let drop = ManageRequest {
            caps: "chown,net_raw".to_string(),
            user: Some("alice".to_string()),
            group: None,
        };
        manage(&path, &drop, CapOp::Drop, 0, &Accounts)?;
        let file = CapabilityFile::load(&path)?;
        assert!(file.users.is_empty());
        assert_eq!(file.group_caps("hpc").len(), 2);
        Ok(())
    }

    #[test]
    fn test_manage_rejections() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("capability.json");
        let req = ManageRequest {
            caps: "CAP_CHOWN".to_string(),
            user: Some("bob".to_string()),
            group: None,
        };
        assert!(matches!(
            manage(&path, &req, CapOp::Add, 1000, &Accounts),
            Err(CapabilityError::RequiresRoot)
        ));
        assert!(matches!(
            manage(&path, &req, CapOp::Add, 0, &Accounts),
            Err(CapabilityError::NoSuchUser(u)) if u == "bob"
        ));
        let none = ManageRequest {
            caps: "CAP_CHOWN".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            manage(&path, &none, CapOp::Add, 0, &Accounts),
            Err(CapabilityError::NoTarget)
        ));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_avail() -> Result<()> {
        let one = avail("sys_boot")?;
        assert_eq!(one, vec![("CAP_SYS_BOOT".to_string(), "Use reboot and kexec_load.")]);
        assert_eq!(avail("")?.len(), all_names().len());
        Ok(())
    }
}
