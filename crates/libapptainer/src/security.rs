//! `--security` options: target uid/gid and LSM/seccomp profiles.

use crate::privilege::{with_privilege, PrivilegeError};

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid security option {0:?}, expected <feature>:<value>")]
    Syntax(String),
    #[error("unknown security feature {0:?}")]
    UnknownFeature(String),
    #[error("failed to parse provided UID {0:?}")]
    Uid(String),
    #[error("failed to parse provided GID {0:?}")]
    Gid(String),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

type Result<T> = std::result::Result<T, SecurityError>;

/// Parsed `--security` values. Later values of a feature replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SecurityOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparmor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<String>,
}

impl SecurityOptions {
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let mut opts = Self::default();
        for value in values
            .iter()
            .flat_map(|v| v.as_ref().split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            let (feature, param) = value
                .split_once(':')
                .ok_or_else(|| SecurityError::Syntax(value.to_string()))?;
            let slot = match feature {
                "uid" => &mut opts.uid,
                "gid" => &mut opts.gid,
                "selinux" => &mut opts.selinux,
                "apparmor" => &mut opts.apparmor,
                "seccomp" => &mut opts.seccomp,
                other => return Err(SecurityError::UnknownFeature(other.to_string())),
            };
            *slot = Some(param.to_string());
        }
        Ok(opts)
    }

    /// Profiles handed to the engine untouched.
    pub fn profiles(&self) -> Vec<String> {
        [
            ("selinux", &self.selinux),
            ("apparmor", &self.apparmor),
            ("seccomp", &self.seccomp),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}:{v}")))
        .collect()
    }
}

/// Identity the container process runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIds {
    pub uid: u32,
    pub gid: u32,
    /// Uid requested with `uid:N`, 0 when none.
    pub target_uid: u32,
    pub target_gids: Vec<u32>,
}

/// Applies `uid:`/`gid:` requests. They need root when the setuid starter
/// is used and are always allowed otherwise.
pub fn target_ids(opts: &SecurityOptions, uid: u32, gid: u32, use_suid: bool) -> Result<TargetIds> {
    let pseudo_root = if use_suid { uid } else { 0 };
    let mut ids = TargetIds {
        uid,
        gid,
        target_uid: 0,
        target_gids: Vec::new(),
    };

    let uid_param = opts.uid.as_deref().unwrap_or_default();
    let target_uid = with_privilege(
        pseudo_root,
        !uid_param.is_empty(),
        "uid security feature with suid mode",
        || uid_param.parse::<u32>(),
    )?;
    if let Some(parsed) = target_uid {
        let target = parsed.map_err(|_| SecurityError::Uid(uid_param.to_string()))?;
        ids.uid = target;
        ids.target_uid = target;
    }

    let gid_param = opts.gid.as_deref().unwrap_or_default();
    let target_gids = with_privilege(
        pseudo_root,
        !gid_param.is_empty(),
        "gid security feature with suid mode",
        || {
            gid_param
                .split(':')
                .map(|g| g.parse::<u32>().map_err(|_| SecurityError::Gid(g.to_string())))
                .collect::<Result<Vec<_>>>()
        },
    )?;
    if let Some(gids) = target_gids {
        let gids = gids?;
        if let Some(first) = gids.first() {
            ids.gid = *first;
        }
        ids.target_gids = gids;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_parse() -> Result<()> {
        let opts = SecurityOptions::parse(&["uid:1000,gid:100:200", "seccomp:/p.json"])?;
        assert_eq!(opts.uid.as_deref(), Some("1000"));
        assert_eq!(opts.gid.as_deref(), Some("100:200"));
        assert_eq!(opts.profiles(), vec!["seccomp:/p.json"]);
        assert!(matches!(
            SecurityOptions::parse(&["bogus:1"]),
            Err(SecurityError::UnknownFeature(_))
        ));
        assert!(matches!(SecurityOptions::parse(&["uid"]), Err(SecurityError::Syntax(_))));
        Ok(())
    }

    #[test]
    fn test_target_ids() -> Result<()> {
        let opts = SecurityOptions::parse(&["uid:1001,gid:10:20"])?;

        let ids = target_ids(&opts, 0, 0, true)?;
        assert_eq!((ids.uid, ids.gid), (1001, 10));
        assert_eq!(ids.target_gids, vec![10, 20]);

        // non-suid runs may always ask
        let ids = target_ids(&opts, 1000, 1000, false)?;
        assert_eq!(ids.target_uid, 1001);

        assert!(matches!(
            target_ids(&opts, 1000, 1000, true),
            Err(SecurityError::Privilege(PrivilegeError::RequiresRoot(_)))
        ));

        let bad = SecurityOptions::parse(&["gid:x"])?;
        assert!(matches!(target_ids(&bad, 0, 0, false), Err(SecurityError::Gid(_))));

        let none = target_ids(&SecurityOptions::default(), 1000, 1000, true)?;
        assert_eq!((none.uid, none.target_uid), (1000, 0));
        Ok(())
    }
}
