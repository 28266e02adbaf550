//! Home directory source and destination inside the container.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HomeError {
    #[error("home argument has incorrect number of elements: {0}")]
    Elements(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeRequest {
    /// `--home` value, or the real home when not given.
    pub home: String,
    pub custom_home: bool,
    pub fakeroot: bool,
    /// Uid requested with `--security uid:N`, 0 when none.
    pub target_uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomePlan {
    pub source: String,
    pub dest: String,
    pub custom_home: bool,
    pub no_home: bool,
}

/// Computes the home mount. `lookup_home` resolves a uid to its passwd
/// home directory.
pub fn plan_home<F>(req: &HomeRequest, lookup_home: F) -> Result<HomePlan, HomeError>
where
    F: Fn(u32) -> Option<String>,
{
    let mut home = req.home.clone();
    let mut custom_home = req.custom_home;
    let mut no_home = false;

    // the real home shows up as /root, which does not count as custom
    if !req.custom_home && req.fakeroot {
        home = format!("{home}:/root");
    }

    // an explicit --home wins over the target uid's passwd entry
    if !req.custom_home && req.target_uid != 0 {
        if req.target_uid > 500 {
            match lookup_home(req.target_uid) {
                Some(dir) => {
                    tracing::debug!("Target UID requested, set home directory to {dir}");
                    home = dir;
                    custom_home = true;
                }
                None => {
                    tracing::info!(
                        "Home directory for UID {} not found, home won't be mounted",
                        req.target_uid
                    );
                    no_home = true;
                    home = "/".to_string();
                }
            }
        } else {
            tracing::info!("System UID {} requested, home won't be mounted", req.target_uid);
            no_home = true;
            home = "/".to_string();
        }
    }

    let parts: Vec<&str> = home.split(':').collect();
    let (source, dest) = match parts.as_slice() {
        [src] => (src.to_string(), src.to_string()),
        [src, dst] => (src.to_string(), dst.to_string()),
        other => return Err(HomeError::Elements(other.len())),
    };
    Ok(HomePlan {
        source,
        dest,
        custom_home,
        no_home,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn req(home: &str) -> HomeRequest {
        HomeRequest {
            home: home.to_string(),
            custom_home: false,
            fakeroot: false,
            target_uid: 0,
        }
    }

    #[test]
    fn test_default_and_custom() -> Result<()> {
        let p = plan_home(&req("/home/alice"), |_| None)?;
        assert_eq!((p.source.as_str(), p.dest.as_str()), ("/home/alice", "/home/alice"));

        let custom = HomeRequest {
            custom_home: true,
            ..req("/scratch/alice:/home/alice")
        };
        let p = plan_home(&custom, |_| None)?;
        assert_eq!(p.source, "/scratch/alice");
        assert_eq!(p.dest, "/home/alice");
        assert!(p.custom_home);
        Ok(())
    }

    #[test]
    fn test_fakeroot_maps_to_root() -> Result<()> {
        let p = plan_home(
            &HomeRequest {
                fakeroot: true,
                ..req("/home/alice")
            },
            |_| None,
        )?;
        assert_eq!(p.dest, "/root");
        assert!(!p.custom_home);
        Ok(())
    }

    #[test]
    fn test_target_uid() -> Result<()> {
        let bob = |uid| (uid == 1001).then(|| "/home/bob".to_string());
        let base = HomeRequest {
            target_uid: 1001,
            ..req("/home/alice")
        };
        let p = plan_home(&base, bob)?;
        assert_eq!(p.source, "/home/bob");
        assert!(p.custom_home);
        assert!(!p.no_home);

        let explicit = HomeRequest {
            custom_home: true,
            ..req("/scratch/a:/home/a")
        };
        let explicit = HomeRequest {
            target_uid: 1001,
            ..explicit
        };
        let p = plan_home(&explicit, bob)?;
        assert_eq!(p.source, "/scratch/a");
        assert_eq!(p.dest, "/home/a");

        let p = plan_home(&base, |_| None)?;
        assert!(p.no_home);

        let system = HomeRequest {
            target_uid: 100,
            ..base
        };
        let p = plan_home(&system, |_| Some("/var/lib/x".into()))?;
        assert!(p.no_home);
        assert_eq!(p.source, "/");
        Ok(())
    }

    #[test]
    fn test_too_many_elements() {
        assert_eq!(
            plan_home(&req("/a:/b:/c"), |_| None),
            Err(HomeError::Elements(3))
        );
    }
}
