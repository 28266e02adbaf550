//! Fakeroot support: the `fakeroot` preload command, root-mapped user
//! namespaces and subordinate id ranges.

pub mod subid;
mod unshare;

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub use unshare::{RootMappedExecutor, UnshareExecutor, FAKEFAKEROOT_ENV};

/// Paths of the fakeroot pieces once bound into the container.
pub const FAKE_ARGS: [&str; 5] = [
    "/.singularity.d/libs/fakeroot",
    "-f",
    "/.singularity.d/libs/faked",
    "-l",
    "/.singularity.d/libs/libfakeroot.so",
];

#[derive(Debug, thiserror::Error)]
pub enum FakerootError {
    #[error("fakeroot command not found")]
    NotFound,
    #[error("error starting {cmd:?}")]
    Spawn {
        cmd: PathBuf,
        source: std::io::Error,
    },
    #[error("no {0} in fakeroot environment")]
    MissingVar(&'static str),
    #[error("error re-executing in root-mapped unprivileged user namespace")]
    Unshare(#[source] std::io::Error),
}

type Result<T> = std::result::Result<T, FakerootError>;

/// Locates the `fakeroot` command. Abstracted so planners can be tested
/// without one installed.
pub trait FakerootLocator {
    fn find_fake(&self) -> Option<PathBuf>;
}

/// Searches `$PATH`, preferring `fakeroot-sysv` which is much faster than
/// the tcp flavour.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathLocator;

impl FakerootLocator for PathLocator {
    fn find_fake(&self) -> Option<PathBuf> {
        for cmd in ["fakeroot-sysv", "fakeroot"] {
            tracing::debug!("looking for the {cmd} command");
            match which::which(cmd) {
                Ok(path) => {
                    tracing::debug!(?path, "{cmd} found");
                    return Some(path);
                }
                Err(err) => tracing::debug!(?err, "failure finding {cmd}"),
            }
        }
        None
    }
}

/// Bind specs mapping the fakeroot command, its daemon and preload library
/// into the container, as `src:dst` when a source is known.
pub fn fake_binds(fakeroot: &Path) -> Result<Vec<String>> {
    let targets = vec![
        FAKE_ARGS[0].to_string(),
        FAKE_ARGS[2].to_string(),
        FAKE_ARGS[4].to_string(),
    ];
    if fakeroot == Path::new(FAKE_ARGS[0]) {
        // nested run, the binds are already in place
        return Ok(targets);
    }

    let mut cmd = Command::new(fakeroot);
    cmd.arg("env").stdout(Stdio::piped()).stderr(Stdio::null());
    cmd.env_remove("LD_LIBRARY_PATH");
    if std::env::var_os("PATH").map_or(true, |p| p.is_empty()) {
        cmd.env("PATH", crate::utils::DEFAULT_PATH);
    }
    let mut child = cmd.spawn().map_err(|source| FakerootError::Spawn {
        cmd: fakeroot.to_path_buf(),
        source,
    })?;
    let mut output = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        output.extend(BufReader::new(stdout).lines().map_while(|l| l.ok()));
    }
    let _ = child.wait();

    binds_from_env(fakeroot, &output, |p| p.exists())
}

/// Derives the binds from the `fakeroot env` output.
fn binds_from_env<F>(fakeroot: &Path, env_lines: &[String], exists: F) -> Result<Vec<String>>
where
    F: Fn(&Path) -> bool,
{
    let mut preload = "";
    let mut library_path = "";
    for line in env_lines {
        if let Some(v) = line.strip_prefix("LD_PRELOAD=") {
            preload = v;
        } else if let Some(v) = line.strip_prefix("LD_LIBRARY_PATH=") {
            library_path = v;
        }
    }
    if preload.is_empty() {
        return Err(FakerootError::MissingVar("LD_PRELOAD"));
    }
    if library_path.is_empty() {
        return Err(FakerootError::MissingVar("LD_LIBRARY_PATH"));
    }
    let preload = preload
        .split(':')
        .find(|e| e.starts_with("libfakeroot"))
        .unwrap_or(preload);

    let mut binds = vec![
        format!("{}:{}", fakeroot.display(), FAKE_ARGS[0]),
        FAKE_ARGS[2].to_string(),
        FAKE_ARGS[4].to_string(),
    ];

    // libfakeroot-sysv.so pairs with faked-sysv
    let dir = fakeroot.parent().unwrap_or(Path::new("/"));
    let flavour = preload
        .split('.')
        .next()
        .and_then(|stem| stem.split_once('-'))
        .map(|(_, f)| f);
    let faked = match flavour {
        Some(f) => dir.join(format!("faked-{f}")),
        None => dir.join("faked"),
    };
    if exists(&faked) {
        binds[1] = format!("{}:{}", faked.display(), FAKE_ARGS[2]);
    }

    if let Some(lib) = library_path
        .split(':')
        .map(|d| Path::new(d).join(preload))
        .find(|p| exists(p))
    {
        binds[2] = format!("{}:{}", lib.display(), FAKE_ARGS[4]);
    }
    Ok(binds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_binds_from_env() -> Result<()> {
        let lines = vec![
            "HOME=/root".to_string(),
            "LD_PRELOAD=libc.so:libfakeroot-sysv.so".to_string(),
            "LD_LIBRARY_PATH=/usr/lib64/libfakeroot:/usr/lib/libfakeroot".to_string(),
        ];
        let present = [
            PathBuf::from("/usr/bin/faked-sysv"),
            PathBuf::from("/usr/lib/libfakeroot/libfakeroot-sysv.so"),
        ];
        let binds = binds_from_env(Path::new("/usr/bin/fakeroot-sysv"), &lines, |p| {
            present.iter().any(|x| x == p)
        })?;
        assert_eq!(
            binds,
            vec![
                "/usr/bin/fakeroot-sysv:/.singularity.d/libs/fakeroot",
                "/usr/bin/faked-sysv:/.singularity.d/libs/faked",
                "/usr/lib/libfakeroot/libfakeroot-sysv.so:/.singularity.d/libs/libfakeroot.so",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_binds_need_preload() {
        let lines = vec!["LD_LIBRARY_PATH=/usr/lib".to_string()];
        assert!(matches!(
            binds_from_env(Path::new("/usr/bin/fakeroot"), &lines, |_| true),
            Err(FakerootError::MissingVar("LD_PRELOAD"))
        ));
    }

    #[test]
    fn test_nested_binds() -> Result<()> {
        let binds = fake_binds(Path::new(FAKE_ARGS[0]))?;
        assert_eq!(binds.len(), 3);
        assert!(binds.iter().all(|b| !b.contains(':')));
        Ok(())
    }
}
