//! Key material for encrypted images.

use std::io::{BufRead, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::sys::termios::{self, LocalFlags, SetArg};

pub const PEM_PATH_ENV: &str = "APPTAINER_ENCRYPTION_PEM_PATH";
pub const PEM_DATA_ENV: &str = "APPTAINER_ENCRYPTION_PEM_DATA";
pub const PASSPHRASE_ENV: &str = "APPTAINER_ENCRYPTION_PASSPHRASE";

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("required option --passphrase or --pem-path missing")]
    Missing,
    #[error("Specified PEM file {0:?}: does not exist.")]
    PemNotFound(PathBuf),
    #[error("could not read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid encryption {kind} key: no PEM data")]
    NoPemData { kind: &'static str },
    #[error("passphrase protected pem files not supported")]
    ProtectedPem,
    #[error("Cannot encrypt container with empty passphrase")]
    EmptyPassphrase,
    #[error("while reading passphrase")]
    Prompt(#[source] std::io::Error),
    #[error("while configuring terminal")]
    Terminal(#[from] nix::Error),
    #[error("unprivileged encryption requires user namespaces")]
    NoUserNs,
}

type Result<T> = std::result::Result<T, CryptError>;

/// Where the key material came from.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyInfo {
    PemPath(PathBuf),
    PemData(String),
    Passphrase(String),
}

impl std::fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyInfo::PemPath(p) => f.debug_tuple("PemPath").field(p).finish(),
            KeyInfo::PemData(_) => f.write_str("PemData(..)"),
            KeyInfo::Passphrase(_) => f.write_str("Passphrase(..)"),
        }
    }
}

/// Which half of a key pair a PEM must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Encrypting at build time.
    Public,
    /// Decrypting to run.
    Private,
}

impl KeyPurpose {
    fn name(self) -> &'static str {
        match self {
            KeyPurpose::Public => "public",
            KeyPurpose::Private => "private",
        }
    }
}

/// Key material options from the command line.
#[derive(Debug, Clone, Default)]
pub struct KeyRequest {
    pub pem_path: Option<PathBuf>,
    /// `--passphrase` was given, prompt for it.
    pub passphrase: bool,
}

/// Checks that `data` holds a PEM block of the wanted kind.
pub fn check_pem(data: &str, purpose: KeyPurpose) -> Result<()> {
    let label = data
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("-----BEGIN ").and_then(|l| l.strip_suffix("-----")))
        .ok_or(CryptError::NoPemData {
            kind: purpose.name(),
        })?;
    if data.contains("Proc-Type: 4,ENCRYPTED") || label == "ENCRYPTED PRIVATE KEY" {
        return Err(CryptError::ProtectedPem);
    }
    let ok = match purpose {
        KeyPurpose::Public => label.ends_with("PUBLIC KEY"),
        KeyPurpose::Private => label.ends_with("PRIVATE KEY"),
    };
    if !ok {
        return Err(CryptError::NoPemData {
            kind: purpose.name(),
        });
    }
    Ok(())
}

fn check_pem_file(path: &Path, purpose: KeyPurpose) -> Result<()> {
    if !path.exists() {
        return Err(CryptError::PemNotFound(path.to_path_buf()));
    }
    let data = std::fs::read_to_string(path).map_err(|source| CryptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    check_pem(&data, purpose)
}

/// Reads a line from the terminal with echo turned off.
pub fn ask_no_echo(question: &str) -> Result<String> {
    let stdin = std::io::stdin();
    let fd = stdin.as_fd();
    let saved = termios::tcgetattr(fd).ok();
    if let Some(saved) = &saved {
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        termios::tcsetattr(fd, SetArg::TCSANOW, &silent)?;
    }
    eprint!("{question}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);
    if let Some(saved) = &saved {
        termios::tcsetattr(fd, SetArg::TCSANOW, saved)?;
        eprintln!();
    }
    read.map_err(CryptError::Prompt)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Resolves key material. Flags win over the environment, a PEM over a
/// passphrase. `prompt` is called for `--passphrase`.
pub fn key_material<E, P>(
    req: &KeyRequest,
    purpose: KeyPurpose,
    env: E,
    prompt: P,
) -> Result<Option<KeyInfo>>
where
    E: Fn(&str) -> Option<String>,
    P: FnOnce() -> Result<String>,
{
    if let Some(path) = &req.pem_path {
        tracing::info!("Using pem path flag for encrypted container");
        check_pem_file(path, purpose)?;
        return Ok(Some(KeyInfo::PemPath(path.clone())));
    }
    if req.passphrase {
        tracing::info!("Using interactive passphrase entry for encrypted container");
        let passphrase = prompt()?;
        if passphrase.is_empty() {
            return Err(CryptError::EmptyPassphrase);
        }
        return Ok(Some(KeyInfo::Passphrase(passphrase)));
    }
    if let Some(path) = env(PEM_PATH_ENV).filter(|p| !p.is_empty()) {
        tracing::info!("Using pem path environment variable for encrypted container");
        let path = PathBuf::from(path);
        check_pem_file(&path, purpose)?;
        return Ok(Some(KeyInfo::PemPath(path)));
    }
    if let Some(data) = env(PEM_DATA_ENV).filter(|p| !p.is_empty()) {
        tracing::info!("Using pem data environment variable for encrypted container");
        check_pem(&data, purpose)?;
        return Ok(Some(KeyInfo::PemData(data)));
    }
    if let Some(passphrase) = env(PASSPHRASE_ENV) {
        tracing::info!("Using passphrase environment variable for encrypted container");
        if passphrase.is_empty() {
            return Err(CryptError::EmptyPassphrase);
        }
        return Ok(Some(KeyInfo::Passphrase(passphrase)));
    }
    Ok(None)
}
