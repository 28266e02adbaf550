//! `remote`, `keyserver` and `registry`: edits of `remote.yaml`.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Args, Debug, Clone, Default)]
pub struct RemoteFile {
    /// Use this remote configuration file
    #[clap(short, long)]
    pub config: Option<PathBuf>,
}

/// Manage library endpoints
#[derive(Parser, Debug)]
pub struct Remote {
    #[clap(flatten)]
    pub file: RemoteFile,
    #[clap(subcommand)]
    pub cmd: RemoteCmd,
}

#[derive(Subcommand, Debug)]
pub enum RemoteCmd {
    Add(RemoteAdd),
    Remove {
        #[clap(short, long)]
        global: bool,
        name: String,
    },
    Use(RemoteUse),
    List,
    Rename {
        #[clap(short, long)]
        global: bool,
        name: String,
        new_name: String,
    },
    /// Show the configuration of a remote
    Status { name: Option<String> },
    Login(Login),
    Logout { uri: Option<String> },
}

/// Add a remote endpoint
#[derive(Parser, Debug)]
pub struct RemoteAdd {
    /// Add to the system configuration, root only
    #[clap(short, long)]
    pub global: bool,
    #[clap(long)]
    pub insecure: bool,
    /// Do not make the remote the default one
    #[clap(long)]
    pub no_default: bool,
    pub name: String,
    pub uri: String,
}

/// Select the default remote
#[derive(Parser, Debug)]
pub struct RemoteUse {
    #[clap(short, long)]
    pub global: bool,
    /// Forbid users from choosing another remote, needs --global
    #[clap(short, long)]
    pub exclusive: bool,
    pub name: String,
}

#[derive(Parser, Debug)]
pub struct Login {
    #[clap(short, long)]
    pub username: Option<String>,
    #[clap(short, long, env = "APPTAINER_LOGIN_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Read the password from standard input
    #[clap(long)]
    pub password_stdin: bool,
    #[clap(long)]
    pub insecure: bool,
    pub uri: Option<String>,
}

/// Manage keyservers
#[derive(Parser, Debug)]
pub struct Keyserver {
    #[clap(flatten)]
    pub file: RemoteFile,
    #[clap(subcommand)]
    pub cmd: KeyserverCmd,
}

#[derive(Subcommand, Debug)]
pub enum KeyserverCmd {
    Add {
        /// Position of the keyserver, 1 is first
        #[clap(short, long, default_value_t = 0)]
        order: usize,
        #[clap(short, long)]
        insecure: bool,
        /// Remote receiving the keyserver
        #[clap(long)]
        remote: Option<String>,
        uri: String,
    },
    Remove {
        #[clap(long)]
        remote: Option<String>,
        uri: String,
    },
    List { remote: Option<String> },
    Login(Login),
    Logout { uri: String },
}

/// Manage OCI registry credentials
#[derive(Parser, Debug)]
pub struct Registry {
    /// Docker style credential file
    #[clap(long, env = "APPTAINER_AUTHFILE")]
    pub authfile: Option<PathBuf>,
    #[clap(subcommand)]
    pub cmd: RegistryCmd,
}

#[derive(Subcommand, Debug)]
pub enum RegistryCmd {
    Login(Login),
    Logout { uri: Option<String> },
    List,
}
