//! Commands managing local state: cache, overlays, checkpoints,
//! capabilities and the admin configuration.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Manage the local image cache
#[derive(Parser, Debug)]
pub struct Cache {
    #[clap(subcommand)]
    pub cmd: CacheCmd,
}

#[derive(Subcommand, Debug)]
pub enum CacheCmd {
    List(CacheList),
    Clean(CacheClean),
}

/// Show the cached images
#[derive(Parser, Debug)]
pub struct CacheList {
    /// Cache types to list, comma separated
    #[clap(short = 'T', long = "type", value_delimiter = ',', default_value = "all")]
    pub types: Vec<String>,
    /// List every entry
    #[clap(short, long)]
    pub verbose: bool,
}

/// Remove cached images
#[derive(Parser, Debug)]
pub struct CacheClean {
    #[clap(short = 'T', long = "type", value_delimiter = ',', default_value = "all")]
    pub types: Vec<String>,
    /// Only remove entries older than this many days
    #[clap(short, long)]
    pub days: Option<u64>,
    /// Show what would be removed
    #[clap(short = 'n', long)]
    pub dry_run: bool,
    /// Do not ask for confirmation
    #[clap(short, long)]
    pub force: bool,
}

/// Manage writable overlay images
#[derive(Parser, Debug)]
pub struct Overlay {
    #[clap(subcommand)]
    pub cmd: OverlayCmd,
}

#[derive(Subcommand, Debug)]
pub enum OverlayCmd {
    Create(OverlayCreate),
}

/// Create an ext3 overlay image
#[derive(Parser, Debug)]
pub struct OverlayCreate {
    /// Size in MiB
    #[clap(short, long, default_value_t = 64)]
    pub size: u64,
    /// Directory created in the overlay
    #[clap(long)]
    pub create_dir: Vec<String>,
    /// Allocate a sparse file
    #[clap(long)]
    pub sparse: bool,
    pub path: PathBuf,
}

/// Manage DMTCP checkpoints
#[derive(Parser, Debug)]
pub struct Checkpoint {
    #[clap(subcommand)]
    pub cmd: CheckpointCmd,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCmd {
    /// List the checkpoints
    List,
    /// Create an empty checkpoint
    Create { name: String },
    /// Delete a checkpoint
    Delete { name: String },
    /// Checkpoint a running instance
    Instance {
        /// Checkpoint receiving the state
        #[clap(long)]
        name: Option<String>,
        instance: String,
    },
}

/// Manage the capabilities granted to users and groups
#[derive(Parser, Debug)]
pub struct Capability {
    #[clap(subcommand)]
    pub cmd: CapabilityCmd,
}

#[derive(Args, Debug, Clone)]
pub struct CapabilityTarget {
    #[clap(short, long)]
    pub user: Option<String>,
    #[clap(short, long)]
    pub group: Option<String>,
    /// Comma separated capabilities, or all
    pub caps: String,
}

#[derive(Subcommand, Debug)]
pub enum CapabilityCmd {
    Add(CapabilityTarget),
    Drop(CapabilityTarget),
    /// Show the capabilities of users and groups
    List {
        /// Restrict the listing to one user or group
        name: Option<String>,
    },
    /// Describe the available capabilities
    Avail { caps: Option<String> },
}

/// Manage the administrative configuration
#[derive(Parser, Debug)]
pub struct Config {
    #[clap(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    Global(ConfigGlobal),
    Fakeroot(ConfigFakeroot),
}

/// Edit apptainer.conf
#[derive(Parser, Debug)]
#[clap(group(clap::ArgGroup::new("op").required(true).args(["set", "unset", "get", "reset"])))]
pub struct ConfigGlobal {
    #[clap(short, long)]
    pub set: bool,
    #[clap(short, long)]
    pub unset: bool,
    #[clap(short, long)]
    pub get: bool,
    #[clap(short, long)]
    pub reset: bool,
    /// Only print the resulting configuration
    #[clap(short, long)]
    pub dry_run: bool,
    pub key: String,
    pub value: Option<String>,
}

/// Edit /etc/subuid and /etc/subgid
#[derive(Parser, Debug)]
#[clap(group(clap::ArgGroup::new("op").required(true).args(["add", "remove", "enable", "disable"])))]
pub struct ConfigFakeroot {
    #[clap(short, long)]
    pub add: bool,
    #[clap(short, long)]
    pub remove: bool,
    #[clap(short, long)]
    pub enable: bool,
    #[clap(short, long)]
    pub disable: bool,
    pub user: String,
}
