use std::path::PathBuf;

use clap::builder::FalseyValueParser;
use clap::{Args, Parser};

// Commands launching a container
mod actions;
mod instance;

pub use actions::{ActionOpts, Exec, PullAuthOpts, Run, Shell, Test};
pub use instance::{Instance, InstanceCmd, InstanceList, InstanceStart, InstanceStats, InstanceStop};

// Commands producing or consuming images
mod image;

pub use image::{Build, Pull, Push};

// Local state and configuration
mod manage;
mod remote;

pub use manage::{
    Cache, CacheClean, CacheCmd, CacheList, Capability, CapabilityCmd, CapabilityTarget, Checkpoint,
    CheckpointCmd, Config, ConfigCmd, ConfigFakeroot, ConfigGlobal, Overlay, OverlayCmd, OverlayCreate,
};
pub use remote::{
    Keyserver, KeyserverCmd, Login, Registry, RegistryCmd, Remote, RemoteAdd, RemoteCmd, RemoteFile,
    RemoteUse,
};

#[derive(Parser, Debug)]
pub enum ActionCmd {
    Exec(Exec),
    Run(Run),
    Shell(Shell),
    Test(Test),
    Instance(Instance),
}

#[derive(Parser, Debug)]
pub enum ImageCmd {
    Pull(Pull),
    Push(Push),
    Build(Build),
}

#[derive(Parser, Debug)]
pub enum ManageCmd {
    Cache(Cache),
    Overlay(Overlay),
    Checkpoint(Checkpoint),
    Capability(Capability),
    Config(Config),
    Remote(Remote),
    Keyserver(Keyserver),
    Registry(Registry),
}

// Verbosity flags, the most verbose one wins, `log-level` overrides them
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOpts {
    /// Print debugging information
    #[clap(short, long, env = "APPTAINER_DEBUG", value_parser = FalseyValueParser::new())]
    pub debug: bool,
    /// Print additional information
    #[clap(short, long, env = "APPTAINER_VERBOSE", value_parser = FalseyValueParser::new())]
    pub verbose: bool,
    /// Only print errors
    #[clap(short, long, env = "APPTAINER_QUIET", value_parser = FalseyValueParser::new())]
    pub quiet: bool,
    /// Print nothing
    #[clap(short, long, env = "APPTAINER_SILENT", value_parser = FalseyValueParser::new())]
    pub silent: bool,
    /// Explicit log level: error, warn, info, debug or trace
    #[clap(long)]
    pub log_level: Option<String>,
    /// Log format, text (default) or json
    #[clap(long)]
    pub log_format: Option<String>,
    /// Write logs to this file instead of stderr
    #[clap(long)]
    pub log_file: Option<PathBuf>,
    /// Disable colored output
    #[clap(long, env = "APPTAINER_NOCOLOR", value_parser = FalseyValueParser::new())]
    pub nocolor: bool,
    /// Also send logs to the systemd journal
    #[clap(long)]
    pub syslog: bool,
}
