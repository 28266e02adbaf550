use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::actions::ActionOpts;

/// Manage background instances
#[derive(Parser, Debug)]
pub struct Instance {
    #[clap(subcommand)]
    pub cmd: InstanceCmd,
}

#[derive(Subcommand, Debug)]
pub enum InstanceCmd {
    Start(InstanceStart),
    Run(InstanceStart),
    Stop(InstanceStop),
    List(InstanceList),
    Stats(InstanceStats),
}

/// Start a named instance of an image
#[derive(Parser, Debug)]
#[clap(trailing_var_arg = true)]
pub struct InstanceStart {
    #[clap(flatten)]
    pub opts: ActionOpts,
    /// File the instance pid is written to
    #[clap(long, env = "APPTAINER_PID_FILE")]
    pub pid_file: Option<PathBuf>,
    pub image: String,
    pub name: String,
    #[clap(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Stop named instances
#[derive(Parser, Debug)]
pub struct InstanceStop {
    /// Stop every instance of the user
    #[clap(short, long)]
    pub all: bool,
    /// Send SIGKILL to the instances
    #[clap(short = 'F', long)]
    pub force: bool,
    /// Signal sent to the instances, name or number
    #[clap(short, long)]
    pub signal: Option<String>,
    /// Seconds before an instance is killed
    #[clap(short, long, default_value_t = 10)]
    pub timeout: u64,
    /// Stop instances of another user, root only
    #[clap(short, long)]
    pub user: Option<String>,
    /// Instance name or glob pattern
    pub name: Option<String>,
}

/// List running instances
#[derive(Parser, Debug)]
pub struct InstanceList {
    #[clap(short, long)]
    pub json: bool,
    /// Show log paths instead of images
    #[clap(short, long)]
    pub logs: bool,
    /// Include the shared namespace instances
    #[clap(short, long)]
    pub all: bool,
    #[clap(short, long)]
    pub user: Option<String>,
    /// Instance name or glob pattern
    pub name: Option<String>,
}

/// Show resource usage of an instance
#[derive(Parser, Debug)]
pub struct InstanceStats {
    #[clap(short, long)]
    pub json: bool,
    /// Print the figures once
    #[clap(long)]
    pub no_stream: bool,
    #[clap(short, long)]
    pub user: Option<String>,
    pub name: String,
}
