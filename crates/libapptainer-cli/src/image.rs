//! Commands producing or publishing images.
use std::path::PathBuf;

use clap::builder::FalseyValueParser;
use clap::Parser;

use crate::actions::PullAuthOpts;

/// Pull an image from a URI
#[derive(Parser, Debug)]
pub struct Pull {
    /// Overwrite an existing destination
    #[clap(short = 'F', long, env = "APPTAINER_PULL_FORCE", value_parser = FalseyValueParser::new())]
    pub force: bool,
    /// Extract the image to a sandbox directory
    #[clap(long)]
    pub sandbox: bool,
    #[clap(long, env = "APPTAINER_DISABLE_CACHE", value_parser = FalseyValueParser::new())]
    pub disable_cache: bool,
    #[clap(flatten)]
    pub auth: PullAuthOpts,
    /// Destination followed by the source, or the source alone
    #[clap(num_args = 1..=2, required = true)]
    pub uris: Vec<String>,
}

impl Pull {
    /// Splits the positional arguments into destination and source.
    pub fn dest_and_source(&self) -> (Option<PathBuf>, &str) {
        match self.uris.as_slice() {
            [dest, source] => (Some(PathBuf::from(dest)), source.as_str()),
            [source] => (None, source.as_str()),
            _ => (None, ""),
        }
    }
}

/// Upload an image to a library or an OCI registry
#[derive(Parser, Debug)]
pub struct Push {
    /// Library description of the image
    #[clap(short = 'D', long, default_value = "")]
    pub description: String,
    #[clap(long, env = "APPTAINER_LIBRARY")]
    pub library: Option<String>,
    #[clap(long, env = "APPTAINER_AUTHFILE")]
    pub authfile: Option<PathBuf>,
    pub file: PathBuf,
    pub uri: String,
}

/// Build an image from a definition file or another image
#[derive(Parser, Debug)]
pub struct Build {
    #[clap(short, long, env = "APPTAINER_FAKEROOT", value_parser = FalseyValueParser::new())]
    pub fakeroot: bool,
    #[clap(long, env = "APPTAINER_USERNS", value_parser = FalseyValueParser::new())]
    pub userns: bool,
    #[clap(long)]
    pub ignore_subuid: bool,
    #[clap(long)]
    pub ignore_fakeroot_command: bool,
    #[clap(long)]
    pub ignore_userns: bool,
    #[clap(short, long)]
    pub sandbox: bool,
    /// Run the definition over an existing sandbox
    #[clap(short, long)]
    pub update: bool,
    #[clap(short = 'F', long)]
    pub force: bool,
    /// Sections of the definition to run
    #[clap(long, value_delimiter = ',', default_value = "all")]
    pub section: Vec<String>,
    #[clap(short = 'T', long)]
    pub notest: bool,
    #[clap(long)]
    pub no_cleanup: bool,
    #[clap(long)]
    pub fix_perms: bool,
    /// Encrypt the squashfs filesystem
    #[clap(short, long)]
    pub encrypt: bool,
    #[clap(long, env = "APPTAINER_ENCRYPTION_PEM_PATH")]
    pub pem_path: Option<PathBuf>,
    #[clap(long)]
    pub passphrase: bool,
    /// Definition variable, KEY=VALUE
    #[clap(long)]
    pub build_arg: Vec<String>,
    #[clap(long)]
    pub build_arg_file: Option<PathBuf>,
    #[clap(long, env = "APPTAINER_NV", value_parser = FalseyValueParser::new())]
    pub nv: bool,
    #[clap(long, env = "APPTAINER_NVCCLI", value_parser = FalseyValueParser::new())]
    pub nvccli: bool,
    #[clap(long, env = "APPTAINER_ROCM", value_parser = FalseyValueParser::new())]
    pub rocm: bool,
    #[clap(short = 'B', long, env = "APPTAINER_BINDPATH", value_delimiter = ',')]
    pub bind: Vec<String>,
    #[clap(long, env = "APPTAINER_MOUNT")]
    pub mount: Vec<String>,
    #[clap(long, env = "APPTAINER_WRITABLE_TMPFS", value_parser = FalseyValueParser::new())]
    pub writable_tmpfs: bool,
    #[clap(long, env = "APPTAINER_DISABLE_CACHE", value_parser = FalseyValueParser::new())]
    pub disable_cache: bool,
    pub dest: String,
    pub spec: String,
}
