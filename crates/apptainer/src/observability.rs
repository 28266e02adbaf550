use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";
const SYSLOG_IDENTIFIER: &str = "apptainer";

enum LogFormat {
    Text,
    Json,
}

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

/// Verbosity selected by the global flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Silent,
    Quiet,
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn from_flags(debug: bool, verbose: bool, quiet: bool, silent: bool) -> Self {
        if debug {
            Verbosity::Debug
        } else if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else if silent {
            Verbosity::Silent
        } else {
            Verbosity::Normal
        }
    }

    /// Value exported to the starter as `APPTAINER_MESSAGELEVEL`.
    pub fn message_level(self) -> i32 {
        match self {
            Verbosity::Silent => -3,
            Verbosity::Quiet => -1,
            Verbosity::Normal => 1,
            Verbosity::Verbose => 4,
            Verbosity::Debug => 5,
        }
    }

    fn level(self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::OFF,
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::WARN,
            Verbosity::Verbose => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }
}

fn detect_log_level(input: Option<&str>, verbosity: Verbosity) -> Result<LevelFilter> {
    // `log-level` takes precedence over the verbosity flags
    match input {
        None => Ok(verbosity.level()),
        Some(level) => Ok(LevelFilter::from_str(level)?),
    }
}

#[derive(Debug)]
pub struct ObservabilityConfig {
    pub verbosity: Verbosity,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub nocolor: bool,
    pub syslog: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Normal,
            log_level: None,
            log_file: None,
            log_format: None,
            nocolor: false,
            syslog: false,
        }
    }
}

impl From<&crate::Opts> for ObservabilityConfig {
    fn from(opts: &crate::Opts) -> Self {
        let global = &opts.global;
        Self {
            verbosity: Verbosity::from_flags(global.debug, global.verbose, global.quiet, global.silent),
            log_level: global.log_level.to_owned(),
            log_file: global.log_file.to_owned(),
            log_format: global.log_format.to_owned(),
            nocolor: global.nocolor,
            syslog: global.syslog,
        }
    }
}

pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let log_level_filter = detect_log_level(config.log_level.as_deref(), config.verbosity)
        .with_context(|| "failed to parse log level")?;
    let log_format = detect_log_format(config.log_format.as_deref())
        .with_context(|| "failed to detect log format")?;

    let systemd_journald = if config.syslog {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string())),
            Err(err) => {
                // journald may be missing, e.g. inside containers
                eprintln!("failed to initialize syslog logging: {:?}", err);
                None
            }
        }
    } else {
        None
    };
    let subscriber = tracing_subscriber::registry()
        .with(log_level_filter)
        .with(systemd_journald);

    match (config.log_file.as_ref(), log_format) {
        (None, LogFormat::Text) => {
            let ansi = !config.nocolor && std::io::stderr().is_terminal();
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_target(false)
                        .with_ansi(ansi)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (None, LogFormat::Json) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (Some(path), LogFormat::Text) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| "failed to open log file")?;
            subscriber
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| "failed to open log file")?;
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
    }

    Ok(())
}
