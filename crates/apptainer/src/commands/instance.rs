//! `instance start|run|stop|list|stats`.
use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tabwriter::TabWriter;

use libapptainer::context::LaunchContext;
use libapptainer::engine_config::Action;
use libapptainer::instance::stats::{instance_stats, StatsSummary};
use libapptainer::instance::stop::{parse_signal, stop_instances, StopOptions};
use libapptainer::instance::{check_name, InstanceRecord, InstanceStore};
use libapptainer::privilege::hidepid_proc;
use libapptainer_cli::{InstanceList, InstanceStart, InstanceStats, InstanceStop};

use super::actions::{launch, launch_options, resolve_image};
use crate::observability::Verbosity;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Starts a named instance, `run` selects the runscript of `instance run`.
pub fn start(args: InstanceStart, ctx: &LaunchContext, verbosity: Verbosity, run: bool) -> Result<i32> {
    check_name(&args.name)?;
    let action = if run { Action::InstanceRun } else { Action::Start };
    let resolved = resolve_image(ctx, &args.opts, &args.image)?;
    let mut opts = launch_options(args.opts, action, &args.image, args.args);
    opts.image = resolved;
    opts.instance = Some(args.name);
    opts.pid_file = args.pid_file;
    launch(ctx, opts, verbosity)
}

/// Instances of `user`, only root may look at other users.
fn store_for(ctx: &LaunchContext, user: Option<&str>) -> Result<InstanceStore> {
    match user {
        Some(user) if user != ctx.username => {
            if ctx.uid != 0 {
                bail!("only root user can list user's instances");
            }
            Ok(ctx.instance_store_for(user))
        }
        _ => Ok(ctx.instance_store()),
    }
}

pub fn stop(args: InstanceStop, ctx: &LaunchContext) -> Result<()> {
    let pattern = match (&args.name, args.all) {
        (Some(name), false) => name.as_str(),
        (None, true) => "*",
        (Some(_), true) => bail!("an instance name can't be combined with --all"),
        (None, false) => bail!("an instance name or --all is required"),
    };
    let signal = match &args.signal {
        Some(value) => parse_signal(value).with_context(|| format!("invalid signal {value}"))?,
        None => StopOptions::default().signal,
    };
    let store = store_for(ctx, args.user.as_deref())?;
    let opts = StopOptions {
        signal,
        force: args.force,
        timeout: Duration::from_secs(args.timeout),
    };
    let stopped = stop_instances(&store, pattern, &opts)?;
    tracing::debug!(?stopped, "stopped instances");
    Ok(())
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ListedInstance {
    instance: String,
    pid: i32,
    img: String,
    ip: String,
    log_err_path: String,
    log_out_path: String,
}

impl From<&InstanceRecord> for ListedInstance {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance: record.name.clone(),
            pid: record.pid,
            img: record.image.clone(),
            ip: record.ip.clone(),
            log_err_path: record.log_err_path.display().to_string(),
            log_out_path: record.log_out_path.display().to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
struct Listing {
    instances: Vec<ListedInstance>,
}

fn render_list<W: Write>(out: W, records: &[InstanceRecord], logs: bool) -> Result<()> {
    let mut content = String::new();
    for record in records {
        if logs {
            let _ = writeln!(
                content,
                "{}\t{}\t{}\n\t\t{}",
                record.name,
                record.pid,
                record.log_out_path.display(),
                record.log_err_path.display()
            );
        } else {
            let _ = writeln!(content, "{}\t{}\t{}\t{}", record.name, record.pid, record.ip, record.image);
        }
    }

    let mut tab_writer = TabWriter::new(out);
    if logs {
        writeln!(&mut tab_writer, "INSTANCE NAME\tPID\tLOGS")?;
    } else {
        writeln!(&mut tab_writer, "INSTANCE NAME\tPID\tIP\tIMAGE")?;
    }
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    Ok(())
}

pub fn list(args: InstanceList, ctx: &LaunchContext) -> Result<()> {
    let store = store_for(ctx, args.user.as_deref())?;
    let pattern = args.name.as_deref().unwrap_or("*");
    let records: Vec<InstanceRecord> = store
        .list(pattern)?
        .into_iter()
        .filter(|r| args.all || !r.share_ns)
        .collect();

    if args.json {
        let listing = Listing {
            instances: records.iter().map(ListedInstance::from).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    render_list(io::stdout(), &records, args.logs)
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

fn render_stats<W: Write>(out: W, name: &str, summary: &StatsSummary) -> Result<()> {
    let mem_percent = if summary.memory_limit > 0 {
        summary.memory_usage as f64 * 100.0 / summary.memory_limit as f64
    } else {
        0.0
    };
    let pids_limit = if summary.pids_limit == 0 {
        "max".to_string()
    } else {
        summary.pids_limit.to_string()
    };
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "INSTANCE NAME\tCPU TIME\tMEM USAGE / LIMIT\tMEM %\tPIDS")?;
    writeln!(
        &mut tab_writer,
        "{}\t{:.2}s\t{} / {}\t{:.2}%\t{} / {}",
        name,
        summary.cpu_usage as f64 / 1e9,
        human_bytes(summary.memory_usage),
        human_bytes(summary.memory_limit),
        mem_percent,
        summary.pids_current,
        pids_limit
    )?;
    tab_writer.flush()?;
    Ok(())
}

pub fn stats(args: InstanceStats, ctx: &LaunchContext) -> Result<()> {
    let store = store_for(ctx, args.user.as_deref())?;
    let record = store.get(&args.name)?;
    let hidepid = hidepid_proc();

    loop {
        let stats = instance_stats(&record, hidepid)
            .with_context(|| format!("failed to read stats of instance {}", record.name))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            render_stats(io::stdout(), &record.name, &StatsSummary::from(&stats))?;
        }
        if args.no_stream || !record.is_alive() {
            return Ok(());
        }
        std::thread::sleep(STATS_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(name: &str, ip: &str) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            image: "/images/alpine.sif".to_string(),
            pid: 4242,
            user: "alice".to_string(),
            ip: ip.to_string(),
            user_ns: true,
            cgroup: false,
            fakeroot: false,
            share_ns: false,
            created: Utc::now(),
            log_out_path: PathBuf::from(format!("/logs/{name}.out")),
            log_err_path: PathBuf::from(format!("/logs/{name}.err")),
            checkpoint: None,
        }
    }

    #[test]
    fn test_render_list() -> Result<()> {
        let mut out = Vec::new();
        render_list(&mut out, &[record("web", "10.22.0.2"), record("db", "")], false)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("INSTANCE NAME"));
        assert!(lines[1].starts_with("web") && lines[1].contains("10.22.0.2"));
        assert!(lines[2].starts_with("db") && lines[2].ends_with("/images/alpine.sif"));
        Ok(())
    }

    #[test]
    fn test_render_logs() -> Result<()> {
        let mut out = Vec::new();
        render_list(&mut out, &[record("web", "")], true)?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("LOGS"));
        assert!(text.contains("/logs/web.out") && text.contains("/logs/web.err"));
        Ok(())
    }

    #[test]
    fn test_json_listing() -> Result<()> {
        let listing = Listing {
            instances: vec![ListedInstance::from(&record("web", "10.22.0.2"))],
        };
        let value: serde_json::Value = serde_json::to_value(&listing)?;
        let first = &value["instances"][0];
        assert_eq!(first["instance"], "web");
        assert_eq!(first["pid"], 4242);
        assert_eq!(first["img"], "/images/alpine.sif");
        assert_eq!(first["logErrPath"], "/logs/web.err");
        assert_eq!(first["logOutPath"], "/logs/web.out");
        Ok(())
    }

    #[test]
    fn test_render_stats() -> Result<()> {
        let summary = StatsSummary {
            cpu_usage: 1_500_000_000,
            memory_usage: 512 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
            pids_current: 3,
            pids_limit: 0,
        };
        let mut out = Vec::new();
        render_stats(&mut out, "web", &summary)?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("1.50s"));
        assert!(text.contains("512.00MiB / 1.00GiB"));
        assert!(text.contains("50.00%"));
        assert!(text.contains("3 / max"));
        Ok(())
    }
}
