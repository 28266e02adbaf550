use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{InstanceError, InstanceRecord, InstanceStore, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOptions {
    pub signal: Signal,
    /// Send SIGKILL right away.
    pub force: bool,
    /// Time given to an instance before it is killed.
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            signal: Signal::SIGINT,
            force: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Parses a `--signal` value: a number, or a name with or without `SIG`.
pub fn parse_signal(value: &str) -> Option<Signal> {
    if let Ok(num) = value.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = value.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    name.parse().ok()
}

fn send(record: &InstanceRecord, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(record.pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(InstanceError::Signal {
            name: record.name.clone(),
            source,
        }),
    }
}

/// Stops every instance matching `pattern`. Returns the names of the
/// instances that stopped.
pub fn stop_instances(store: &InstanceStore, pattern: &str, opts: &StopOptions) -> Result<Vec<String>> {
    let records = store.list(pattern)?;
    if records.is_empty() {
        return Err(InstanceError::NoneMatched);
    }
    let signal = if opts.force { Signal::SIGKILL } else { opts.signal };
    for record in &records {
        tracing::debug!(pid = record.pid, ?signal, "stopping instance {}", record.name);
        send(record, signal)?;
    }

    let deadline = Instant::now() + opts.timeout;
    let mut pending: Vec<&InstanceRecord> = records.iter().collect();
    while !pending.is_empty() && Instant::now() < deadline {
        pending.retain(|r| r.is_alive());
        if !pending.is_empty() {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    for record in &pending {
        tracing::warn!("instance {} did not stop", record.name);
        send(record, Signal::SIGKILL)?;
    }

    let mut stopped = Vec::new();
    for record in &records {
        if pending.iter().any(|p| p.name == record.name) {
            continue;
        }
        if let Err(err) = store.delete(&record.name) {
            tracing::debug!(?err, "could not remove instance {}", record.name);
        }
        tracing::info!("Stopping {} instance of {} (PID={})", record.name, record.image, record.pid);
        stopped.push(record.name.clone());
    }
    Ok(stopped)
}
