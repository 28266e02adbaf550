use std::path::PathBuf;

use libcgroups::common::{create_cgroup_manager, CgroupConfig, CgroupManager};
use libcgroups::stats::Stats;
use serde::Serialize;

use super::{InstanceError, InstanceRecord, Result};

/// The figures shown by `instance stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    /// Total CPU time in nanoseconds.
    pub cpu_usage: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub pids_current: u64,
    /// 0 when unlimited.
    pub pids_limit: u64,
}

impl From<&Stats> for StatsSummary {
    fn from(stats: &Stats) -> Self {
        Self {
            cpu_usage: stats.cpu.usage.usage_total,
            memory_usage: stats.memory.memory.usage,
            memory_limit: stats.memory.memory.limit,
            pids_current: stats.pids.current,
            pids_limit: stats.pids.limit,
        }
    }
}

/// Refuses records whose cgroup can't be read.
pub fn check_stats_allowed(record: &InstanceRecord, hidepid: bool) -> Result<()> {
    if record.fakeroot {
        return Err(InstanceError::StatsFakeroot);
    }
    if hidepid {
        return Err(InstanceError::StatsHidepid);
    }
    if !record.cgroup {
        return Err(InstanceError::NoCgroup(record.name.clone()));
    }
    Ok(())
}

/// Cgroup path of `pid`, relative to the cgroup root. On cgroup v1 the
/// `pids` hierarchy is used.
fn cgroup_path(pid: i32) -> Result<PathBuf> {
    let cgroups = procfs::process::Process::new(pid)
        .and_then(|p| p.cgroups())
        .map_err(|err| InstanceError::Cgroup(err.to_string()))?;
    let entries = cgroups.0;
    let entry = entries
        .iter()
        .find(|c| c.hierarchy == 0 && c.controllers.is_empty())
        .or_else(|| entries.iter().find(|c| c.controllers.iter().any(|n| n == "pids")))
        .ok_or_else(|| InstanceError::Cgroup(format!("no cgroup found for pid {pid}")))?;
    Ok(PathBuf::from(&entry.pathname))
}

/// Reads the raw cgroup statistics of an instance.
#[tracing::instrument(level = "trace", skip(record), fields(name = %record.name))]
pub fn instance_stats(record: &InstanceRecord, hidepid: bool) -> Result<Stats> {
    check_stats_allowed(record, hidepid)?;
    let path = cgroup_path(record.pid)?;
    tracing::debug!(?path, pid = record.pid, "reading instance cgroup");
    let manager = create_cgroup_manager(CgroupConfig {
        cgroup_path: path,
        systemd_cgroup: false,
        container_name: record.name.clone(),
    })
    .map_err(|err| InstanceError::Cgroup(err.to_string()))?;
    manager
        .stats()
        .map_err(|err| InstanceError::Cgroup(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::record;
    use crate::instance::InstanceStore;
    use anyhow::Result;

    #[test]
    fn test_stats_refused() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = InstanceStore::new(tmp.path(), "node1", "alice");
        let mut rec = record(&store, "web", 1);

        assert!(matches!(
            check_stats_allowed(&rec, false),
            Err(InstanceError::NoCgroup(_))
        ));
        rec.cgroup = true;
        assert!(matches!(check_stats_allowed(&rec, true), Err(InstanceError::StatsHidepid)));
        rec.fakeroot = true;
        assert!(matches!(check_stats_allowed(&rec, false), Err(InstanceError::StatsFakeroot)));
        rec.fakeroot = false;
        check_stats_allowed(&rec, false)?;
        Ok(())
    }

    #[test]
    fn test_summary() {
        let mut stats = Stats::default();
        stats.cpu.usage.usage_total = 42;
        stats.memory.memory.usage = 1024;
        stats.memory.memory.limit = 4096;
        stats.pids.current = 3;
        let summary = StatsSummary::from(&stats);
        assert_eq!(summary.cpu_usage, 42);
        assert_eq!((summary.memory_usage, summary.memory_limit), (1024, 4096));
        assert_eq!((summary.pids_current, summary.pids_limit), (3, 0));
    }

    #[test]
    fn test_own_cgroup_path() -> Result<()> {
        let path = cgroup_path(std::process::id() as i32)?;
        assert!(path.is_absolute());
        Ok(())
    }
}
