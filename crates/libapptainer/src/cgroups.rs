//! Cgroups resource limits from the limit flags or a TOML file, and the
//! cgroup arrangement of instances.

use std::path::{Path, PathBuf};

use libcgroups::common::CgroupSetup;
use nix::sys::stat::{lstat, major, minor, SFlag};
use oci_spec::runtime::{
    LinuxBlockIoBuilder, LinuxCpuBuilder, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResources,
    LinuxResourcesBuilder, LinuxWeightDevice, LinuxWeightDeviceBuilder,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// CFS period used for `--cpus`, 100ms in microseconds.
pub const CPU_PERIOD: u64 = 100_000;
const NANO: u64 = 1_000_000_000;

static RAM_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([kKmMgGtTpP])?[iI]?[bB]?$").unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum CgroupsError {
    #[error("cannot apply a cgroups TOML file while using limit flags")]
    FileAndFlags,
    #[error("blkio-weight must be in range 10-1000")]
    BlkioWeight,
    #[error("blkio-weight-device specifications must be in <device>:<weight> format")]
    DeviceWeightFormat,
    #[error("{0} is not a valid device weight")]
    DeviceWeightValue(String),
    #[error("while examining device {path:?}")]
    Device {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("{0:?} is not a device")]
    NotADevice(PathBuf),
    #[error("invalid cpus value: {0}")]
    CpusValue(String),
    #[error("cpus value must be in range 0.01 - {0}")]
    CpusRange(usize),
    #[error("invalid {flag} value: {value}")]
    Memory { flag: &'static str, value: String },
    #[error("invalid pids-limit: {0}")]
    PidsLimit(i64),
    #[error("could not read cgroups file {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid cgroups file {path:?}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Instances do not currently support rootless cgroups")]
    RootlessInstance,
    #[error("rootless cgroups require cgroups v2 with systemd as cgroups manager")]
    RootlessUnsupported,
    #[error("building cgroups resources")]
    Spec(#[from] oci_spec::OciSpecError),
}

type Result<T> = std::result::Result<T, CgroupsError>;

/// Resource limit flags. Zero and empty values mean unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitFlags {
    pub blkio_weight: i64,
    pub blkio_weight_device: Vec<String>,
    pub cpu_shares: i64,
    pub cpus: Option<String>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory: Option<String>,
    pub memory_reservation: Option<String>,
    pub memory_swap: Option<String>,
    pub oom_kill_disable: bool,
    pub pids_limit: i64,
}

/// Parses a memory size like `512M` or `1.5g` in bytes, binary multiples.
pub fn ram_in_bytes(value: &str) -> Option<i64> {
    let caps = RAM_SIZE.captures(value.trim())?;
    let number: f64 = caps[1].parse().ok()?;
    let mult: f64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1.0,
        Some(u) => match u.as_str() {
            "k" => 1024.0,
            "m" => 1024f64.powi(2),
            "g" => 1024f64.powi(3),
            "t" => 1024f64.powi(4),
            "p" => 1024f64.powi(5),
            _ => return None,
        },
    };
    let bytes = number * mult;
    (bytes <= i64::MAX as f64).then_some(bytes as i64)
}

/// Exact decimal CPU count in nano CPUs, at most 9 fractional digits.
fn nano_cpus(value: &str) -> Option<u64> {
    let (int, frac) = match value.split_once('.') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    if (int.is_empty() && frac.is_empty())
        || !int.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let int: u64 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let mut frac_nanos = 0u64;
    for (i, c) in frac.chars().take(9).enumerate() {
        frac_nanos += (c as u64 - '0' as u64) * 10u64.pow(8 - i as u32);
    }
    int.checked_mul(NANO)?.checked_add(frac_nanos)
}

fn device_major_minor(path: &Path) -> Result<(i64, i64)> {
    let stat = lstat(path).map_err(|source| CgroupsError::Device {
        path: path.to_path_buf(),
        source,
    })?;
    let kind = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;
    if kind != SFlag::S_IFBLK && kind != SFlag::S_IFCHR {
        return Err(CgroupsError::NotADevice(path.to_path_buf()));
    }
    Ok((major(stat.st_rdev) as i64, minor(stat.st_rdev) as i64))
}

fn check_weight(weight: i64) -> Result<u16> {
    if !(10..=1000).contains(&weight) {
        return Err(CgroupsError::BlkioWeight);
    }
    Ok(weight as u16)
}

fn memory_value(flag: &'static str, value: &str) -> Result<i64> {
    ram_in_bytes(value).ok_or_else(|| CgroupsError::Memory {
        flag,
        value: value.to_string(),
    })
}

impl LimitFlags {
    /// Converts the flags into resources, `None` when no flag is set.
    pub fn to_resources(&self, num_cpu: usize) -> Result<Option<LinuxResources>> {
        let mut resources = LinuxResourcesBuilder::default();
        let mut configured = false;

        let mut weight_devices: Vec<LinuxWeightDevice> = Vec::new();
        for spec in &self.blkio_weight_device {
            let (dev, weight) = spec.split_once(':').ok_or(CgroupsError::DeviceWeightFormat)?;
            let (major, minor) = device_major_minor(Path::new(dev))?;
            let weight: i64 = weight
                .parse()
                .map_err(|_| CgroupsError::DeviceWeightValue(weight.to_string()))?;
            weight_devices.push(
                LinuxWeightDeviceBuilder::default()
                    .major(major)
                    .minor(minor)
                    .weight(check_weight(weight)?)
                    .build()?,
            );
        }
        if self.blkio_weight != 0 || !weight_devices.is_empty() {
            let mut blkio = LinuxBlockIoBuilder::default();
            if self.blkio_weight != 0 {
                blkio = blkio.weight(check_weight(self.blkio_weight)?);
            }
            if !weight_devices.is_empty() {
                blkio = blkio.weight_device(weight_devices);
            }
            resources = resources.block_io(blkio.build()?);
            configured = true;
        }

        let mut cpu = LinuxCpuBuilder::default();
        let mut cpu_set = false;
        if self.cpu_shares > 0 {
            cpu = cpu.shares(self.cpu_shares as u64);
            cpu_set = true;
        }
        if let Some(cpus) = &self.cpuset_cpus {
            cpu = cpu.cpus(cpus.clone());
            cpu_set = true;
        }
        if let Some(mems) = &self.cpuset_mems {
            cpu = cpu.mems(mems.clone());
            cpu_set = true;
        }
        if let Some(cpus) = &self.cpus {
            let nanos = nano_cpus(cpus).ok_or_else(|| CgroupsError::CpusValue(cpus.clone()))?;
            if nanos < NANO / 100 || nanos > num_cpu as u64 * NANO {
                return Err(CgroupsError::CpusRange(num_cpu));
            }
            let quota = (nanos as u128 * CPU_PERIOD as u128 / NANO as u128) as i64;
            cpu = cpu.period(CPU_PERIOD).quota(quota);
            cpu_set = true;
        }
        if cpu_set {
            resources = resources.cpu(cpu.build()?);
            configured = true;
        }

        let mut memory = LinuxMemoryBuilder::default();
        let mut memory_set = false;
        if let Some(v) = &self.memory {
            memory = memory.limit(memory_value("memory", v)?);
            memory_set = true;
        }
        if let Some(v) = &self.memory_reservation {
            memory = memory.reservation(memory_value("memory-reservation", v)?);
            memory_set = true;
        }
        if let Some(v) = &self.memory_swap {
            // -1 is unlimited swap
            let swap = if v == "-1" { -1 } else { memory_value("memory-swap", v)? };
            memory = memory.swap(swap);
            memory_set = true;
        }
        if self.oom_kill_disable {
            memory = memory.disable_oom_killer(true);
            memory_set = true;
        }
        if memory_set {
            resources = resources.memory(memory.build()?);
            configured = true;
        }

        if self.pids_limit < -1 {
            return Err(CgroupsError::PidsLimit(self.pids_limit));
        }
        if self.pids_limit != 0 {
            resources = resources.pids(LinuxPidsBuilder::default().limit(self.pids_limit).build()?);
            configured = true;
        }

        if !configured {
            return Ok(None);
        }
        Ok(Some(resources.build()?))
    }
}

/// Loads an `--apply-cgroups` TOML file.
pub fn load_toml(path: &Path) -> Result<LinuxResources> {
    let content = std::fs::read_to_string(path).map_err(|source| CgroupsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| CgroupsError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

/// Resources requested with the limit flags or a TOML file, never both.
pub fn requested_resources(
    flags: &LimitFlags,
    toml_file: Option<&Path>,
    num_cpu: usize,
) -> Result<Option<LinuxResources>> {
    let from_flags = flags.to_resources(num_cpu)?;
    match (from_flags, toml_file) {
        (Some(_), Some(_)) => Err(CgroupsError::FileAndFlags),
        (Some(r), None) => Ok(Some(r)),
        (None, Some(path)) => load_toml(path).map(Some),
        (None, None) => Ok(None),
    }
}

/// Host state relevant to cgroup placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHost {
    pub uid: u32,
    pub unprivileged: bool,
    pub unified: bool,
    pub systemd_cgroups: bool,
    pub hidepid: bool,
    pub xdg_runtime_dir: Option<String>,
    pub dbus_session_bus_address: Option<String>,
}

impl CgroupHost {
    pub fn probe(uid: u32, systemd_cgroups: bool, hidepid: bool) -> Self {
        let unified = matches!(libcgroups::common::get_cgroup_setup(), Ok(CgroupSetup::Unified));
        Self {
            uid,
            unprivileged: crate::utils::is_in_new_userns(),
            unified,
            systemd_cgroups,
            hidepid,
            xdg_runtime_dir: std::env::var("XDG_RUNTIME_DIR").ok().filter(|v| !v.is_empty()),
            dbus_session_bus_address: std::env::var("DBUS_SESSION_BUS_ADDRESS")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Cgroups section of the engine config.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CgroupPlan {
    /// Resources applied to the container cgroup. An empty document still
    /// places an instance in its own cgroup for stats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xdg_runtime_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbus_session_bus_address: Option<String>,
}

/// Decides the cgroups arrangement of a run.
pub fn plan_cgroups(
    requested: Option<LinuxResources>,
    host: &CgroupHost,
    instance: bool,
    fakeroot: bool,
    sharens: bool,
) -> Result<CgroupPlan> {
    let mut plan = CgroupPlan::default();
    let rootless_systemd = host.unified && host.systemd_cgroups && !host.unprivileged;
    if host.uid != 0 {
        tracing::debug!("Recording rootless XDG_RUNTIME_DIR / DBUS_SESSION_BUS_ADDRESS");
        plan.xdg_runtime_dir = host.xdg_runtime_dir.clone();
        plan.dbus_session_bus_address = host.dbus_session_bus_address.clone();
    }

    if let Some(resources) = requested {
        if host.uid != 0 {
            if instance {
                return Err(CgroupsError::RootlessInstance);
            }
            if !rootless_systemd {
                return Err(CgroupsError::RootlessUnsupported);
            }
        }
        plan.resources = Some(resources);
        return Ok(plan);
    }
    if !instance {
        return Ok(plan);
    }

    // instances get a cgroup when possible so stats work
    let mut use_cg = host.uid == 0 && !host.unprivileged;
    if !use_cg && rootless_systemd && !fakeroot && !host.hidepid {
        if host.xdg_runtime_dir.is_none() || host.dbus_session_bus_address.is_none() {
            tracing::info!("Instance stats will not be available because XDG_RUNTIME_DIR");
            tracing::info!("  or DBUS_SESSION_BUS_ADDRESS is not set");
            return Ok(plan);
        }
        use_cg = true;
    }
    if use_cg {
        tracing::debug!("Using cgroup manager during setting cgroups configuration");
        plan.resources = Some(LinuxResources::default());
    } else if fakeroot {
        tracing::debug!("Instance stats will not be available because of fakeroot mode");
    } else if host.hidepid {
        tracing::debug!("Instance stats will not be available because of hidepid option is set on /proc mount");
    } else if sharens {
        tracing::debug!("Instance stats will not be available - requires cgroups v2 with systemd as manager.");
    } else {
        tracing::info!("Instance stats will not be available - requires cgroups v2 with systemd as manager.");
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn cpus(v: &str) -> LimitFlags {
        LimitFlags {
            cpus: Some(v.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpus_quota() -> Result<()> {
        let res = cpus("0.5").to_resources(4)?.expect("cpu configured");
        let cpu = res.cpu().as_ref().expect("cpu");
        assert_eq!(cpu.quota(), Some(50000));
        assert_eq!(cpu.period(), Some(100000));
        Ok(())
    }

    #[test]
    fn test_cpus_bounds() {
        assert!(cpus("0.01").to_resources(4).is_ok());
        assert!(matches!(
            cpus("0.009").to_resources(4),
            Err(CgroupsError::CpusRange(4))
        ));
        assert!(cpus("4").to_resources(4).is_ok());
        assert!(matches!(cpus("4.01").to_resources(4), Err(CgroupsError::CpusRange(4))));
        assert!(matches!(cpus("abc").to_resources(4), Err(CgroupsError::CpusValue(_))));
    }

    #[test]
    fn test_blkio_weight_bounds() {
        let w = |v| LimitFlags {
            blkio_weight: v,
            ..Default::default()
        };
        assert!(w(10).to_resources(1).is_ok());
        assert!(w(1000).to_resources(1).is_ok());
        assert!(matches!(w(9).to_resources(1), Err(CgroupsError::BlkioWeight)));
        assert!(matches!(w(1001).to_resources(1), Err(CgroupsError::BlkioWeight)));
    }

    #[test]
    fn test_device_weight_needs_device() -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let flags = LimitFlags {
            blkio_weight_device: vec![format!("{}:100", tmp.path().display())],
            ..Default::default()
        };
        assert!(matches!(flags.to_resources(1), Err(CgroupsError::NotADevice(_))));
        let flags = LimitFlags {
            blkio_weight_device: vec!["/dev/null".to_string()],
            ..Default::default()
        };
        assert!(matches!(flags.to_resources(1), Err(CgroupsError::DeviceWeightFormat)));
        Ok(())
    }

    #[test]
    fn test_memory() -> Result<()> {
        assert_eq!(ram_in_bytes("1024"), Some(1024));
        assert_eq!(ram_in_bytes("512M"), Some(512 * 1024 * 1024));
        assert_eq!(ram_in_bytes("1.5g"), Some(1610612736));
        assert_eq!(ram_in_bytes("2kb"), Some(2048));
        assert_eq!(ram_in_bytes("-1"), None);

        let flags = LimitFlags {
            memory: Some("1G".into()),
            memory_swap: Some("-1".into()),
            ..Default::default()
        };
        let res = flags.to_resources(1)?.expect("memory configured");
        let mem = res.memory().as_ref().expect("memory");
        assert_eq!(mem.limit(), Some(1 << 30));
        assert_eq!(mem.swap(), Some(-1));

        let bad = LimitFlags {
            memory: Some("-1".into()),
            ..Default::default()
        };
        assert!(matches!(bad.to_resources(1), Err(CgroupsError::Memory { flag: "memory", .. })));
        Ok(())
    }

    #[test]
    fn test_pids() -> Result<()> {
        let p = |v| LimitFlags {
            pids_limit: v,
            ..Default::default()
        };
        assert!(p(-1).to_resources(1)?.is_some());
        assert!(p(0).to_resources(1)?.is_none());
        assert!(matches!(p(-2).to_resources(1), Err(CgroupsError::PidsLimit(-2))));
        Ok(())
    }

    #[test]
    fn test_file_and_flags_exclusive() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("cgroups.toml");
        std::fs::write(&file, "[memory]\nlimit = 1073741824\n")?;
        assert!(matches!(
            requested_resources(&cpus("1"), Some(&file), 2),
            Err(CgroupsError::FileAndFlags)
        ));
        let res = requested_resources(&LimitFlags::default(), Some(&file), 2)?.expect("file");
        assert_eq!(res.memory().as_ref().and_then(|m| m.limit()), Some(1073741824));
        assert!(requested_resources(&LimitFlags::default(), None, 2)?.is_none());
        Ok(())
    }

    fn host(uid: u32) -> CgroupHost {
        CgroupHost {
            uid,
            unprivileged: false,
            unified: true,
            systemd_cgroups: true,
            hidepid: false,
            xdg_runtime_dir: Some("/run/user/1000".into()),
            dbus_session_bus_address: Some("unix:path=/run/user/1000/bus".into()),
        }
    }

    #[test]
    fn test_plan_cgroups() -> Result<()> {
        let limits = cpus("1").to_resources(2)?;
        assert!(matches!(
            plan_cgroups(limits.clone(), &host(1000), true, false, false),
            Err(CgroupsError::RootlessInstance)
        ));
        let plan = plan_cgroups(limits, &host(1000), false, false, false)?;
        assert!(plan.resources.is_some());
        assert_eq!(plan.xdg_runtime_dir.as_deref(), Some("/run/user/1000"));

        // instances get an empty cgroup for stats
        let plan = plan_cgroups(None, &host(0), true, false, false)?;
        assert_eq!(plan.resources, Some(LinuxResources::default()));
        let plan = plan_cgroups(None, &host(1000), true, true, false)?;
        assert!(plan.resources.is_none());
        let v1 = CgroupHost {
            unified: false,
            ..host(1000)
        };
        assert!(matches!(
            plan_cgroups(cpus("1").to_resources(2)?, &v1, false, false, false),
            Err(CgroupsError::RootlessUnsupported)
        ));
        Ok(())
    }
}
