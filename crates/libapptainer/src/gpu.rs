//! NVIDIA and ROCm GPU setup.
//!
//! With `nvidia-container-cli` the starter does the work and only needs the
//! `NVIDIA_*` environment. The legacy flow binds the host libraries and
//! binaries listed in `nvliblist.conf`/`rocmliblist.conf`.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::paths::InstallPaths;

const BOUND_LIBS_DIR: &str = "/.singularity.d/libs";
const PERSISTENCED_SOCKET: &str = "/var/run/nvidia-persistenced/socket";

static LDCONFIG_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(.*)\s*\(.*\)\s*=>\s*(.*)$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("could not read {path:?}")]
    LibList {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not execute ldconfig")]
    Ldconfig(#[source] std::io::Error),
    #[error("--fakeroot does not support --nvccli in set-uid installations")]
    FakerootNvccli,
}

type Result<T> = std::result::Result<T, GpuError>;

/// Reads a GPU library list: one entry per line, `#` comments.
pub fn gpu_lib_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|source| GpuError::LibList {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Parses `ldconfig -p` output, keeping the first path of each library.
pub fn parse_ld_cache(output: &str) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut cache = Vec::new();
    for cap in LDCONFIG_LINE.captures_iter(output) {
        let name = cap[1].trim().to_string();
        let path = cap[2].trim().to_string();
        if seen.insert(name.clone()) {
            cache.push((name, path));
        }
    }
    cache
}

fn ld_cache() -> Result<Vec<(String, String)>> {
    let ldconfig = which::which("ldconfig").unwrap_or_else(|_| PathBuf::from("/sbin/ldconfig"));
    let out = Command::new(ldconfig)
        .arg("-p")
        .output()
        .map_err(GpuError::Ldconfig)?;
    Ok(parse_ld_cache(&String::from_utf8_lossy(&out.stdout)))
}

/// ELF `e_machine` of a file, `None` when it is not an ELF object.
fn elf_machine(path: &Path) -> Option<u16> {
    let mut header = [0u8; 20];
    fs::File::open(path).ok()?.read_exact(&mut header).ok()?;
    if &header[..4] != b"\x7fELF" {
        return None;
    }
    // EI_DATA 1 is little endian
    let bytes = [header[18], header[19]];
    Some(if header[5] == 1 {
        u16::from_le_bytes(bytes)
    } else {
        u16::from_be_bytes(bytes)
    })
}

/// Versioned symlinks next to `lib` that resolve to it.
fn so_links(lib: &Path) -> Vec<PathBuf> {
    let lib_str = lib.to_string_lossy();
    let Some(idx) = lib_str.find(".so") else {
        return Vec::new();
    };
    let bare = &lib_str[..idx + 3];
    let (Some(dir), Some(stem)) = (Path::new(bare).parent(), Path::new(bare).file_name()) else {
        return Vec::new();
    };
    let stem = stem.to_string_lossy().into_owned();
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut links: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(&stem))
        .map(|e| e.path())
        .filter(|p| p.is_symlink() && fs::canonicalize(p).ok().as_deref() == Some(lib))
        .collect();
    links.sort();
    links
}

/// Libraries and binaries found on the host for a GPU platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuFiles {
    pub libs: Vec<String>,
    pub bins: Vec<String>,
    pub ipcs: Vec<String>,
}

/// Host lookups the GPU setup depends on.
pub trait GpuProbe {
    fn resolve(&self, list: &[String]) -> Result<GpuFiles>;
    fn nvidia_ipcs(&self) -> Vec<String>;
}

/// Probes the running host with `ldconfig -p` and `$PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostGpuProbe;

impl GpuProbe for HostGpuProbe {
    fn resolve(&self, list: &[String]) -> Result<GpuFiles> {
        let machine = elf_machine(Path::new("/proc/self/exe"));
        let cache = ld_cache()?;
        let mut files = GpuFiles::default();
        let mut lib_names = HashSet::new();
        let mut bins = HashSet::new();

        // libraries bound by a parent container are inherited
        if let Ok(entries) = fs::read_dir(BOUND_LIBS_DIR) {
            for entry in entries.flatten() {
                lib_names.insert(entry.file_name().to_string_lossy().into_owned());
                files.libs.push(entry.path().to_string_lossy().into_owned());
            }
        }

        for file in list {
            if file.contains(".so") {
                let path = Path::new(file);
                if path.is_absolute() {
                    if elf_machine(path).is_some() && elf_machine(path) == machine {
                        files.libs.push(file.clone());
                        files
                            .libs
                            .extend(so_links(path).iter().map(|p| p.to_string_lossy().into_owned()));
                    } else {
                        tracing::debug!("ignoring library {file}");
                    }
                    continue;
                }
                for (name, lib_path) in cache.iter().filter(|(n, _)| n.starts_with(file.as_str())) {
                    if lib_names.contains(name) {
                        continue;
                    }
                    if elf_machine(Path::new(lib_path)) == machine {
                        lib_names.insert(name.clone());
                        files.libs.push(lib_path.clone());
                    }
                }
            } else if let Ok(bin) = which::which(file) {
                let bin = bin.to_string_lossy().into_owned();
                if bins.insert(bin.clone()) {
                    files.bins.push(bin);
                }
            }
        }
        Ok(files)
    }

    fn nvidia_ipcs(&self) -> Vec<String> {
        if Path::new(PERSISTENCED_SOCKET).exists() {
            vec![PERSISTENCED_SOCKET.to_string()]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuRequest {
    pub nv: bool,
    pub nvccli: bool,
    pub rocm: bool,
    pub no_nv: bool,
    pub no_rocm: bool,
    pub contain: bool,
    pub writable: bool,
    pub writable_tmpfs: bool,
}

/// GPU section of the engine config.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GpuPlan {
    pub nv_legacy: bool,
    pub nvccli: bool,
    pub nvccli_env: Vec<String>,
    pub rocm: bool,
    /// `src:dst` file binds, binaries land in `/usr/bin`.
    pub files: Vec<String>,
    pub libs: Vec<String>,
    /// nvidia-container-cli needs a writable overlay.
    pub force_writable_tmpfs: bool,
    /// Host environment additions, e.g. `NVIDIA_VISIBLE_DEVICES`.
    pub host_env: Vec<(String, String)>,
}

impl GpuPlan {
    fn add_binds(&mut self, files: GpuFiles, platform: &str, writable: bool) {
        if files.bins.is_empty() && files.ipcs.is_empty() {
            tracing::warn!("Could not find any {platform} files on this host!");
        } else {
            if writable {
                tracing::warn!("{platform} files may not be bound with --writable");
            }
            for bin in files.bins {
                let name = Path::new(&bin)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.files.push(format!("{bin}:/usr/bin/{name}"));
            }
            self.files.extend(files.ipcs);
        }
        if files.libs.is_empty() {
            tracing::warn!("Could not find any {platform} libraries on this host!");
        } else {
            self.libs.extend(files.libs);
        }
    }
}

/// Computes the GPU setup. `host_env` is the current process environment.
pub fn plan_gpu(
    req: &GpuRequest,
    admin: &crate::admin_config::AdminConfig,
    paths: &InstallPaths,
    host_env: &[(String, String)],
    setuid_fakeroot: bool,
    probe: &dyn GpuProbe,
) -> Result<GpuPlan> {
    let mut plan = GpuPlan::default();
    let mut nv = req.nv;
    let mut rocm = req.rocm;
    if admin.always_use_nv && !req.no_nv {
        nv = true;
        tracing::info!("'always use nv = yes' found in apptainer.conf");
    }
    if admin.always_use_rocm && !req.no_rocm {
        rocm = true;
        tracing::info!("'always use rocm = yes' found in apptainer.conf");
    }
    if req.nvccli && !nv {
        tracing::debug!("implying --nv from --nvccli");
        nv = true;
    }

    if rocm {
        tracing::debug!("Using rocm GPU setup");
        plan.rocm = true;
        let files = gpu_lib_list(&paths.rocmliblist())
            .and_then(|list| probe.resolve(&list))
            .unwrap_or_else(|err| {
                tracing::warn!("While finding ROCm bind points: {err}");
                GpuFiles::default()
            });
        plan.add_binds(files, "rocm", req.writable);
    }

    if !nv {
        return Ok(plan);
    }
    if !admin.use_nvidia_container_cli && !req.nvccli {
        tracing::debug!("Using legacy binds for nv GPU setup");
        plan.nv_legacy = true;
        let mut files = gpu_lib_list(&paths.nvliblist())
            .and_then(|list| probe.resolve(&list))
            .unwrap_or_else(|err| {
                tracing::warn!("While finding nv bind points: {err}");
                GpuFiles::default()
            });
        files.ipcs = probe.nvidia_ipcs();
        plan.add_binds(files, "nv", req.writable);
        return Ok(plan);
    }
    if setuid_fakeroot {
        return Err(GpuError::FakerootNvccli);
    }

    tracing::debug!("Using nvidia-container-cli for GPU setup");
    plan.nvccli = true;
    let visible = host_env
        .iter()
        .any(|(k, v)| k == "NVIDIA_VISIBLE_DEVICES" && !v.is_empty());
    if !visible {
        if req.contain {
            tracing::warn!("When using nvidia-container-cli with --contain NVIDIA_VISIBLE_DEVICES must be set or no GPUs will be available in container.");
        } else {
            tracing::info!("Setting 'NVIDIA_VISIBLE_DEVICES=all' to emulate legacy GPU binding.");
            plan.host_env
                .push(("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string()));
        }
    }
    plan.nvccli_env = host_env
        .iter()
        .chain(plan.host_env.iter())
        .filter(|(k, _)| k.starts_with("NVIDIA_"))
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if !req.writable && !req.writable_tmpfs {
        tracing::info!("Setting --writable-tmpfs (required by nvidia-container-cli)");
        plan.force_writable_tmpfs = true;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_config::AdminConfig;
    use anyhow::Result;

    struct FakeProbe;

    impl GpuProbe for FakeProbe {
        fn resolve(&self, list: &[String]) -> super::Result<GpuFiles> {
            Ok(GpuFiles {
                libs: list.iter().filter(|l| l.contains(".so")).cloned().collect(),
                bins: list
                    .iter()
                    .filter(|l| !l.contains(".so"))
                    .map(|b| format!("/usr/bin/{b}"))
                    .collect(),
                ipcs: Vec::new(),
            })
        }

        fn nvidia_ipcs(&self) -> Vec<String> {
            vec![PERSISTENCED_SOCKET.to_string()]
        }
    }

    fn install(dir: &Path) -> InstallPaths {
        InstallPaths::default().with_confdir(Some(dir.to_path_buf()))
    }

    #[test]
    fn test_parse_ld_cache() {
        let out = "\
1234 libs found in cache `/etc/ld.so.cache'
\tlibnvidia-ml.so.1 (libc6,x86-64) => /usr/lib64/nvidia/libnvidia-ml.so.1
\tlibnvidia-ml.so.1 (libc6) => /usr/lib/nvidia/libnvidia-ml.so.1
\tlibcuda.so (libc6,x86-64) => /usr/lib64/libcuda.so
";
        let cache = parse_ld_cache(out);
        assert_eq!(
            cache,
            vec![
                (
                    "libnvidia-ml.so.1".to_string(),
                    "/usr/lib64/nvidia/libnvidia-ml.so.1".to_string()
                ),
                ("libcuda.so".to_string(), "/usr/lib64/libcuda.so".to_string()),
            ]
        );
    }

    #[test]
    fn test_legacy_nv() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::write(
            tmp.path().join("nvliblist.conf"),
            "# binaries\nnvidia-smi\n\nlibcuda.so\n",
        )?;
        let req = GpuRequest {
            nv: true,
            ..Default::default()
        };
        let plan = plan_gpu(
            &req,
            &AdminConfig::default(),
            &install(tmp.path()),
            &[],
            false,
            &FakeProbe,
        )?;
        assert!(plan.nv_legacy && !plan.nvccli);
        assert_eq!(
            plan.files,
            vec![
                "/usr/bin/nvidia-smi:/usr/bin/nvidia-smi".to_string(),
                PERSISTENCED_SOCKET.to_string()
            ]
        );
        assert_eq!(plan.libs, vec!["libcuda.so"]);
        Ok(())
    }

    #[test]
    fn test_nvccli() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let req = GpuRequest {
            nvccli: true,
            ..Default::default()
        };
        let env = vec![("NVIDIA_DRIVER_CAPABILITIES".to_string(), "all".to_string())];
        let plan = plan_gpu(
            &req,
            &AdminConfig::default(),
            &install(tmp.path()),
            &env,
            false,
            &FakeProbe,
        )?;
        assert!(plan.nvccli);
        assert!(plan.force_writable_tmpfs);
        assert_eq!(
            plan.nvccli_env,
            vec!["NVIDIA_DRIVER_CAPABILITIES=all", "NVIDIA_VISIBLE_DEVICES=all"]
        );

        assert!(matches!(
            plan_gpu(&req, &AdminConfig::default(), &install(tmp.path()), &env, true, &FakeProbe),
            Err(GpuError::FakerootNvccli)
        ));
        Ok(())
    }

    #[test]
    fn test_missing_list_warns_only() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let req = GpuRequest {
            rocm: true,
            ..Default::default()
        };
        let plan = plan_gpu(
            &req,
            &AdminConfig::default(),
            &install(tmp.path()),
            &[],
            false,
            &FakeProbe,
        )?;
        assert!(plan.rocm);
        assert!(plan.files.is_empty() && plan.libs.is_empty());
        Ok(())
    }
}
