//! Engine configuration handed to the starter.
//!
//! The launcher fills an [`EngineConfig`]; [`EngineConfig::oci_spec`] renders
//! its process and namespace parts as an OCI runtime spec, and the whole
//! document travels to the starter as JSON.

use std::collections::{BTreeMap, HashMap};

use oci_spec::runtime::{
    LinuxBuilder, LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType,
    PosixRlimitBuilder, PosixRlimitType, ProcessBuilder, Spec, SpecBuilder,
};

use crate::cgroups::CgroupPlan;
use crate::checkpoint::DmtcpConfig;
use crate::crypt::KeyInfo;
use crate::env::ProcessEnv;
use crate::gpu::GpuPlan;
use crate::mounts::MountPlan;

/// Engine name the starter dispatches on.
pub const ENGINE_NAME: &str = "apptainer";
const ACTIONS_DIR: &str = "/.singularity.d/actions";

#[derive(Debug, thiserror::Error)]
pub enum EngineConfigError {
    #[error("building runtime spec")]
    Spec(#[from] oci_spec::OciSpecError),
    #[error("serializing engine config")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, EngineConfigError>;

/// Container action, each backed by a script in the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Exec,
    Run,
    Shell,
    Test,
    Start,
    InstanceRun,
}

impl Action {
    pub fn script(self) -> String {
        let name = match self {
            Action::Exec => "exec",
            Action::Run => "run",
            Action::Shell => "shell",
            Action::Test => "test",
            Action::Start => "start",
            Action::InstanceRun => "instance_run",
        };
        format!("{ACTIONS_DIR}/{name}")
    }
}

/// Namespaces requested for the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Namespaces {
    pub user: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub net: bool,
    /// `--no-pid` under `--containall` or an instance.
    pub no_pid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub dns: Vec<String>,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityConfig {
    pub add: Vec<String>,
    pub drop: Vec<String>,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub allow_suid: bool,
}

/// Everything the starter needs to run the container.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub image: String,
    /// Image as given on the command line.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_arg: String,
    pub instance: bool,
    pub instance_join: bool,
    pub boot_instance: bool,
    pub share_ns_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_ns_fd: Option<i32>,

    pub args: Vec<String>,
    pub env: ProcessEnv,
    /// Overrides applied by the action scripts.
    pub apptainer_env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub custom_cwd: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,
    pub restore_umask: bool,
    pub no_eval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Soft and hard `RLIMIT_STACK` of the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimit_stack: Option<(u64, u64)>,

    pub namespaces: Namespaces,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub target_uid: u32,
    pub target_gids: Vec<u32>,
    pub fakeroot: bool,
    pub no_init: bool,
    pub contain: bool,

    pub mounts: MountPlan,
    pub gpu: GpuPlan,
    pub cgroups: CgroupPlan,
    pub security: Vec<String>,
    pub network: NetworkConfig,
    pub capabilities: CapabilityConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<KeyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_temp_dir: Option<String>,
    pub config_dir: String,
    pub files_path: Vec<String>,
    pub libraries_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmtcp: Option<DmtcpConfig>,
    pub load_overlay: bool,
}

fn namespace(typ: LinuxNamespaceType) -> Result<LinuxNamespace> {
    Ok(LinuxNamespaceBuilder::default().typ(typ).build()?)
}

impl EngineConfig {
    /// Sets `key` under every runtime prefix in the process environment.
    pub fn set_env_with_prefixes(&mut self, key: &str, value: &str) {
        self.env.set_with_prefixes(key, value);
    }

    /// Maps the caller to the target ids inside a plain user namespace.
    pub fn add_user_mapping(&mut self, host_uid: u32, host_gid: u32, uid: u32, gid: u32) {
        self.uid_mappings.push(IdMapping {
            container_id: uid,
            host_id: host_uid,
            size: 1,
        });
        self.gid_mappings.push(IdMapping {
            container_id: gid,
            host_id: host_gid,
            size: 1,
        });
    }

    /// The namespaces to create, mount always first.
    pub fn linux_namespaces(&self) -> Result<Vec<LinuxNamespace>> {
        let ns = &self.namespaces;
        let mut out = vec![namespace(LinuxNamespaceType::Mount)?];
        for (wanted, typ) in [
            (ns.net, LinuxNamespaceType::Network),
            (ns.uts, LinuxNamespaceType::Uts),
            (ns.pid && !ns.no_pid, LinuxNamespaceType::Pid),
            (ns.ipc, LinuxNamespaceType::Ipc),
            (ns.user, LinuxNamespaceType::User),
        ] {
            if wanted {
                out.push(namespace(typ)?);
            }
        }
        Ok(out)
    }

    pub fn oci_spec(&self) -> Result<Spec> {
        let mut process = ProcessBuilder::default()
            .args(self.args.clone())
            .env(self.env.to_oci());
        if let Some(cwd) = &self.cwd {
            process = process.cwd(cwd);
        }
        if let Some((soft, hard)) = self.rlimit_stack {
            process = process.rlimits(vec![PosixRlimitBuilder::default()
                .typ(PosixRlimitType::RlimitStack)
                .soft(soft)
                .hard(hard)
                .build()?]);
        }

        let map = |m: &IdMapping| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
        };
        let mut linux = LinuxBuilder::default()
            .namespaces(self.linux_namespaces()?)
            .uid_mappings(self.uid_mappings.iter().map(map).collect::<std::result::Result<Vec<_>, _>>()?)
            .gid_mappings(self.gid_mappings.iter().map(map).collect::<std::result::Result<Vec<_>, _>>()?);
        if let Some(resources) = &self.cgroups.resources {
            linux = linux.resources(resources.clone());
        }

        let mut annotations = HashMap::new();
        if self.custom_cwd {
            annotations.insert("CustomCwd".to_string(), "true".to_string());
        }

        let mut spec = SpecBuilder::default()
            .process(process.build()?)
            .linux(linux.build()?)
            .annotations(annotations);
        if let Some(hostname) = &self.network.hostname {
            spec = spec.hostname(hostname.clone());
        }
        Ok(spec.build()?)
    }

    /// JSON document sent to the starter.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Common<'a> {
            engine_name: &'static str,
            container_id: &'a str,
            engine_config: &'a EngineConfig,
            oci_config: Spec,
        }
        let container_id = if self.instance {
            self.env
                .get("APPTAINER_INSTANCE")
                .unwrap_or_default()
        } else {
            ""
        };
        Ok(serde_json::to_vec(&Common {
            engine_name: ENGINE_NAME,
            container_id,
            engine_config: self,
            oci_config: self.oci_spec()?,
        })?)
    }
}
