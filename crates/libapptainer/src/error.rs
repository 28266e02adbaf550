//! Crate wide error aggregate and its classification into exit behavior.

use crate::admin_config::AdminConfigError;
use crate::bind::BindError;
use crate::builder::BuildError;
use crate::cache::CacheError;
use crate::capability::CapabilityError;
use crate::cgroups::CgroupsError;
use crate::checkpoint::CheckpointError;
use crate::context::ContextError;
use crate::crypt::CryptError;
use crate::engine_config::EngineConfigError;
use crate::env::EnvError;
use crate::fakeroot::subid::SubidError;
use crate::fakeroot::FakerootError;
use crate::gpu::GpuError;
use crate::home::HomeError;
use crate::image::ImageError;
use crate::instance::sharens::SharensError;
use crate::instance::InstanceError;
use crate::launcher::LaunchError;
use crate::mounts::MountError;
use crate::overlay::OverlayError;
use crate::privilege::PrivilegeError;
use crate::pull::PullError;
use crate::remote::credentials::CredentialsError;
use crate::remote::RemoteError;
use crate::security::SecurityError;
use crate::starter::StarterError;
use crate::uri::UriError;

/// How a failure is reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments or flag combinations.
    Usage,
    /// Unreadable or invalid configuration.
    Config,
    /// Needs root, or an unprivileged install.
    Privilege,
    Io,
    /// Unsupported or unusable image.
    Image,
    Remote,
    /// The starter or container exited with this status.
    Starter(i32),
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Starter(status) => status,
            _ => 1,
        }
    }

    /// Kind of the first classified error in the chain starting at `err`.
    pub fn of(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
        let mut current = Some(err);
        while let Some(err) = current {
            if let Some(kind) = classify(err) {
                return Some(kind);
            }
            current = err.source();
        }
        None
    }
}

/// Implemented by every error type of the crate.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

macro_rules! downcast_kind {
    ($err:expr, $($ty:ty),+ $(,)?) => {
        $(
            if let Some(e) = $err.downcast_ref::<$ty>() {
                return Some(e.kind());
            }
        )+
    };
}

fn classify(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    downcast_kind!(
        err,
        LibapptainerError,
        LaunchError,
        AdminConfigError,
        BindError,
        BuildError,
        CacheError,
        CapabilityError,
        CgroupsError,
        CheckpointError,
        ContextError,
        CredentialsError,
        CryptError,
        EngineConfigError,
        EnvError,
        FakerootError,
        GpuError,
        HomeError,
        ImageError,
        InstanceError,
        MountError,
        OverlayError,
        PrivilegeError,
        PullError,
        RemoteError,
        SecurityError,
        SharensError,
        StarterError,
        SubidError,
        UriError,
    );
    None
}

#[derive(Debug, thiserror::Error)]
pub enum LibapptainerError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    AdminConfig(#[from] AdminConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Subid(#[from] SubidError),
    #[error(transparent)]
    Uri(#[from] UriError),
}

pub type Result<T> = std::result::Result<T, LibapptainerError>;

impl Classify for LibapptainerError {
    fn kind(&self) -> ErrorKind {
        match self {
            LibapptainerError::Launch(e) => e.kind(),
            LibapptainerError::Context(e) => e.kind(),
            LibapptainerError::AdminConfig(e) => e.kind(),
            LibapptainerError::Build(e) => e.kind(),
            LibapptainerError::Cache(e) => e.kind(),
            LibapptainerError::Capability(e) => e.kind(),
            LibapptainerError::Checkpoint(e) => e.kind(),
            LibapptainerError::Credentials(e) => e.kind(),
            LibapptainerError::Instance(e) => e.kind(),
            LibapptainerError::Overlay(e) => e.kind(),
            LibapptainerError::Privilege(e) => e.kind(),
            LibapptainerError::Pull(e) => e.kind(),
            LibapptainerError::Remote(e) => e.kind(),
            LibapptainerError::Subid(e) => e.kind(),
            LibapptainerError::Uri(e) => e.kind(),
        }
    }
}

impl Classify for LaunchError {
    fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::InstanceFromInstance => ErrorKind::Usage,
            LaunchError::JoinCgroups => ErrorKind::Config,
            LaunchError::Ext3Unprivileged(_) => ErrorKind::Image,
            LaunchError::EnvFile { .. } => ErrorKind::Io,
            LaunchError::EnvFileSyntax { source, .. } => source.kind(),
            LaunchError::Privilege(e) => e.kind(),
            LaunchError::Fakeroot(e) => e.kind(),
            LaunchError::Bind(e) => e.kind(),
            LaunchError::Mount(e) => e.kind(),
            LaunchError::Home(e) => e.kind(),
            LaunchError::Gpu(e) => e.kind(),
            LaunchError::Cgroups(e) => e.kind(),
            LaunchError::Security(e) => e.kind(),
            LaunchError::Crypt(e) => e.kind(),
            LaunchError::Image(e) => e.kind(),
            LaunchError::Instance(e) => e.kind(),
            LaunchError::Sharens(e) => e.kind(),
            LaunchError::Starter(e) => e.kind(),
            LaunchError::EngineConfig(e) => e.kind(),
            LaunchError::Checkpoint(e) => e.kind(),
            LaunchError::Uri(e) => e.kind(),
        }
    }
}

impl Classify for BuildError {
    fn kind(&self) -> ErrorKind {
        match self {
            BuildError::EncryptNeedsRoot | BuildError::RecipeNeedsRoot => ErrorKind::Privilege,
            BuildError::BuildArgFile { .. } | BuildError::Io { .. } => ErrorKind::Io,
            BuildError::Privilege(e) => e.kind(),
            BuildError::Crypt(e) => e.kind(),
            BuildError::Image(e) => e.kind(),
            BuildError::Uri(e) => e.kind(),
            BuildError::Engine(_) => ErrorKind::Image,
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for CapabilityError {
    fn kind(&self) -> ErrorKind {
        match self {
            CapabilityError::RequiresRoot => ErrorKind::Privilege,
            CapabilityError::Read { .. } | CapabilityError::Write { .. } => ErrorKind::Io,
            CapabilityError::Parse { .. } => ErrorKind::Config,
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for OverlayError {
    fn kind(&self) -> ErrorKind {
        match self {
            OverlayError::TooSmall | OverlayError::Exists(_) | OverlayError::OutsideLayout(_) => ErrorKind::Usage,
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for PullError {
    fn kind(&self) -> ErrorKind {
        match self {
            PullError::Exists(_) | PullError::Local(_) => ErrorKind::Usage,
            PullError::Uri(e) => e.kind(),
            PullError::Image(e) => e.kind(),
            PullError::Io { .. } => ErrorKind::Io,
        }
    }
}

impl Classify for AdminConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            AdminConfigError::Read { .. } | AdminConfigError::Write { .. } => ErrorKind::Io,
            _ => ErrorKind::Config,
        }
    }
}

impl Classify for ContextError {
    fn kind(&self) -> ErrorKind {
        match self {
            ContextError::AdminConfig(e) => e.kind(),
            ContextError::Remote(e) => e.kind(),
            ContextError::NoHome(_) => ErrorKind::Config,
            ContextError::Cwd(_) => ErrorKind::Io,
        }
    }
}

impl Classify for BindError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Usage
    }
}

impl Classify for MountError {
    fn kind(&self) -> ErrorKind {
        match self {
            MountError::FuseDisabled => ErrorKind::Config,
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for HomeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Usage
    }
}

impl Classify for EnvError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Usage
    }
}

impl Classify for CgroupsError {
    fn kind(&self) -> ErrorKind {
        match self {
            CgroupsError::Read { .. } => ErrorKind::Io,
            CgroupsError::Toml { .. } => ErrorKind::Config,
            CgroupsError::RootlessInstance | CgroupsError::RootlessUnsupported => ErrorKind::Privilege,
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for SecurityError {
    fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::Privilege(e) => e.kind(),
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for PrivilegeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Privilege
    }
}

impl Classify for FakerootError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Privilege
    }
}

impl Classify for SubidError {
    fn kind(&self) -> ErrorKind {
        match self {
            SubidError::Read { .. } | SubidError::Write { .. } => ErrorKind::Io,
            SubidError::Invalid { .. } => ErrorKind::Config,
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for GpuError {
    fn kind(&self) -> ErrorKind {
        match self {
            GpuError::FakerootNvccli => ErrorKind::Usage,
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for CryptError {
    fn kind(&self) -> ErrorKind {
        match self {
            CryptError::Read { .. } | CryptError::Prompt(_) | CryptError::Terminal(_) => ErrorKind::Io,
            _ => ErrorKind::Image,
        }
    }
}

impl Classify for ImageError {
    fn kind(&self) -> ErrorKind {
        match self {
            ImageError::Open { .. } | ImageError::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Image,
        }
    }
}

impl Classify for CacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Disabled | CacheError::UnknownType(_) => ErrorKind::Usage,
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for UriError {
    fn kind(&self) -> ErrorKind {
        match self {
            UriError::Cache(e) => e.kind(),
            UriError::BadPlatform(_) => ErrorKind::Usage,
            _ => ErrorKind::Image,
        }
    }
}

impl Classify for EngineConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

impl Classify for CheckpointError {
    fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::Io(_) | CheckpointError::Config { .. } => ErrorKind::Io,
            CheckpointError::ConfigSyntax { .. } => ErrorKind::Config,
            CheckpointError::Resolve(e) => e.kind(),
            _ => ErrorKind::Usage,
        }
    }
}

impl Classify for InstanceError {
    fn kind(&self) -> ErrorKind {
        match self {
            InstanceError::InvalidName(_)
            | InstanceError::Exists(_)
            | InstanceError::NotFound(_)
            | InstanceError::NoneMatched => ErrorKind::Usage,
            InstanceError::StatsFakeroot | InstanceError::StatsHidepid => ErrorKind::Privilege,
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for SharensError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Io
    }
}

impl Classify for StarterError {
    fn kind(&self) -> ErrorKind {
        match self {
            StarterError::InstanceFailed(status) => ErrorKind::Starter(*status),
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for RemoteError {
    fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Read { .. } | RemoteError::Write { .. } => ErrorKind::Io,
            RemoteError::Parse { .. } | RemoteError::Encode(_) => ErrorKind::Config,
            RemoteError::Credentials(e) => e.kind(),
            _ => ErrorKind::Remote,
        }
    }
}

impl Classify for CredentialsError {
    fn kind(&self) -> ErrorKind {
        match self {
            CredentialsError::Read { .. } | CredentialsError::Write { .. } => ErrorKind::Io,
            CredentialsError::NoUsername | CredentialsError::NoPassword => ErrorKind::Usage,
            _ => ErrorKind::Remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_through_chain() {
        let err = anyhow::Error::new(CgroupsError::FileAndFlags).context("while planning");
        assert_eq!(ErrorKind::of(err.as_ref()), Some(ErrorKind::Usage));

        let err: LibapptainerError = LaunchError::from(StarterError::InstanceFailed(3)).into();
        assert_eq!(err.kind().exit_code(), 3);

        let err = anyhow::Error::new(RemoteError::NoDefault);
        assert_eq!(ErrorKind::of(err.as_ref()).map(ErrorKind::exit_code), Some(1));
        assert_eq!(ErrorKind::of(&std::fmt::Error), None);
    }
}
