use std::path::Path;

use anyhow::{bail, Context, Result};

use libapptainer::context::LaunchContext;
use libapptainer::uri::{check_push_transport, ImagePusher, PullOptions, Uri, UriError};
use libapptainer_cli::{PullAuthOpts, Push};

use super::pull_options;

/// Uploads are handled by the library and registry clients, none of them
/// is linked into this front-end.
pub struct NoPusher;

impl ImagePusher for NoPusher {
    fn push(&self, _: &Path, reference: &str, _: &PullOptions) -> Result<(), UriError> {
        // the transport was checked by the caller
        let uri = Uri::parse(reference)?;
        Err(UriError::NoClient(uri.transport))
    }
}

pub fn push(args: Push, ctx: &LaunchContext) -> Result<()> {
    push_with(args, ctx, &NoPusher)
}

fn push_with(args: Push, ctx: &LaunchContext, pusher: &dyn ImagePusher) -> Result<()> {
    let uri = Uri::parse(&args.uri)?;
    check_push_transport(&uri)?;
    if !args.file.is_file() {
        bail!("unable to open {}: not a file", args.file.display());
    }
    if !args.description.is_empty() {
        tracing::debug!(description = %args.description, "library description");
    }

    let auth = PullAuthOpts {
        authfile: args.authfile.clone(),
        library: args.library.clone(),
        ..Default::default()
    };
    let opts = pull_options(ctx, &auth, &args.uri)?;
    pusher
        .push(&args.file, &args.uri, &opts)
        .with_context(|| format!("failed to push {} to {}", args.file.display(), args.uri))?;
    tracing::info!("Upload complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    use crate::commands::test_context;

    #[derive(Default)]
    struct RecordingPusher {
        pushed: RefCell<Vec<(PathBuf, String)>>,
    }

    impl ImagePusher for RecordingPusher {
        fn push(&self, file: &Path, reference: &str, _: &PullOptions) -> Result<(), UriError> {
            self.pushed.borrow_mut().push((file.to_path_buf(), reference.to_string()));
            Ok(())
        }
    }

    fn push_args(file: PathBuf, uri: &str) -> Push {
        Push {
            description: String::new(),
            library: None,
            authfile: None,
            file,
            uri: uri.to_string(),
        }
    }

    #[test]
    fn test_push_transports() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = test_context(tmp.path(), 1000)?;
        let image = tmp.path().join("alpine.sif");
        std::fs::write(&image, b"SIF")?;

        let pusher = RecordingPusher::default();
        push_with(push_args(image.clone(), "oras://registry/alpine:1"), &ctx, &pusher)?;
        assert_eq!(pusher.pushed.borrow()[0].1, "oras://registry/alpine:1");

        let err = push_with(push_args(image.clone(), "docker://alpine"), &ctx, &pusher).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported transport type: docker");

        let missing = push_with(push_args(tmp.path().join("none.sif"), "library://a/b/c"), &ctx, &pusher);
        assert!(missing.is_err());
        assert_eq!(pusher.pushed.borrow().len(), 1);

        assert!(push_with(push_args(image, "library://a/b/c"), &ctx, &NoPusher).is_err());
        Ok(())
    }
}
