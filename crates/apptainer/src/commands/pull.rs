use anyhow::{Context, Result};

use libapptainer::context::LaunchContext;
use libapptainer::image::{DescriptorTable, LookupUnsquasher};
use libapptainer::pull::PullRequest;
use libapptainer_cli::Pull;

use super::{cache_config, pull_options, resolver};

pub fn pull(args: Pull, ctx: &LaunchContext) -> Result<()> {
    let (dest, source) = args.dest_and_source();
    let req = PullRequest {
        source: source.to_string(),
        dest,
        force: args.force,
        sandbox: args.sandbox,
        cwd: ctx.cwd.clone(),
    };
    let opts = pull_options(ctx, &args.auth, source)?;
    let cache = cache_config(ctx, args.disable_cache);

    let path = libapptainer::pull::pull(&req, &resolver(), &cache, &opts, &DescriptorTable, &LookupUnsquasher)
        .with_context(|| format!("failed to pull {source}"))?;
    tracing::info!("Image saved to {}", path.display());
    Ok(())
}
