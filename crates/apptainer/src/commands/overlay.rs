use anyhow::{Context, Result};

use libapptainer::context::LaunchContext;
use libapptainer::overlay::{create_overlay, Mkfs3Command, OverlayRequest};
use libapptainer_cli::OverlayCreate;

pub fn create(args: OverlayCreate, ctx: &LaunchContext) -> Result<()> {
    let mkfs = Mkfs3Command::find()?;
    let req = OverlayRequest {
        path: ctx.cwd.join(&args.path),
        size_mib: args.size,
        sparse: args.sparse,
        create_dirs: args.create_dir,
        tmp_dir: ctx.tmp_dir.clone(),
        uid: ctx.uid,
        gid: ctx.gid,
    };
    create_overlay(&req, &mkfs).with_context(|| format!("failed to create overlay {}", args.path.display()))
}
