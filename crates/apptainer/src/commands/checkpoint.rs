//! `checkpoint list|create|delete|instance`
use anyhow::{Context, Result};

use libapptainer::checkpoint::{checkpoint_args, CheckpointManager};
use libapptainer::context::LaunchContext;
use libapptainer::engine_config::Action;
use libapptainer::launcher::LaunchOptions;
use libapptainer::uri::Transport;
use libapptainer_cli::{Checkpoint, CheckpointCmd};

use super::actions::launch;
use crate::observability::Verbosity;

fn manager(ctx: &LaunchContext) -> CheckpointManager {
    CheckpointManager::new(ctx.user_dirs.checkpoint_dir())
}

pub fn checkpoint(args: Checkpoint, ctx: &LaunchContext, verbosity: Verbosity) -> Result<i32> {
    let manager = manager(ctx);
    match args.cmd {
        CheckpointCmd::List => {
            for entry in manager.list()? {
                println!("{}", entry.name());
            }
        }
        CheckpointCmd::Create { name } => {
            let entry = manager.create(&name)?;
            tracing::info!("Checkpoint {:?} created", entry.name());
        }
        CheckpointCmd::Delete { name } => {
            manager.delete(&name)?;
            tracing::info!("Checkpoint {name:?} deleted");
        }
        CheckpointCmd::Instance { name, instance } => {
            return checkpoint_instance(ctx, &manager, name.as_deref(), &instance, verbosity);
        }
    }
    Ok(0)
}

/// Name of the checkpoint receiving the state of `instance`.
fn checkpoint_name(name: Option<&str>, recorded: Option<&str>, instance: &str) -> Result<String> {
    name.or(recorded)
        .map(str::to_string)
        .with_context(|| format!("instance {instance} was not launched with --dmtcp-launch"))
}

/// Asks the DMTCP coordinator of a running instance to checkpoint, from
/// inside the instance.
fn checkpoint_instance(
    ctx: &LaunchContext,
    manager: &CheckpointManager,
    name: Option<&str>,
    instance: &str,
    verbosity: Verbosity,
) -> Result<i32> {
    let record = ctx.instance_store().get(instance)?;
    let name = checkpoint_name(name, record.checkpoint.as_deref(), instance)?;
    let entry = manager.get(&name)?;
    let port = entry
        .coordinator_port()
        .with_context(|| format!("no coordinator found for checkpoint {name}"))?;
    tracing::info!("Using checkpoint {name:?}");

    let opts = LaunchOptions {
        action: Action::Exec,
        image_arg: instance.to_string(),
        image: format!("{}://{instance}", Transport::Instance.scheme()),
        args: checkpoint_args(&port),
        ..Default::default()
    };
    launch(ctx, opts, verbosity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_name() -> Result<()> {
        assert_eq!(checkpoint_name(Some("a"), Some("b"), "web")?, "a");
        assert_eq!(checkpoint_name(None, Some("b"), "web")?, "b");
        let err = checkpoint_name(None, None, "web").unwrap_err();
        assert_eq!(err.to_string(), "instance web was not launched with --dmtcp-launch");
        Ok(())
    }

    #[test]
    fn test_create_list_delete() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = crate::commands::test_context(tmp.path(), 1000)?;
        let normal = Verbosity::Normal;
        for name in ["b", "a"] {
            let cmd = CheckpointCmd::Create {
                name: name.to_string(),
            };
            assert_eq!(checkpoint(Checkpoint { cmd }, &ctx, normal)?, 0);
        }
        let names: Vec<String> = manager(&ctx).list()?.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let again = Checkpoint {
            cmd: CheckpointCmd::Create { name: "a".to_string() },
        };
        assert!(checkpoint(again, &ctx, normal).is_err());

        let delete = Checkpoint {
            cmd: CheckpointCmd::Delete { name: "a".to_string() },
        };
        checkpoint(delete, &ctx, normal)?;
        assert_eq!(manager(&ctx).list()?.len(), 1);
        Ok(())
    }
}
