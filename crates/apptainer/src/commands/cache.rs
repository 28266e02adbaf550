//! `cache list|clean`
use std::fmt::Write as _;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use tabwriter::TabWriter;

use libapptainer::cache::{CacheEntry, CacheHandle, CACHE_TYPES};
use libapptainer::context::LaunchContext;
use libapptainer_cli::{CacheClean, CacheList};

use super::{cache_config, confirm, is_interactive, with_status};

/// Expands `all` and checks the requested cache types.
fn cache_types(requested: &[String]) -> Result<Vec<&'static str>> {
    if requested.is_empty() || requested.iter().any(|t| t == "all") {
        return Ok(CACHE_TYPES.to_vec());
    }
    requested
        .iter()
        .map(|t| {
            CACHE_TYPES
                .iter()
                .find(|known| *known == t)
                .copied()
                .with_context(|| format!("{t} is not a valid cache type, choose from {}", CACHE_TYPES.join(", ")))
        })
        .collect()
}

fn open_cache(ctx: &LaunchContext) -> Result<CacheHandle> {
    let config = cache_config(ctx, false);
    if config.disable {
        bail!("unable to use the cache: the cache is disabled");
    }
    Ok(CacheHandle::new(&config)?)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn render_summary<W: Write>(out: W, types: &[&str], entries: &[CacheEntry]) -> Result<()> {
    let mut content = String::new();
    for kind in types {
        let (count, size) = entries
            .iter()
            .filter(|e| e.kind == *kind)
            .fold((0, 0), |(count, size), e| (count + 1, size + e.size));
        let _ = writeln!(content, "{kind}\t{count}\t{}", human_size(size));
    }
    let total: u64 = entries.iter().map(|e| e.size).sum();

    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "TYPE\tENTRIES\tSIZE")?;
    write!(&mut tab_writer, "{content}")?;
    writeln!(&mut tab_writer, "\nTotal space used: {}", human_size(total))?;
    tab_writer.flush()?;
    Ok(())
}

fn render_entries<W: Write>(out: W, entries: &[CacheEntry]) -> Result<()> {
    let mut content = String::new();
    for entry in entries {
        let created: DateTime<Local> = DateTime::from(entry.modified);
        let _ = writeln!(
            content,
            "{}\t{}\t{}\t{}",
            entry.name,
            created.format("%Y-%m-%d %H:%M:%S"),
            human_size(entry.size),
            entry.kind
        );
    }
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "NAME\tDATE CREATED\tSIZE\tTYPE")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    Ok(())
}

pub fn list(args: CacheList, ctx: &LaunchContext) -> Result<()> {
    let listed = || -> Result<()> {
        let types = cache_types(&args.types)?;
        let entries = open_cache(ctx)?.list(&types)?;
        if args.verbose {
            render_entries(io::stdout(), &entries)?;
        }
        render_summary(io::stdout(), &types, &entries)
    };
    listed().map_err(|err| with_status(2, err.context("could not list the cache")))
}

pub fn clean(args: CacheClean, ctx: &LaunchContext) -> Result<()> {
    let types = cache_types(&args.types)?;
    let cache = open_cache(ctx)?;
    if !args.force && !args.dry_run {
        if !is_interactive() {
            bail!("cache clean needs --force when not run interactively");
        }
        let question = format!(
            "This will delete everything in your cache (containers from all sources and OCI blobs) under {}.\nAre you sure you want to continue? [y/N] ",
            cache.root().display()
        );
        if !confirm(&question) {
            tracing::info!("Cache cleanup aborted");
            return Ok(());
        }
    }

    let removed = cache.clean(&types, args.days, args.dry_run)?;
    for entry in &removed {
        if args.dry_run {
            println!("Would remove {}", entry.path.display());
        } else {
            tracing::info!("Removing {} cache entry {}", entry.kind, entry.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn entry(kind: &str, name: &str, size: u64) -> CacheEntry {
        CacheEntry {
            kind: kind.to_string(),
            name: name.to_string(),
            path: PathBuf::from(format!("/cache/{kind}/{name}")),
            size,
            modified: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_cache_types() -> Result<()> {
        assert_eq!(cache_types(&["all".to_string()])?, CACHE_TYPES);
        assert_eq!(cache_types(&["oci-tmp".to_string(), "blob".to_string()])?, vec!["oci-tmp", "blob"]);
        assert!(cache_types(&["images".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn test_summary() -> Result<()> {
        let entries = vec![entry("library", "a", 1024), entry("library", "b", 1024), entry("blob", "c", 10)];
        let mut out = Vec::new();
        render_summary(&mut out, &["library", "blob"], &entries)?;
        let text = String::from_utf8(out)?;
        let library = text.lines().find(|l| l.starts_with("library")).unwrap_or_default();
        assert!(library.contains(" 2 ") && library.ends_with("2.00 KiB"));
        assert!(text.contains("Total space used: 2.01 KiB"));
        Ok(())
    }

    #[test]
    fn test_list_failure_exits_with_two() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = crate::commands::test_context(tmp.path(), 1000)?;
        let args = CacheList {
            types: vec!["bogus".to_string()],
            verbose: false,
        };
        let err = list(args, &ctx).unwrap_err();
        assert_eq!(err.downcast_ref::<crate::commands::ExitStatus>().map(|s| s.0), Some(2));
        Ok(())
    }
}
