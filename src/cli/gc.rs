//! `flowctl gc`: retains the N most recent run directories by mtime,
//! deleting the rest.

use std::path::PathBuf;

use tracing::info;

#[derive(clap::Args, Debug)]
pub struct GcArgs {
    #[arg(long, default_value = "./.runs")]
    pub base_dir: PathBuf,

    #[arg(long, default_value = "20")]
    pub keep: usize,

    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: GcArgs) -> anyhow::Result<()> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let read_dir = match std::fs::read_dir(&args.base_dir) {
        Ok(rd) => rd,
        Err(_) => {
            println!("{}: nothing to collect", args.base_dir.display());
            return Ok(());
        }
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                entries.push((modified, path));
            }
        }
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let to_delete: Vec<&PathBuf> = entries.iter().skip(args.keep).map(|(_, p)| p).collect();

    if to_delete.is_empty() {
        println!("{} run(s) kept, nothing to delete", entries.len().min(args.keep));
        return Ok(());
    }

    for path in &to_delete {
        if args.dry_run {
            println!("would delete {}", path.display());
        } else {
            std::fs::remove_dir_all(path)?;
            info!(path = %path.display(), "deleted run directory");
            println!("deleted {}", path.display());
        }
    }

    Ok(())
}
