#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use forkfs_core::{ForkFs, ForkFsOptions};
use forkfs_ondisk::base::BaseImageBuilder;
use forkfs_ondisk::format::{FormatOptions, format_image};
use forkfs_types::InodeNumber;
use forkfs_window::{FileWindow, Window};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "forkfs", about = "ForkFS — branchable delta-log filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file, optionally embedding a base snapshot.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size (bytes; K/M/G suffixes accepted).
        #[arg(long)]
        size: String,
        /// Seed the base image from this directory tree.
        #[arg(long)]
        from_dir: Option<PathBuf>,
        /// Delta log capacity of the main branch (bytes; suffixes accepted).
        #[arg(long, default_value = "1M")]
        main_capacity: String,
    },
    /// Fork a new branch.
    Create {
        /// Path to the image file.
        image: PathBuf,
        /// Name of the branch to create.
        name: String,
        /// Parent branch.
        #[arg(short = 'p', long, default_value = forkfs_ondisk::MAIN_BRANCH)]
        parent: String,
    },
    /// Merge a branch into its parent; siblings become stale.
    Commit {
        /// Path to the image file.
        image: PathBuf,
        /// Branch to commit.
        name: String,
    },
    /// Discard a branch's mutations.
    Abort {
        /// Path to the image file.
        image: PathBuf,
        /// Branch to abort.
        name: String,
    },
    /// List branch records.
    Branches {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show superblock and layout information.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    total_size: u64,
    block_size: u32,
    base_offset: u64,
    base_size: u64,
    base_inode_count: Option<u32>,
    branch_table_entries: u32,
    active_branches: u32,
    next_branch_id: u64,
    next_inode_id: u64,
    delta_region_offset: u64,
    delta_region_size: u64,
    delta_alloc_offset: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs {
            image,
            size,
            from_dir,
            main_capacity,
        } => mkfs(&image, &size, from_dir.as_deref(), &main_capacity),
        Command::Create {
            image,
            name,
            parent,
        } => {
            let fs = open(&image)?;
            fs.create_branch(&name, &parent)
                .with_context(|| format!("failed to create branch '{name}'"))?;
            println!("created branch '{name}' from '{parent}'");
            Ok(())
        }
        Command::Commit { image, name } => {
            let fs = open(&image)?;
            fs.commit(&name)
                .with_context(|| format!("failed to commit branch '{name}'"))?;
            println!("committed branch '{name}'");
            Ok(())
        }
        Command::Abort { image, name } => {
            let fs = open(&image)?;
            fs.abort(&name)
                .with_context(|| format!("failed to abort branch '{name}'"))?;
            println!("aborted branch '{name}'");
            Ok(())
        }
        Command::Branches { image, json } => branches(&image, json),
        Command::Inspect { image, json } => inspect(&image, json),
    }
}

fn open(path: &Path) -> Result<ForkFs> {
    let window = FileWindow::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    ForkFs::open(Arc::new(window), ForkFsOptions::default())
        .with_context(|| format!("{} is not a ForkFS image", path.display()))
}

fn mkfs(path: &Path, size: &str, from_dir: Option<&Path>, main_capacity: &str) -> Result<()> {
    let size = parse_size(size).context("invalid --size")?;
    let main_capacity = parse_size(main_capacity).context("invalid --main-capacity")?;

    let base_image = match from_dir {
        Some(dir) => Some(build_base_from_dir(dir)?),
        None => None,
    };

    let window = FileWindow::create(path, size)
        .with_context(|| format!("failed to create image {}", path.display()))?;
    let sb = format_image(
        &window,
        &FormatOptions {
            base_image,
            main_log_capacity: main_capacity,
        },
    )
    .context("failed to format image")?;
    window.sync(forkfs_types::ByteOffset::ZERO, sb.total_size)?;

    println!(
        "formatted {} ({} bytes, base {} bytes, delta region {} bytes)",
        path.display(),
        sb.total_size,
        sb.base_size,
        sb.delta_region_size
    );
    Ok(())
}

fn build_base_from_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = BaseImageBuilder::new();
    let root = builder.root();
    add_dir_tree(&mut builder, root, dir)?;
    builder.build().context("failed to assemble base image")
}

fn add_dir_tree(builder: &mut BaseImageBuilder, parent: InodeNumber, dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            bail!("non-UTF-8 file name under {}", dir.display());
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let ino = builder
                .add_dir(parent, name, 0o755)
                .with_context(|| format!("failed to add directory {name}"))?;
            add_dir_tree(builder, ino, &entry.path())?;
        } else if file_type.is_file() {
            let data = std::fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            builder
                .add_file(parent, name, 0o644, &data)
                .with_context(|| format!("failed to add file {name}"))?;
        }
        // Symlinks and special files are skipped; the base image format
        // only carries directories and regular files here.
    }
    Ok(())
}

fn branches(path: &Path, json: bool) -> Result<()> {
    let fs = open(path)?;
    let info = fs.branches_info();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("serialize branches")?
        );
    } else {
        println!(
            "{:<24} {:>4} {:>6} {:<10} {:>5} {:>10} {:>10}",
            "NAME", "ID", "PARENT", "STATE", "REFS", "USED", "CAPACITY"
        );
        for b in info {
            let state = if b.stale {
                "stale".to_owned()
            } else {
                format!("{:?}", b.state).to_lowercase()
            };
            println!(
                "{:<24} {:>4} {:>6} {:<10} {:>5} {:>10} {:>10}",
                b.name, b.id, b.parent_id, state, b.refcount, b.log_used, b.log_capacity
            );
        }
    }
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open(path)?;
    let sb = fs.superblock();
    let output = InspectOutput {
        total_size: sb.total_size,
        block_size: sb.block_size,
        base_offset: sb.base_offset,
        base_size: sb.base_size,
        base_inode_count: fs.base().map(forkfs_ondisk::base::BaseImage::inode_count),
        branch_table_entries: sb.branch_table_entries,
        active_branches: sb.active_branches,
        next_branch_id: sb.next_branch_id,
        next_inode_id: sb.next_inode_id,
        delta_region_offset: sb.delta_region_offset,
        delta_region_size: sb.delta_region_size,
        delta_alloc_offset: sb.delta_alloc_offset,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("ForkFS image");
        println!("total_size: {}", output.total_size);
        println!("block_size: {}", output.block_size);
        match output.base_inode_count {
            Some(count) => println!(
                "base: {} bytes at offset {} ({count} inodes)",
                output.base_size, output.base_offset
            ),
            None => println!("base: none"),
        }
        println!("active_branches: {}", output.active_branches);
        println!("next_branch_id: {}", output.next_branch_id);
        println!("next_inode_id: {}", output.next_inode_id);
        println!(
            "delta_region: {} bytes at offset {} (bump at {})",
            output.delta_region_size, output.delta_region_offset, output.delta_alloc_offset
        );
    }
    Ok(())
}

/// Parse a byte count with optional `K`/`M`/`G` suffix.
fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("'{input}' is not a size"))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("'{input}' overflows u64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn mkfs_then_branch_lifecycle_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("test.img");

        mkfs(&image, "8M", None, "256K").expect("mkfs");

        let fs = open(&image).expect("open");
        fs.create_branch("feature", "main").expect("create");
        drop(fs);

        // Branch state survives reopen.
        let fs = open(&image).expect("reopen");
        let info = fs.branches_info();
        assert_eq!(info.len(), 2);
        assert!(info.iter().any(|b| b.name == "feature"));
        fs.abort("feature").expect("abort");
        assert_eq!(fs.branches_info().len(), 1);
    }

    #[test]
    fn mkfs_from_dir_embeds_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).expect("mkdir");
        std::fs::write(tree.join("a.txt"), b"alpha").expect("write");
        std::fs::write(tree.join("sub/b.txt"), b"beta").expect("write");

        let image = dir.path().join("seeded.img");
        mkfs(&image, "8M", Some(&tree), "256K").expect("mkfs");

        let fs = open(&image).expect("open");
        let mount = fs.mount_main_read_only().expect("mount");
        let a = fs
            .lookup(mount, InodeNumber::ROOT, b"a.txt")
            .expect("lookup")
            .expect("a.txt");
        assert_eq!(fs.read(mount, a, 0, 16).expect("read"), b"alpha");
        let sub = fs
            .lookup(mount, InodeNumber::ROOT, b"sub")
            .expect("lookup")
            .expect("sub");
        let b = fs.lookup(mount, sub, b"b.txt").expect("lookup").expect("b");
        assert_eq!(fs.read(mount, b, 0, 16).expect("read"), b"beta");
    }
}
