use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use casfs_core::{
    check_device, format_device, CasFs, Digest, FormatOptions, MountOptions,
};
use casfs_device::{BlockDevice, FileDevice};
use casfs_types::{BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, NODES_PER_BLOCK};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Mkfs(args) => cmd_mkfs(args, format),
        Command::Fsck(args) => cmd_fsck(args, format),
        Command::Stats(args) => cmd_stats(args, format),
        Command::Put(args) => cmd_put(args, format),
        Command::Get(args) => cmd_get(args),
        Command::Ls(args) => cmd_ls(args, format),
        Command::Rm(args) => cmd_rm(args, format),
    }
}

/// Open the image and mount. The device is opened writable even for
/// read-only mounts so a crashed image can replay its journal.
fn mount(image: &Path, read_only: bool) -> anyhow::Result<CasFs> {
    let device = Arc::new(
        FileDevice::open(image, false)
            .with_context(|| format!("cannot open image {}", image.display()))?,
    );
    let fs = CasFs::mount(
        device as Arc<dyn BlockDevice>,
        None,
        MountOptions {
            read_only,
            ..MountOptions::default()
        },
    )
    .with_context(|| format!("cannot mount {}", image.display()))?;
    Ok(fs)
}

fn parse_digest(hex: &str) -> anyhow::Result<Digest> {
    Digest::from_hex(hex).with_context(|| format!("invalid digest {hex:?}"))
}

fn cmd_mkfs(args: MkfsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let max_data_blocks = args.max_data_blocks.unwrap_or(args.device_blocks);
    let metadata_blocks = 1
        + max_data_blocks.div_ceil(BITS_PER_BITMAP_BLOCK)
        + args.max_nodes.div_ceil(NODES_PER_BLOCK as u64)
        + args.journal_blocks;
    if args.device_blocks <= metadata_blocks {
        bail!(
            "{} blocks leave no data region behind {metadata_blocks} metadata blocks",
            args.device_blocks
        );
    }
    let data_blocks = args
        .data_blocks
        .unwrap_or(args.device_blocks - metadata_blocks);

    let device = FileDevice::create(&args.image, args.device_blocks)
        .with_context(|| format!("cannot create image {}", args.image.display()))?;
    let sb = format_device(
        &device,
        FormatOptions {
            data_blocks,
            max_data_blocks,
            node_count: args.nodes,
            max_node_count: args.max_nodes,
            journal_blocks: args.journal_blocks,
        },
    )?;

    match format {
        OutputFormat::Text => {
            println!("formatted {}", args.image.display());
            println!("  data blocks:  {} (headroom {})", sb.data_block_count, sb.max_data_blocks());
            println!("  node slots:   {} (headroom {})", sb.node_count, sb.max_nodes());
            println!("  journal:      {} blocks", sb.journal_blocks);
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "image": args.image.display().to_string(),
                "data_blocks": sb.data_block_count,
                "max_data_blocks": sb.max_data_blocks(),
                "node_count": sb.node_count,
                "max_nodes": sb.max_nodes(),
                "journal_blocks": sb.journal_blocks,
            })
        ),
    }
    Ok(())
}

fn cmd_fsck(args: FsckArgs, format: OutputFormat) -> anyhow::Result<()> {
    let device = FileDevice::open(&args.image, true)
        .with_context(|| format!("cannot open image {}", args.image.display()))?;
    let report = check_device(&device)?;

    match format {
        OutputFormat::Text => {
            println!(
                "{}: {} blobs, {} blocks, {} nodes allocated",
                args.image.display(),
                report.blob_count,
                report.alloc_block_count,
                report.alloc_node_count
            );
            if report.pending_journal_entries > 0 {
                println!(
                    "  {} journal entries pending replay (unclean shutdown)",
                    report.pending_journal_entries
                );
            }
            if report.is_clean() {
                println!("  clean");
            } else {
                for problem in &report.problems {
                    println!("  problem: {problem}");
                }
            }
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "blob_count": report.blob_count,
                "alloc_block_count": report.alloc_block_count,
                "alloc_node_count": report.alloc_node_count,
                "pending_journal_entries": report.pending_journal_entries,
                "clean": report.is_clean(),
                "problems": report.problems,
            })
        ),
    }
    if !report.is_clean() {
        bail!("{} inconsistencies found", report.problems.len());
    }
    Ok(())
}

fn cmd_stats(args: StatsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let fs = mount(&args.image, true)?;
    let stats = fs.stats();

    match format {
        OutputFormat::Text => {
            println!("{}", args.image.display());
            println!(
                "  data:   {}/{} blocks ({} / {} bytes)",
                stats.alloc_block_count,
                stats.data_block_count,
                stats.alloc_block_count * BLOCK_SIZE as u64,
                stats.data_block_count * BLOCK_SIZE as u64
            );
            println!("  nodes:  {}/{}", stats.alloc_node_count, stats.node_count);
            println!("  blobs:  {}", stats.blob_count);
            println!("  format: revision {}", stats.format_revision);
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "data_block_count": stats.data_block_count,
                "alloc_block_count": stats.alloc_block_count,
                "node_count": stats.node_count,
                "alloc_node_count": stats.alloc_node_count,
                "blob_count": stats.blob_count,
                "format_revision": stats.format_revision,
            })
        ),
    }
    Ok(())
}

fn cmd_put(args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let data =
        fs::read(&args.file).with_context(|| format!("cannot read {}", args.file.display()))?;
    let fs_handle = mount_writable(&args.image, !args.no_compress)?;

    let mut writer = fs_handle.create_blob(data.len() as u64)?;
    writer.append(&data);
    let digest = writer.complete()?;
    fs_handle.unmount()?;

    match format {
        OutputFormat::Text => println!("{digest}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "digest": digest.to_hex(), "bytes": data.len() })
        ),
    }
    Ok(())
}

fn mount_writable(image: &Path, compress: bool) -> anyhow::Result<CasFs> {
    let device = Arc::new(
        FileDevice::open(image, false)
            .with_context(|| format!("cannot open image {}", image.display()))?,
    );
    Ok(CasFs::mount(
        device as Arc<dyn BlockDevice>,
        None,
        MountOptions {
            compress,
            ..MountOptions::default()
        },
    )?)
}

fn cmd_get(args: GetArgs) -> anyhow::Result<()> {
    let digest = parse_digest(&args.digest)?;
    let fs = mount(&args.image, true)?;
    let reader = fs.open_blob(&digest)?;
    let data = reader.read_all()?;
    drop(reader);

    match &args.output {
        Some(path) => fs::write(path, &data)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

fn cmd_ls(args: LsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let fs = mount(&args.image, true)?;
    let digests = fs.list_blobs();

    match format {
        OutputFormat::Text => {
            for digest in &digests {
                println!("{digest}");
            }
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "blobs": digests.iter().map(Digest::to_hex).collect::<Vec<_>>(),
            })
        ),
    }
    Ok(())
}

fn cmd_rm(args: RmArgs, format: OutputFormat) -> anyhow::Result<()> {
    let digest = parse_digest(&args.digest)?;
    let fs = mount_writable(&args.image, true)?;
    fs.delete_blob(&digest)?;
    fs.unmount()?;

    match format {
        OutputFormat::Text => println!("deleted {digest}"),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "deleted": digest.to_hex() }))
        }
    }
    Ok(())
}
