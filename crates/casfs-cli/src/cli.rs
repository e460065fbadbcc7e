use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "casfs",
    about = "casfs — content-addressed blob filesystem over an image file",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Format a new filesystem image
    Mkfs(MkfsArgs),
    /// Check an image for inconsistencies
    Fsck(FsckArgs),
    /// Show superblock counters and usage
    Stats(StatsArgs),
    /// Store a file as a blob, printing its digest
    Put(PutArgs),
    /// Read a blob by digest
    Get(GetArgs),
    /// List all blob digests
    Ls(LsArgs),
    /// Delete a blob by digest
    Rm(RmArgs),
}

#[derive(Args)]
pub struct MkfsArgs {
    /// Image file to create (overwritten if it exists)
    pub image: PathBuf,
    /// Image size in 8 KiB blocks
    #[arg(long, default_value_t = 4096)]
    pub device_blocks: u64,
    /// Initially addressable data blocks; defaults to everything left
    /// after the metadata regions
    #[arg(long)]
    pub data_blocks: Option<u64>,
    /// Growth headroom for the data region
    #[arg(long)]
    pub max_data_blocks: Option<u64>,
    /// Initially addressable node slots
    #[arg(long, default_value_t = 512)]
    pub nodes: u64,
    /// Growth headroom for node slots
    #[arg(long, default_value_t = 2048)]
    pub max_nodes: u64,
    /// Journal region size in blocks, including its header
    #[arg(long, default_value_t = 17)]
    pub journal_blocks: u64,
}

#[derive(Args)]
pub struct FsckArgs {
    pub image: PathBuf,
}

#[derive(Args)]
pub struct StatsArgs {
    pub image: PathBuf,
}

#[derive(Args)]
pub struct PutArgs {
    pub image: PathBuf,
    /// File whose contents become the blob
    pub file: PathBuf,
    /// Store raw even when compression would save space
    #[arg(long)]
    pub no_compress: bool,
}

#[derive(Args)]
pub struct GetArgs {
    pub image: PathBuf,
    /// Blob digest (hex)
    pub digest: String,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct LsArgs {
    pub image: PathBuf,
}

#[derive(Args)]
pub struct RmArgs {
    pub image: PathBuf,
    /// Blob digest (hex)
    pub digest: String,
}
