//! `fa-prepare`: format a fresh archive file with a fixed geometry.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fa_archiver::archive::header::ArchiveLayout;
use fa_archiver::archive::prepare::{self, PrepareParams};
use fa_archiver::mask::Mask;

/// Format a new archive file.
#[derive(Parser, Debug)]
#[command(name = "fa-prepare")]
struct Cli {
    /// Path of the archive file to create (overwritten if it exists).
    disk: PathBuf,

    /// Number of BPM ids the source can report (0 <= id < n).
    #[arg(long, default_value_t = 256)]
    n: usize,

    /// log2 of the first-stage decimation factor D1.
    #[arg(long, default_value_t = 6)]
    d1_log2: u32,

    /// Second-stage decimation factor D2 (applied on top of D1).
    #[arg(long, default_value_t = 128)]
    d2: u32,

    /// Raw samples per major block, per archived id.
    #[arg(long, default_value_t = 1 << 20)]
    major_sample_count: u32,

    /// Number of major blocks in the circular data region.
    #[arg(long, default_value_t = 8)]
    major_block_count: u32,

    /// Number of double-decimated rows retained in the DD ring.
    #[arg(long, default_value_t = 1024)]
    dd_sample_count: u32,

    /// Frames per sniffer read (must divide `major_sample_count`).
    #[arg(long, default_value_t = 256)]
    input_block_size: u32,

    /// Ids to archive, in mask grammar (default: all of `n`).
    #[arg(long)]
    mask: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mask = match &cli.mask {
        Some(text) => Mask::parse(text, cli.n).context("parsing --mask")?,
        None => Mask::all(cli.n),
    };

    let params = PrepareParams {
        n: cli.n,
        d1_log2: cli.d1_log2,
        d2: cli.d2,
        major_sample_count: cli.major_sample_count,
        major_block_count: cli.major_block_count,
        dd_sample_count: cli.dd_sample_count,
        mask,
        input_block_size: cli.input_block_size,
    };
    let layout = ArchiveLayout {
        n: params.n,
        d1_log2: params.d1_log2,
        d2: params.d2,
        major_sample_count: params.major_sample_count,
        major_block_count: params.major_block_count,
        dd_sample_count: params.dd_sample_count,
        archive_mask: params.mask.clone(),
        input_block_size: params.input_block_size,
    };
    let total_size = layout.total_file_size();

    let archive = prepare::prepare(&cli.disk, params)
        .with_context(|| format!("preparing archive at {}", cli.disk.display()))?;

    info!(
        disk = %cli.disk.display(),
        n = archive.header.header().n,
        archived_ids = archive.header.archived_id_count(),
        major_block_count = archive.header.major_block_count(),
        total_size,
        "archive prepared",
    );
    Ok(())
}
