//! `fa-archiver`: the archive daemon. Wires together the sniffer thread,
//! the ring buffer, the disk-writer/transform loop and the wire protocol
//! server around one open [`ArchiveState`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fa_archiver::archive::writer::{self, ShutdownFlag as WriterShutdown};
use fa_archiver::archive::ArchiveState;
use fa_archiver::config::ArchiverConfig;
use fa_archiver::ring_buffer::RingBuffer;
use fa_archiver::sniffer::device::CharDeviceSniffer;
use fa_archiver::sniffer::mock::SyntheticSniffer;
use fa_archiver::sniffer::thread::{self as sniffer_thread, ShutdownFlag as SnifferShutdown};
use fa_archiver::sniffer::Sniffer;
use fa_archiver::transform::Transform;
use fa_archiver::wire;

/// Archive daemon: ingest, decimate, persist and serve a circular per-BPM
/// archive.
#[derive(Parser, Debug)]
#[command(name = "fa-archiver")]
struct Cli {
    /// Path to a prepared archive file (see `fa-prepare`).
    disk: PathBuf,

    /// Ring buffer capacity, in major-block-sized raw blocks.
    #[arg(short = 'b', long, default_value_t = 256)]
    bufsize: usize,

    /// TCP address to serve the wire protocol on.
    #[arg(short = 's', long, default_value = "0.0.0.0:8888")]
    sockname: String,

    /// Free-run against the synthetic sniffer instead of a real device.
    #[arg(short = 'F', long)]
    fake: bool,

    /// Override the number of ids the sniffer reports per frame, when
    /// smaller than the archive's configured N.
    #[arg(short = 'E', long)]
    entry_count: Option<usize>,

    /// Character device path for the real sniffer.
    #[arg(long, default_value = "/dev/fa_sniffer0")]
    device: PathBuf,

    /// Name tag included in log output, for sites running more than one
    /// archiver instance.
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Suppress informational logging.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let config = ArchiverConfig {
        archive_path: cli.disk.clone(),
        buffer_block_count: cli.bufsize,
        socket_addr: cli.sockname.clone(),
        entry_count_override: cli.entry_count,
        use_synthetic_sniffer: cli.fake,
        device_path: cli.device.clone(),
        quiet: cli.quiet,
    };

    let archive = Arc::new(
        ArchiveState::open(&config.archive_path)
            .with_context(|| format!("opening archive {}", config.archive_path.display()))?,
    );
    let header = archive.header.header();
    config
        .validate(header.n as usize)
        .context("validating archiver configuration")?;

    if let Some(name) = &cli.name {
        info!(name, disk = %config.archive_path.display(), "starting fa-archiver");
    } else {
        info!(disk = %config.archive_path.display(), "starting fa-archiver");
    }

    let entry_count = config.entry_count_override.unwrap_or(header.n as usize);
    let frame_count = header.input_block_size as usize;
    let ring = Arc::new(RingBuffer::new(config.buffer_block_count, entry_count, frame_count));

    let sniffer: Box<dyn Sniffer> = if config.use_synthetic_sniffer {
        Box::new(SyntheticSniffer::new(1_000_000 / 10_000, 0))
    } else {
        Box::new(
            CharDeviceSniffer::open(&config.device_path, entry_count)
                .with_context(|| format!("opening sniffer device {}", config.device_path.display()))?,
        )
    };

    let sniffer_shutdown = Arc::new(SnifferShutdown::new());
    let sniffer_ring = Arc::clone(&ring);
    let sniffer_shutdown_handle = Arc::clone(&sniffer_shutdown);
    std::thread::spawn(move || {
        if !config.use_synthetic_sniffer {
            sniffer_thread::try_set_realtime_priority();
        }
        sniffer_thread::run(sniffer, sniffer_ring, sniffer_shutdown_handle);
    });

    let archive_mask = archive.header.archive_mask();
    let transform = Transform::new(
        &archive_mask,
        header.d1_log2,
        1u32 << header.d2_log2,
        header.major_sample_count,
        header.dd_total_count,
    );

    let writer_reader = ring.open_reader(true);
    let writer_shutdown = Arc::new(WriterShutdown::new());
    let writer_archive = Arc::clone(&archive);
    let writer_ring = Arc::clone(&ring);
    let writer_shutdown_handle = Arc::clone(&writer_shutdown);
    std::thread::spawn(move || {
        writer::run(writer_archive, writer_ring, writer_reader, transform, writer_shutdown_handle);
    });

    let wire_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    wire::serve(&cli.sockname, archive, wire_shutdown).context("wire protocol server failed")
}

fn init_logging(quiet: bool) {
    let default_filter = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}
