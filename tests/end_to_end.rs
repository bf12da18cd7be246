//! End-to-end tests wiring the sniffer source, ring buffer, transform,
//! disk writer and reader together the way `fa-archiver` does, rather
//! than exercising any one module in isolation.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;

use fa_archiver::archive::header::ArchiveLayout;
use fa_archiver::archive::writer::SegmentTracker;
use fa_archiver::archive::ArchiveState;
use fa_archiver::mask::Mask;
use fa_archiver::reader::Reader;
use fa_archiver::ring_buffer::{ReadResult, RingBuffer};
use fa_archiver::sniffer::mock::SyntheticSniffer;
use fa_archiver::sniffer::Sniffer;
use fa_archiver::transform::Transform;
use fa_archiver::wire;

fn small_layout() -> ArchiveLayout {
    ArchiveLayout {
        n: 4,
        d1_log2: 2, // D1 = 4
        d2: 2,      // D1*D2 = 8
        major_sample_count: 32,
        // Must exceed INDEX_SKIP (2) + 1: the reader's safety band excludes
        // `current` plus the INDEX_SKIP blocks ahead of it, which would
        // swallow the entire index if major_block_count were 3 or less,
        // making every completed block permanently unsearchable.
        major_block_count: 4,
        dd_sample_count: 4,
        archive_mask: Mask::all(4),
        input_block_size: 8,
    }
}

fn build_archive(layout: &ArchiveLayout) -> (Arc<ArchiveState>, NamedTempFile) {
    let file = NamedTempFile::new().expect("tempfile");
    let archive = ArchiveState::create(file.path(), layout).expect("create archive");
    (Arc::new(archive), file)
}

/// Drive the ring buffer and transform exactly the way `archive::writer::run`
/// does for one strict reader, for `iterations` sniffer reads. Returns the
/// number of major blocks completed.
fn pump(
    sniffer: &mut dyn Sniffer,
    ring: &Arc<RingBuffer>,
    reader: fa_archiver::ring_buffer::ReaderHandle,
    transform: &mut Transform,
    archive: &ArchiveState,
    iterations: usize,
) -> u32 {
    let mut scratch = ring.new_scratch_block();
    for _ in 0..iterations {
        match sniffer.read(&mut scratch) {
            Ok(timestamp) => {
                let slot = ring.reserve_write();
                ring.commit_write(slot, false, timestamp, |block| {
                    block.entries.copy_from_slice(&scratch.entries);
                    block.timestamp = timestamp;
                    block.gap = false;
                });
            }
            Err(_) => {
                let slot = ring.reserve_write();
                ring.commit_write(slot, true, 0, |block| block.gap = true);
            }
        }
    }

    let mut completed = 0;
    for _ in 0..iterations {
        let (result, _backlog) = ring.get_read(reader);
        match result {
            ReadResult::Shutdown => break,
            ReadResult::Gap => {
                transform.process_gap();
                ring.release_read(reader);
            }
            ReadResult::Block(mut block) => {
                let timestamp = block.timestamp;
                let scheduled = transform.process_data_block(&mut block, timestamp, archive);
                drop(block);
                ring.release_read(reader);
                if let Some(scheduled) = scheduled {
                    archive
                        .write_major_block(scheduled.block_index, &scheduled.buffer)
                        .expect("write major block");
                    completed += 1;
                }
            }
        }
    }
    completed
}

#[test]
fn full_pipeline_writes_and_reads_back_raw_samples() {
    let layout = small_layout();
    let (archive, _file) = build_archive(&layout);
    let ring = Arc::new(RingBuffer::new(4, layout.n, layout.input_block_size as usize));
    let reader_handle = ring.open_reader(true);
    let mut transform = Transform::new(
        &layout.archive_mask,
        layout.d1_log2,
        layout.d2,
        layout.major_sample_count,
        layout.dd_total_count(),
    );
    let mut sniffer = SyntheticSniffer::new(100, 0);

    // major_sample_count / input_block_size reads complete one major block.
    let iterations = (layout.major_sample_count / layout.input_block_size) as usize;
    let completed = pump(
        &mut sniffer,
        &ring,
        reader_handle,
        &mut transform,
        &archive,
        iterations,
    );
    assert_eq!(completed, 1);
    assert_eq!(archive.header.current_major_block(), 1);

    let reader = Reader::new(&archive);
    let columns = reader
        .read_raw(0, 0, layout.major_sample_count, &[0, 1, 2, 3])
        .expect("read raw samples");
    assert_eq!(columns.len(), 4);
    assert_eq!(columns[0].len(), layout.major_sample_count as usize);
    // Synthetic sniffer's counter is strictly increasing per frame.
    for w in columns[0].windows(2) {
        assert!(w[1].x > w[0].x);
    }
}

#[test]
fn wrapping_the_circular_region_overwrites_the_oldest_block() {
    let layout = small_layout();
    let (archive, _file) = build_archive(&layout);
    let ring = Arc::new(RingBuffer::new(8, layout.n, layout.input_block_size as usize));
    let reader_handle = ring.open_reader(true);
    let mut transform = Transform::new(
        &layout.archive_mask,
        layout.d1_log2,
        layout.d2,
        layout.major_sample_count,
        layout.dd_total_count(),
    );
    let mut sniffer = SyntheticSniffer::new(100, 0);

    let per_block = (layout.major_sample_count / layout.input_block_size) as usize;
    // Complete major_block_count + 1 blocks so block index 0 is reused.
    let mut total_completed = 0;
    for _ in 0..(layout.major_block_count as usize + 1) {
        total_completed += pump(
            &mut sniffer,
            &ring,
            reader_handle,
            &mut transform,
            &archive,
            per_block,
        );
    }
    assert_eq!(total_completed, layout.major_block_count + 1);
    // Wrapped back to block 0 after major_block_count writes, plus one more.
    assert_eq!(archive.header.current_major_block(), 1);

    let reader = Reader::new(&archive);
    let first_pass_entry = archive.header.read_data_index(0);
    let columns = reader
        .read_raw(0, 0, layout.major_sample_count, &[0])
        .expect("read the reused block");
    // The reused block's id_zero should reflect the *last* write to it:
    // the fourth major block, after major_block_count full ones.
    assert_eq!(
        first_pass_entry.id_zero,
        layout.major_sample_count * layout.major_block_count
    );
    assert_eq!(columns[0].len(), layout.major_sample_count as usize);
}

#[test]
fn forced_sniffer_dropout_surfaces_as_a_ring_gap_and_resets_the_partial_block() {
    let layout = small_layout();
    let (archive, _file) = build_archive(&layout);
    let ring = Arc::new(RingBuffer::new(8, layout.n, layout.input_block_size as usize));
    let reader_handle = ring.open_reader(true);
    let mut transform = Transform::new(
        &layout.archive_mask,
        layout.d1_log2,
        layout.d2,
        layout.major_sample_count,
        layout.dd_total_count(),
    );
    // Every 2nd read fails, well before a major block would complete.
    let mut sniffer = SyntheticSniffer::new(100, 0).with_forced_gap_every(2);

    let completed = pump(
        &mut sniffer,
        &ring,
        reader_handle,
        &mut transform,
        &archive,
        3,
    );
    assert_eq!(completed, 0, "a gap should discard the partial block, not complete it");
    assert_eq!(archive.header.current_major_block(), 0);

    let mut tracker = SegmentTracker::load(
        archive.header.header().data_size,
        archive.header.blocks(),
        archive.header.block_count(),
    );
    tracker.record_gap(0);
    assert_eq!(tracker.segments().len(), 1);
}

#[test]
fn wire_server_streams_raw_samples_to_a_real_tcp_client() {
    let layout = small_layout();
    let (archive, _file) = build_archive(&layout);
    let ring = Arc::new(RingBuffer::new(4, layout.n, layout.input_block_size as usize));
    let reader_handle = ring.open_reader(true);
    let mut transform = Transform::new(
        &layout.archive_mask,
        layout.d1_log2,
        layout.d2,
        layout.major_sample_count,
        layout.dd_total_count(),
    );
    let mut sniffer = SyntheticSniffer::new(100, 0);
    let iterations = (layout.major_sample_count / layout.input_block_size) as usize;
    let completed = pump(
        &mut sniffer,
        &ring,
        reader_handle,
        &mut transform,
        &archive,
        iterations,
    );
    assert_eq!(completed, 1);

    let picked = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = picked.local_addr().expect("local addr");
    drop(picked);

    let shutdown = Arc::new(AtomicBool::new(false));
    let serve_archive = Arc::clone(&archive);
    let serve_shutdown = Arc::clone(&shutdown);
    let addr_string = addr.to_string();
    let server = thread::spawn(move || {
        let _ = wire::serve(&addr_string, serve_archive, serve_shutdown);
    });

    // Give the listener a moment to come up.
    let mut stream = None;
    for _ in 0..20 {
        if let Ok(s) = TcpStream::connect(addr) {
            stream = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let mut stream = stream.expect("connect to wire server");

    let entry = archive.header.read_data_index(0);
    use std::io::{Read, Write};
    // Asking for exactly [timestamp, timestamp] lands on block 0's first
    // sample only: the resolved start and end offsets both land on sample
    // 0, clipping the read to a single sample per id.
    let request = format!("R F 0-3 - {} {}\n", entry.timestamp, entry.timestamp);
    stream.write_all(request.as_bytes()).expect("send request");

    let expected_bytes = layout.n * 1 * 8;
    let mut received = vec![0u8; expected_bytes];
    stream.read_exact(&mut received).expect("read raw stream");
    assert!(received.iter().any(|&b| b != 0), "stream should carry non-zero samples");

    // Spanning the block's whole timestamp range instead pulls every
    // sample back.
    let full_request = format!(
        "R F 0-3 - {} {}\n",
        entry.timestamp,
        entry.end_timestamp()
    );
    stream.write_all(full_request.as_bytes()).expect("send full-range request");
    let full_expected_bytes = layout.n * layout.major_sample_count as usize * 8;
    let mut full_received = vec![0u8; full_expected_bytes];
    stream.read_exact(&mut full_received).expect("read full raw stream");
    assert!(
        full_received.iter().any(|&b| b != 0),
        "full-range stream should carry non-zero samples"
    );

    shutdown.store(true, Ordering::Release);
    drop(stream);
    // The listener only rechecks shutdown between accepts; connecting once
    // more unblocks a pending accept() so the server thread can exit.
    let _ = TcpStream::connect(addr);
    let _ = server.join();
}
