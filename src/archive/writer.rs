//! Disk Writer (spec 4.5, 4.7): the thread that drains completed major
//! blocks through the transform, persists them via `O_DIRECT`, and
//! maintains the on-disk block directory and header.
//!
//! Per spec 5, the transform has no thread of its own — this loop is
//! both "the disk writer" and the transform's driver, reading the ring
//! buffer as a strict reader and calling [`Transform::process_data_block`]
//! / [`Transform::process_gap`] inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::header::{BlockDirEntry, DataIndexEntry, DISK_STATUS_CLEAN, DISK_STATUS_WRITING, MAX_HEADER_BLOCKS};
use super::ArchiveState;
use crate::ring_buffer::{ReadResult, ReaderHandle, RingBuffer};
use crate::transform::Transform;

const HEADER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag(AtomicBool::new(false))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks the circular data region's block directory: up to
/// [`MAX_HEADER_BLOCKS`] contiguous archive segments, most recent first.
pub struct SegmentTracker {
    data_size: u64,
    segments: Vec<BlockDirEntry>,
}

impl SegmentTracker {
    pub fn load(data_size: u64, blocks: [BlockDirEntry; MAX_HEADER_BLOCKS], count: u32) -> Self {
        SegmentTracker {
            data_size,
            segments: blocks[..count as usize].to_vec(),
        }
    }

    /// Whether `offset` lies in the half-open, wrap-aware interval
    /// `(old_offset, new_offset]` — the writer's `expired` predicate.
    fn expired(&self, old_offset: u64, new_offset: u64, offset: u64) -> bool {
        if new_offset > old_offset {
            offset > old_offset && offset <= new_offset
        } else if new_offset < old_offset {
            offset > old_offset || offset <= new_offset
        } else {
            false
        }
    }

    /// Record a successful write of `[start_offset, stop_offset)` with
    /// the given wall-clock second range, extending the current segment
    /// (or starting a fresh one if the directory was empty) and pruning
    /// any older segment it has now overwritten.
    pub fn record_write(
        &mut self,
        start_offset: u64,
        stop_offset: u64,
        start_sec: u64,
        stop_sec: u64,
    ) {
        match self.segments.first_mut() {
            Some(top) if top.stop_offset as u64 == start_offset => {
                top.stop_offset = stop_offset as i64;
                top.stop_sec = stop_sec;
            }
            _ => {
                self.segments.insert(
                    0,
                    BlockDirEntry {
                        start_sec,
                        stop_sec,
                        start_offset: start_offset as i64,
                        stop_offset: stop_offset as i64,
                    },
                );
            }
        }
        self.prune_overwritten(start_offset, stop_offset);
    }

    /// A gap event: push a fresh, zero-length segment at the write
    /// cursor's current position, ahead of every existing segment.
    pub fn record_gap(&mut self, offset: u64) {
        self.segments.insert(
            0,
            BlockDirEntry {
                start_sec: 0,
                stop_sec: 0,
                start_offset: offset as i64,
                stop_offset: offset as i64,
            },
        );
        if self.segments.len() > MAX_HEADER_BLOCKS {
            self.segments.pop();
        }
    }

    fn prune_overwritten(&mut self, old_offset: u64, new_offset: u64) {
        while self.segments.len() > 1 {
            let oldest = self.segments.last_mut().expect("len > 1");
            let oldest_start = oldest.start_offset as u64;
            if self.expired(old_offset, new_offset, oldest_start) {
                oldest.start_offset = new_offset as i64;
                if oldest.start_offset == oldest.stop_offset {
                    self.segments.pop();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
    }

    pub fn segments(&self) -> &[BlockDirEntry] {
        &self.segments
    }

    /// Write the current segment list back into the header's fixed-size
    /// directory array.
    pub fn flush_into(&self, archive: &ArchiveState) {
        let mut blocks = [BlockDirEntry::default(); MAX_HEADER_BLOCKS];
        for (i, seg) in self.segments.iter().take(MAX_HEADER_BLOCKS).enumerate() {
            blocks[i] = *seg;
        }
        archive.header.set_blocks(blocks);
        archive.header.set_block_count(self.segments.len().min(MAX_HEADER_BLOCKS) as u32);
    }
}

/// Run the disk-writer / transform loop until `shutdown` is signalled.
pub fn run(
    archive: Arc<ArchiveState>,
    ring: Arc<RingBuffer>,
    reader: ReaderHandle,
    mut transform: Transform,
    shutdown: Arc<ShutdownFlag>,
) {
    archive.header.set_disk_status(DISK_STATUS_WRITING);

    let data_size = archive.header.header().data_size;
    let mut tracker = SegmentTracker::load(
        data_size,
        archive.header.blocks(),
        archive.header.block_count(),
    );

    let mut last_flush = Instant::now();
    let mut peak_backlog: u64 = 0;

    loop {
        if shutdown.is_set() {
            break;
        }

        let (result, backlog) = ring.get_read(reader);
        peak_backlog = peak_backlog.max(backlog);

        match result {
            ReadResult::Shutdown => break,
            ReadResult::Gap => {
                transform.process_gap();
                let offset = archive.block_offset(archive.header.current_major_block());
                tracker.record_gap(offset - archive.major_data_start());
                tracker.flush_into(&archive);
                if let Err(err) = archive.flush_header() {
                    error!(%err, "header flush failed after gap");
                }
                last_flush = Instant::now();
                ring.release_read(reader);
            }
            ReadResult::Block(mut block) => {
                let timestamp = block.timestamp;
                let scheduled = transform.process_data_block(&mut block, timestamp, &archive);
                drop(block);
                ring.release_read(reader);

                if let Some(scheduled) = scheduled {
                    if let Err(err) = archive.write_major_block(scheduled.block_index, &scheduled.buffer) {
                        error!(%err, "fatal: major block write failed");
                        archive.header.set_disk_status(DISK_STATUS_CLEAN);
                        return;
                    }
                    record_index_write(&mut tracker, &archive, scheduled.block_index, scheduled.index_entry);

                    archive.header.set_write_backlog(peak_backlog);
                    let elapsed = last_flush.elapsed();
                    if elapsed >= HEADER_FLUSH_INTERVAL {
                        tracker.flush_into(&archive);
                        if let Err(err) = archive.flush_header() {
                            warn!(%err, "periodic header flush failed");
                        }
                        last_flush = Instant::now();
                        peak_backlog = 0;
                    }
                }
            }
        }
    }

    tracker.flush_into(&archive);
    archive.header.set_disk_status(DISK_STATUS_CLEAN);
    if let Err(err) = archive.flush_header() {
        error!(%err, "final header flush failed at shutdown");
    }
    info!("disk writer stopped");
}

fn record_index_write(
    tracker: &mut SegmentTracker,
    archive: &ArchiveState,
    block_index: u32,
    entry: DataIndexEntry,
) {
    let block_size = archive.major_block_size();
    let start_offset = block_index as u64 * block_size;
    let stop_offset = start_offset + block_size;
    let data_size = archive.header.header().data_size;
    let stop_offset = if stop_offset >= data_size { 0 } else { stop_offset };
    tracker.record_write(
        start_offset,
        stop_offset,
        entry.timestamp / 1_000_000,
        entry.end_timestamp() / 1_000_000,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: i64, stop: i64) -> BlockDirEntry {
        BlockDirEntry {
            start_sec: 0,
            stop_sec: 0,
            start_offset: start,
            stop_offset: stop,
        }
    }

    #[test]
    fn extends_current_segment_on_contiguous_write() {
        let mut tracker = SegmentTracker {
            data_size: 1000,
            segments: vec![entry(0, 100)],
        };
        tracker.record_write(100, 200, 0, 0);
        assert_eq!(tracker.segments(), &[entry(0, 200)]);
    }

    #[test]
    fn gap_pushes_a_new_segment_ahead() {
        let mut tracker = SegmentTracker {
            data_size: 1000,
            segments: vec![entry(0, 300)],
        };
        tracker.record_gap(300);
        assert_eq!(tracker.segments().len(), 2);
        assert_eq!(tracker.segments()[0], entry(300, 300));
    }

    #[test]
    fn overwriting_the_oldest_segment_advances_its_start() {
        let mut tracker = SegmentTracker {
            data_size: 1000,
            segments: vec![entry(500, 500), entry(550, 900)],
        };
        // New write extends the current (top) segment from 500 to 600,
        // advancing into the oldest segment's start at 550.
        tracker.record_write(500, 600, 0, 0);
        assert_eq!(tracker.segments()[0], entry(500, 600));
        assert_eq!(tracker.segments()[1].start_offset, 600);
    }

    #[test]
    fn fully_overwritten_segment_is_removed() {
        let mut tracker = SegmentTracker {
            data_size: 1000,
            segments: vec![entry(100, 100), entry(120, 150)],
        };
        // The oldest segment [120, 150) sits entirely within the new
        // write's (100, 150] span, so it collapses to empty and is
        // dropped rather than just shrunk.
        tracker.record_write(100, 150, 0, 0);
        assert_eq!(tracker.segments().len(), 1);
        assert_eq!(tracker.segments()[0], entry(100, 150));
    }
}
