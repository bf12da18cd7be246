//! Single-producer / multi-consumer bounded ring of fixed-size raw blocks
//! (spec 4.2).
//!
//! The sniffer thread is the sole producer: it reserves a slot, fills it
//! with one [`RawBlock`] worth of frames, and commits it with a gap flag
//! and timestamp. Consumers — the disk writer (a *strict* reader) and any
//! number of live subscribers (*non-strict* readers) — each track their
//! own read [`Sequence`] independently. A strict reader causes the
//! producer to block rather than overwrite data it hasn't consumed yet;
//! a non-strict reader that falls behind is simply skipped ahead, with
//! the skipped distance reported back as backlog.
//!
//! This is deliberately not lock-free: the spec calls for "ring-buffer
//! internal lock + condition variables" with bounded waits, not a
//! Disruptor-style spinning SPMC, so a single [`parking_lot::Mutex`] plus
//! [`parking_lot::Condvar`] protects the shared cursor state. The data
//! slots themselves are plain `Vec<Entry>` buffers swapped in by index;
//! only metadata (sequence numbers, gap bits, timestamps, reader cursors)
//! lives behind the lock, so the lock is only ever held for O(1) work.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::mask::Mask;

/// Monotonically increasing ring-buffer position, in units of whole blocks.
pub type Sequence = u64;

/// One (x, y) BPM reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Entry {
    pub x: i32,
    pub y: i32,
}

/// One raw block: `frame_count` frames of `entry_count` BPM entries each,
/// stored frame-major (all entries of frame 0, then frame 1, ...), plus
/// the timestamp of the first frame and a gap flag.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub entries: Vec<Entry>,
    pub entry_count: usize,
    pub frame_count: usize,
    pub timestamp: u64,
    pub gap: bool,
}

impl RawBlock {
    pub fn new(entry_count: usize, frame_count: usize) -> Self {
        RawBlock {
            entries: vec![Entry::default(); entry_count * frame_count],
            entry_count,
            frame_count,
            timestamp: 0,
            gap: false,
        }
    }

    /// Entries of frame `frame_index`, one per BPM id.
    pub fn frame(&self, frame_index: usize) -> &[Entry] {
        let start = frame_index * self.entry_count;
        &self.entries[start..start + self.entry_count]
    }

    /// Mutable entries of frame `frame_index`.
    pub fn frame_mut(&mut self, frame_index: usize) -> &mut [Entry] {
        let start = frame_index * self.entry_count;
        &mut self.entries[start..start + self.entry_count]
    }

    /// Column of one BPM id across every frame in this block.
    pub fn column(&self, id: usize) -> impl Iterator<Item = Entry> + '_ {
        (0..self.frame_count).map(move |f| self.entries[f * self.entry_count + id])
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    sequence: Sequence,
    gap: bool,
    timestamp: u64,
}

struct Shared {
    slots: Mutex<Vec<RawBlock>>,
    meta: Mutex<Vec<Option<SlotMeta>>>,
    cond: Condvar,
    write_seq: AtomicU64,
    shutting_down: std::sync::atomic::AtomicBool,
    block_count: usize,
    readers: Mutex<Vec<ReaderEntry>>,
    next_reader_id: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct ReaderEntry {
    id: usize,
    strict: bool,
    read_seq: Sequence,
    closed: bool,
}

/// A bounded ring of `block_count` raw blocks.
pub struct RingBuffer {
    shared: Arc<Shared>,
}

/// A reserved, writable slot. Produced by [`RingBuffer::reserve_write`]
/// and must be handed back via [`RingBuffer::commit_write`].
pub struct WriteSlot {
    index: usize,
    sequence: Sequence,
}

/// A registered reader's handle.
#[derive(Debug, Clone, Copy)]
pub struct ReaderHandle(usize);

/// What [`RingBuffer::get_read`] can hand back.
pub enum ReadResult<'a> {
    Block(std::sync::MappedMutexGuard<'a, RawBlock>),
    Gap,
    Shutdown,
}

impl RingBuffer {
    pub fn new(block_count: usize, entry_count: usize, frame_count: usize) -> Self {
        let slots = (0..block_count)
            .map(|_| RawBlock::new(entry_count, frame_count))
            .collect();
        RingBuffer {
            shared: Arc::new(Shared {
                slots: Mutex::new(slots),
                meta: Mutex::new(vec![None; block_count]),
                cond: Condvar::new(),
                write_seq: AtomicU64::new(0),
                shutting_down: std::sync::atomic::AtomicBool::new(false),
                block_count,
                readers: Mutex::new(Vec::new()),
                next_reader_id: AtomicUsize::new(0),
            }),
        }
    }

    pub fn block_count(&self) -> usize {
        self.shared.block_count
    }

    /// A freshly allocated block matching this ring's slot shape, for
    /// producers that want to fill a scratch buffer before committing it.
    pub fn new_scratch_block(&self) -> RawBlock {
        let slots = self.shared.slots.lock();
        let shape = &slots[0];
        RawBlock::new(shape.entry_count, shape.frame_count)
    }

    /// The smallest `read_seq` among live strict readers, or the current
    /// write sequence if there are none (nothing to block on).
    fn min_strict_seq(&self) -> Sequence {
        let readers = self.shared.readers.lock();
        readers
            .iter()
            .filter(|r| r.strict && !r.closed)
            .map(|r| r.read_seq)
            .min()
            .unwrap_or_else(|| self.shared.write_seq.load(Ordering::Acquire))
    }

    /// Reserve the next slot for writing. Blocks only if a strict reader
    /// has not yet consumed the block this call would overwrite — in
    /// steady state the producer never waits on consumers (spec 4.2).
    pub fn reserve_write(&self) -> WriteSlot {
        let sequence = self.shared.write_seq.load(Ordering::Relaxed);
        let block_count = self.shared.block_count as u64;

        let mut meta = self.shared.meta.lock();
        loop {
            let min_strict = self.min_strict_seq();
            if sequence - min_strict < block_count {
                break;
            }
            // A strict reader hasn't consumed the block we'd overwrite;
            // wait for it to advance rather than corrupt its read.
            self.shared.cond.wait(&mut meta);
        }

        WriteSlot {
            index: (sequence % block_count) as usize,
            sequence,
        }
    }

    /// Fill callback for the reserved slot, then publish it.
    ///
    /// Returns `true` if this commit overwrote data that the slowest
    /// non-strict reader had not consumed (an overflow — logged by the
    /// caller, not fatal).
    pub fn commit_write(&self, slot: WriteSlot, gap: bool, timestamp: u64, fill: impl FnOnce(&mut RawBlock)) -> bool {
        {
            let mut slots = self.shared.slots.lock();
            fill(&mut slots[slot.index]);
        }

        let block_count = self.shared.block_count as u64;
        let overflow = {
            let readers = self.shared.readers.lock();
            readers
                .iter()
                .any(|r| !r.strict && !r.closed && slot.sequence - r.read_seq >= block_count)
        };

        {
            let mut meta = self.shared.meta.lock();
            meta[slot.index] = Some(SlotMeta {
                sequence: slot.sequence,
                gap,
                timestamp,
            });
            self.shared
                .write_seq
                .store(slot.sequence + 1, Ordering::Release);
        }
        self.shared.cond.notify_all();
        overflow
    }

    /// Register a reader. Strict readers (the disk writer) block the
    /// producer on overflow; non-strict readers (live subscribers) are
    /// skipped ahead instead.
    pub fn open_reader(&self, strict: bool) -> ReaderHandle {
        let id = self.shared.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let read_seq = self.shared.write_seq.load(Ordering::Acquire);
        self.shared.readers.lock().push(ReaderEntry {
            id,
            strict,
            read_seq,
            closed: false,
        });
        ReaderHandle(id)
    }

    fn reader_index(&self, handle: ReaderHandle) -> Option<usize> {
        self.shared
            .readers
            .lock()
            .iter()
            .position(|r| r.id == handle.0)
    }

    /// Read the next block for `reader`, or `Gap` if it was a gap
    /// sentinel, or `Shutdown` once the buffer has been closed and
    /// drained. Returns the current backlog (blocks this reader is
    /// behind the producer) alongside the result.
    pub fn get_read(&self, reader: ReaderHandle) -> (ReadResult<'_>, u64) {
        loop {
            let write_seq = self.shared.write_seq.load(Ordering::Acquire);
            let mut readers = self.shared.readers.lock();
            let Some(idx) = readers.iter().position(|r| r.id == reader.0) else {
                return (ReadResult::Shutdown, 0);
            };

            if readers[idx].read_seq >= write_seq {
                if self.shared.shutting_down.load(Ordering::Acquire) {
                    return (ReadResult::Shutdown, 0);
                }
                drop(readers);
                let mut meta = self.shared.meta.lock();
                self.shared.cond.wait(&mut meta);
                continue;
            }

            let block_count = self.shared.block_count as u64;
            let strict = readers[idx].strict;
            if !strict && write_seq - readers[idx].read_seq > block_count {
                // Fallen behind the producer's overwrite point: skip
                // ahead and report the gap as backlog.
                readers[idx].read_seq = write_seq - block_count;
            }
            let read_seq = readers[idx].read_seq;
            let backlog = write_seq - read_seq;
            drop(readers);

            let meta = self.shared.meta.lock();
            let slot_index = (read_seq % block_count) as usize;
            let Some(m) = meta[slot_index] else {
                return (ReadResult::Shutdown, backlog);
            };
            if m.sequence != read_seq {
                // Overwritten since we computed read_seq; retry.
                continue;
            }
            let is_gap = m.gap;
            drop(meta);

            if is_gap {
                return (ReadResult::Gap, backlog);
            }
            let slots = self.shared.slots.lock();
            let guard = parking_lot::MutexGuard::map(slots, |s| &mut s[slot_index]);
            return (ReadResult::Block(guard), backlog);
        }
    }

    /// Mark the current block as consumed and advance this reader.
    pub fn release_read(&self, reader: ReaderHandle) {
        let mut readers = self.shared.readers.lock();
        if let Some(r) = readers.iter_mut().find(|r| r.id == reader.0) {
            r.read_seq += 1;
        }
        drop(readers);
        self.shared.cond.notify_all();
    }

    /// Stop a reader without removing its bookkeeping (used during
    /// shutdown so `close_reader` can still report final backlog).
    pub fn stop_reader(&self, reader: ReaderHandle) {
        let mut readers = self.shared.readers.lock();
        if let Some(r) = readers.iter_mut().find(|r| r.id == reader.0) {
            r.closed = true;
        }
        drop(readers);
        self.shared.cond.notify_all();
    }

    /// Remove a reader entirely.
    pub fn close_reader(&self, reader: ReaderHandle) {
        self.shared.readers.lock().retain(|r| r.id != reader.0);
        self.shared.cond.notify_all();
    }

    /// Signal shutdown: all blocked `get_read` calls return `Shutdown`.
    pub fn shutdown(&self) {
        self.shared
            .shutting_down
            .store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    pub fn write_sequence(&self) -> Sequence {
        self.shared.write_seq.load(Ordering::Acquire)
    }
}

impl Clone for RingBuffer {
    fn clone(&self) -> Self {
        RingBuffer {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Compact pair of (id, Entry) used when projecting a frame through a
/// [`Mask`] for wire streaming.
pub fn masked_entries<'a>(frame: &'a [Entry], mask: &'a Mask) -> impl Iterator<Item = Entry> + 'a {
    mask.iter_ids().map(move |id| frame[id])
}
