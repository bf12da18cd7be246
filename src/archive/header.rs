//! On-disk layout (spec 3, §6): a fixed 64 KiB header region (the
//! [`Header`] struct plus its block directory), followed by the
//! data-index array, the double-decimation ring mirror, and finally the
//! large circular data region.
//!
//! The header region is memory-mapped (mirroring
//! `rust_daq::data::ring_buffer`'s header-plus-data mmap layout) so that
//! updates can be flushed with `msync(MS_ASYNC)` under a byte-range
//! `fcntl` lock; the data region itself is written separately through a
//! raw `O_DIRECT` file descriptor, since it is far larger than anything
//! worth keeping paged in.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{FaError, Result};
use crate::mask::Mask;

pub const MAGIC: [u8; 8] = *b"FAARCH01";
pub const CURRENT_VERSION: u32 = 1;
pub const HEADER_REGION_SIZE: usize = 64 * 1024;
/// Maximum number of contiguous archive segments tracked by the block
/// directory (spec 3, 4.5).
pub const MAX_HEADER_BLOCKS: usize = 16;
/// Supports `N` up to 512 BPM ids (64 bytes = 512 bits), the largest `N`
/// the spec's historical values (256, 512) call for.
pub const MAX_MASK_BYTES: usize = 64;

pub const DISK_STATUS_CLEAN: u32 = 0;
pub const DISK_STATUS_WRITING: u32 = 1;

/// One contiguous archive segment: `[start_offset, stop_offset)` in the
/// circular data region, with the wall-clock range it covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BlockDirEntry {
    pub start_sec: u64,
    pub stop_sec: u64,
    pub start_offset: i64,
    pub stop_offset: i64,
}

/// One entry per major block: its start timestamp, fitted duration, and
/// the hardware frame counter at its first sample. `duration == 0`
/// means the block has never been written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DataIndexEntry {
    pub timestamp: u64,
    pub duration: u32,
    pub id_zero: u32,
}

impl DataIndexEntry {
    pub fn is_initialized(&self) -> bool {
        self.duration != 0
    }

    pub fn end_timestamp(&self) -> u64 {
        self.timestamp + self.duration as u64
    }
}

/// Fixed-size struct occupying the front of the header region.
/// `current_major_block`, `disk_status` and `write_backlog` use atomics
/// since they are mutated in place behind the mmap without re-flushing
/// the whole struct on every access.
#[repr(C)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub n: u32,
    pub d1_log2: u32,
    pub d2_log2: u32,
    pub input_block_size: u32,
    pub major_block_size: u64,
    pub major_sample_count: u32,
    pub major_block_count: u32,
    pub major_data_start: u64,
    pub dd_total_count: u32,
    pub dd_sample_count: u32,
    pub archived_id_count: u32,
    pub archive_mask_bytes: [u8; MAX_MASK_BYTES],
    pub last_duration: AtomicU32,
    pub disk_status: AtomicU32,
    pub write_backlog: AtomicU64,
    pub write_buffer: u32,
    pub current_major_block: AtomicU32,
    pub data_start: u64,
    pub data_size: u64,
    pub block_count: AtomicU32,
    pub blocks: [BlockDirEntry; MAX_HEADER_BLOCKS],
}

const HEADER_STRUCT_SIZE: usize = std::mem::size_of::<Header>();
const _: () = assert!(
    HEADER_STRUCT_SIZE <= HEADER_REGION_SIZE,
    "Header struct must fit inside the fixed 64 KiB header region"
);

/// Parameters needed to lay out a fresh archive (used by both
/// `fa-prepare` and by tests that build an archive in-process).
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    pub n: usize,
    pub d1_log2: u32,
    pub d2: u32,
    pub major_sample_count: u32,
    pub major_block_count: u32,
    pub dd_sample_count: u32,
    pub archive_mask: Mask,
    pub input_block_size: u32,
}

impl ArchiveLayout {
    pub fn archived_id_count(&self) -> u32 {
        self.archive_mask.popcount() as u32
    }

    pub fn d1(&self) -> u32 {
        1 << self.d1_log2
    }

    /// `major_block_size` per spec 3: the FA region (raw samples) plus
    /// the first-decimation region, both transposed across the archived
    /// ids. The spec's stated formula omits the `/D1` reduction on the
    /// decimated term; that omission would make `D1` irrelevant to the
    /// block size, so the decimated region is sized here as
    /// `major_sample_count / D1` slots per id, which is what the
    /// transform actually produces.
    pub fn major_block_size(&self) -> u64 {
        let ids = self.archived_id_count() as u64;
        let raw_bytes = self.major_sample_count as u64 * 8;
        let decimated_slots = self.major_sample_count as u64 / self.d1() as u64;
        let decimated_bytes = decimated_slots * 32;
        ids * (raw_bytes + decimated_bytes)
    }

    pub fn dd_total_count(&self) -> u32 {
        self.dd_sample_count * self.d2
    }

    pub fn data_index_region_size(&self) -> u64 {
        self.major_block_count as u64 * std::mem::size_of::<DataIndexEntry>() as u64
    }

    pub fn dd_ring_region_size(&self) -> u64 {
        self.dd_total_count() as u64 * self.archived_id_count() as u64 * 32
    }

    pub fn control_region_size(&self) -> u64 {
        HEADER_REGION_SIZE as u64 + self.data_index_region_size() + self.dd_ring_region_size()
    }

    pub fn data_region_size(&self) -> u64 {
        self.major_block_count as u64 * self.major_block_size()
    }

    pub fn total_file_size(&self) -> u64 {
        self.control_region_size() + self.data_region_size()
    }
}

/// Owns the mmap'd control region (header, block directory, data index,
/// DD ring mirror) of an archive file.
pub struct HeaderView {
    mmap: MmapMut,
    major_block_count: u32,
    dd_total_count: u32,
    archived_id_count: u32,
}

impl HeaderView {
    /// Map the control region of an already-sized file and initialize it
    /// for a fresh archive described by `layout`.
    pub fn initialize(file: &File, layout: &ArchiveLayout) -> Result<Self> {
        let control_size = layout.control_region_size() as usize;
        // SAFETY: file is sized for at least control_size bytes by the
        // caller (fa-prepare); the mapping is exclusive to this process.
        let mut mmap = unsafe { MmapOptionsExt::map_mut_at(file, 0, control_size)? };

        {
            let header = header_mut(&mut mmap);
            header.magic = MAGIC;
            header.version = CURRENT_VERSION;
            header.n = layout.n as u32;
            header.d1_log2 = layout.d1_log2;
            header.d2_log2 = layout.d2.trailing_zeros();
            header.input_block_size = layout.input_block_size;
            header.major_block_size = layout.major_block_size();
            header.major_sample_count = layout.major_sample_count;
            header.major_block_count = layout.major_block_count;
            header.major_data_start = layout.control_region_size();
            header.dd_total_count = layout.dd_total_count();
            header.dd_sample_count = layout.dd_sample_count;
            header.archived_id_count = layout.archived_id_count();
            header.archive_mask_bytes = [0u8; MAX_MASK_BYTES];
            let mask_bytes = mask_to_bytes(&layout.archive_mask);
            header.archive_mask_bytes[..mask_bytes.len()].copy_from_slice(&mask_bytes);
            header.last_duration.store(0, Ordering::Relaxed);
            header.disk_status.store(DISK_STATUS_CLEAN, Ordering::Relaxed);
            header.write_backlog.store(0, Ordering::Relaxed);
            header.write_buffer = 0;
            header.current_major_block.store(0, Ordering::Relaxed);
            header.data_start = layout.control_region_size();
            header.data_size = layout.data_region_size();
            header.block_count.store(0, Ordering::Relaxed);
            header.blocks = [BlockDirEntry::default(); MAX_HEADER_BLOCKS];
        }

        let view = HeaderView {
            mmap,
            major_block_count: layout.major_block_count,
            dd_total_count: layout.dd_total_count(),
            archived_id_count: layout.archived_id_count(),
        };
        view.write_data_index(0, DataIndexEntry::default());
        mmap_msync(&view.mmap)?;
        Ok(view)
    }

    /// Map and validate an existing archive's control region.
    pub fn open(file: &File, control_region_size: usize) -> Result<Self> {
        // SAFETY: caller guarantees the file is at least control_region_size
        // bytes and that no other process maps it writably concurrently
        // (spec non-goal: no multi-writer concurrency).
        let mmap = unsafe { MmapOptionsExt::map_mut_at(file, 0, control_region_size)? };
        let header = header_ref(&mmap);
        if header.magic != MAGIC {
            return Err(FaError::fatal("archive header magic mismatch"));
        }
        if header.version != CURRENT_VERSION {
            return Err(FaError::fatal(format!(
                "unsupported archive version {}",
                header.version
            )));
        }
        if header.major_block_count == 0 || header.major_sample_count == 0 {
            return Err(FaError::fatal("archive header has impossible geometry"));
        }
        let major_block_count = header.major_block_count;
        let dd_total_count = header.dd_total_count;
        let archived_id_count = header.archived_id_count;
        Ok(HeaderView {
            mmap,
            major_block_count,
            dd_total_count,
            archived_id_count,
        })
    }

    pub fn header(&self) -> &Header {
        header_ref(&self.mmap)
    }

    fn header_mut(&mut self) -> &mut Header {
        header_mut(&mut self.mmap)
    }

    pub fn archive_mask(&self) -> Mask {
        let header = self.header();
        mask_from_bytes(&header.archive_mask_bytes, header.n as usize)
    }

    pub fn current_major_block(&self) -> u32 {
        self.header().current_major_block.load(Ordering::Acquire)
    }

    pub fn set_current_major_block(&self, value: u32) {
        self.header()
            .current_major_block
            .store(value, Ordering::Release);
    }

    pub fn disk_status(&self) -> u32 {
        self.header().disk_status.load(Ordering::Acquire)
    }

    pub fn set_disk_status(&self, value: u32) {
        self.header().disk_status.store(value, Ordering::Release);
    }

    pub fn write_backlog(&self) -> u64 {
        self.header().write_backlog.load(Ordering::Acquire)
    }

    pub fn set_write_backlog(&self, value: u64) {
        self.header().write_backlog.store(value, Ordering::Release);
    }

    pub fn block_count(&self) -> u32 {
        self.header().block_count.load(Ordering::Acquire)
    }

    pub fn set_block_count(&self, value: u32) {
        self.header().block_count.store(value, Ordering::Release);
    }

    pub fn blocks(&self) -> [BlockDirEntry; MAX_HEADER_BLOCKS] {
        self.header().blocks
    }

    /// Overwrite the whole block directory. Like the data-index and DD
    /// writes, this goes through a raw pointer rather than `&mut self`:
    /// the archive's no-multi-writer invariant means only the disk
    /// writer thread ever calls this, so `&self` is sufficient and lets
    /// every caller share one `Arc<ArchiveState>`.
    pub fn set_blocks(&self, blocks: [BlockDirEntry; MAX_HEADER_BLOCKS]) {
        let field_ptr = &self.header().blocks as *const _ as *mut [BlockDirEntry; MAX_HEADER_BLOCKS];
        // SAFETY: field_ptr points at the `blocks` array inside the
        // mapped header struct; BlockDirEntry is a plain repr(C) struct
        // of integers with no invalid bit patterns.
        unsafe {
            std::ptr::write_unaligned(field_ptr, blocks);
        }
    }

    pub fn last_duration(&self) -> u32 {
        self.header().last_duration.load(Ordering::Acquire)
    }

    pub fn set_last_duration(&self, value: u32) {
        self.header().last_duration.store(value, Ordering::Release);
    }

    fn data_index_offset(&self) -> usize {
        HEADER_REGION_SIZE
    }

    pub fn read_data_index(&self, block: u32) -> DataIndexEntry {
        let offset =
            self.data_index_offset() + block as usize * std::mem::size_of::<DataIndexEntry>();
        let bytes = &self.mmap[offset..offset + std::mem::size_of::<DataIndexEntry>()];
        // SAFETY: DataIndexEntry is a plain repr(C) struct of integers;
        // any bit pattern of the right size is valid.
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const DataIndexEntry) }
    }

    pub fn write_data_index(&self, block: u32, entry: DataIndexEntry) {
        let offset =
            self.data_index_offset() + block as usize * std::mem::size_of::<DataIndexEntry>();
        let size = std::mem::size_of::<DataIndexEntry>();
        let ptr = self.mmap.as_ptr() as *mut u8;
        // SAFETY: offset+size is within the mapped control region (block
        // index is always < major_block_count); writes here are confined
        // to the disk-writer thread per spec's no-multi-writer invariant.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &entry as *const DataIndexEntry as *const u8,
                ptr.add(offset),
                size,
            );
        }
    }

    fn dd_ring_offset(&self) -> usize {
        self.data_index_offset()
            + self.major_block_count as usize * std::mem::size_of::<DataIndexEntry>()
    }

    /// Mirror one first-decimation-accumulated double-decimated slot
    /// into the on-disk DD region at `(slot_index, archived_index)`.
    pub fn write_dd_slot(
        &self,
        slot_index: u32,
        archived_index: u32,
        bytes: &[u8; 32],
    ) {
        let stride = self.archived_id_count as usize * 32;
        let offset =
            self.dd_ring_offset() + slot_index as usize * stride + archived_index as usize * 32;
        let ptr = self.mmap.as_ptr() as *mut u8;
        // SAFETY: slot_index < dd_total_count and archived_index <
        // archived_id_count are upheld by the transform; offset+32 stays
        // within the mapped region.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), 32);
        }
    }

    pub fn read_dd_slot(&self, slot_index: u32, archived_index: u32) -> [u8; 32] {
        let stride = self.archived_id_count as usize * 32;
        let offset =
            self.dd_ring_offset() + slot_index as usize * stride + archived_index as usize * 32;
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.mmap[offset..offset + 32]);
        out
    }

    pub fn dd_total_count(&self) -> u32 {
        self.dd_total_count
    }

    pub fn archived_id_count(&self) -> u32 {
        self.archived_id_count
    }

    pub fn major_block_count(&self) -> u32 {
        self.major_block_count
    }

    /// Flush the control region under an `F_WRLCK` byte-range lock
    /// covering the header struct, then `msync(MS_ASYNC)` (spec 4.5).
    pub fn flush(&self, file: &File) -> Result<()> {
        lock_header_range(file, true)?;
        let result = mmap_msync(&self.mmap);
        lock_header_range(file, false)?;
        result
    }
}

fn header_ref(mmap: &MmapMut) -> &Header {
    // SAFETY: the mmap is at least HEADER_STRUCT_SIZE bytes (enforced by
    // ArchiveLayout::control_region_size) and was initialized by
    // HeaderView::initialize or validated by HeaderView::open.
    unsafe { &*(mmap.as_ptr() as *const Header) }
}

fn header_mut(mmap: &mut MmapMut) -> &mut Header {
    // SAFETY: see header_ref; exclusive access is guaranteed by &mut self.
    unsafe { &mut *(mmap.as_mut_ptr() as *mut Header) }
}

fn mask_to_bytes(mask: &Mask) -> Vec<u8> {
    let nbytes = mask.n().div_ceil(8);
    let mut bytes = vec![0u8; nbytes];
    for id in mask.iter_ids() {
        bytes[id / 8] |= 1 << (id % 8);
    }
    bytes
}

fn mask_from_bytes(bytes: &[u8; MAX_MASK_BYTES], n: usize) -> Mask {
    let mut mask = Mask::empty(n);
    for id in 0..n {
        if (bytes[id / 8] >> (id % 8)) & 1 != 0 {
            mask.set(id);
        }
    }
    mask
}

fn lock_header_range(file: &File, lock: bool) -> Result<()> {
    let mut flock = libc::flock {
        l_type: if lock {
            libc::F_WRLCK as i16
        } else {
            libc::F_UNLCK as i16
        },
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: HEADER_STRUCT_SIZE as i64,
        l_pid: 0,
    };
    // SAFETY: file is a valid open fd for the duration of this call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut flock) };
    if rc < 0 {
        return Err(FaError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn mmap_msync(mmap: &MmapMut) -> Result<()> {
    mmap.flush_async().map_err(FaError::Io)
}

/// Small extension so `map_mut_at` reads clearly at call sites above;
/// memmap2's builder API otherwise requires a multi-line chain there.
trait MmapOptionsExt {
    unsafe fn map_mut_at(file: &File, offset: u64, len: usize) -> Result<MmapMut>;
}

impl MmapOptionsExt for MmapMut {
    unsafe fn map_mut_at(file: &File, offset: u64, len: usize) -> Result<MmapMut> {
        memmap2::MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_mut(file)
            .map_err(FaError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn test_layout() -> ArchiveLayout {
        ArchiveLayout {
            n: 16,
            d1_log2: 6,
            d2: 128,
            major_sample_count: 65536,
            major_block_count: 4,
            dd_sample_count: 64,
            archive_mask: Mask::parse("0-7", 16).unwrap(),
            input_block_size: 256,
        }
    }

    #[test]
    fn initialize_then_open_round_trips_geometry() {
        let layout = test_layout();
        let file = tempfile().unwrap();
        file.set_len(layout.total_file_size()).unwrap();

        {
            let view = HeaderView::initialize(&file, &layout).unwrap();
            assert_eq!(view.header().n, 16);
            assert_eq!(view.current_major_block(), 0);
            assert_eq!(view.archive_mask().popcount(), 8);
        }

        let view = HeaderView::open(&file, layout.control_region_size() as usize).unwrap();
        assert_eq!(view.header().magic, MAGIC);
        assert_eq!(view.major_block_count(), 4);
        assert_eq!(view.archived_id_count(), 8);
    }

    #[test]
    fn rejects_bad_magic() {
        let layout = test_layout();
        let file = tempfile().unwrap();
        file.set_len(layout.total_file_size()).unwrap();
        {
            let mut view = HeaderView::initialize(&file, &layout).unwrap();
            view.header_mut().magic = *b"BOGUS000";
        }
        let err = HeaderView::open(&file, layout.control_region_size() as usize).unwrap_err();
        assert!(err.to_string().contains("fatal"));
    }

    #[test]
    fn data_index_round_trips() {
        let layout = test_layout();
        let file = tempfile().unwrap();
        file.set_len(layout.total_file_size()).unwrap();
        let view = HeaderView::initialize(&file, &layout).unwrap();

        let entry = DataIndexEntry {
            timestamp: 1_000_000,
            duration: 65536,
            id_zero: 42,
        };
        view.write_data_index(1, entry);
        assert_eq!(view.read_data_index(1), entry);
        assert_eq!(view.read_data_index(2), DataIndexEntry::default());
    }

    #[test]
    fn dd_slot_round_trips() {
        let layout = test_layout();
        let file = tempfile().unwrap();
        file.set_len(layout.total_file_size()).unwrap();
        let view = HeaderView::initialize(&file, &layout).unwrap();

        let bytes: [u8; 32] = std::array::from_fn(|i| i as u8);
        view.write_dd_slot(3, 2, &bytes);
        assert_eq!(view.read_dd_slot(3, 2), bytes);
        assert_eq!(view.read_dd_slot(3, 1), [0u8; 32]);
    }
}
