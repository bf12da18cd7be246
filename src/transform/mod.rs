//! Transform: per-block transpose, first-stage decimation, second-stage
//! (double-decimation) accumulation, timestamp indexing, and major-block
//! completion (spec 4.4).
//!
//! This runs synchronously in the disk-writer thread's consumer loop,
//! not on its own thread (spec 5) — there is one `Transform` per
//! archiver process, driven one ring-buffer block at a time.

pub mod variance;

mod timestamp;

pub use timestamp::{Fit, SmoothedDuration, TimestampIndex};

use tracing::debug;

use crate::archive::header::DataIndexEntry;
use crate::archive::{dd_ring, ArchiveState};
use crate::mask::Mask;
use crate::ring_buffer::{Entry, RawBlock};
use variance::{DecimatedSlot, VarianceAccumulator};

/// A completed major block, ready for the disk writer to persist. The
/// buffer is laid out as: for every archived id in ascending id order,
/// `major_sample_count` raw [`Entry`]s, followed (after all ids' raw
/// regions) by that id's `major_sample_count / D1` first-decimation
/// [`DecimatedSlot`]s.
///
/// The spec's stated `major_block_size` formula doesn't divide the
/// decimated term by `D1`; this buffer (and [`crate::archive::header::ArchiveLayout::major_block_size`])
/// both implement the size the transform actually produces, which does
/// divide by `D1` — see that function's doc comment.
pub struct MajorBlockBuffer {
    archived_id_count: usize,
    major_sample_count: usize,
    decimated_per_id: usize,
    raw: Vec<Entry>,
    decimated: Vec<DecimatedSlot>,
}

impl MajorBlockBuffer {
    fn new(archived_id_count: usize, major_sample_count: usize, d1: usize) -> Self {
        let decimated_per_id = major_sample_count / d1;
        MajorBlockBuffer {
            archived_id_count,
            major_sample_count,
            decimated_per_id,
            raw: vec![Entry::default(); archived_id_count * major_sample_count],
            decimated: vec![DecimatedSlot::default(); archived_id_count * decimated_per_id],
        }
    }

    fn raw_offset(&self, archived_index: usize, fa_offset: usize) -> usize {
        archived_index * self.major_sample_count + fa_offset
    }

    fn decimated_offset(&self, archived_index: usize, minor_index: usize) -> usize {
        archived_index * self.decimated_per_id + minor_index
    }

    fn clear(&mut self) {
        self.raw.fill(Entry::default());
        self.decimated.fill(DecimatedSlot::default());
    }

    /// Serialize this buffer to the exact on-disk byte layout for one
    /// major block: page-aligned, as `O_DIRECT` requires (spec 9).
    pub fn to_bytes(&self) -> Vec<u8> {
        let raw_bytes = std::mem::size_of_val(self.raw.as_slice());
        let decimated_bytes = std::mem::size_of_val(self.decimated.as_slice());
        let mut out = page_aligned_buffer(raw_bytes + decimated_bytes);
        // SAFETY: Entry and DecimatedSlot are repr(C) with no padding
        // bytes of their own; viewing them as raw bytes for a
        // pure-copy serialize is sound.
        unsafe {
            let raw_src =
                std::slice::from_raw_parts(self.raw.as_ptr() as *const u8, raw_bytes);
            out[..raw_bytes].copy_from_slice(raw_src);
            let dec_src = std::slice::from_raw_parts(
                self.decimated.as_ptr() as *const u8,
                decimated_bytes,
            );
            out[raw_bytes..raw_bytes + decimated_bytes].copy_from_slice(dec_src);
        }
        out
    }
}

fn page_aligned_buffer(len: usize) -> Vec<u8> {
    const PAGE: usize = 4096;
    let padded = len.div_ceil(PAGE) * PAGE;
    let layout = std::alloc::Layout::from_size_align(padded, PAGE).expect("valid alignment");
    // SAFETY: layout has non-zero size and a power-of-two alignment;
    // the resulting pointer is immediately wrapped in a Vec that owns it
    // and will deallocate with the same layout on drop.
    unsafe {
        let ptr = std::alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Vec::from_raw_parts(ptr, padded, padded)
    }
}

/// Output of completing a major block: ready to hand to the disk writer
/// for the actual `O_DIRECT` write, outside the transform lock.
pub struct ScheduledWrite {
    pub block_index: u32,
    pub buffer: Vec<u8>,
    pub index_entry: DataIndexEntry,
}

/// Stateful per-archive transform. One instance per archiver process.
pub struct Transform {
    archived_ids: Vec<usize>,
    d1: u32,
    d1_log2: u32,
    d2: u32,
    major_sample_count: u32,
    dd_total_count: u32,
    fa_offset: u32,
    buffer: MajorBlockBuffer,
    stage1: Vec<VarianceAccumulator>,
    stage2: Vec<VarianceAccumulator>,
    timestamp_index: TimestampIndex,
    id_zero: Option<i32>,
    smoothed_duration: SmoothedDuration,
    preprocessor: Option<Box<dyn FnMut(&mut RawBlock) + Send>>,
}

impl Transform {
    pub fn new(
        archive_mask: &Mask,
        d1_log2: u32,
        d2: u32,
        major_sample_count: u32,
        dd_total_count: u32,
    ) -> Self {
        let archived_ids: Vec<usize> = archive_mask.iter_ids().collect();
        let archived_id_count = archived_ids.len();
        let d1 = 1u32 << d1_log2;
        Transform {
            archived_ids,
            d1,
            d1_log2,
            d2,
            major_sample_count,
            dd_total_count,
            fa_offset: 0,
            buffer: MajorBlockBuffer::new(
                archived_id_count,
                major_sample_count as usize,
                d1 as usize,
            ),
            stage1: vec![VarianceAccumulator::default(); archived_id_count],
            stage2: vec![VarianceAccumulator::default(); archived_id_count],
            timestamp_index: TimestampIndex::new(),
            id_zero: None,
            smoothed_duration: SmoothedDuration::new(0),
            preprocessor: None,
        }
    }

    /// Register an optional pre-processing hook run on each raw block
    /// before transpose — the pluggable slot for a site-specific
    /// corrector-extraction step (spec 9, Open Question). Left unused
    /// by default.
    pub fn with_preprocessor(mut self, hook: Box<dyn FnMut(&mut RawBlock) + Send>) -> Self {
        self.preprocessor = Some(hook);
        self
    }

    pub fn last_duration(&self) -> u32 {
        self.smoothed_duration.get()
    }

    /// Process one data block (spec 4.4 steps 1-5). Returns a
    /// [`ScheduledWrite`] when this block completed the current major
    /// block.
    pub fn process_data_block(
        &mut self,
        block: &mut RawBlock,
        timestamp: u64,
        archive: &ArchiveState,
    ) -> Option<ScheduledWrite> {
        if let Some(hook) = self.preprocessor.as_mut() {
            hook(block);
        }

        if self.timestamp_index.is_empty() {
            self.id_zero = Some(block.frame(0)[0].x);
        }
        self.timestamp_index.record(timestamp);

        for (archived_index, &id) in self.archived_ids.clone().iter().enumerate() {
            for frame_index in 0..block.frame_count {
                let entry = block.frame(frame_index)[id];
                let raw_index = self
                    .buffer
                    .raw_offset(archived_index, self.fa_offset as usize + frame_index);
                self.buffer.raw[raw_index] = entry;

                let acc = &mut self.stage1[archived_index];
                acc.add(entry.x, entry.y);
                if acc.count() == self.d1 {
                    let minor_index =
                        (self.fa_offset as usize + frame_index + 1) / self.d1 as usize - 1;
                    let slot = acc.finish_and_reset(self.d1_log2);
                    let dec_index = self.buffer.decimated_offset(archived_index, minor_index);
                    self.buffer.decimated[dec_index] = slot;
                }
            }
        }

        // Second-stage accumulation operates on the same raw samples as
        // stage 1, grouped by D1*D2 instead of D1, rather than combining
        // already-summarized first-stage slots: this avoids re-deriving
        // a combined variance from partial sums and is exactly
        // equivalent for min/max/mean/std over the full window.
        self.accumulate_stage2(block, archive);

        self.fa_offset += block.frame_count as u32;
        if self.fa_offset == self.major_sample_count {
            return Some(self.finish_major_block(archive));
        }
        None
    }

    /// Feed the same raw samples stage 1 saw into a second accumulator
    /// grouped by `D1*D2` instead of `D1` (rather than combining
    /// already-summarized first-stage slots, which would mean
    /// re-deriving a combined variance from partial sums). Iterates
    /// frame-major so that every archived id's completion for the same
    /// frame lands in one DD row under a single cursor advance, even if
    /// a single raw block happens to span more than one `D1*D2` group.
    fn accumulate_stage2(&mut self, block: &RawBlock, archive: &ArchiveState) {
        let d2_group = self.d1 as u64 * self.d2 as u64;
        let log2_group = self.d1_log2 + self.d2.trailing_zeros();
        let archived_ids = self.archived_ids.clone();

        for frame_index in 0..block.frame_count {
            let frame = block.frame(frame_index);
            let mut completed: Vec<(usize, DecimatedSlot)> = Vec::new();
            for (archived_index, &id) in archived_ids.iter().enumerate() {
                let entry = frame[id];
                let acc = &mut self.stage2[archived_index];
                acc.add(entry.x, entry.y);
                if acc.count() as u64 == d2_group {
                    completed.push((archived_index, acc.finish_and_reset(log2_group)));
                }
            }
            if !completed.is_empty() {
                let mut cursor = archive.transform_lock.lock();
                let row = cursor.dd_offset;
                for (archived_index, slot) in completed {
                    dd_ring::write_slot(&archive.header, row, archived_index as u32, slot);
                }
                cursor.dd_offset = (row + 1) % self.dd_total_count;
            }
        }
    }

    fn finish_major_block(&mut self, archive: &ArchiveState) -> ScheduledWrite {
        let fit = self.timestamp_index.fit();
        let (start_timestamp, duration) = match fit {
            Some(fit) => (fit.start_timestamp, fit.duration),
            None => (self.timestamp_index.first_timestamp(), 0),
        };
        self.smoothed_duration.update(duration);

        let index_entry = DataIndexEntry {
            timestamp: start_timestamp,
            duration,
            id_zero: self.id_zero.unwrap_or(0) as u32,
        };

        let block_index = {
            let _cursor = archive.transform_lock.lock();
            let current = archive.header.current_major_block();
            archive.header.write_data_index(current, index_entry);
            let next = (current + 1) % archive.header.major_block_count();
            archive.header.set_current_major_block(next);
            archive.header.set_last_duration(self.smoothed_duration.get());
            current
        };

        let buffer = self.buffer.to_bytes();
        self.buffer.clear();
        self.fa_offset = 0;
        self.timestamp_index.reset();
        self.id_zero = None;

        debug!(block_index, duration, "major block completed");
        ScheduledWrite {
            block_index,
            buffer,
            index_entry,
        }
    }

    /// Discard the in-progress major block on a gap (spec 4.4 "On a
    /// gap"). The previously completed major block is unaffected.
    pub fn process_gap(&mut self) {
        self.buffer.clear();
        self.fa_offset = 0;
        self.timestamp_index.reset();
        self.id_zero = None;
        for acc in self.stage1.iter_mut().chain(self.stage2.iter_mut()) {
            *acc = VarianceAccumulator::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::ArchiveLayout;
    use crate::archive::{dd_ring, ArchiveState};
    use crate::ring_buffer::RawBlock;
    use tempfile::NamedTempFile;

    fn small_archive() -> (ArchiveState, ArchiveLayout, NamedTempFile) {
        let layout = ArchiveLayout {
            n: 4,
            d1_log2: 2, // D1 = 4
            d2: 2,      // D1*D2 = 8
            major_sample_count: 16,
            major_block_count: 3,
            dd_sample_count: 2,
            archive_mask: Mask::parse("0-1", 4).unwrap(),
            input_block_size: 8,
        };
        let file = NamedTempFile::new().unwrap();
        let archive = ArchiveState::create(file.path(), &layout).unwrap();
        (archive, layout, file)
    }

    fn filled_block(frame_count: usize, start_counter: i32) -> RawBlock {
        let mut block = RawBlock::new(4, frame_count);
        for f in 0..frame_count {
            let frame = block.frame_mut(f);
            for (id, entry) in frame.iter_mut().enumerate() {
                let v = start_counter + f as i32;
                entry.x = v;
                entry.y = -v - id as i32;
            }
        }
        block
    }

    #[test]
    fn completes_a_major_block_with_matching_index_entry() {
        let (archive, layout, _tmp) = small_archive();
        let mut transform = Transform::new(
            &layout.archive_mask,
            layout.d1_log2,
            layout.d2,
            layout.major_sample_count,
            layout.dd_total_count(),
        );

        let mut scheduled = None;
        for i in 0..(layout.major_sample_count / 8) {
            let mut block = filled_block(8, i as i32 * 8);
            let ts = i as u64 * 8000;
            let result = transform.process_data_block(&mut block, ts, &archive);
            if result.is_some() {
                scheduled = result;
            }
        }

        let scheduled = scheduled.expect("major block should have completed");
        assert_eq!(scheduled.block_index, 0);
        assert!(scheduled.index_entry.duration > 0);
        assert_eq!(scheduled.index_entry.id_zero, 0);
        assert_eq!(archive.header.current_major_block(), 1);
        assert_eq!(
            archive.header.read_data_index(0).timestamp,
            scheduled.index_entry.timestamp
        );

        let snap = dd_ring::snapshot(&archive.header);
        // major_sample_count=16, D1*D2=8, so exactly two DD rows were
        // written across the whole major block.
        assert_ne!(snap.slot(0, 0), Default::default());
        assert_ne!(snap.slot(1, 0), Default::default());
    }

    #[test]
    fn gap_discards_partial_block_without_touching_current_major_block() {
        let (archive, layout, _tmp) = small_archive();
        let mut transform = Transform::new(
            &layout.archive_mask,
            layout.d1_log2,
            layout.d2,
            layout.major_sample_count,
            layout.dd_total_count(),
        );

        let mut block = filled_block(8, 0);
        transform.process_data_block(&mut block, 0, &archive);
        assert_eq!(archive.header.current_major_block(), 0);

        transform.process_gap();
        assert_eq!(archive.header.current_major_block(), 0);

        // A fresh major block started after the gap should complete
        // normally from frame 0.
        let mut scheduled = None;
        for i in 0..(layout.major_sample_count / 8) {
            let mut block = filled_block(8, i as i32 * 8);
            let result = transform.process_data_block(&mut block, i as u64 * 8000, &archive);
            if result.is_some() {
                scheduled = result;
            }
        }
        assert!(scheduled.is_some());
    }

    #[test]
    fn id_zero_advances_by_major_sample_count_across_blocks() {
        let (archive, layout, _tmp) = small_archive();
        let mut transform = Transform::new(
            &layout.archive_mask,
            layout.d1_log2,
            layout.d2,
            layout.major_sample_count,
            layout.dd_total_count(),
        );

        let mut entries = Vec::new();
        let mut counter = 0i32;
        for _major in 0..2 {
            for i in 0..(layout.major_sample_count / 8) {
                let mut block = filled_block(8, counter);
                counter += 8;
                let result =
                    transform.process_data_block(&mut block, i as u64 * 8000, &archive);
                if let Some(scheduled) = result {
                    entries.push(scheduled.index_entry);
                }
            }
        }

        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].id_zero - entries[0].id_zero,
            layout.major_sample_count
        );
    }
}
