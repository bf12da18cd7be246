//! In-memory double-decimation ring, mirrored into the header's DD
//! region on disk (spec 3, 4.4 step 4).
//!
//! The transform is the sole writer, one slot per archived id per row;
//! readers take a full snapshot under the transform lock before
//! streaming a DD query, re-acquiring at each major-block boundary
//! (spec 4.6).

use super::header::HeaderView;
use crate::transform::variance::DecimatedSlot;

/// A point-in-time copy of the whole DD ring, safe to stream from
/// without holding any lock.
#[derive(Debug, Clone)]
pub struct DdRingSnapshot {
    pub dd_total_count: u32,
    pub archived_id_count: u32,
    slots: Vec<DecimatedSlot>,
}

impl DdRingSnapshot {
    pub fn slot(&self, row: u32, archived_index: u32) -> DecimatedSlot {
        self.slots[row as usize * self.archived_id_count as usize + archived_index as usize]
    }
}

/// Copy the entire on-disk DD region into a plain in-memory snapshot.
/// Callers are expected to hold the archive's transform lock while
/// calling this so the copy is consistent with whatever `dd_offset` they
/// read alongside it.
pub fn snapshot(header: &HeaderView) -> DdRingSnapshot {
    let dd_total_count = header.dd_total_count();
    let archived_id_count = header.archived_id_count();
    let mut slots = Vec::with_capacity((dd_total_count * archived_id_count) as usize);
    for row in 0..dd_total_count {
        for archived_index in 0..archived_id_count {
            let bytes = header.read_dd_slot(row, archived_index);
            // SAFETY: DecimatedSlot is a repr(C) struct of four i32
            // pairs, exactly 32 bytes, with no padding or invalid
            // bit patterns.
            let slot = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const DecimatedSlot) };
            slots.push(slot);
        }
    }
    DdRingSnapshot {
        dd_total_count,
        archived_id_count,
        slots,
    }
}

/// Write one archived id's finalized slot into the DD region at `row`.
pub fn write_slot(header: &HeaderView, row: u32, archived_index: u32, slot: DecimatedSlot) {
    let size = std::mem::size_of::<DecimatedSlot>();
    debug_assert_eq!(size, 32);
    let mut bytes = [0u8; 32];
    // SAFETY: DecimatedSlot has no padding and is exactly 32 bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(
            &slot as *const DecimatedSlot as *const u8,
            bytes.as_mut_ptr(),
            size,
        );
    }
    header.write_dd_slot(row, archived_index, &bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::ArchiveLayout;
    use crate::mask::Mask;
    use crate::transform::variance::AxisSlot;
    use tempfile::tempfile;

    #[test]
    fn write_then_snapshot_round_trips() {
        let layout = ArchiveLayout {
            n: 8,
            d1_log2: 2,
            d2: 4,
            major_sample_count: 256,
            major_block_count: 2,
            dd_sample_count: 8,
            archive_mask: Mask::parse("0-3", 8).unwrap(),
            input_block_size: 64,
        };
        let file = tempfile().unwrap();
        file.set_len(layout.total_file_size()).unwrap();
        let header = HeaderView::initialize(&file, &layout).unwrap();

        let slot = DecimatedSlot {
            x: AxisSlot {
                min: 1,
                max: 9,
                mean: 5,
                std: 2,
            },
            y: AxisSlot {
                min: -9,
                max: -1,
                mean: -5,
                std: 2,
            },
        };
        write_slot(&header, 3, 1, slot);

        let snap = snapshot(&header);
        assert_eq!(snap.slot(3, 1), slot);
        assert_eq!(snap.slot(3, 0), DecimatedSlot::default());
    }
}
