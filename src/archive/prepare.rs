//! `fa-prepare`'s formatting logic as a library function (SPEC_FULL §B),
//! so both the `fa-prepare` binary and integration tests can build a
//! real archive file without shelling out.

use std::path::Path;

use crate::error::Result;
use crate::mask::Mask;

use super::header::ArchiveLayout;
use super::ArchiveState;

/// Parameters accepted by the `fa-prepare` CLI (spec 6), already parsed.
#[derive(Debug, Clone)]
pub struct PrepareParams {
    pub n: usize,
    pub d1_log2: u32,
    pub d2: u32,
    pub major_sample_count: u32,
    pub major_block_count: u32,
    pub dd_sample_count: u32,
    pub mask: Mask,
    pub input_block_size: u32,
}

/// Format a fresh archive at `path` per `params`, returning the opened
/// [`ArchiveState`] ready for the archiver daemon to attach to.
pub fn prepare(path: impl AsRef<Path>, params: PrepareParams) -> Result<ArchiveState> {
    let layout = ArchiveLayout {
        n: params.n,
        d1_log2: params.d1_log2,
        d2: params.d2,
        major_sample_count: params.major_sample_count,
        major_block_count: params.major_block_count,
        dd_sample_count: params.dd_sample_count,
        archive_mask: params.mask,
        input_block_size: params.input_block_size,
    };
    ArchiveState::create(path, &layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn prepare_then_reopen_preserves_geometry() {
        let file = NamedTempFile::new().unwrap();
        let params = PrepareParams {
            n: 16,
            d1_log2: 6,
            d2: 4,
            major_sample_count: 1024,
            major_block_count: 2,
            dd_sample_count: 8,
            mask: Mask::parse("0-7", 16).unwrap(),
            input_block_size: 256,
        };
        {
            let archive = prepare(file.path(), params.clone()).unwrap();
            assert_eq!(archive.header.header().n, 16);
        }
        let reopened = ArchiveState::open(file.path()).unwrap();
        assert_eq!(reopened.header.archived_id_count(), 8);
        assert_eq!(reopened.header.major_block_count(), 2);
    }
}
