//! Archive Header & Index (spec 3, 4.5, 4.7): the on-disk circular
//! archive plus the shared state the transform, disk writer and reader
//! all coordinate through.

pub mod dd_ring;
pub mod header;
pub mod prepare;
pub mod writer;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{FaError, Result};
use header::{ArchiveLayout, HeaderView};

/// Cursor state the transform lock actually protects: the DD ring write
/// position and the block-directory segment list, both of which must be
/// updated atomically with respect to the header's `current_major_block`
/// (spec 5: "protects `current_major_block`, the DD ring cursor, and any
/// snapshot of the index array").
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformCursor {
    pub dd_offset: u32,
}

/// Shared handle to an open archive file: the mmap'd control region plus
/// a raw fd for `O_DIRECT` reads/writes against the data region.
pub struct ArchiveState {
    pub header: HeaderView,
    file: File,
    data_fd: File,
    pub transform_lock: Mutex<TransformCursor>,
}

impl ArchiveState {
    /// Open an existing archive (the steady-state archiver path).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // A second fd is opened O_DIRECT specifically for data-region
        // I/O; the control region continues to be accessed through the
        // buffered mmap above.
        let data_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;

        // Probe the fixed header region first to learn the control
        // region's true size before mapping it.
        let probe = HeaderView::open(&file, header::HEADER_REGION_SIZE)?;
        let control_region_size = probe.header().major_data_start as usize;
        drop(probe);

        let header = HeaderView::open(&file, control_region_size)?;
        Ok(ArchiveState {
            header,
            file,
            data_fd,
            transform_lock: Mutex::new(TransformCursor::default()),
        })
    }

    /// Create a fresh archive file sized per `layout` and initialize its
    /// header (the `fa-prepare` path; see [`prepare`]).
    pub fn create(path: impl AsRef<Path>, layout: &ArchiveLayout) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(layout.total_file_size())?;

        let header = HeaderView::initialize(&file, layout)?;
        let data_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;

        Ok(ArchiveState {
            header,
            file,
            data_fd,
            transform_lock: Mutex::new(TransformCursor::default()),
        })
    }

    pub fn major_data_start(&self) -> u64 {
        self.header.header().major_data_start
    }

    pub fn major_block_size(&self) -> u64 {
        self.header.header().major_block_size
    }

    /// Offset of major block `index` within the file.
    pub fn block_offset(&self, index: u32) -> u64 {
        self.major_data_start() + index as u64 * self.major_block_size()
    }

    /// Write one major block's bytes at `index`'s offset. `buf` must be
    /// page-aligned and a multiple of the filesystem's logical block
    /// size, as required by `O_DIRECT` (spec 9).
    pub fn write_major_block(&self, index: u32, buf: &[u8]) -> Result<()> {
        let offset = self.block_offset(index);
        let n = pwrite_all(&self.data_fd, buf, offset)?;
        if n != buf.len() {
            return Err(FaError::fatal("short write to archive data region"));
        }
        Ok(())
    }

    /// Read `len` bytes of major block `index` starting at byte
    /// `start_offset` within it.
    pub fn read_major_block_range(
        &self,
        index: u32,
        start_offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let offset = self.block_offset(index) + start_offset;
        let mut buf = vec![0u8; len];
        pread_exact(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    /// Flush the control region header under its byte-range lock.
    pub fn flush_header(&self) -> Result<()> {
        self.header.flush(&self.file)
    }
}

fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
    let mut written = 0usize;
    while written < buf.len() {
        // SAFETY: file is a valid fd; buf[written..] stays within buf's
        // allocation for the requested length.
        let n = unsafe {
            libc::pwrite(
                file.as_raw_fd(),
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                (offset + written as u64) as libc::off_t,
            )
        };
        if n < 0 {
            return Err(FaError::Io(std::io::Error::last_os_error()));
        }
        if n == 0 {
            break;
        }
        written += n as usize;
    }
    Ok(written)
}

fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut read = 0usize;
    while read < buf.len() {
        // SAFETY: file is a valid fd; buf[read..] stays within buf's
        // allocation for the requested length.
        let n = unsafe {
            libc::pread(
                file.as_raw_fd(),
                buf[read..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - read,
                (offset + read as u64) as libc::off_t,
            )
        };
        if n < 0 {
            return Err(FaError::Io(std::io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(FaError::fatal("short read from archive data region"));
        }
        read += n as usize;
    }
    Ok(())
}
