//! Stub sniffer variants: [`EmptySniffer`] for read-only archivers (its
//! `read` always fails, producing a continuous gap stream) and
//! [`SyntheticSniffer`] for free-running tests and the `fa-archiver -F`
//! mode, which generates deterministic ramped frames instead of reading
//! hardware.

use super::{Sniffer, Status};
use crate::error::{FaError, Result};
use crate::ring_buffer::{Entry, RawBlock};

/// A sniffer that never produces data. `read` always fails; used when
/// the archiver is opened purely for queries against an existing archive.
#[derive(Debug, Default)]
pub struct EmptySniffer;

impl Sniffer for EmptySniffer {
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _block: &mut RawBlock) -> Result<u64> {
        Err(FaError::fatal("empty sniffer has no data source"))
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status::default())
    }

    fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Free-running deterministic source. Each frame's BPM 0 reading carries
/// a monotonic rolling counter in `x` (playing the role of the
/// hardware's `id_zero` frame counter) and a fixed pattern in `y`; other
/// ids ramp off id 0 so tests can distinguish columns.
pub struct SyntheticSniffer {
    frame_interval_micros: u64,
    next_timestamp: u64,
    next_counter: i32,
    fail_every: Option<u64>,
    blocks_emitted: u64,
}

impl SyntheticSniffer {
    pub fn new(frame_interval_micros: u64, start_timestamp: u64) -> Self {
        SyntheticSniffer {
            frame_interval_micros,
            next_timestamp: start_timestamp,
            next_counter: 0,
            fail_every: None,
            blocks_emitted: 0,
        }
    }

    /// Make every `n`th `read()` call fail, to exercise gap handling in
    /// tests without a real hardware dropout.
    pub fn with_forced_gap_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }
}

impl Sniffer for SyntheticSniffer {
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, block: &mut RawBlock) -> Result<u64> {
        self.blocks_emitted += 1;
        if let Some(n) = self.fail_every {
            if n > 0 && self.blocks_emitted % n == 0 {
                return Err(FaError::Io(std::io::Error::from(
                    std::io::ErrorKind::TimedOut,
                )));
            }
        }

        let timestamp = self.next_timestamp;
        for frame_index in 0..block.frame_count {
            let counter = self.next_counter;
            let frame = block.frame_mut(frame_index);
            for (id, entry) in frame.iter_mut().enumerate() {
                *entry = Entry {
                    x: counter.wrapping_add(id as i32),
                    y: -counter.wrapping_add(id as i32),
                };
            }
            self.next_counter = self.next_counter.wrapping_add(1);
            self.next_timestamp += self.frame_interval_micros;
        }
        Ok(timestamp)
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            version: 1,
            entry_count: 0,
            overruns: 0,
        })
    }

    fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }
}
