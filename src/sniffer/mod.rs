//! Sniffer Driver: a polymorphic source of timestamped raw blocks (spec
//! 4.3). Two variants are provided — [`device::CharDeviceSniffer`], which
//! issues ioctls against a real hardware character device, and
//! [`mock::EmptySniffer`] / [`mock::SyntheticSniffer`] for read-only and
//! test deployments. [`thread::run`] drives whichever implementation is
//! configured at real-time priority.

pub mod device;
pub mod mock;
pub mod thread;

use crate::error::Result;
use crate::ring_buffer::RawBlock;

/// Status reported by [`Sniffer::status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub version: u32,
    pub entry_count: u32,
    pub overruns: u64,
}

/// Capability set exposed by a sniffer source: {reset, read, status,
/// interrupt}. Implemented both by a real character-device driver and by
/// stubs used for testing and read-only deployments.
///
/// Unlike the higher-level instrument capability traits this crate was
/// built from, this one is synchronous: the sniffer thread is a
/// dedicated, optionally real-time-scheduled OS thread performing
/// blocking reads, not an async task.
pub trait Sniffer: Send {
    /// Reset the device (and, per spec 4.3, optionally restart capture
    /// in-place) after a read failure.
    fn reset(&mut self) -> Result<()>;

    /// Fill `block` with one block's worth of frames. On success returns
    /// the timestamp of the first frame (microseconds since epoch).
    fn read(&mut self, block: &mut RawBlock) -> Result<u64>;

    /// Query device status (firmware version, configured entry count,
    /// overrun counter).
    fn status(&mut self) -> Result<Status>;

    /// Request the device stop delivering data (used at shutdown).
    fn interrupt(&mut self) -> Result<()>;
}
